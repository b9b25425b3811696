use crate::config::LoggingConfig;
use crate::peer::types::IceCandidate;
use once_cell::sync::OnceCell;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber with local timestamps.
///
/// `RUST_LOG` wins over `config.level`. Later calls are no-ops, and a
/// subscriber installed by someone else is left in place.
pub fn init_logging(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }

    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_target(false)
            .try_init()
            .is_ok();

        if installed {
            info!("logging initialised");
        }
    });
}

/// Trace a trickled ICE candidate
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    trace!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}

/// Quick getStats snapshot of the nominated candidate pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                debug!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Logs the host/srflx/relay mix of the candidates seen so far
pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateMix {
    let mut mix = CandidateMix::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            mix.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            mix.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            mix.relay += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        mix.host, mix.srflx, mix.relay
    );

    if mix.relay == 0 && !candidates.is_empty() {
        warn!("No TURN relay candidates found, connection through NAT may fail");
    }
    mix
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateMix {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}
