use crate::config::ServerConfig;
use rand::Rng;

/// Short hex identifier used to tag sessions in logs
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Adds the protocol scheme to an ICE server URL when it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
