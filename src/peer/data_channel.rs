//! Payload transfer over an established data channel.
//!
//! Every data-channel message is one frame:
//!
//! ```text
//! [seq: u32 BE][total: u32 BE, u32::MAX = unknown][len: u32 BE][flags: u8][len bytes]
//! ```
//!
//! `flags & 1` marks the last chunk of a payload. Payloads that fit in a single
//! message still travel as one frame (seq 0, total 1, last).

use crate::error::{Error, Result};
use crate::peer::engine::{EngineEvent, EngineEventSender};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

pub const HEADER_LEN: usize = 13;
pub const TOTAL_UNKNOWN: u32 = u32::MAX;
const FLAG_LAST: u8 = 0x01;

/// Forward data-channel callbacks into the engine event queue
pub fn attach_dc(dc: &Arc<RTCDataChannel>, tx: EngineEventSender) {
    debug!("Attaching handlers to data channel '{}'", dc.label());

    dc.on_open(Box::new({
        let tx = tx.clone();
        move || {
            debug!("Data channel opened");
            let _ = tx.send(EngineEvent::DataChannelOpen);
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let tx = tx.clone();
        move |msg: DataChannelMessage| {
            let _ = tx.send(EngineEvent::DataMessage(msg.data));
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        debug!("Data channel closed");
        let _ = tx.send(EngineEvent::DataChannelClosed);
        Box::pin(async {})
    }));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub seq: u32,
    /// Chunk count of the payload, `None` when the sender did not know it
    pub total: Option<u32>,
    pub len: u32,
    pub last: bool,
}

impl ChunkHeader {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u32(self.total.unwrap_or(TOTAL_UNKNOWN));
        buf.put_u32(self.len);
        buf.put_u8(if self.last { FLAG_LAST } else { 0 });
    }

    /// Split a frame into header and chunk body
    pub fn parse(frame: &[u8]) -> Result<(ChunkHeader, &[u8])> {
        if frame.len() < HEADER_LEN {
            return Err(Error::MalformedChunk(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let mut head = &frame[..HEADER_LEN];
        let seq = head.get_u32();
        let total = match head.get_u32() {
            TOTAL_UNKNOWN => None,
            n => Some(n),
        };
        let len = head.get_u32();
        let flags = head.get_u8();

        let body = &frame[HEADER_LEN..];
        if body.len() != len as usize {
            return Err(Error::MalformedChunk(format!(
                "header says {} bytes, frame carries {}",
                len,
                body.len()
            )));
        }
        if let Some(total) = total {
            if seq >= total {
                return Err(Error::MalformedChunk(format!(
                    "sequence {} outside of {} chunks",
                    seq, total
                )));
            }
        }

        Ok((
            ChunkHeader {
                seq,
                total,
                len,
                last: flags & FLAG_LAST != 0,
            },
            body,
        ))
    }
}

/// Cut a payload into framed chunks of at most `max_chunk` body bytes.
/// With no limit the payload goes out as a single frame.
pub fn split_payload(payload: &[u8], max_chunk: Option<usize>) -> Vec<Bytes> {
    let chunk_size = match max_chunk {
        Some(limit) if limit > 0 && limit < payload.len() => limit,
        _ => payload.len().max(1),
    };

    let pieces: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_size).collect()
    };
    let total = pieces.len() as u32;

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let seq = i as u32;
            let mut buf = BytesMut::with_capacity(HEADER_LEN + piece.len());
            ChunkHeader {
                seq,
                total: Some(total),
                len: piece.len() as u32,
                last: seq + 1 == total,
            }
            .write(&mut buf);
            buf.extend_from_slice(piece);
            buf.freeze()
        })
        .collect()
}

/// Rebuilds inbound payloads, one in flight at a time
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    next_seq: u32,
    in_flight: bool,
    /// Set after a failed transfer; remaining chunks are dropped until seq 0
    discarding: bool,
    max_bytes: usize,
}

impl Reassembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            next_seq: 0,
            in_flight: false,
            discarding: false,
            max_bytes,
        }
    }

    /// Whether a partially received payload is buffered
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one frame. Returns the payload when its last chunk arrives.
    ///
    /// Errors abort the current transfer only; the next seq-0 chunk starts over.
    pub fn accept(&mut self, frame: &[u8]) -> Result<Option<Bytes>> {
        let (header, body) = match ChunkHeader::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };

        if header.seq == 0 {
            if self.in_flight {
                warn!(
                    "New transfer started with {} bytes buffered, discarding stale payload",
                    self.buffer.len()
                );
            }
            self.reset();
            self.in_flight = true;
        } else if self.discarding || !self.in_flight {
            debug!("Dropping chunk {} of an abandoned transfer", header.seq);
            return Ok(None);
        } else if header.seq != self.next_seq {
            let expected = self.next_seq;
            self.abort();
            return Err(Error::ChunkOutOfSequence {
                expected,
                got: header.seq,
            });
        }

        let next_seq = match header.seq.checked_add(1) {
            Some(next) => next,
            None if header.last => 0,
            None => {
                self.abort();
                return Err(Error::MalformedChunk(
                    "sequence number space exhausted before the last chunk".into(),
                ));
            }
        };

        if self.buffer.len() + body.len() > self.max_bytes {
            self.abort();
            return Err(Error::PayloadTooLargeForBuffering {
                limit: self.max_bytes,
            });
        }

        self.buffer.extend_from_slice(body);
        self.next_seq = next_seq;

        if header.last {
            let payload = std::mem::take(&mut self.buffer).freeze();
            self.reset();
            return Ok(Some(payload));
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.next_seq = 0;
        self.in_flight = false;
        self.discarding = false;
    }

    fn abort(&mut self) {
        self.reset();
        self.discarding = true;
    }
}

/// Data exchange state, created when the session reaches `Connected`
#[derive(Debug)]
pub struct DataExchange {
    outbound: VecDeque<Bytes>,
    reassembly: Reassembler,
    max_message_size: Option<usize>,
    channel_open: bool,
}

impl DataExchange {
    pub fn new(max_message_size: Option<usize>, max_reassembly_bytes: usize) -> Self {
        Self {
            outbound: VecDeque::new(),
            reassembly: Reassembler::new(max_reassembly_bytes),
            max_message_size,
            channel_open: false,
        }
    }

    pub fn enqueue(&mut self, payload: Bytes) {
        self.outbound.push_back(payload);
    }

    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    pub fn set_channel_open(&mut self, open: bool) {
        self.channel_open = open;
    }

    /// Next payload to transmit, already framed, if the channel is open
    pub fn next_outbound(&mut self) -> Option<Vec<Bytes>> {
        if !self.channel_open {
            return None;
        }
        self.outbound
            .pop_front()
            .map(|payload| split_payload(&payload, self.max_message_size))
    }

    pub fn receive(&mut self, frame: &[u8]) -> Result<Option<Bytes>> {
        self.reassembly.accept(frame)
    }

    pub fn clear(&mut self) {
        self.outbound.clear();
        self.reassembly.reset();
    }
}
