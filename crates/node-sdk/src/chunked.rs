//! Outbound side of the chunking protocol.
//!
//! A logical message larger than the transport's frame payload limit is
//! split into `max`-sized chunks; only the last one carries
//! `completed = true`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use el_protocol::{ErrorKind, ErrorPayload, Frame, MessageKind};
use parking_lot::Mutex;

use crate::connectivity::ActiveClient;
use crate::types::PostError;

/// One frame's worth of a chunked message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u64,
    pub completed: bool,
    pub data: Bytes,
}

/// Split `payload` into chunks of at most `max` bytes.
///
/// Yields `ceil(len / max)` chunks, and a single empty completed chunk for
/// an empty payload.
pub fn chunk_payload(payload: Bytes, max: usize) -> Vec<Chunk> {
    let max = max.max(1);
    let mut chunks = Vec::with_capacity(payload.len() / max + 1);
    let mut rest = payload;
    let mut seq = 0u64;
    while rest.len() > max {
        let data = rest.split_to(max);
        chunks.push(Chunk {
            seq,
            completed: false,
            data,
        });
        seq += 1;
    }
    chunks.push(Chunk {
        seq,
        completed: true,
        data: rest,
    });
    chunks
}

/// One send lane per sid.  A post holds its sid's lane from the first
/// chunk to the last, so two messages on one sid never interleave.
#[derive(Debug, Default)]
pub struct SidLanes {
    lanes: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl SidLanes {
    pub fn new() -> Self {
        Self::default()
    }

    fn ticket(self: &Arc<Self>, sid: u64) -> LaneTicket {
        let lane = self.lanes.lock().entry(sid).or_default().clone();
        LaneTicket {
            lanes: self.clone(),
            sid,
            lane,
        }
    }

    /// Sids with a post in progress or waiting.
    pub fn busy(&self) -> usize {
        self.lanes.lock().len()
    }
}

/// Claim on a sid's lane; the map entry goes away with the last claim.
struct LaneTicket {
    lanes: Arc<SidLanes>,
    sid: u64,
    lane: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LaneTicket {
    fn drop(&mut self) {
        // Two references left (the map's and ours) means no other claim.
        let mut lanes = self.lanes.lanes.lock();
        if Arc::strong_count(&self.lane) == 2 {
            lanes.remove(&self.sid);
        }
    }
}

/// Posts complete messages through whichever client is active.
#[derive(Clone, Debug)]
pub struct ChunkedPoster {
    active: Arc<ActiveClient>,
    lanes: Arc<SidLanes>,
}

impl ChunkedPoster {
    pub fn new(active: Arc<ActiveClient>) -> Self {
        Self::with_lanes(active, Arc::new(SidLanes::new()))
    }

    /// Poster that serializes per sid with every other poster sharing
    /// `lanes`.
    pub fn with_lanes(active: Arc<ActiveClient>, lanes: Arc<SidLanes>) -> Self {
        Self { active, lanes }
    }

    /// Payload limit of the active client, if connected.
    pub fn max_payload_size(&self) -> Option<usize> {
        self.active.current().map(|c| c.max_payload_size())
    }

    /// Send `payload` as one logical message on `sid`.  Returns the seq of
    /// the final chunk.
    ///
    /// All chunks go through the client that was active when the post
    /// started.  The first failed chunk aborts the post.  Posts on the same
    /// sid run one at a time, in the order they claimed the lane.
    pub async fn post(&self, sid: u64, kind: MessageKind, payload: impl Into<Bytes>) -> Result<u64, PostError> {
        let payload = payload.into();
        let ticket = self.lanes.ticket(sid);
        let _turn = ticket.lane.lock().await;
        let client = self.active.current().ok_or(PostError::NotConnected)?;
        let mut last = 0;
        for chunk in chunk_payload(payload, client.max_payload_size()) {
            let seq = chunk.seq;
            client
                .post_msg(Frame::new(kind, sid, seq, chunk.completed, chunk.data))
                .await
                .map_err(|source| PostError::Transport { sid, seq, source })?;
            last = seq;
        }
        Ok(last)
    }

    /// Send an `Error` message on `sid`.
    pub async fn post_error(&self, sid: u64, kind: ErrorKind, message: impl Into<String>) -> Result<u64, PostError> {
        self.post_error_payload(sid, &ErrorPayload::new(kind, message)).await
    }

    pub async fn post_error_payload(&self, sid: u64, error: &ErrorPayload) -> Result<u64, PostError> {
        let body = serde_json::to_vec(error)?;
        self.post(sid, MessageKind::Error, body).await
    }
}
