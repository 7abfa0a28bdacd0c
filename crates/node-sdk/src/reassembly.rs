//! Per-session reorder buffer that turns chunked frames back into complete
//! messages.
//!
//! Fragments of one logical message share a `sid`, start at `seq = 0` and
//! end with the fragment flagged `completed`.  Transports may deliver them
//! out of order; the reassembler appends each contiguous run as it becomes
//! available and yields the message once every seq up to the final one has
//! been consumed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::{Bytes, BytesMut};

/// How many completed sids are remembered so late duplicates are dropped.
pub const DEFAULT_TOMBSTONES: usize = 4096;

/// Default limit on buffered out-of-order fragments per session.
pub const DEFAULT_MAX_PENDING: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("session {sid} exceeded {limit} buffered fragments")]
    TooManyPending { sid: u64, limit: usize },
}

#[derive(Default)]
struct PartialMessage {
    /// Next seq to append.
    next_seq: u64,
    buf: BytesMut,
    /// Out-of-order fragments waiting for the gap before them.
    pending: BTreeMap<u64, Bytes>,
    final_seq: Option<u64>,
}

impl PartialMessage {
    fn is_complete(&self) -> bool {
        matches!(self.final_seq, Some(last) if self.next_seq > last)
    }

    fn absorb_contiguous(&mut self) {
        while let Some(chunk) = self.pending.remove(&self.next_seq) {
            self.buf.extend_from_slice(&chunk);
            self.next_seq += 1;
        }
    }
}

/// Reorder buffer keyed by session id.
pub struct SeqReassembler {
    sessions: HashMap<u64, PartialMessage>,
    tombstones: HashSet<u64>,
    tombstone_order: VecDeque<u64>,
    tombstone_limit: usize,
    max_pending: usize,
}

impl Default for SeqReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl SeqReassembler {
    pub fn new(max_pending: usize) -> Self {
        Self::with_tombstones(max_pending, DEFAULT_TOMBSTONES)
    }

    pub fn with_tombstones(max_pending: usize, tombstone_limit: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            tombstones: HashSet::new(),
            tombstone_order: VecDeque::new(),
            tombstone_limit: tombstone_limit.max(1),
            max_pending: max_pending.max(1),
        }
    }

    /// Accept one fragment.  Returns the full message if this fragment
    /// completed it.
    pub fn offer(&mut self, sid: u64, seq: u64, payload: Bytes) -> Result<Option<Bytes>, ReassemblyError> {
        if self.tombstones.contains(&sid) {
            tracing::trace!(sid, seq, "dropping fragment for completed session");
            return Ok(None);
        }

        let limit = self.max_pending;
        let partial = self.sessions.entry(sid).or_default();

        if seq < partial.next_seq || partial.pending.contains_key(&seq) {
            tracing::trace!(sid, seq, "duplicate fragment ignored");
            return Ok(None);
        }

        if seq == partial.next_seq {
            partial.buf.extend_from_slice(&payload);
            partial.next_seq += 1;
            partial.absorb_contiguous();
        } else {
            if partial.pending.len() >= limit {
                self.sessions.remove(&sid);
                return Err(ReassemblyError::TooManyPending { sid, limit });
            }
            partial.pending.insert(seq, payload);
        }

        Ok(self.take_if_complete(sid))
    }

    /// Record `final_seq` as the last fragment of the message on `sid`.
    pub fn mark_complete(&mut self, sid: u64, final_seq: u64) -> Option<Bytes> {
        if self.tombstones.contains(&sid) {
            return None;
        }
        let partial = self.sessions.entry(sid).or_default();
        partial.final_seq = Some(final_seq);
        // Anything past the final fragment can never be part of this message.
        partial.pending.retain(|seq, _| *seq <= final_seq);
        if partial.next_seq > final_seq {
            partial.pending.clear();
        }
        self.take_if_complete(sid)
    }

    /// [`offer`](Self::offer) followed by [`mark_complete`](Self::mark_complete)
    /// when the fragment carries the completed flag.
    pub fn push(
        &mut self,
        sid: u64,
        seq: u64,
        completed: bool,
        payload: Bytes,
    ) -> Result<Option<Bytes>, ReassemblyError> {
        if let Some(done) = self.offer(sid, seq, payload)? {
            return Ok(Some(done));
        }
        if completed {
            return Ok(self.mark_complete(sid, seq));
        }
        Ok(None)
    }

    /// Drop any partial state for `sid` without tombstoning it.
    pub fn forget(&mut self, sid: u64) {
        self.sessions.remove(&sid);
    }

    /// Drop all state, tombstones included.  Used on connection teardown.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.tombstones.clear();
        self.tombstone_order.clear();
    }

    /// Number of sessions with a partially assembled message.
    pub fn in_flight(&self) -> usize {
        self.sessions.len()
    }

    fn take_if_complete(&mut self, sid: u64) -> Option<Bytes> {
        if !self.sessions.get(&sid).is_some_and(PartialMessage::is_complete) {
            return None;
        }
        let partial = self.sessions.remove(&sid)?;
        self.tombstone(sid);
        Some(partial.buf.freeze())
    }

    fn tombstone(&mut self, sid: u64) {
        if self.tombstones.insert(sid) {
            self.tombstone_order.push_back(sid);
        }
        while self.tombstone_order.len() > self.tombstone_limit {
            if let Some(old) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&old);
            }
        }
    }
}
