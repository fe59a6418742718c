use super::{Index, NodeID, ReadContext};

use ::log::debug;
use std::collections::{HashMap, HashSet};

/// A pending linearizable read, waiting for a quorum of heartbeat
/// responses to confirm the leader's authority since the request.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadStatus {
    /// The commit index at the time of the request.
    pub index: Index,
    /// The opaque client context of the request.
    pub ctx: ReadContext,
    /// The node the request arrived from: the local node for local
    /// reads, or the forwarding peer.
    pub from: NodeID,
    /// Peers that have confirmed leadership for this context.
    confirmed: HashSet<NodeID>,
}

/// The queue of pending ReadIndex requests, ordered by arrival.
/// Confirming a context completes it and every earlier request, since
/// the quorum that confirmed it also confirms any older commit index.
#[derive(Debug, Default)]
pub struct ReadIndexQueue {
    pending: HashMap<ReadContext, ReadStatus>,
    queue: Vec<ReadContext>,
}

impl ReadIndexQueue {
    /// Enqueues a read request awaiting confirmation.
    pub fn add_request(&mut self, index: Index, ctx: ReadContext, from: NodeID) {
        if self.pending.contains_key(&ctx) {
            debug!("ignoring duplicate read index context {ctx:?}");
            return;
        }
        self.queue.push(ctx);
        self.pending.insert(ctx, ReadStatus { index, ctx, from, confirmed: HashSet::new() });
    }

    /// Returns true if any requests are pending.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Returns the most recently queued context, to stamp on heartbeat
    /// broadcasts. Confirming it drains the entire queue.
    pub fn latest_ctx(&self) -> Option<ReadContext> {
        self.queue.last().copied()
    }

    /// Records a peer's confirmation of the given context. When the
    /// confirmations reach a quorum (counting the leader itself),
    /// returns the completed request and all earlier ones, removing
    /// them from the queue.
    pub fn confirm(&mut self, ctx: ReadContext, from: NodeID, quorum: usize) -> Vec<ReadStatus> {
        let Some(status) = self.pending.get_mut(&ctx) else {
            return Vec::new();
        };
        status.confirmed.insert(from);
        if status.confirmed.len() + 1 < quorum {
            return Vec::new();
        }
        let position = self
            .queue
            .iter()
            .position(|c| *c == ctx)
            .expect("confirmed context missing from queue");
        self.queue
            .drain(..=position)
            .map(|c| self.pending.remove(&c).expect("queued context missing from pending"))
            .collect()
    }
}
