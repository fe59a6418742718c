use super::Index;

/// The replication flow state of a remote peer, governing send
/// throttling. Orthogonal to the node role.
///
/// Probe and Retry allow a single batch in flight, pausing in Wait
/// until the peer responds; a successful response promotes the peer to
/// Replicate, where sends pipeline optimistically. Snapshot pauses
/// replication entirely while a snapshot transfer is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlowState {
    /// The initial state: the match index is unknown, so a single batch
    /// is sent at a time to discover it.
    #[default]
    Probe,
    /// Steady state: the peer accepts entries, sends pipeline without
    /// waiting for responses.
    Replicate,
    /// A snapshot transfer is in flight; no entries are sent.
    Snapshot,
    /// A batch is in flight; sends pause until the peer responds.
    Wait,
    /// Probing after a rejection, an unreachability signal, or a
    /// completed snapshot.
    Retry,
}

/// Replication progress for a remote voter or observer, tracked by the
/// leader.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Peer {
    /// The highest index known replicated to the peer (0 if none).
    pub match_index: Index,
    /// The next index to send. Always greater than match_index.
    pub next_index: Index,
    /// The replication flow state.
    pub state: FlowState,
    /// The index of the snapshot in flight, when in Snapshot state. At
    /// most one snapshot is in flight per peer.
    pub pending_snapshot_index: Option<Index>,
    /// Whether the peer has responded since the last check-quorum
    /// window.
    pub active: bool,
}

impl Peer {
    /// Creates progress for a peer whose log state is unknown.
    pub fn new(next_index: Index) -> Self {
        Self { next_index, ..Self::default() }
    }

    /// Creates progress with a known match index, e.g. for the local
    /// node.
    pub fn with_match(match_index: Index, next_index: Index) -> Self {
        assert!(match_index < next_index, "match_index {match_index} >= next_index {next_index}");
        Self { match_index, next_index, ..Self::default() }
    }

    /// Returns true if sends to the peer are currently suppressed.
    pub fn is_paused(&self) -> bool {
        matches!(self.state, FlowState::Wait | FlowState::Snapshot)
    }

    /// Moves the peer to Retry, rewinding next_index to just past the
    /// highest confirmed index.
    pub fn become_retry(&mut self) {
        self.next_index = match self.pending_snapshot_index.take() {
            Some(snapshot_index) => std::cmp::max(self.match_index, snapshot_index) + 1,
            None => self.match_index + 1,
        };
        self.state = FlowState::Retry;
    }

    /// Moves the peer to Wait, e.g. after a snapshot transfer resolves,
    /// holding sends until the next response.
    pub fn become_wait(&mut self) {
        self.become_retry();
        self.state = FlowState::Wait;
    }

    /// Moves the peer to steady-state Replicate.
    pub fn become_replicate(&mut self) {
        self.next_index = self.match_index + 1;
        self.pending_snapshot_index = None;
        self.state = FlowState::Replicate;
    }

    /// Records a snapshot transfer in flight at the given index.
    pub fn become_snapshot(&mut self, index: Index) {
        self.pending_snapshot_index = Some(index);
        self.next_index = index + 1;
        self.state = FlowState::Snapshot;
    }

    /// Abandons an in-flight snapshot that the transport reported
    /// failed.
    pub fn clear_pending_snapshot(&mut self) {
        self.pending_snapshot_index = None;
    }

    /// Advances next_index after entries were queued for sending. In
    /// Replicate the send is optimistic; in Probe/Retry the peer pauses
    /// until it responds.
    pub fn sent_entries(&mut self, last_index: Index) {
        match self.state {
            FlowState::Replicate => self.next_index = last_index + 1,
            FlowState::Probe | FlowState::Retry => self.state = FlowState::Wait,
            FlowState::Wait | FlowState::Snapshot => panic!("sent entries to a paused peer"),
        }
    }

    /// Attempts to advance the match index, returning true if it did.
    /// next_index never regresses.
    pub fn try_update(&mut self, index: Index) -> bool {
        self.next_index = std::cmp::max(self.next_index, index + 1);
        if index > self.match_index {
            self.match_index = index;
            return true;
        }
        false
    }

    /// Promotes the peer after a successful replication response:
    /// probing states resume pipelining, and a completed snapshot falls
    /// back to probing from its index.
    pub fn responded_to(&mut self) {
        match self.state {
            FlowState::Probe | FlowState::Retry | FlowState::Wait => self.become_replicate(),
            FlowState::Snapshot => {
                if self.match_index >= self.pending_snapshot_index.unwrap_or(0) {
                    self.become_retry();
                }
            }
            FlowState::Replicate => {}
        }
    }

    /// Rewinds next_index after a rejection at the given index, using
    /// the peer's last index as a hint. Returns false if the rejection
    /// is stale. Unblocks a waiting peer so the rewound batch can be
    /// resent immediately.
    pub fn decrease_to(&mut self, rejected: Index, hint: Index) -> bool {
        if self.state == FlowState::Replicate {
            // Rejections below the confirmed match index are stale.
            if rejected <= self.match_index {
                return false;
            }
            self.next_index = self.match_index + 1;
            return true;
        }
        // Only the most recent probe can be rejected; anything else is
        // a stale or duplicate response.
        if self.next_index - 1 != rejected {
            return false;
        }
        self.unblock_wait();
        self.next_index = std::cmp::max(1, std::cmp::min(rejected, hint + 1));
        true
    }

    /// Unblocks a waiting peer, e.g. when a heartbeat response shows it
    /// is alive.
    pub fn unblock_wait(&mut self) {
        if self.state == FlowState::Wait {
            self.state = FlowState::Retry;
        }
    }
}
