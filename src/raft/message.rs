use super::{Entry, Index, NodeID, Snapshot, Term};

use serde::{Deserialize, Serialize};

/// A message envelope passed between Raft nodes.
///
/// Messages that originate locally (ticks, client requests, transport
/// status signals) carry term 0 and are always dispatched; messages
/// from peers carry the sender's term, which is reconciled against the
/// local term before dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The sender's term, or 0 for local-origin messages.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A message between Raft nodes, or a local signal to one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Local tick signal: the election timeout elapsed, campaign for
    /// leadership.
    Election,

    /// A client proposal, either submitted locally or forwarded to the
    /// leader by a follower or observer.
    Propose {
        /// Proposed entries. Index and term are assigned by the leader.
        entries: Vec<Entry>,
    },

    /// Leaders replicate log entries to followers and observers.
    Replicate {
        /// The index of the entry immediately preceding the batch.
        log_index: Index,
        /// The term of the entry immediately preceding the batch.
        log_term: Term,
        /// Entries to append.
        entries: Vec<Entry>,
        /// The leader's commit index.
        commit: Index,
    },

    /// Acknowledges or rejects a Replicate or InstallSnapshot message.
    ReplicateResp {
        /// On success, the last index now known replicated. On
        /// rejection, the index that failed to match.
        log_index: Index,
        /// Whether the entries were rejected due to a log mismatch.
        reject: bool,
        /// On rejection, the recipient's last index, as a backoff hint.
        hint: Index,
    },

    /// Leaders send periodic heartbeats to followers and observers.
    Heartbeat {
        /// The leader's commit index, clamped to the recipient's match
        /// index so the recipient never learns a commit index beyond
        /// what it has replicated.
        commit: Index,
        /// A pending read-index context, if leadership confirmation was
        /// requested as part of the ReadIndex protocol.
        ctx: Option<ReadContext>,
    },

    /// Confirms leadership after a heartbeat.
    HeartbeatResp {
        /// The read-index context of the heartbeat being answered.
        ctx: Option<ReadContext>,
    },

    /// Candidates solicit votes when campaigning for leadership.
    RequestVote {
        /// The index of the candidate's last log entry.
        log_index: Index,
        /// The term of the candidate's last log entry.
        log_term: Term,
        /// Set to the candidate itself when campaigning as a leader
        /// transfer target, which bypasses leader stickiness.
        hint: Option<NodeID>,
    },

    /// Answers a RequestVote, granting or rejecting the vote.
    RequestVoteResp {
        /// Whether the vote was rejected.
        reject: bool,
    },

    /// Leaders install a snapshot on peers whose log tail has been
    /// compacted away.
    InstallSnapshot {
        /// The snapshot, including the membership at its index.
        snapshot: Snapshot,
    },

    /// Local transport signal: the outcome of an in-flight snapshot
    /// transfer to a peer.
    SnapshotStatus {
        /// Whether the snapshot transfer failed.
        reject: bool,
    },

    /// Local transport signal: a peer is unreachable.
    Unreachable,

    /// Local tick signal: verify that a quorum of peers has been active
    /// within the last election window, stepping down otherwise.
    CheckQuorum,

    /// Local tick signal: broadcast heartbeats.
    LeaderHeartbeat,

    /// Requests that leadership be handed to the target node. Followers
    /// forward this to their leader.
    LeaderTransfer {
        /// The node to transfer leadership to.
        target: Option<NodeID>,
    },

    /// Instructs a leader transfer target to campaign immediately.
    TimeoutNow,

    /// A linearizable read request, either submitted locally or
    /// forwarded to the leader.
    ReadIndex {
        /// An opaque client context identifying the read.
        ctx: ReadContext,
    },

    /// Answers a forwarded ReadIndex once leadership is confirmed.
    ReadIndexResp {
        /// The commit index the read must wait for.
        log_index: Index,
        /// The client context of the original request.
        ctx: ReadContext,
    },

    /// An empty reply used to unstick stale peers when check-quorum is
    /// enabled. Has no handler in any role.
    NoOp,
}

impl Message {
    /// Returns true if the message type is only ever sent by a leader.
    /// Such messages identify their sender as the leader for the term.
    pub fn is_leader_message(&self) -> bool {
        matches!(
            self,
            Message::Replicate { .. }
                | Message::InstallSnapshot { .. }
                | Message::Heartbeat { .. }
                | Message::TimeoutNow
                | Message::ReadIndexResp { .. }
        )
    }
}

/// An opaque client context identifying a linearizable read request.
/// The host assigns these; the core only requires uniqueness among
/// in-flight reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadContext {
    pub low: u64,
    pub high: u64,
}

/// A read request whose index has been quorum-confirmed. The host may
/// serve the read once entries up to index have been applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyToRead {
    /// The commit index the read must wait for.
    pub index: Index,
    /// The client context of the request.
    pub ctx: ReadContext,
}

/// The durable node state. The host must persist this before
/// transmitting any messages staged in the same Ready batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The current term.
    pub term: Term,
    /// The node voted for in the current term, if any.
    pub vote: Option<NodeID>,
    /// The commit index.
    pub commit: Index,
}

/// Output staged since the previous ready() call.
///
/// The host must persist hard_state and snapshot before sending
/// messages, apply committed_entries to the state machine (confirming
/// with set_applied), and may serve ready_to_reads once applied catches
/// up to their index.
#[derive(Debug, Default, PartialEq)]
pub struct Ready {
    /// Durable state to persist, if it changed.
    pub hard_state: Option<HardState>,
    /// Outbound messages, in staging order.
    pub messages: Vec<Envelope>,
    /// Committed entries not yet confirmed applied via set_applied.
    pub committed_entries: Vec<Entry>,
    /// A restored snapshot the host must install in the state machine.
    pub snapshot: Option<Snapshot>,
    /// Quorum-confirmed read requests.
    pub ready_to_reads: Vec<ReadyToRead>,
}
