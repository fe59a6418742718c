use super::log::NO_LIMIT;
use super::{
    Entry, EntryType, Envelope, HardState, Index, LogStore, Message, RaftLog, Ready, ReadContext,
    ReadyToRead, Snapshot,
};
use super::{FlowState, Peer, ReadIndexQueue};
use crate::errinput;
use crate::error::{Error, Result};

use itertools::Itertools as _;
use ::log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A node ID. 0 is reserved to mean none/unknown, and is rejected in
/// configuration; absent IDs are represented as None.
pub type NodeID = u64;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u32;

/// The default minimum ticks between elections.
const ELECTION_TIMEOUT: Ticks = 10;

/// The default ticks between leader heartbeats.
const HEARTBEAT_INTERVAL: Ticks = 1;

/// The default maximum entry bytes per Replicate message.
const MAX_ENTRY_BYTES: u64 = 1 << 20;

/// Raft node options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The cluster this node belongs to.
    pub cluster_id: u64,
    /// The local node ID. Must be non-zero.
    pub node_id: NodeID,
    /// The minimum number of ticks between elections. The effective
    /// timeout is randomized in [election_timeout, 2 * election_timeout)
    /// to avoid split elections.
    pub election_timeout: Ticks,
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// Step down when a quorum of peers hasn't responded within an
    /// election window, and suppress vote requests from peers that
    /// haven't seen the leader time out (leader stickiness).
    pub check_quorum: bool,
    /// Join the cluster as a non-voting observer.
    pub observer: bool,
    /// Maximum entry bytes per Replicate message.
    pub max_entry_bytes: u64,
    /// Seeds the election timeout randomization, for deterministic
    /// tests. Uses an entropy seed if None.
    pub seed: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            node_id: 0,
            election_timeout: ELECTION_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            check_quorum: false,
            observer: false,
            max_entry_bytes: MAX_ENTRY_BYTES,
            seed: None,
        }
    }
}

impl Options {
    /// Validates the options.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return errinput!("node ID must be non-zero");
        }
        if self.heartbeat_interval == 0 {
            return errinput!("heartbeat interval must be positive");
        }
        if self.election_timeout <= self.heartbeat_interval {
            return errinput!("election timeout must exceed the heartbeat interval");
        }
        Ok(())
    }
}

/// A point-in-time summary of node state, for host introspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub cluster_id: u64,
    pub node_id: NodeID,
    pub role: String,
    pub term: Term,
    pub vote: Option<NodeID>,
    pub leader: Option<NodeID>,
    pub committed: Index,
    pub applied: Index,
    pub last_index: Index,
}

/// A Raft node, with a dynamic role. The node is a pure, deterministic
/// decision engine, driven synchronously by processing inbound messages
/// via step() or by advancing the logical clock via tick(). These
/// methods consume the current node and return a new one with a
/// possibly different role. Staged output (outbound messages, committed
/// entries, read completions, and durable state changes) is drained via
/// ready().
///
/// This enum wraps the RawNode<Role> types, which implement the actual
/// node logic. It exists for ergonomic use across role transitions, i.e
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
    Observer(RawNode<Observer>),
}

impl Node {
    /// Creates a new Raft node from the persisted state and membership
    /// in the given log store, starting as a leaderless follower, or as
    /// an observer when so configured.
    pub fn new(opts: Options, store: Box<dyn LogStore>) -> Result<Self> {
        opts.validate()?;
        check_dispatch();
        let log = RaftLog::new(store);
        let (hard_state, membership) = log.node_state();
        let mut rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let election_timeout = opts.election_timeout + rng.gen_range(0..opts.election_timeout);
        let observer = opts.observer;
        let node = RawNode {
            id: opts.node_id,
            cluster_id: opts.cluster_id,
            term: hard_state.term,
            vote: hard_state.vote,
            voters: membership.voters,
            observers: membership.observers,
            log,
            opts,
            rng,
            msgs: Vec::new(),
            reads_ready: Vec::new(),
            staged_snapshot: None,
            last_hard_state: hard_state,
            role: Follower::new(None, election_timeout),
        };
        if observer {
            return Ok(Node::Observer(node.into_role(Observer::new(None))));
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
            Node::Observer(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
            Node::Observer(n) => n.term,
        }
    }

    /// Processes a message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
            Node::Observer(n) => n.step(msg),
        }
    }

    /// Moves the logical clock forward by one tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
            Node::Observer(n) => n.tick(),
        }
    }

    /// Drains and returns the output staged since the previous ready()
    /// call. The host must persist the hard state and snapshot before
    /// transmitting the messages.
    pub fn ready(&mut self) -> Ready {
        match self {
            Node::Candidate(n) => n.ready(),
            Node::Follower(n) => n.ready(),
            Node::Leader(n) => n.ready(),
            Node::Observer(n) => n.ready(),
        }
    }

    /// Confirms that the host has applied entries up to the given index
    /// to the state machine.
    pub fn set_applied(&mut self, index: Index) {
        match self {
            Node::Candidate(n) => n.log.applied_to(index),
            Node::Follower(n) => n.log.applied_to(index),
            Node::Leader(n) => n.log.applied_to(index),
            Node::Observer(n) => n.log.applied_to(index),
        }
    }

    /// Returns a summary of the node state.
    pub fn status(&self) -> Status {
        match self {
            Node::Candidate(n) => n.status("candidate", None),
            Node::Follower(n) => n.status("follower", n.role.leader),
            Node::Leader(n) => n.status("leader", Some(n.id)),
            Node::Observer(n) => n.status("observer", n.role.leader),
        }
    }

    /// Applies a committed membership change adding a voter. Promoting
    /// an observer keeps its replication progress; promoting the local
    /// node makes it a follower.
    pub fn add_node(self, id: NodeID) -> Result<Self> {
        match self {
            Node::Leader(mut n) => {
                n.add_node(id);
                Ok(n.into())
            }
            Node::Observer(mut n) => {
                let promoted = n.add_node_membership(id);
                if promoted && id == n.id {
                    let (term, leader) = (n.term, n.role.leader);
                    info!("promoted to voter, becoming follower");
                    return Ok(n.into_follower(term, leader)?.into());
                }
                Ok(n.into())
            }
            Node::Follower(mut n) => {
                n.add_node_membership(id);
                Ok(n.into())
            }
            Node::Candidate(mut n) => {
                n.add_node_membership(id);
                Ok(n.into())
            }
        }
    }

    /// Applies a committed membership change adding an observer.
    /// Idempotent.
    pub fn add_observer(self, id: NodeID) -> Result<Self> {
        match self {
            Node::Leader(mut n) => {
                n.add_observer(id);
                Ok(n.into())
            }
            Node::Follower(mut n) => {
                n.add_observer_membership(id);
                Ok(n.into())
            }
            Node::Candidate(mut n) => {
                n.add_observer_membership(id);
                Ok(n.into())
            }
            Node::Observer(mut n) => {
                n.add_observer_membership(id);
                Ok(n.into())
            }
        }
    }

    /// Applies a committed membership change removing a node. The local
    /// node may remove itself and keeps running, but won't campaign or
    /// accept proposals.
    pub fn remove_node(self, id: NodeID) -> Result<Self> {
        match self {
            Node::Leader(mut n) => {
                n.remove_node(id)?;
                Ok(n.into())
            }
            Node::Follower(mut n) => {
                n.remove_node_membership(id);
                Ok(n.into())
            }
            Node::Candidate(mut n) => {
                n.remove_node_membership(id);
                Ok(n.into())
            }
            Node::Observer(mut n) => {
                n.remove_node_membership(id);
                Ok(n.into())
            }
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

impl From<RawNode<Observer>> for Node {
    fn from(n: RawNode<Observer>) -> Self {
        Node::Observer(n)
    }
}

/// A Raft role: leader, follower, candidate, or observer.
pub trait Role {
    /// Returns true if the role's step() routes the given message type
    /// to a handler rather than dropping it. Mirrors the step() match
    /// arms, and is verified against the protocol-forbidden
    /// combinations at node construction (see check_dispatch).
    fn handles(message: &Message) -> bool;
}

/// Protocol-forbidden (role, message type) combinations must never be
/// routed to a handler: the dispatch tables are checked on every node
/// construction, so a dispatch change that accidentally fills one of
/// these cells fails immediately.
fn check_dispatch() {
    let election = Message::Election;
    let request_vote = Message::RequestVote { log_index: 0, log_term: 0, hint: None };
    let request_vote_resp = Message::RequestVoteResp { reject: false };
    let replicate =
        Message::Replicate { log_index: 0, log_term: 0, entries: Vec::new(), commit: 0 };
    let replicate_resp = Message::ReplicateResp { log_index: 0, reject: false, hint: 0 };
    let heartbeat = Message::Heartbeat { commit: 0, ctx: None };
    let heartbeat_resp = Message::HeartbeatResp { ctx: None };
    let install_snapshot = Message::InstallSnapshot { snapshot: Snapshot::default() };
    let snapshot_status = Message::SnapshotStatus { reject: false };
    let read_index_resp = Message::ReadIndexResp { log_index: 0, ctx: ReadContext::default() };
    let unreachable = Message::Unreachable;

    // A leader never processes another leader's messages in its term.
    for message in [&heartbeat, &replicate, &install_snapshot, &read_index_resp] {
        assert!(!Leader::handles(message), "leader must not handle {message:?}");
    }
    // Only leaders track replication progress and peer liveness.
    for message in [&replicate_resp, &heartbeat_resp, &snapshot_status, &unreachable] {
        assert!(!Follower::handles(message), "follower must not handle {message:?}");
        assert!(!Candidate::handles(message), "candidate must not handle {message:?}");
    }
    // Observers neither campaign nor vote.
    for message in [&election, &request_vote, &request_vote_resp, &replicate_resp, &heartbeat_resp]
    {
        assert!(!Observer::handles(message), "observer must not handle {message:?}");
    }
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>, and role-specific behavior
/// only exists on the corresponding type.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    cluster_id: u64,
    term: Term,
    vote: Option<NodeID>,
    /// Voting members, including ourself unless removed.
    voters: HashSet<NodeID>,
    /// Non-voting members. Disjoint from voters.
    observers: HashSet<NodeID>,
    log: RaftLog,
    opts: Options,
    rng: StdRng,
    /// Outbound messages staged for the next ready().
    msgs: Vec<Envelope>,
    /// Quorum-confirmed reads staged for the next ready().
    reads_ready: Vec<ReadyToRead>,
    /// A restored snapshot staged for the next ready().
    staged_snapshot: Option<Snapshot>,
    /// The hard state as of the previous ready(), to detect changes.
    last_hard_state: HardState,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            cluster_id: self.cluster_id,
            term: self.term,
            vote: self.vote,
            voters: self.voters,
            observers: self.observers,
            log: self.log,
            opts: self.opts,
            rng: self.rng,
            msgs: self.msgs,
            reads_ready: self.reads_ready,
            staged_snapshot: self.staged_snapshot,
            last_hard_state: self.last_hard_state,
            role,
        }
    }

    /// Transitions into a follower at the given term, optionally
    /// following a known leader. Raising the term clears the vote.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {term}", self.term);
        if term > self.term {
            info!("discovered new term {term}");
            self.term = term;
            self.vote = None;
        }
        if let Some(leader) = leader {
            info!("following leader {leader} in term {term}");
        }
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(leader, election_timeout)))
    }

    /// Returns the cluster quorum size (strict majority of voters).
    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Returns true if the local node no longer appears in the voter
    /// set.
    fn self_removed(&self) -> bool {
        !self.voters.contains(&self.id)
    }

    /// Returns true if committed entries (possibly including a
    /// membership change) haven't been applied by the host yet.
    fn has_unapplied_entries(&self) -> bool {
        self.log.committed > self.log.applied
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&mut self) -> Ticks {
        self.opts.election_timeout + self.rng.gen_range(0..self.opts.election_timeout)
    }

    /// Stages a message for sending, stamped with the current term.
    fn send(&mut self, to: NodeID, message: Message) {
        let msg = Envelope { from: self.id, to, term: self.term, message };
        debug!("sending {msg:?}");
        self.msgs.push(msg);
    }

    /// Forwards a client request to the leader, preserving its local
    /// origin (term 0).
    fn forward(&mut self, to: NodeID, message: Message) {
        self.msgs.push(Envelope { from: self.id, to, term: 0, message });
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message to node {} stepped on node {}", msg.to, self.id);
    }

    /// Handles a message from a past term. Leader messages get a NoOp
    /// reply carrying our term when check-quorum is enabled, to unstick
    /// a partitioned peer that raised its term while unable to win an
    /// election; everything else is dropped.
    fn stale_message(&mut self, msg: &Envelope) {
        if msg.message.is_leader_message() && self.opts.check_quorum {
            self.send(msg.from, Message::NoOp);
        } else {
            debug!("dropping message from past term {}: {msg:?}", msg.term);
        }
    }

    /// Returns true if a higher-term RequestVote should be dropped to
    /// avoid disrupting an established leader: the request is not
    /// transfer-authorized, check-quorum is enabled, a leader is known,
    /// and the minimum election timeout hasn't elapsed since it was
    /// last heard from (see section 6 of the Raft paper).
    fn suppress_vote_request(
        &self,
        msg: &Envelope,
        leader: Option<NodeID>,
        election_ticks: Ticks,
    ) -> bool {
        let Message::RequestVote { hint, .. } = &msg.message else {
            return false;
        };
        if !self.opts.check_quorum || msg.term <= self.term {
            return false;
        }
        if *hint == Some(msg.from) {
            info!("vote request from {} carries a leader transfer hint", msg.from);
            return false;
        }
        leader.is_some() && election_ticks < self.opts.election_timeout
    }

    /// Answers a RequestVote, granting iff we haven't voted for anyone
    /// else in this term and the candidate's log is at least as
    /// up-to-date as ours. Returns true when granted, so the caller can
    /// reset its election ticks.
    fn handle_request_vote(
        &mut self,
        from: NodeID,
        msg_term: Term,
        log_index: Index,
        log_term: Term,
    ) -> bool {
        let can_grant = self.vote.is_none() || self.vote == Some(from) || msg_term > self.term;
        let up_to_date = self.log.up_to_date(log_index, log_term);
        if can_grant && up_to_date {
            info!("casting vote for {from} in term {}", self.term);
            self.vote = Some(from);
            self.send(from, Message::RequestVoteResp { reject: false });
            return true;
        }
        info!(
            "rejecting vote request from {from} (can_grant={can_grant}, up_to_date={up_to_date})"
        );
        self.send(from, Message::RequestVoteResp { reject: true });
        false
    }

    /// Appends replicated entries from the leader, after log-matching
    /// against the preceding entry, and advances the commit index. On a
    /// mismatch, rejects with our last index as a backoff hint.
    fn handle_replicate(
        &mut self,
        from: NodeID,
        log_index: Index,
        log_term: Term,
        entries: Vec<Entry>,
        commit: Index,
    ) -> Result<()> {
        // Entries at or below the commit index are immutable and known
        // replicated, so just report the commit index back.
        if log_index < self.log.committed {
            let committed = self.log.committed;
            self.send(from, Message::ReplicateResp { log_index: committed, reject: false, hint: 0 });
            return Ok(());
        }
        if self.log.match_term(log_index, log_term) {
            let last_index = log_index + entries.len() as Index;
            self.log.try_append(log_index, entries)?;
            self.log.commit_to(std::cmp::min(last_index, commit))?;
            self.send(from, Message::ReplicateResp { log_index: last_index, reject: false, hint: 0 });
        } else {
            warn!("rejecting entries at index {log_index} term {log_term} from {from}");
            let hint = self.log.last_index();
            self.send(from, Message::ReplicateResp { log_index, reject: true, hint });
        }
        Ok(())
    }

    /// Advances the commit index from a heartbeat and confirms
    /// leadership, echoing any read-index context.
    fn handle_heartbeat(
        &mut self,
        from: NodeID,
        commit: Index,
        ctx: Option<ReadContext>,
    ) -> Result<()> {
        self.log.commit_to(commit)?;
        self.send(from, Message::HeartbeatResp { ctx });
        Ok(())
    }

    /// Installs a snapshot from the leader, replying with our last
    /// index when restored, or the commit index when ignored so the
    /// leader can back off its next index. Returns true if restored.
    fn handle_install_snapshot(
        &mut self,
        from: NodeID,
        snapshot: Snapshot,
        is_observer: bool,
    ) -> Result<bool> {
        let (index, term) = (snapshot.index, snapshot.term);
        if self.restore(snapshot, is_observer)? {
            info!("restored snapshot at index {index} term {term}");
            let last_index = self.log.last_index();
            self.send(from, Message::ReplicateResp { log_index: last_index, reject: false, hint: 0 });
            return Ok(true);
        }
        info!("ignored snapshot at index {index} term {term}");
        let committed = self.log.committed;
        self.send(from, Message::ReplicateResp { log_index: committed, reject: false, hint: 0 });
        Ok(false)
    }

    /// Restores a snapshot, replacing the log and membership, and
    /// stages it for the host to apply. A snapshot at or below the
    /// commit index is ignored, and a snapshot whose index and term
    /// already match the log only advances the commit index. Returns
    /// true if the log was replaced.
    fn restore(&mut self, snapshot: Snapshot, is_observer: bool) -> Result<bool> {
        if snapshot.index <= self.log.committed {
            info!("ignoring snapshot at index {} at or below commit", snapshot.index);
            return Ok(false);
        }
        if !is_observer && snapshot.membership.observers.contains(&self.id) {
            panic!("snapshot at index {} demotes local voter to observer", snapshot.index);
        }
        if self.log.match_term(snapshot.index, snapshot.term) {
            self.log.commit_to(snapshot.index)?;
            return Ok(false);
        }
        self.voters = snapshot.membership.voters.clone();
        self.observers = snapshot.membership.observers.clone();
        self.log.restore(snapshot.clone())?;
        self.staged_snapshot = Some(snapshot);
        Ok(true)
    }

    /// Drains and returns the staged output. The hard state is included
    /// iff it changed since the previous ready().
    fn ready(&mut self) -> Ready {
        let hard_state = HardState { term: self.term, vote: self.vote, commit: self.log.committed };
        let changed = (hard_state != self.last_hard_state).then(|| {
            self.last_hard_state = hard_state;
            hard_state
        });
        Ready {
            hard_state: changed,
            messages: std::mem::take(&mut self.msgs),
            committed_entries: self.log.committed_entries(),
            snapshot: self.staged_snapshot.take(),
            ready_to_reads: std::mem::take(&mut self.reads_ready),
        }
    }

    /// Builds a status summary for the given role.
    fn status(&self, role: &str, leader: Option<NodeID>) -> Status {
        Status {
            cluster_id: self.cluster_id,
            node_id: self.id,
            role: role.to_string(),
            term: self.term,
            vote: self.vote,
            leader,
            committed: self.log.committed,
            applied: self.log.applied,
            last_index: self.log.last_index(),
        }
    }

    /// Adds a voter to the membership, promoting it from the observer
    /// set if present. Returns true if it was promoted.
    fn add_node_membership(&mut self, id: NodeID) -> bool {
        if self.voters.contains(&id) {
            return false;
        }
        let promoted = self.observers.remove(&id);
        self.voters.insert(id);
        promoted
    }

    /// Adds an observer to the membership.
    fn add_observer_membership(&mut self, id: NodeID) {
        self.observers.insert(id);
    }

    /// Removes a node from the membership.
    fn remove_node_membership(&mut self, id: NodeID) {
        self.voters.remove(&id);
        self.observers.remove(&id);
    }
}

/// A follower replicates state from a leader, or waits out an election
/// timeout when there is none.
pub struct Follower {
    /// The leader for the current term, if known.
    leader: Option<NodeID>,
    /// Ticks since the last leader contact or election activity.
    election_ticks: Ticks,
    /// The randomized election timeout.
    election_timeout: Ticks,
    /// Set when a TimeoutNow made this node a leader transfer target;
    /// the next campaign then carries a hint bypassing leader
    /// stickiness.
    transfer_target: bool,
}

impl Follower {
    fn new(leader: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, election_ticks: 0, election_timeout, transfer_target: false }
    }
}

impl Role for Follower {
    fn handles(message: &Message) -> bool {
        matches!(
            message,
            Message::Replicate { .. }
                | Message::Heartbeat { .. }
                | Message::InstallSnapshot { .. }
                | Message::ReadIndexResp { .. }
                | Message::Propose { .. }
                | Message::ReadIndex { .. }
                | Message::LeaderTransfer { .. }
                | Message::TimeoutNow
                | Message::Election
                | Message::RequestVote { .. }
        )
    }
}

impl RawNode<Follower> {
    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if msg.term > 0 && msg.term < self.term {
            self.stale_message(&msg);
            return Ok(self.into());
        }
        if msg.term > self.term {
            if self.suppress_vote_request(&msg, self.role.leader, self.role.election_ticks) {
                info!("suppressing vote request from {}, leader recently active", msg.from);
                return Ok(self.into());
            }
            let leader = msg.message.is_leader_message().then_some(msg.from);
            return self.into_follower(msg.term, leader)?.step(msg);
        }
        debug_assert!(msg.term == 0 || msg.term == self.term, "unreconciled message term");

        match msg.message {
            Message::Replicate { log_index, log_term, entries, commit } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                self.handle_replicate(msg.from, log_index, log_term, entries, commit)?;
            }

            Message::Heartbeat { commit, ctx } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                self.handle_heartbeat(msg.from, commit, ctx)?;
            }

            Message::InstallSnapshot { snapshot } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                self.handle_install_snapshot(msg.from, snapshot, false)?;
            }

            // Answers a read we previously forwarded to the leader.
            Message::ReadIndexResp { log_index, ctx } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                self.reads_ready.push(ReadyToRead { index: log_index, ctx });
            }

            // Forward client requests to the leader, or drop them if
            // there is none (the client must retry).
            Message::Propose { .. } => match self.role.leader {
                Some(leader) => {
                    debug!("forwarding proposal to leader {leader}");
                    self.forward(leader, msg.message);
                }
                None => warn!("dropping proposal, no leader"),
            },

            Message::ReadIndex { .. } => match self.role.leader {
                Some(leader) => self.forward(leader, msg.message),
                None => warn!("dropping read index request, no leader"),
            },

            Message::LeaderTransfer { .. } => match self.role.leader {
                Some(leader) => {
                    info!("forwarding leader transfer request to leader {leader}");
                    self.send(leader, msg.message);
                }
                None => warn!("dropping leader transfer request, no leader"),
            },

            // The leader wants us to take over; campaign immediately,
            // carrying the transfer hint that bypasses stickiness. This
            // is no different from the clock moving forward faster.
            Message::TimeoutNow => {
                info!("leader {} requested immediate campaign", msg.from);
                self.role.election_ticks = 0;
                self.role.transfer_target = true;
                return self.handle_election();
            }

            Message::Election => return self.handle_election(),

            Message::RequestVote { log_index, log_term, .. } => {
                if self.handle_request_vote(msg.from, msg.term, log_index, log_term) {
                    self.role.election_ticks = 0;
                }
            }

            other => debug!("follower dropping {other:?} from {}", msg.from),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick, campaigning when the randomized
    /// election timeout expires.
    fn tick(mut self) -> Result<Node> {
        self.role.election_ticks += 1;
        if !self.self_removed() && self.role.election_ticks >= self.role.election_timeout {
            self.role.election_ticks = 0;
            let id = self.id;
            return self.step(Envelope { from: id, to: id, term: 0, message: Message::Election });
        }
        Ok(self.into())
    }

    /// Starts a campaign, unless committed entries (possibly including
    /// a membership change) haven't been applied yet: campaigning with
    /// a stale membership view could break quorum accounting.
    fn handle_election(mut self) -> Result<Node> {
        if self.has_unapplied_entries() {
            warn!("skipping campaign, committed entries not yet applied");
            self.role.transfer_target = false;
            return Ok(self.into());
        }
        self.into_candidate()
    }

    /// Transitions to candidate and campaigns.
    fn into_candidate(mut self) -> Result<Node> {
        let transfer_target = std::mem::take(&mut self.role.transfer_target);
        let election_timeout = self.gen_election_timeout();
        let node = self.into_role(Candidate::new(election_timeout));
        node.campaign(transfer_target)
    }
}

/// A candidate is campaigning for leadership.
pub struct Candidate {
    /// Responses by voter, true if the vote was granted. Includes
    /// ourself. The first response from each voter wins.
    votes: HashMap<NodeID, bool>,
    /// Ticks since the campaign started.
    election_ticks: Ticks,
    /// The randomized election timeout before campaigning again.
    election_timeout: Ticks,
}

impl Candidate {
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashMap::new(), election_ticks: 0, election_timeout }
    }
}

impl Role for Candidate {
    fn handles(message: &Message) -> bool {
        matches!(
            message,
            Message::Replicate { .. }
                | Message::Heartbeat { .. }
                | Message::InstallSnapshot { .. }
                | Message::RequestVoteResp { .. }
                | Message::Propose { .. }
                | Message::Election
                | Message::RequestVote { .. }
        )
    }
}

impl RawNode<Candidate> {
    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if msg.term > 0 && msg.term < self.term {
            self.stale_message(&msg);
            return Ok(self.into());
        }
        if msg.term > self.term {
            // Candidates have no leader, so stickiness never applies.
            let leader = msg.message.is_leader_message().then_some(msg.from);
            return self.into_follower(msg.term, leader)?.step(msg);
        }
        debug_assert!(msg.term == 0 || msg.term == self.term, "unreconciled message term");

        match msg.message {
            // Another node won the election in this term; follow it and
            // process the message as a follower.
            Message::Replicate { .. } | Message::Heartbeat { .. } | Message::InstallSnapshot { .. } => {
                let term = self.term;
                return self.into_follower(term, Some(msg.from))?.step(msg);
            }

            Message::RequestVoteResp { reject } => {
                if self.observers.contains(&msg.from) {
                    warn!("dropping vote response from observer {}", msg.from);
                    return Ok(self.into());
                }
                self.role.votes.entry(msg.from).or_insert(!reject);
                let granted = self.role.votes.values().filter(|granted| **granted).count();
                let rejected = self.role.votes.len() - granted;
                info!("got {granted} votes and {rejected} rejections, quorum is {}", self.quorum());
                if granted >= self.quorum() {
                    let mut leader = self.into_leader()?;
                    leader.broadcast_replicate()?;
                    return Ok(leader.into());
                }
                if rejected >= self.quorum() {
                    // We lost the election; wait out the term.
                    let term = self.term;
                    return Ok(self.into_follower(term, None)?.into());
                }
            }

            Message::Election => {
                if self.has_unapplied_entries() {
                    warn!("skipping campaign, committed entries not yet applied");
                    return Ok(self.into());
                }
                return self.campaign(false);
            }

            Message::RequestVote { log_index, log_term, .. } => {
                if self.handle_request_vote(msg.from, msg.term, log_index, log_term) {
                    self.role.election_ticks = 0;
                }
            }

            Message::Propose { .. } => warn!("dropping proposal, no leader elected"),

            other => debug!("candidate dropping {other:?} from {}", msg.from),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick, campaigning again when the
    /// election times out without a winner.
    fn tick(mut self) -> Result<Node> {
        self.role.election_ticks += 1;
        if !self.self_removed() && self.role.election_ticks >= self.role.election_timeout {
            self.role.election_ticks = 0;
            let id = self.id;
            return self.step(Envelope { from: id, to: id, term: 0, message: Message::Election });
        }
        Ok(self.into())
    }

    /// Campaigns for leadership: advances the term, votes for ourself,
    /// and solicits votes from all voters. A single-node quorum wins
    /// immediately. When campaigning as a leader transfer target, the
    /// vote requests carry a hint bypassing leader stickiness.
    fn campaign(mut self, transfer_target: bool) -> Result<Node> {
        self.term += 1;
        self.vote = Some(self.id);
        let election_timeout = self.gen_election_timeout();
        self.role = Candidate::new(election_timeout);
        self.role.votes.insert(self.id, true);
        info!("campaigning for leadership in term {}", self.term);

        if self.quorum() == 1 {
            return Ok(self.into_leader()?.into());
        }
        let hint = transfer_target.then_some(self.id);
        let (log_index, log_term) = (self.log.last_index(), self.log.last_term());
        let peers: Vec<NodeID> =
            self.voters.iter().copied().filter(|id| *id != self.id).sorted().collect();
        for to in peers {
            self.send(to, Message::RequestVote { log_index, log_term, hint });
        }
        Ok(self.into())
    }

    /// Transitions the candidate to leader after winning the election.
    /// Appends a noop entry to establish the commit index in the new
    /// term (see section 5.4.2 of the Raft paper).
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("won election for term {}, becoming leader", self.term);
        let role = Leader::new(self.id, &self.voters, &self.observers, self.log.last_index());
        let mut node = self.into_role(role);
        match node.pending_config_change_count()? {
            0 => {}
            1 => {
                info!("assuming leadership with a pending config change");
                node.role.pending_config_change = true;
            }
            n => panic!("{n} uncommitted config change entries"),
        }
        node.append_entries(vec![Entry::default()])?;
        Ok(node)
    }
}

/// A leader serves proposals and linearizable reads, and replicates the
/// log to voters and observers.
pub struct Leader {
    /// Replication progress for every voter, including ourself.
    progress: HashMap<NodeID, Peer>,
    /// Replication progress for observers.
    observer_progress: HashMap<NodeID, Peer>,
    /// Ticks since the last check-quorum window; also the leader
    /// transfer abort timer.
    election_ticks: Ticks,
    /// Ticks since the last periodic heartbeat.
    heartbeat_ticks: Ticks,
    /// Pending linearizable reads awaiting quorum confirmation.
    reads: ReadIndexQueue,
    /// True while a membership change entry is uncommitted. At most one
    /// may be outstanding.
    pending_config_change: bool,
    /// The target of an ongoing leadership transfer.
    transfer_target: Option<NodeID>,
}

impl Leader {
    fn new(
        id: NodeID,
        voters: &HashSet<NodeID>,
        observers: &HashSet<NodeID>,
        last_index: Index,
    ) -> Self {
        let next_index = last_index + 1;
        let progress = voters
            .iter()
            .map(|v| match *v == id {
                true => (*v, Peer::with_match(last_index, next_index)),
                false => (*v, Peer::new(next_index)),
            })
            .collect();
        let observer_progress = observers.iter().map(|o| (*o, Peer::new(next_index))).collect();
        Self {
            progress,
            observer_progress,
            election_ticks: 0,
            heartbeat_ticks: 0,
            reads: ReadIndexQueue::default(),
            pending_config_change: false,
            transfer_target: None,
        }
    }
}

impl Role for Leader {
    fn handles(message: &Message) -> bool {
        matches!(
            message,
            Message::LeaderHeartbeat
                | Message::CheckQuorum
                | Message::Propose { .. }
                | Message::ReadIndex { .. }
                | Message::ReplicateResp { .. }
                | Message::HeartbeatResp { .. }
                | Message::SnapshotStatus { .. }
                | Message::Unreachable
                | Message::LeaderTransfer { .. }
                | Message::Election
                | Message::RequestVote { .. }
        )
    }
}

impl RawNode<Leader> {
    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if msg.term > 0 && msg.term < self.term {
            self.stale_message(&msg);
            return Ok(self.into());
        }
        if msg.term > self.term {
            if self.suppress_vote_request(&msg, Some(self.id), self.role.election_ticks) {
                info!("suppressing vote request from {}, leadership established", msg.from);
                return Ok(self.into());
            }
            let leader = msg.message.is_leader_message().then_some(msg.from);
            return self.into_follower(msg.term, leader)?.step(msg);
        }
        debug_assert!(msg.term == 0 || msg.term == self.term, "unreconciled message term");

        match msg.message {
            Message::LeaderHeartbeat => self.broadcast_heartbeat()?,

            Message::CheckQuorum => {
                if !self.leader_has_quorum() {
                    warn!("stepping down, lost contact with a quorum");
                    let term = self.term;
                    return Ok(self.into_follower(term, None)?.into());
                }
            }

            Message::Propose { mut entries } => {
                if self.self_removed() {
                    warn!("dropping proposal, local node removed");
                    return Ok(self.into());
                }
                if self.role.transfer_target.is_some() {
                    warn!("dropping proposal, leader transfer in progress");
                    return Ok(self.into());
                }
                for entry in &mut entries {
                    if entry.entry_type == EntryType::ConfigChange {
                        if self.role.pending_config_change {
                            warn!("demoting config change to noop, one is already pending");
                            *entry = Entry::default();
                        }
                        self.role.pending_config_change = true;
                    }
                }
                self.append_entries(entries)?;
                self.broadcast_replicate()?;
            }

            Message::ReadIndex { ctx } => self.handle_read_index(msg.from, ctx)?,

            Message::ReplicateResp { log_index, reject, hint } => {
                self.handle_replicate_resp(msg.from, log_index, reject, hint)?;
            }

            Message::HeartbeatResp { ctx } => self.handle_heartbeat_resp(msg.from, ctx)?,

            Message::SnapshotStatus { reject } => self.handle_snapshot_status(msg.from, reject),

            Message::Unreachable => {
                info!("peer {} unreachable, probing again", msg.from);
                self.enter_retry_state(msg.from);
            }

            Message::LeaderTransfer { target } => self.handle_leader_transfer(target)?,

            Message::Election => info!("ignoring election signal, already leader"),

            Message::RequestVote { log_index, log_term, .. } => {
                if self.handle_request_vote(msg.from, msg.term, log_index, log_term) {
                    self.role.election_ticks = 0;
                }
            }

            other => debug!("leader dropping {other:?} from {}", msg.from),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick: periodic heartbeats, the
    /// check-quorum window, and the leader transfer abort timer.
    fn tick(mut self) -> Result<Node> {
        self.role.election_ticks += 1;
        if self.role.election_ticks >= self.opts.election_timeout {
            if self.role.transfer_target.is_some() {
                warn!("aborting leader transfer, target did not take over in time");
                self.role.transfer_target = None;
            }
            self.role.election_ticks = 0;
            if self.opts.check_quorum && !self.leader_has_quorum() {
                warn!("stepping down, lost contact with a quorum");
                let term = self.term;
                return Ok(self.into_follower(term, None)?.into());
            }
        }
        self.role.heartbeat_ticks += 1;
        if self.role.heartbeat_ticks >= self.opts.heartbeat_interval {
            self.role.heartbeat_ticks = 0;
            self.broadcast_heartbeat()?;
        }
        Ok(self.into())
    }

    /// Returns a peer's progress, whether voter or observer.
    fn peer(&self, id: NodeID) -> Option<&Peer> {
        self.role.progress.get(&id).or_else(|| self.role.observer_progress.get(&id))
    }

    /// Returns a peer's progress mutably, whether voter or observer.
    fn peer_mut(&mut self, id: NodeID) -> Option<&mut Peer> {
        if self.role.progress.contains_key(&id) {
            return self.role.progress.get_mut(&id);
        }
        self.role.observer_progress.get_mut(&id)
    }

    /// Appends entries to the local log at the current term, advancing
    /// our own progress and, on a single-node quorum, the commit index.
    fn append_entries(&mut self, mut entries: Vec<Entry>) -> Result<()> {
        let mut index = self.log.last_index();
        for entry in &mut entries {
            index += 1;
            entry.index = index;
            entry.term = self.term;
        }
        let last_index = self.log.append(entries)?;
        self.role.progress.get_mut(&self.id).expect("no progress for local node").try_update(last_index);
        if self.quorum() == 1 {
            self.maybe_commit()?;
        }
        Ok(())
    }

    /// Commits entries replicated to a quorum of voters, subject to the
    /// current-term rule: entries from previous terms are never
    /// committed by counting replicas (see section 5.4.2 of the Raft
    /// paper). Returns true if the commit index advanced.
    fn maybe_commit(&mut self) -> Result<bool> {
        let matches: Vec<Index> = self.role.progress.values().map(|p| p.match_index).collect();
        let quorum_index = quorum_value(matches, self.quorum());
        self.log.try_commit(quorum_index, self.term)
    }

    /// Sends pending entries to a peer according to its progress,
    /// unless sends are paused. If the needed entries have been
    /// compacted away, sends the current snapshot instead, but only to
    /// peers known to be active.
    fn send_replicate(&mut self, to: NodeID) -> Result<()> {
        let peer = self.peer(to).expect("no progress for peer");
        let (next_index, paused, active) = (peer.next_index, peer.is_paused(), peer.active);
        if paused {
            return Ok(());
        }
        match self.log.term(next_index - 1) {
            Ok(log_term) => {
                let entries = self.log.entries(next_index, self.opts.max_entry_bytes)?;
                if let Some(last) = entries.last() {
                    debug_assert_eq!(
                        last.index,
                        next_index - 1 + entries.len() as Index,
                        "non-contiguous replicate batch"
                    );
                }
                let last_index = entries.last().map(|e| e.index);
                let commit = self.log.committed;
                let message =
                    Message::Replicate { log_index: next_index - 1, log_term, entries, commit };
                self.send(to, message);
                if let Some(last_index) = last_index {
                    self.peer_mut(to).expect("no progress for peer").sent_entries(last_index);
                }
            }
            Err(Error::Compacted) => {
                if !active {
                    warn!("peer {to} is inactive, not sending snapshot");
                    return Ok(());
                }
                let snapshot = self.log.snapshot();
                assert!(!snapshot.is_empty(), "log compacted without a snapshot");
                let index = snapshot.index;
                info!("sending snapshot at index {index} to {to}");
                self.send(to, Message::InstallSnapshot { snapshot });
                self.peer_mut(to).expect("no progress for peer").become_snapshot(index);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Sends entries to every voter and observer.
    fn broadcast_replicate(&mut self) -> Result<()> {
        let voters: Vec<NodeID> =
            self.voters.iter().copied().filter(|id| *id != self.id).sorted().collect();
        for to in voters {
            self.send_replicate(to)?;
        }
        let observers: Vec<NodeID> = self.observers.iter().copied().sorted().collect();
        for to in observers {
            assert_ne!(to, self.id, "leader listed as observer");
            self.send_replicate(to)?;
        }
        Ok(())
    }

    /// Broadcasts heartbeats, stamped with the newest pending read
    /// context, if any.
    fn broadcast_heartbeat(&mut self) -> Result<()> {
        let ctx = self.role.reads.latest_ctx();
        self.broadcast_heartbeat_with(ctx)
    }

    /// Broadcasts heartbeats to all voters, each carrying the commit
    /// index clamped to that peer's match index so no follower learns a
    /// commit index beyond its own log. Observers are included only
    /// when no read context is attached, since they don't count toward
    /// read confirmation.
    fn broadcast_heartbeat_with(&mut self, ctx: Option<ReadContext>) -> Result<()> {
        let committed = self.log.committed;
        let voters: Vec<NodeID> =
            self.voters.iter().copied().filter(|id| *id != self.id).sorted().collect();
        for to in voters {
            let match_index = self.peer(to).expect("no progress for voter").match_index;
            let commit = std::cmp::min(match_index, committed);
            self.send(to, Message::Heartbeat { commit, ctx });
        }
        if ctx.is_none() {
            let observers: Vec<NodeID> = self.observers.iter().copied().sorted().collect();
            for to in observers {
                let match_index = self.peer(to).expect("no progress for observer").match_index;
                let commit = std::cmp::min(match_index, committed);
                self.send(to, Message::Heartbeat { commit, ctx: None });
            }
        }
        Ok(())
    }

    /// Counts voters seen since the last check-quorum window, consuming
    /// their activity flags so the next window requires fresh
    /// responses.
    fn leader_has_quorum(&mut self) -> bool {
        let quorum = self.quorum();
        let id = self.id;
        let mut count = 0;
        for (peer_id, peer) in self.role.progress.iter_mut() {
            if *peer_id == id || peer.active {
                count += 1;
                peer.active = false;
            }
        }
        count >= quorum
    }

    /// Handles a replication response, advancing the peer's progress
    /// and the commit index, or backing off after a rejection. Finishes
    /// an ongoing leadership transfer once the target has caught up.
    fn handle_replicate_resp(
        &mut self,
        from: NodeID,
        log_index: Index,
        reject: bool,
        hint: Index,
    ) -> Result<()> {
        let Some(peer) = self.peer_mut(from) else {
            debug!("no progress for peer {from}, dropping replication response");
            return Ok(());
        };
        peer.active = true;
        if reject {
            if peer.decrease_to(log_index, hint) {
                self.enter_retry_state(from);
                self.send_replicate(from)?;
            }
            return Ok(());
        }
        let paused = peer.is_paused();
        if peer.try_update(log_index) {
            peer.responded_to();
            if self.maybe_commit()? {
                // The commit index advanced; let everyone know.
                self.broadcast_replicate()?;
            } else if paused {
                // The peer was paused waiting for this response; there
                // may be more entries to send it.
                self.send_replicate(from)?;
            }
            if self.role.transfer_target == Some(from)
                && self.peer(from).map(|p| p.match_index) == Some(self.log.last_index())
            {
                info!("transfer target {from} caught up, requesting takeover");
                self.send(from, Message::TimeoutNow);
            }
        }
        Ok(())
    }

    /// Handles a heartbeat response: marks the peer active, lifts any
    /// wait gating, catches the peer up if it is behind, and feeds any
    /// read-index confirmation into the read queue.
    fn handle_heartbeat_resp(&mut self, from: NodeID, ctx: Option<ReadContext>) -> Result<()> {
        let last_index = self.log.last_index();
        let Some(peer) = self.peer_mut(from) else {
            debug!("no progress for peer {from}, dropping heartbeat response");
            return Ok(());
        };
        peer.active = true;
        peer.unblock_wait();
        if peer.match_index < last_index {
            self.send_replicate(from)?;
        }
        if let Some(ctx) = ctx {
            self.confirm_read_index(from, ctx);
        }
        Ok(())
    }

    /// Records a peer's leadership confirmation, completing reads
    /// confirmed by a voter quorum (counting ourself). Completions for
    /// local requests become ready-to-reads; completions for forwarded
    /// requests are answered to the forwarder.
    fn confirm_read_index(&mut self, from: NodeID, ctx: ReadContext) {
        let quorum = self.quorum();
        for read in self.role.reads.confirm(ctx, from, quorum) {
            if read.from == self.id {
                self.reads_ready.push(ReadyToRead { index: read.index, ctx: read.ctx });
            } else {
                self.send(read.from, Message::ReadIndexResp { log_index: read.index, ctx: read.ctx });
            }
        }
    }

    /// Handles a linearizable read request via the ReadIndex protocol
    /// (see section 6.4 of the Raft thesis): record the current commit
    /// index, confirm leadership with a quorum of heartbeats, then
    /// release the read. Dropped until an entry from the current term
    /// has committed, since only then is the commit index known to be
    /// the cluster-wide maximum.
    fn handle_read_index(&mut self, from: NodeID, ctx: ReadContext) -> Result<()> {
        if self.self_removed() {
            warn!("dropping read index request, local node removed");
            return Ok(());
        }
        if !self.has_committed_entry_at_current_term() {
            warn!("dropping read index request, no entry committed in current term");
            return Ok(());
        }
        let committed = self.log.committed;
        if self.quorum() == 1 {
            self.reads_ready.push(ReadyToRead { index: committed, ctx });
            if from != self.id && self.observers.contains(&from) {
                self.send(from, Message::ReadIndexResp { log_index: committed, ctx });
            }
            return Ok(());
        }
        self.role.reads.add_request(committed, ctx, from);
        self.broadcast_heartbeat_with(Some(ctx))
    }

    /// Returns true if an entry from the current term has committed.
    fn has_committed_entry_at_current_term(&self) -> bool {
        assert_ne!(self.term, 0, "leader at term 0");
        match self.log.term(self.log.committed) {
            Ok(term) => term == self.term,
            Err(Error::Compacted) => false,
            Err(e) => panic!("term of commit index unavailable: {e}"),
        }
    }

    /// Handles the transport's verdict on an in-flight snapshot
    /// transfer. Either way the peer moves to Wait until its next
    /// response; a failed transfer forgets the snapshot index so
    /// replication resumes from the confirmed match index.
    fn handle_snapshot_status(&mut self, from: NodeID, reject: bool) {
        let Some(peer) = self.peer_mut(from) else {
            debug!("no progress for peer {from}, dropping snapshot status");
            return;
        };
        if peer.state != FlowState::Snapshot {
            debug!("ignoring snapshot status for {from}, no snapshot in flight");
            return;
        }
        if reject {
            info!("snapshot transfer to {from} failed");
            peer.clear_pending_snapshot();
        } else {
            info!("snapshot transfer to {from} succeeded");
        }
        peer.become_wait();
    }

    /// Begins transferring leadership to the target: stop accepting
    /// proposals, and send TimeoutNow once the target's log is caught
    /// up (immediately, if it already is). The transfer aborts if the
    /// target doesn't take over within an election timeout.
    fn handle_leader_transfer(&mut self, target: Option<NodeID>) -> Result<()> {
        let Some(target) = target else { panic!("leader transfer target not set") };
        if self.role.transfer_target.is_some() {
            warn!("ignoring leader transfer to {target}, one is in progress");
            return Ok(());
        }
        if target == self.id {
            warn!("ignoring leader transfer to ourself");
            return Ok(());
        }
        let Some(match_index) = self.peer(target).map(|p| p.match_index) else {
            warn!("ignoring leader transfer to unknown node {target}");
            return Ok(());
        };
        info!("transferring leadership to {target}");
        self.role.transfer_target = Some(target);
        self.role.election_ticks = 0;
        if match_index == self.log.last_index() {
            self.send(target, Message::TimeoutNow);
        }
        Ok(())
    }

    /// Drops a peer from optimistic pipelining back to probing.
    fn enter_retry_state(&mut self, id: NodeID) {
        if let Some(peer) = self.peer_mut(id) {
            if peer.state == FlowState::Replicate {
                peer.become_retry();
            }
        }
    }

    /// Returns the number of uncommitted config change entries.
    fn pending_config_change_count(&self) -> Result<usize> {
        let entries = self.log.entries(self.log.committed + 1, NO_LIMIT)?;
        Ok(entries.iter().filter(|e| e.entry_type == EntryType::ConfigChange).count())
    }

    /// Adds a voter. A promoted observer keeps its replication
    /// progress: resetting it would redo already-replicated work.
    fn add_node(&mut self, id: NodeID) {
        self.role.pending_config_change = false;
        if self.voters.contains(&id) {
            return;
        }
        if self.observers.remove(&id) {
            self.voters.insert(id);
            let peer =
                self.role.observer_progress.remove(&id).expect("no progress for observer");
            self.role.progress.insert(id, peer);
            return;
        }
        self.voters.insert(id);
        self.role.progress.insert(id, Peer::new(self.log.last_index() + 1));
    }

    /// Adds an observer. Idempotent.
    fn add_observer(&mut self, id: NodeID) {
        self.role.pending_config_change = false;
        if self.observers.contains(&id) {
            return;
        }
        self.observers.insert(id);
        self.role.observer_progress.insert(id, Peer::new(self.log.last_index() + 1));
    }

    /// Removes a node. Removing a voter may lower the quorum match
    /// index requirement, so attempt a commit and broadcast it.
    fn remove_node(&mut self, id: NodeID) -> Result<()> {
        self.remove_node_membership(id);
        self.role.progress.remove(&id);
        self.role.observer_progress.remove(&id);
        self.role.pending_config_change = false;
        if self.role.transfer_target == Some(id) {
            info!("aborting leader transfer, target {id} removed");
            self.role.transfer_target = None;
        }
        if !self.role.progress.is_empty() && self.maybe_commit()? {
            self.broadcast_replicate()?;
        }
        Ok(())
    }
}

/// An observer is a non-voting member: it replicates the log and
/// receives heartbeats, but doesn't count toward quorum, can't vote,
/// and never campaigns. It stays an observer across terms, and leaves
/// the role only when a membership change promotes it to voter.
pub struct Observer {
    /// The leader for the current term, if known.
    leader: Option<NodeID>,
    /// Ticks since the last leader contact.
    election_ticks: Ticks,
}

impl Observer {
    fn new(leader: Option<NodeID>) -> Self {
        Self { leader, election_ticks: 0 }
    }
}

impl Role for Observer {
    fn handles(message: &Message) -> bool {
        matches!(
            message,
            Message::Replicate { .. }
                | Message::Heartbeat { .. }
                | Message::InstallSnapshot { .. }
                | Message::ReadIndexResp { .. }
                | Message::Propose { .. }
                | Message::ReadIndex { .. }
        )
    }
}

impl RawNode<Observer> {
    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if msg.term > 0 && msg.term < self.term {
            self.stale_message(&msg);
            return Ok(self.into());
        }
        if msg.term > self.term {
            if self.suppress_vote_request(&msg, self.role.leader, self.role.election_ticks) {
                info!("suppressing vote request from {}, leader recently active", msg.from);
                return Ok(self.into());
            }
            let leader = msg.message.is_leader_message().then_some(msg.from);
            return self.into_observer(msg.term, leader)?.step(msg);
        }
        debug_assert!(msg.term == 0 || msg.term == self.term, "unreconciled message term");

        match msg.message {
            Message::Replicate { log_index, log_term, entries, commit } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                self.handle_replicate(msg.from, log_index, log_term, entries, commit)?;
            }

            Message::Heartbeat { commit, ctx } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                self.handle_heartbeat(msg.from, commit, ctx)?;
            }

            Message::InstallSnapshot { snapshot } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                let restored = self.handle_install_snapshot(msg.from, snapshot, true)?;
                // The snapshot membership may have promoted us.
                if restored && self.voters.contains(&self.id) {
                    let (term, leader) = (self.term, self.role.leader);
                    info!("promoted to voter by snapshot membership");
                    return Ok(self.into_follower(term, leader)?.into());
                }
            }

            Message::ReadIndexResp { log_index, ctx } => {
                self.role.election_ticks = 0;
                self.role.leader = Some(msg.from);
                self.reads_ready.push(ReadyToRead { index: log_index, ctx });
            }

            Message::Propose { .. } => match self.role.leader {
                Some(leader) => {
                    debug!("forwarding proposal to leader {leader}");
                    self.forward(leader, msg.message);
                }
                None => warn!("dropping proposal, no leader"),
            },

            Message::ReadIndex { .. } => match self.role.leader {
                Some(leader) => self.forward(leader, msg.message),
                None => warn!("dropping read index request, no leader"),
            },

            other => debug!("observer dropping {other:?} from {}", msg.from),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. Observers track leader activity
    /// but never campaign.
    fn tick(mut self) -> Result<Node> {
        self.role.election_ticks += 1;
        Ok(self.into())
    }

    /// Steps into a new term, staying an observer.
    fn into_observer(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Observer>> {
        assert!(term >= self.term, "term regression {} → {term}", self.term);
        if term > self.term {
            info!("discovered new term {term}");
            self.term = term;
            self.vote = None;
        }
        Ok(self.into_role(Observer::new(leader)))
    }
}

/// Returns the highest value replicated to a quorum: the quorum-th
/// greatest of the given match indexes.
fn quorum_value(mut values: Vec<Index>, quorum: usize) -> Index {
    assert!(quorum > 0 && quorum <= values.len(), "quorum {quorum} of {} values", values.len());
    *values.select_nth_unstable_by(quorum - 1, |a, b: &Index| a.cmp(b).reverse()).1
}
