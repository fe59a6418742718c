use super::{HardState, NodeID, Term};
use crate::error::{Error, Result};

use ::log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// No size limit when fetching log entries.
pub(crate) const NO_LIMIT: u64 = u64::MAX;

/// A log entry type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// An application command, opaque to the consensus core. Noop
    /// entries (e.g. the entry appended on leader election) are
    /// application entries with no command.
    #[default]
    Application,
    /// A membership change. At most one may be uncommitted at a time.
    ConfigChange,
}

/// A log entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The entry type.
    pub entry_type: EntryType,
    /// The command payload, if any. Opaque to the core.
    pub command: Option<Vec<u8>>,
}

impl Entry {
    /// Approximate in-memory size, used for replication batching.
    pub fn size(&self) -> u64 {
        (std::mem::size_of::<Entry>() + self.command.as_ref().map_or(0, Vec::len)) as u64
    }
}

/// The cluster membership: disjoint sets of voters and observers.
/// Observers replicate the log and receive heartbeats, but don't count
/// toward quorum and can't vote or campaign.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: HashSet<NodeID>,
    pub observers: HashSet<NodeID>,
}

/// A point-in-time snapshot of the state machine, compacting all log
/// entries up to and including index. The snapshot data itself is owned
/// by the host; the core only tracks its position and membership.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last entry covered by the snapshot.
    pub index: Index,
    /// The term of the last entry covered by the snapshot.
    pub term: Term,
    /// The membership as of index.
    pub membership: Membership,
}

impl Snapshot {
    /// Returns true if this is the empty placeholder snapshot.
    pub fn is_empty(&self) -> bool {
        self.index == 0
    }
}

/// The host-provided durable log and snapshot store (the "log DB").
///
/// Index contract: entries are contiguous in [first_index, last_index],
/// where first_index is one past the latest snapshot. term() must also
/// answer for the snapshot index itself, and returns Error::Compacted
/// below it and Error::Unavailable beyond last_index. For a fresh log,
/// term(0) is 0.
pub trait LogStore {
    /// Returns the persisted node state and membership, used when
    /// constructing a node.
    fn node_state(&self) -> (HardState, Membership);

    /// Returns the first available log index (one past the snapshot).
    fn first_index(&self) -> Index;

    /// Returns the last log index, or the snapshot index if empty.
    fn last_index(&self) -> Index;

    /// Returns the term of the entry at the given index.
    fn term(&self, index: Index) -> Result<Term>;

    /// Returns entries from the given index through last_index. Stops
    /// before exceeding max_bytes, but always returns at least one
    /// entry if any exist. Returns Error::Compacted below first_index.
    fn entries(&self, from: Index, max_bytes: u64) -> Result<Vec<Entry>>;

    /// Returns the latest snapshot, possibly empty.
    fn snapshot(&self) -> Snapshot;

    /// Appends entries, truncating any existing entries at or beyond
    /// the first appended index. The batch must be contiguous and
    /// attach to the existing log.
    fn append(&mut self, entries: Vec<Entry>) -> Result<()>;

    /// Durably marks entries up to the given index as committed.
    fn commit_to(&mut self, index: Index) -> Result<()>;

    /// Replaces the log with the given snapshot.
    fn restore(&mut self, snapshot: Snapshot) -> Result<()>;
}

/// An in-memory log store, used for testing. Also serves as the
/// reference implementation of the LogStore contract; the host-side
/// helpers set_hard_state() and compact() stand in for the durability
/// the host normally provides.
#[derive(Default)]
pub struct Memory {
    hard_state: HardState,
    membership: Membership,
    snapshot: Snapshot,
    /// Entries in [snapshot.index + 1, last_index].
    entries: Vec<Entry>,
}

impl Memory {
    /// Creates an empty store with the given membership.
    pub fn new(membership: Membership) -> Self {
        Self { membership, ..Self::default() }
    }

    /// Persists a hard state, as the host does when processing Ready.
    pub fn set_hard_state(&mut self, hard_state: HardState) {
        self.hard_state = hard_state;
    }

    /// Compacts the log up to the given snapshot, as the host does
    /// after taking one. The snapshot index must be within the log.
    pub fn compact(&mut self, snapshot: Snapshot) {
        assert!(
            snapshot.index >= self.first_index() && snapshot.index <= self.last_index(),
            "compaction index {} outside log range [{}, {}]",
            snapshot.index,
            self.first_index(),
            self.last_index(),
        );
        self.entries.retain(|e| e.index > snapshot.index);
        self.snapshot = snapshot;
    }
}

impl LogStore for Memory {
    fn node_state(&self) -> (HardState, Membership) {
        (self.hard_state, self.membership.clone())
    }

    fn first_index(&self) -> Index {
        self.snapshot.index + 1
    }

    fn last_index(&self) -> Index {
        self.entries.last().map_or(self.snapshot.index, |e| e.index)
    }

    fn term(&self, index: Index) -> Result<Term> {
        if index == self.snapshot.index {
            return Ok(self.snapshot.term);
        }
        if index < self.snapshot.index {
            return Err(Error::Compacted);
        }
        if index > self.last_index() {
            return Err(Error::Unavailable);
        }
        Ok(self.entries[(index - self.first_index()) as usize].term)
    }

    fn entries(&self, from: Index, max_bytes: u64) -> Result<Vec<Entry>> {
        if from < self.first_index() {
            return Err(Error::Compacted);
        }
        if from > self.last_index() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let mut bytes = 0;
        for entry in &self.entries[(from - self.first_index()) as usize..] {
            bytes += entry.size();
            if !entries.is_empty() && bytes > max_bytes {
                break;
            }
            entries.push(entry.clone());
        }
        Ok(entries)
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot.clone()
    }

    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        assert!(
            first.index >= self.first_index() && first.index <= self.last_index() + 1,
            "appended entries at {} don't attach to log ending at {}",
            first.index,
            self.last_index(),
        );
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "appended entries are not contiguous"
        );
        self.entries.truncate((first.index - self.first_index()) as usize);
        self.entries.extend(entries);
        Ok(())
    }

    fn commit_to(&mut self, index: Index) -> Result<()> {
        self.hard_state.commit = index;
        Ok(())
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        self.entries.clear();
        self.membership = snapshot.membership.clone();
        self.hard_state.commit = snapshot.index;
        self.snapshot = snapshot;
        Ok(())
    }
}

/// A view over the log store layering the Raft rules: the commit and
/// apply watermarks, log matching, conflict truncation, and the
/// current-term commit rule.
///
/// Invariants:
///
/// * Entry indexes are contiguous from first_index (earlier entries
///   live in the snapshot).
/// * Entry terms never decrease from the previous entry.
/// * applied ≤ committed ≤ last_index.
/// * Committed entries are never truncated or replaced.
pub struct RaftLog {
    store: Box<dyn LogStore>,
    /// The index of the last committed entry.
    pub committed: Index,
    /// The index of the last entry confirmed applied by the host.
    pub applied: Index,
}

impl RaftLog {
    /// Initializes a log view over the given store, loading the
    /// persisted commit index.
    pub fn new(store: Box<dyn LogStore>) -> Self {
        let (hard_state, _) = store.node_state();
        if hard_state.commit > store.last_index() {
            panic!(
                "persisted commit index {} beyond last log index {}",
                hard_state.commit,
                store.last_index()
            );
        }
        Self { committed: hard_state.commit, applied: 0, store }
    }

    /// Returns the persisted node state and membership.
    pub fn node_state(&self) -> (HardState, Membership) {
        self.store.node_state()
    }

    /// Returns the first available log index.
    pub fn first_index(&self) -> Index {
        self.store.first_index()
    }

    /// Returns the last log index.
    pub fn last_index(&self) -> Index {
        self.store.last_index()
    }

    /// Returns the term of the last log entry.
    pub fn last_term(&self) -> Term {
        self.term(self.last_index()).expect("last entry term unavailable")
    }

    /// Returns the term of the entry at the given index.
    pub fn term(&self, index: Index) -> Result<Term> {
        self.store.term(index)
    }

    /// Returns entries from the given index, limited by max_bytes.
    pub fn entries(&self, from: Index, max_bytes: u64) -> Result<Vec<Entry>> {
        self.store.entries(from, max_bytes)
    }

    /// Returns the latest snapshot, possibly empty.
    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Returns true if the entry at the given index has the given term.
    /// Compacted entries don't match, except the snapshot index itself.
    pub fn match_term(&self, index: Index, term: Term) -> bool {
        self.term(index).map_or(false, |t| t == term)
    }

    /// Returns true if a log with the given last index and term is at
    /// least as up-to-date as the local log.
    pub fn up_to_date(&self, index: Index, term: Term) -> bool {
        term > self.last_term() || (term == self.last_term() && index >= self.last_index())
    }

    /// Appends entries stamped by the local leader.
    pub fn append(&mut self, entries: Vec<Entry>) -> Result<Index> {
        self.store.append(entries)?;
        Ok(self.last_index())
    }

    /// Appends replicated entries following prev_index, whose term the
    /// caller has already confirmed via match_term. Entries already in
    /// the log are skipped; a suffix conflicting by term is truncated
    /// and replaced. Never truncates at or below the commit index.
    pub fn try_append(&mut self, prev_index: Index, mut entries: Vec<Entry>) -> Result<Index> {
        let mut skip = 0;
        for entry in &entries {
            debug_assert_eq!(entry.index, prev_index + 1 + skip as Index, "non-contiguous batch");
            if entry.index > self.last_index() {
                break;
            }
            match self.term(entry.index) {
                Ok(term) if term != entry.term => {
                    assert!(entry.index > self.committed, "conflict at or below commit index");
                    warn!("truncating conflicting entries from index {}", entry.index);
                    break;
                }
                // Matching or compacted entries are already present.
                _ => skip += 1,
            }
        }
        let entries = entries.split_off(skip);
        if let Some(first) = entries.first() {
            assert!(first.index > self.committed, "appending at or below commit index");
            self.store.append(entries)?;
        }
        Ok(self.last_index())
    }

    /// Raises the commit index to min(index, last_index). Never lowers
    /// it.
    pub fn commit_to(&mut self, index: Index) -> Result<Index> {
        let index = std::cmp::min(index, self.last_index());
        if index <= self.committed {
            return Ok(self.committed);
        }
        self.store.commit_to(index)?;
        self.committed = index;
        Ok(index)
    }

    /// Commits up to the given index if the entry there is from the
    /// given term. Entries from prior terms are never committed by
    /// counting replicas; they commit indirectly when a current-term
    /// entry above them does (see section 5.4.2 of the Raft paper).
    pub fn try_commit(&mut self, index: Index, term: Term) -> Result<bool> {
        if index <= self.committed || !self.match_term(index, term) {
            return Ok(false);
        }
        self.commit_to(index)?;
        Ok(true)
    }

    /// Marks entries up to the given index as applied by the host.
    pub fn applied_to(&mut self, index: Index) {
        assert!(index >= self.applied, "applied index regression {} → {index}", self.applied);
        assert!(index <= self.committed, "applied index {index} beyond commit {}", self.committed);
        self.applied = index;
    }

    /// Returns committed entries not yet confirmed applied. Empty while
    /// a restored snapshot is pending application.
    pub fn committed_entries(&self) -> Vec<Entry> {
        if self.applied >= self.committed {
            return Vec::new();
        }
        match self.entries(self.applied + 1, NO_LIMIT) {
            Ok(mut entries) => {
                entries.truncate((self.committed - self.applied) as usize);
                entries
            }
            // The apply gap is covered by a snapshot the host hasn't
            // confirmed yet.
            Err(Error::Compacted) => Vec::new(),
            Err(e) => panic!("failed to fetch committed entries: {e}"),
        }
    }

    /// Replaces the log with the given snapshot.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        self.committed = snapshot.index;
        self.store.restore(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn entry(index: Index, term: Term) -> Entry {
        Entry { index, term, entry_type: EntryType::Application, command: None }
    }

    fn log_with(entries: Vec<Entry>, commit: Index) -> RaftLog {
        let mut store = Memory::new(Membership::default());
        store.append(entries).expect("append failed");
        store.set_hard_state(HardState { term: 0, vote: None, commit });
        RaftLog::new(Box::new(store))
    }

    #[test]
    fn empty_log() {
        let log = log_with(Vec::new(), 0);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term(0), Ok(0));
        assert!(log.match_term(0, 0));
        assert_eq!(log.term(1), Err(Error::Unavailable));
    }

    #[test]
    fn append_and_fetch() {
        let mut log = log_with(Vec::new(), 0);
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).expect("append failed");
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entries(2, NO_LIMIT).unwrap(), vec![entry(2, 1), entry(3, 2)]);
        assert_eq!(log.entries(4, NO_LIMIT).unwrap(), Vec::new());
    }

    #[test]
    fn entries_respects_max_bytes() {
        let mut log = log_with(Vec::new(), 0);
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]).expect("append failed");
        // A tiny limit still returns at least one entry.
        assert_eq!(log.entries(1, 1).unwrap(), vec![entry(1, 1)]);
        let two = entry(1, 1).size() + entry(2, 1).size();
        assert_eq!(log.entries(1, two).unwrap(), vec![entry(1, 1), entry(2, 1)]);
    }

    /// try_append truncates a conflicting suffix and replaces it.
    #[test]
    fn try_append_truncates_conflicts() {
        let mut log = log_with(vec![entry(1, 1), entry(2, 2)], 1);
        assert!(log.match_term(1, 1));
        let last = log.try_append(1, vec![entry(2, 1), entry(3, 5)]).expect("append failed");
        assert_eq!(last, 3);
        assert_eq!(
            log.entries(1, NO_LIMIT).unwrap(),
            vec![entry(1, 1), entry(2, 1), entry(3, 5)]
        );
    }

    /// try_append skips entries already present without rewriting them.
    #[test]
    fn try_append_skips_existing() {
        let mut log = log_with(vec![entry(1, 1), entry(2, 1)], 2);
        let last = log.try_append(0, vec![entry(1, 1), entry(2, 1)]).expect("append failed");
        assert_eq!(last, 2);
        assert_eq!(log.committed, 2);
    }

    #[test]
    #[should_panic(expected = "conflict at or below commit index")]
    fn try_append_panics_below_commit() {
        let mut log = log_with(vec![entry(1, 1), entry(2, 1)], 2);
        log.try_append(1, vec![entry(2, 3)]).ok();
    }

    #[test]
    fn commit_to_clamps_and_never_lowers() {
        let mut log = log_with(vec![entry(1, 1), entry(2, 1)], 0);
        assert_eq!(log.commit_to(5).unwrap(), 2);
        assert_eq!(log.committed, 2);
        assert_eq!(log.commit_to(1).unwrap(), 2);
        assert_eq!(log.committed, 2);
    }

    /// Entries from a prior term are not committed by counting
    /// replicas.
    #[test]
    fn try_commit_requires_current_term() {
        let mut log = log_with(vec![entry(1, 1), entry(2, 1), entry(3, 2)], 0);
        assert!(!log.try_commit(2, 2).unwrap());
        assert_eq!(log.committed, 0);
        // Committing a current-term entry commits everything below it.
        assert!(log.try_commit(3, 2).unwrap());
        assert_eq!(log.committed, 3);
    }

    #[test_case(0, 0, true; "empty log accepts empty candidate")]
    #[test_case(1, 2, true; "higher term wins despite shorter log")]
    #[test_case(3, 1, true; "equal term and longer log wins")]
    #[test_case(2, 1, true; "equal term and equal length wins")]
    #[test_case(1, 1, false; "equal term and shorter log loses")]
    fn up_to_date(index: Index, term: Term, expect: bool) {
        let log = match (index, term) {
            (0, 0) => log_with(Vec::new(), 0),
            _ => log_with(vec![entry(1, 1), entry(2, 1)], 0),
        };
        assert_eq!(log.up_to_date(index, term), expect);
    }

    #[test]
    fn compaction_signals() {
        let mut store = Memory::new(Membership::default());
        store.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).expect("append failed");
        store.set_hard_state(HardState { term: 2, vote: None, commit: 3 });
        store.compact(Snapshot { index: 2, term: 1, membership: Membership::default() });
        let log = RaftLog::new(Box::new(store));

        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term(1), Err(Error::Compacted));
        assert_eq!(log.term(2), Ok(1)); // snapshot boundary
        assert_eq!(log.entries(2, NO_LIMIT), Err(Error::Compacted));
        assert_eq!(log.entries(3, NO_LIMIT).unwrap(), vec![entry(3, 2)]);
    }

    #[test]
    fn restore_replaces_log() {
        let mut log = log_with(vec![entry(1, 1), entry(2, 1)], 1);
        let membership = Membership {
            voters: [1, 2, 3].into_iter().collect(),
            observers: HashSet::new(),
        };
        log.restore(Snapshot { index: 5, term: 3, membership: membership.clone() })
            .expect("restore failed");
        assert_eq!(log.committed, 5);
        assert_eq!(log.first_index(), 6);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.node_state().1, membership);
    }

    #[test]
    fn committed_entries_tracks_applied() {
        let mut log = log_with(vec![entry(1, 1), entry(2, 1), entry(3, 1)], 0);
        log.commit_to(2).expect("commit failed");
        assert_eq!(log.committed_entries(), vec![entry(1, 1), entry(2, 1)]);
        log.applied_to(1);
        assert_eq!(log.committed_entries(), vec![entry(2, 1)]);
        log.applied_to(2);
        assert_eq!(log.committed_entries(), Vec::new());
    }
}
