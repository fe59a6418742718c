//! A deterministic Raft consensus core. The node is a pure decision
//! engine: the host drives it with ticks and messages, drains staged
//! output with ready(), and owns storage, transport, and the
//! application state machine.

#![warn(clippy::all)]

pub mod error;
pub mod raft;

pub use error::{Error, Result};
pub use raft::{
    Entry, EntryType, Envelope, HardState, Index, LogStore, Membership, Memory, Message, Node,
    NodeID, Options, RaftLog, Ready, ReadContext, ReadyToRead, Snapshot, Status, Term, Ticks,
};
