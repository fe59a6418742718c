mod log;
mod message;
mod node;
mod peer;
mod read_index;

pub use self::log::{Entry, EntryType, Index, LogStore, Membership, Memory, RaftLog, Snapshot};
pub use message::{Envelope, HardState, Message, Ready, ReadContext, ReadyToRead};
pub use node::{Node, NodeID, Options, Status, Term, Ticks};
pub use peer::{FlowState, Peer};
pub use read_index::{ReadIndexQueue, ReadStatus};
