pub mod memory;
pub mod traits;

pub use memory::{InMemoryStore, WriteKind, WriteOp};
pub use traits::{ChildAdded, RecordStore, Subscription, Unsubscribe};
