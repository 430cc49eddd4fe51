pub mod entry;
pub mod queue;

pub use entry::{BufferEntry, ChangeOperation, NewEntry, ParseOperationError};
pub use queue::BufferQueue;
