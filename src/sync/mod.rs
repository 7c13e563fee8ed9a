//! Background sync: durable queue of mutations made while offline.
//!
//! Tasks are written to storage on enqueue and removed only after a 2xx
//! replay, so delivery is at-least-once. Replay targets deduplicate through
//! the request's idempotency key.

mod queue;
mod storage;
mod task;

pub use queue::{DrainReport, SyncQueue};
pub use storage::{QueueStorage, SqliteQueueStorage};
pub use task::{RequestSnapshot, SyncTask, TaskStatus};
