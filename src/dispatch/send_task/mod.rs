//! Send task execution -- the task record and its delivery loop.
//!
//! Split into focused submodules:
//! - [`context`] - Task record, progress bookkeeping, execution context
//! - [`execution`] - The delivery loop with retry and recovery waits

mod context;
mod execution;

// Re-export so the rest of the engine has one import path
pub(crate) use context::{SendTask, SendTaskContext};
pub(crate) use execution::run_send_task;
