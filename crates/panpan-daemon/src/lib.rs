//! panpan daemon: sessions, tasks, background prompt execution and the
//! framed request/response server that exposes them.
//!
//! - [`server`] accepts connections and routes requests
//! - [`store`] persists sessions and tasks behind [`store::SessionStore`]
//! - [`execution`] runs prompts in the background and owns task output
//! - [`output`] is the per-task append-only chunk log
//! - [`agent`] and [`tool`] drive the model and its tool calls

pub mod agent;
pub mod execution;
pub mod output;
pub mod server;
pub mod store;
pub mod tool;

pub use execution::{ExecutionManager, ExecutionSettings};
pub use server::{DaemonState, ServerHandle, start_server};
