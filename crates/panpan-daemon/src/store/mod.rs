//! Session and task persistence.
//!
//! The daemon talks to storage only through [`SessionStore`], so a durable
//! backend can replace [`MemorySessionStore`] without touching the server.
//! Every implementation must enforce the same rules:
//!
//! - `create_task` requires an existing session and starts a task as
//!   `pending` or `running`, never terminal
//! - task status changes follow [`TaskStatus::can_transition_to`]
//! - entering a terminal status stamps `completedAt`

mod memory;

pub use memory::MemorySessionStore;

use async_trait::async_trait;
use panpan_core::protocol::{
    CreateSessionParams, CreateTaskParams, Session, SessionListFilter, Task, TaskStatus,
    UpdateSessionParams, UpdateTaskParams,
};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by session store operations.
///
/// The display strings are sent to clients verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Tasks cannot be created as {0}")]
    InvalidInitialStatus(TaskStatus),

    /// The task is being executed; only `cancel` may end it.
    #[error("Task {0} is executing; use cancel to stop it")]
    TaskExecuting(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// CRUD over sessions and tasks.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, params: CreateSessionParams) -> Result<Session, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Sessions matching `filter`, oldest first.
    async fn list_sessions(&self, filter: &SessionListFilter) -> Result<Vec<Session>, StoreError>;

    async fn update_session(&self, params: UpdateSessionParams) -> Result<Session, StoreError>;

    async fn create_task(&self, params: CreateTaskParams) -> Result<Task, StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError>;

    /// Tasks of one session, oldest first.
    async fn list_tasks(&self, session_id: &str) -> Result<Vec<Task>, StoreError>;

    async fn update_task(&self, params: UpdateTaskParams) -> Result<Task, StoreError>;
}

/// Shared handle to the active store.
pub type SharedSessionStore = Arc<dyn SessionStore>;
