//! Request routing.
//!
//! Every request is answered: handler errors are folded into a
//! `success: false` response carrying the error's display string.

use panpan_core::protocol::{
    CancelResult, CreateSessionParams, CreateTaskParams, ExecuteParams, GetOutputParams, Request,
    RequestType, Response, SessionListFilter, SessionRef, TaskRef, UpdateSessionParams,
    UpdateTaskParams,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use super::DaemonState;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// `type` is not a known request type.
    #[error("{0}")]
    UnknownType(String),

    #[error("Invalid payload for {kind}: {source}")]
    Payload {
        kind: RequestType,
        #[source]
        source: serde_json::Error,
    },

    /// Reserved request types the daemon does not serve.
    #[error("Unsupported request type: {0}")]
    Unsupported(RequestType),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode {kind} result: {source}")]
    Encode {
        kind: RequestType,
        #[source]
        source: serde_json::Error,
    },
}

/// Handle one request and build its response.
pub async fn dispatch(request: &Request, state: &DaemonState) -> Response {
    debug!("Request {} ({})", request.id, request.kind);
    match route(request, state).await {
        Ok(data) => Response::ok(&request.id, data),
        Err(e) => {
            debug!("Request {} failed: {e}", request.id);
            Response::err(&request.id, e.to_string())
        }
    }
}

async fn route(request: &Request, state: &DaemonState) -> Result<Value, DispatchError> {
    let kind: RequestType = request.kind.parse().map_err(DispatchError::UnknownType)?;

    match kind {
        RequestType::Ping => Ok(json!({ "pong": true })),
        // The connection cancels the shutdown token once this ack is written.
        RequestType::Shutdown => Ok(json!({ "shuttingDown": true })),

        RequestType::SessionCreate => {
            let params: CreateSessionParams = payload(kind, request)?;
            to_value(kind, state.store.create_session(params).await?)
        }
        RequestType::SessionGet => {
            let SessionRef { session_id } = payload(kind, request)?;
            to_value(kind, state.store.get_session(&session_id).await?)
        }
        RequestType::SessionList => {
            let filter: SessionListFilter = payload(kind, request)?;
            to_value(kind, state.store.list_sessions(&filter).await?)
        }
        RequestType::SessionUpdate => {
            let params: UpdateSessionParams = payload(kind, request)?;
            to_value(kind, state.store.update_session(params).await?)
        }

        RequestType::TaskCreate => {
            let params: CreateTaskParams = payload(kind, request)?;
            to_value(kind, state.store.create_task(params).await?)
        }
        RequestType::TaskGet => {
            let TaskRef { task_id } = payload(kind, request)?;
            to_value(kind, state.store.get_task(&task_id).await?)
        }
        RequestType::TaskList => {
            let SessionRef { session_id } = payload(kind, request)?;
            to_value(kind, state.store.list_tasks(&session_id).await?)
        }
        RequestType::TaskUpdate => {
            let params: UpdateTaskParams = payload(kind, request)?;
            to_value(kind, state.executor.update_task(params).await?)
        }

        RequestType::Execute => {
            let params: ExecuteParams = payload(kind, request)?;
            to_value(kind, state.executor.execute(params).await?)
        }
        RequestType::GetStatus => {
            let TaskRef { task_id } = payload(kind, request)?;
            to_value(kind, state.executor.get_status(&task_id).await?)
        }
        RequestType::GetOutput => {
            let params: GetOutputParams = payload(kind, request)?;
            to_value(kind, state.executor.get_output(&params).await?)
        }
        RequestType::Cancel => {
            let TaskRef { task_id } = payload(kind, request)?;
            let cancelled = state.executor.cancel(&task_id).await;
            to_value(kind, CancelResult { cancelled })
        }

        RequestType::Attach | RequestType::Detach => Err(DispatchError::Unsupported(kind)),
    }
}

/// Decode the payload; a missing payload reads as `{}`.
fn payload<T: DeserializeOwned>(kind: RequestType, request: &Request) -> Result<T, DispatchError> {
    let value = request.payload.clone().unwrap_or_else(|| json!({}));
    serde_json::from_value(value).map_err(|source| DispatchError::Payload { kind, source })
}

fn to_value<T: Serialize>(kind: RequestType, value: T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|source| DispatchError::Encode { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoModel;
    use crate::execution::{ExecutionManager, ExecutionSettings};
    use crate::store::MemorySessionStore;
    use crate::tool::ToolRegistry;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn state() -> DaemonState {
        let executor = Arc::new(ExecutionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(EchoModel),
            Arc::new(ToolRegistry::new()),
            ExecutionSettings::default(),
        ));
        DaemonState::new(executor, CancellationToken::new())
    }

    async fn call(state: &DaemonState, kind: &str, payload: Option<Value>) -> Response {
        dispatch(&Request::new("r1", kind, payload), state).await
    }

    #[tokio::test]
    async fn test_ping() {
        let response = call(&state(), "ping", None).await;
        assert_eq!(response, Response::ok("r1", json!({"pong": true})));
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let response = call(&state(), "frobnicate", None).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Unknown request type: frobnicate"));
    }

    #[tokio::test]
    async fn test_reserved_types_unsupported() {
        let state = state();
        for kind in ["attach", "detach"] {
            let response = call(&state, kind, None).await;
            assert_eq!(
                response.error,
                Some(format!("Unsupported request type: {kind}"))
            );
        }
    }

    #[tokio::test]
    async fn test_session_create_and_list() {
        let state = state();
        let created = call(
            &state,
            "session_create",
            Some(json!({"projectRoot": "/proj", "model": "m1"})),
        )
        .await;
        assert!(created.success);
        let data = created.data.unwrap();
        assert_eq!(data["status"], "active");
        assert!(data["createdAt"].is_string());
        assert!(data["updatedAt"].is_string());

        let listed = call(&state, "session_list", None).await;
        assert_eq!(listed.data.unwrap().as_array().unwrap().len(), 1);

        let filtered = call(&state, "session_list", Some(json!({"projectRoot": "/other"}))).await;
        assert_eq!(filtered.data.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_task_create_requires_session() {
        let response = call(
            &state(),
            "task_create",
            Some(json!({"sessionId": "ghost", "type": "prompt"})),
        )
        .await;
        assert_eq!(response.error.as_deref(), Some("Session not found: ghost"));
    }

    #[tokio::test]
    async fn test_bad_payload_is_reported() {
        let response = call(&state(), "session_get", Some(json!({"nope": 1}))).await;
        let error = response.error.unwrap();
        assert!(error.starts_with("Invalid payload for session_get:"), "{error}");
    }

    #[tokio::test]
    async fn test_task_update_rejects_illegal_transition() {
        let state = state();
        let session = call(
            &state,
            "session_create",
            Some(json!({"projectRoot": "/p", "model": "m"})),
        )
        .await
        .data
        .unwrap();
        let task = call(
            &state,
            "task_create",
            Some(json!({"sessionId": session["id"], "type": "prompt"})),
        )
        .await
        .data
        .unwrap();
        assert_eq!(task["status"], "pending");

        let response = call(
            &state,
            "task_update",
            Some(json!({"taskId": task["id"], "status": "cancelled"})),
        )
        .await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("pending -> cancelled"));
    }

    #[tokio::test]
    async fn test_task_create_rejects_terminal_status() {
        let state = state();
        let session = call(
            &state,
            "session_create",
            Some(json!({"projectRoot": "/p", "model": "m"})),
        )
        .await
        .data
        .unwrap();

        for status in ["cancelled", "completed", "failed"] {
            let response = call(
                &state,
                "task_create",
                Some(json!({"sessionId": session["id"], "type": "x", "status": status})),
            )
            .await;
            assert!(!response.success);
            assert_eq!(
                response.error,
                Some(format!("Tasks cannot be created as {status}"))
            );
        }

        let tasks = call(&state, "task_list", Some(json!({"sessionId": session["id"]}))).await;
        assert_eq!(tasks.data, Some(json!([])));
    }

    #[tokio::test]
    async fn test_task_update_cannot_finish_an_execution() {
        let state = state();
        let started = state
            .executor
            .execute(ExecuteParams {
                prompt: "hello".to_string(),
                session_id: None,
                model: "m".to_string(),
                project_root: "/p".to_string(),
                system_prompt: None,
                llm_config: None,
            })
            .await
            .unwrap();
        // The current-thread runtime has not polled the run yet.
        assert_eq!(state.executor.active_count(), 1);

        let response = call(
            &state,
            "task_update",
            Some(json!({"taskId": &started.task_id, "status": "completed"})),
        )
        .await;
        assert!(!response.success);
        assert_eq!(
            response.error,
            Some(format!("Task {} is executing; use cancel to stop it", started.task_id))
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let response = call(&state(), "cancel", Some(json!({"taskId": "nope"}))).await;
        assert_eq!(response.data, Some(json!({"cancelled": false})));
    }

    #[tokio::test]
    async fn test_shutdown_acknowledged() {
        let state = state();
        let response = call(&state, "shutdown", None).await;
        assert_eq!(response.data, Some(json!({"shuttingDown": true})));
        // Cancelling is the connection's job, after the ack is written.
        assert!(!state.shutdown.is_cancelled());
    }
}
