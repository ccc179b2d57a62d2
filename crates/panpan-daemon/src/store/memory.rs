//! In-process session store. Contents live as long as the daemon does.

use super::{SessionStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use panpan_core::protocol::{
    CreateSessionParams, CreateTaskParams, Session, SessionListFilter, Task, TaskStatus,
    UpdateSessionParams, UpdateTaskParams,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// Session ids in creation order.
    session_order: Vec<String>,
    tasks: HashMap<String, Task>,
    /// Task ids per session in creation order.
    tasks_by_session: HashMap<String, Vec<String>>,
}

/// [`SessionStore`] backed by in-memory maps.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Merge `patch` into `target` key by key. Non-object patches replace the
/// whole value.
fn merge_metadata(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(patch)) => {
            for (key, value) in patch {
                existing.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, params: CreateSessionParams) -> Result<Session, StoreError> {
        let mut session = Session::new(new_id(), params.project_root, params.model);
        if let Some(metadata) = params.metadata {
            merge_metadata(&mut session.metadata, metadata);
        }

        let mut inner = self.lock();
        inner.session_order.push(session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        debug!("Created session {}", session.id);
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn list_sessions(&self, filter: &SessionListFilter) -> Result<Vec<Session>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .session_order
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn update_session(&self, params: UpdateSessionParams) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(&params.session_id)
            .ok_or_else(|| StoreError::SessionNotFound(params.session_id.clone()))?;

        let now = Utc::now();
        if let Some(status) = params.status {
            session.status = status;
            if status.is_terminal() && session.completed_at.is_none() {
                session.completed_at = Some(now);
            }
        }
        if let Some(model) = params.model {
            session.model = model;
        }
        if let Some(metadata) = params.metadata {
            merge_metadata(&mut session.metadata, metadata);
        }
        session.updated_at = now;
        Ok(session.clone())
    }

    async fn create_task(&self, params: CreateTaskParams) -> Result<Task, StoreError> {
        let mut inner = self.lock();
        if !inner.sessions.contains_key(&params.session_id) {
            return Err(StoreError::SessionNotFound(params.session_id));
        }

        let status = params.status.unwrap_or(TaskStatus::Pending);
        if status.is_terminal() {
            return Err(StoreError::InvalidInitialStatus(status));
        }
        let now = Utc::now();
        let task = Task {
            id: new_id(),
            session_id: params.session_id,
            task_type: params.task_type,
            description: params.description,
            status,
            result: None,
            error: None,
            started_at: now,
            completed_at: None,
        };

        inner
            .tasks_by_session
            .entry(task.session_id.clone())
            .or_default()
            .push(task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        debug!("Created task {} in session {}", task.id, task.session_id);
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError> {
        self.lock()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    async fn list_tasks(&self, session_id: &str) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(inner
            .tasks_by_session
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| inner.tasks.get(id)).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_task(&self, params: UpdateTaskParams) -> Result<Task, StoreError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&params.task_id)
            .ok_or_else(|| StoreError::TaskNotFound(params.task_id.clone()))?;

        if let Some(next) = params.status {
            if !task.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: next,
                });
            }
            if next.is_terminal() {
                task.completed_at = Some(Utc::now());
            }
            task.status = next;
        }
        if params.result.is_some() {
            task.result = params.result;
        }
        if params.error.is_some() {
            task.error = params.error;
        }
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panpan_core::protocol::SessionStatus;
    use serde_json::json;

    async fn session(store: &MemorySessionStore, root: &str) -> Session {
        store
            .create_session(CreateSessionParams {
                project_root: root.to_string(),
                model: "m1".to_string(),
                metadata: None,
            })
            .await
            .unwrap()
    }

    fn task_params(session_id: &str) -> CreateTaskParams {
        CreateTaskParams {
            session_id: session_id.to_string(),
            task_type: "prompt".to_string(),
            description: "do it".to_string(),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let store = MemorySessionStore::new();
        let created = session(&store, "/proj").await;
        assert_eq!(created.status, SessionStatus::Active);
        assert_eq!(store.get_session(&created.id).await.unwrap(), created);
        assert_eq!(
            store.get_session("missing").await.unwrap_err(),
            StoreError::SessionNotFound("missing".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_sessions_filters_in_creation_order() {
        let store = MemorySessionStore::new();
        let a = session(&store, "/a").await;
        let b = session(&store, "/b").await;
        let c = session(&store, "/a").await;

        let all = store.list_sessions(&SessionListFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]
        );

        let filter = SessionListFilter {
            project_root: Some("/a".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list_sessions(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_session_merges_metadata_and_stamps_completion() {
        let store = MemorySessionStore::new();
        let created = session(&store, "/proj").await;
        store
            .update_session(UpdateSessionParams {
                session_id: created.id.clone(),
                metadata: Some(json!({"a": 1, "b": 2})),
                ..Default::default()
            })
            .await
            .unwrap();
        let updated = store
            .update_session(UpdateSessionParams {
                session_id: created.id.clone(),
                status: Some(SessionStatus::Completed),
                metadata: Some(json!({"b": 3})),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.metadata, json!({"a": 1, "b": 3}));
        assert_eq!(updated.status, SessionStatus::Completed);
        assert!(updated.completed_at.is_some());
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn test_create_task_requires_session() {
        let store = MemorySessionStore::new();
        let err = store.create_task(task_params("nope")).await.unwrap_err();
        assert_eq!(err.to_string(), "Session not found: nope");
    }

    #[tokio::test]
    async fn test_create_task_rejects_terminal_status() {
        let store = MemorySessionStore::new();
        let s = session(&store, "/proj").await;
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            let params = CreateTaskParams {
                status: Some(status),
                ..task_params(&s.id)
            };
            assert_eq!(
                store.create_task(params).await.unwrap_err(),
                StoreError::InvalidInitialStatus(status)
            );
        }
        assert!(store.list_tasks(&s.id).await.unwrap().is_empty());

        let running = CreateTaskParams {
            status: Some(TaskStatus::Running),
            ..task_params(&s.id)
        };
        let task = store.create_task(running).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_task_transitions_enforced() {
        let store = MemorySessionStore::new();
        let s = session(&store, "/proj").await;
        let task = store.create_task(task_params(&s.id)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let update = |status| UpdateTaskParams {
            task_id: task.id.clone(),
            status: Some(status),
            ..Default::default()
        };

        // Pending cannot be cancelled directly.
        assert!(matches!(
            store.update_task(update(TaskStatus::Cancelled)).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        store.update_task(update(TaskStatus::Running)).await.unwrap();
        let done = store.update_task(update(TaskStatus::Completed)).await.unwrap();
        assert!(done.completed_at.is_some());

        let err = store.update_task(update(TaskStatus::Running)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Invalid task transition for {}: completed -> running", task.id)
        );
    }

    #[tokio::test]
    async fn test_list_tasks_per_session() {
        let store = MemorySessionStore::new();
        let s1 = session(&store, "/one").await;
        let s2 = session(&store, "/two").await;
        let t1 = store.create_task(task_params(&s1.id)).await.unwrap();
        let t2 = store.create_task(task_params(&s1.id)).await.unwrap();
        store.create_task(task_params(&s2.id)).await.unwrap();

        let tasks = store.list_tasks(&s1.id).await.unwrap();
        assert_eq!(
            tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            vec![t1.id, t2.id]
        );
        assert!(matches!(
            store.list_tasks("missing").await,
            Err(StoreError::SessionNotFound(_))
        ));
    }
}
