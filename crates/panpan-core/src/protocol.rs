//! Wire protocol shared by the CLI and the daemon.
//!
//! Every message is a JSON object carried in one length-prefixed frame (see
//! [`crate::framing`]):
//!
//! ```json
//! // Request
//! {"id":"2f1c…","type":"get_output","payload":{"taskId":"…","fromId":12}}
//! // Response
//! {"id":"2f1c…","success":true,"data":{"taskId":"…","chunks":[],"hasMore":true,"status":"running"}}
//! ```
//!
//! Domain types use camelCase field names on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Envelope
// ============================================================================

/// Request message from client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier echoed back in the response.
    pub id: String,
    /// Request type, e.g. `"ping"` or `"execute"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Response message from daemon to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echoed `id` of the request this answers.
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Successful response carrying `data`.
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response carrying a human-readable reason.
    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Every request type the daemon understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Ping,
    Shutdown,
    SessionCreate,
    SessionGet,
    SessionList,
    SessionUpdate,
    TaskCreate,
    TaskGet,
    TaskList,
    TaskUpdate,
    Execute,
    GetStatus,
    GetOutput,
    Cancel,
    /// Reserved; never implemented by the daemon.
    Attach,
    /// Reserved; never implemented by the daemon.
    Detach,
}

impl RequestType {
    pub const ALL: [RequestType; 16] = [
        RequestType::Ping,
        RequestType::Shutdown,
        RequestType::SessionCreate,
        RequestType::SessionGet,
        RequestType::SessionList,
        RequestType::SessionUpdate,
        RequestType::TaskCreate,
        RequestType::TaskGet,
        RequestType::TaskList,
        RequestType::TaskUpdate,
        RequestType::Execute,
        RequestType::GetStatus,
        RequestType::GetOutput,
        RequestType::Cancel,
        RequestType::Attach,
        RequestType::Detach,
    ];

    /// Wire name of this request type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Ping => "ping",
            RequestType::Shutdown => "shutdown",
            RequestType::SessionCreate => "session_create",
            RequestType::SessionGet => "session_get",
            RequestType::SessionList => "session_list",
            RequestType::SessionUpdate => "session_update",
            RequestType::TaskCreate => "task_create",
            RequestType::TaskGet => "task_get",
            RequestType::TaskList => "task_list",
            RequestType::TaskUpdate => "task_update",
            RequestType::Execute => "execute",
            RequestType::GetStatus => "get_status",
            RequestType::GetOutput => "get_output",
            RequestType::Cancel => "cancel",
            RequestType::Attach => "attach",
            RequestType::Detach => "detach",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown request type: {s}"))
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One interactive agent engagement spanning one or more tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_root: String,
    pub model: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form metadata; always a JSON object.
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

impl Session {
    /// Build a fresh `active` session with both timestamps set to now.
    pub fn new(id: impl Into<String>, project_root: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_root: project_root.into(),
            model: model.into(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: empty_object(),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Payload of `session_create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    pub project_root: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Payload of `session_update`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Merged key-by-key into the existing metadata object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Optional filter for `session_list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
}

impl SessionListFilter {
    pub fn matches(&self, session: &Session) -> bool {
        self.status.is_none_or(|s| s == session.status)
            && self
                .project_root
                .as_deref()
                .is_none_or(|root| root == session.project_root)
    }
}

/// Payload addressing a single session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

// ============================================================================
// Tasks
// ============================================================================

/// Lifecycle status of a task.
///
/// `pending → running → {completed, failed, cancelled}`; the three outcomes
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-asserting the current non-terminal status is allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Pending | Running) => true,
            (Running, Running | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// One unit of work inside a session, normally one executed prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Payload of `task_create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskParams {
    pub session_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    /// Initial status, `pending` (the default) or `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

/// Payload of `task_update`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskParams {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload addressing a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_id: String,
}

// ============================================================================
// Execution
// ============================================================================

/// Payload of `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub prompt: String,
    /// Existing session to run in; a new session is created when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub model: String,
    pub project_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Opaque model-client configuration, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<Value>,
}

/// Read-only projection of a task and its output buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub task_id: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub output_count: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStatus {
    pub fn from_task(task: &Task, output_count: u64) -> Self {
        Self {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            status: task.status,
            output_count,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

/// Kind of an output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    Error,
    Status,
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkType::Text => write!(f, "text"),
            ChunkType::Thinking => write!(f, "thinking"),
            ChunkType::ToolUse => write!(f, "tool_use"),
            ChunkType::ToolResult => write!(f, "tool_result"),
            ChunkType::Error => write!(f, "error"),
            ChunkType::Status => write!(f, "status"),
        }
    }
}

/// One immutable unit of task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    /// Sequential per task, starting at 0, no gaps.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Payload of `get_output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOutputParams {
    pub task_id: String,
    /// First chunk id to return; everything when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<u64>,
    /// Maximum number of chunks in the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Result of `get_output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPage {
    pub task_id: String,
    pub chunks: Vec<OutputChunk>,
    /// True while the task can still produce output, or when `limit`
    /// truncated this page.
    pub has_more: bool,
    pub status: TaskStatus,
}

/// Result of `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResult {
    /// True only when a running task was found and signalled.
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_uses_type_field() {
        let req = Request::new("t1", "ping", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"id": "t1", "type": "ping"}));

        let decoded: Request = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_ok_and_err_shapes() {
        let ok = serde_json::to_value(Response::ok("t1", json!({"pong": true}))).unwrap();
        assert_eq!(ok, json!({"id": "t1", "success": true, "data": {"pong": true}}));

        let err = serde_json::to_value(Response::err("t2", "Session not found: s")).unwrap();
        assert_eq!(
            err,
            json!({"id": "t2", "success": false, "error": "Session not found: s"})
        );
    }

    #[test]
    fn test_request_type_round_trip() {
        for t in RequestType::ALL {
            assert_eq!(t.as_str().parse::<RequestType>().unwrap(), t);
        }
        assert!("bogus".parse::<RequestType>().is_err());
    }

    #[test]
    fn test_task_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_session_wire_format_is_camel_case() {
        let session = Session::new("s1", "/proj", "m1");
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["projectRoot"], "/proj");
        assert_eq!(json["status"], "active");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("completedAt").is_none());
        assert_eq!(json["metadata"], json!({}));
    }

    #[test]
    fn test_chunk_type_serialization() {
        let chunk = OutputChunk {
            id: 3,
            timestamp: Utc::now(),
            chunk_type: ChunkType::ToolResult,
            content: "ok".to_string(),
            metadata: None,
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["id"], 3);
    }

    #[test]
    fn test_execute_params_optional_fields() {
        let params: ExecuteParams = serde_json::from_value(json!({
            "prompt": "fix the build",
            "model": "m1",
            "projectRoot": "/proj"
        }))
        .unwrap();
        assert!(params.session_id.is_none());
        assert!(params.system_prompt.is_none());
        assert!(params.llm_config.is_none());
    }

    #[test]
    fn test_session_list_filter_matches() {
        let session = Session::new("s1", "/proj", "m1");
        assert!(SessionListFilter::default().matches(&session));
        assert!(
            SessionListFilter {
                status: Some(SessionStatus::Active),
                project_root: Some("/proj".to_string()),
            }
            .matches(&session)
        );
        assert!(
            !SessionListFilter {
                status: Some(SessionStatus::Completed),
                project_root: None,
            }
            .matches(&session)
        );
    }
}
