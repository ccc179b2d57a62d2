use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One event from a running tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    /// Progress note; observed, never shown as output.
    Progress { message: String },
    /// Streaming output, forwarded to the display.
    Output { content: String },
    /// Terminal result. Events after the first result are ignored.
    Result { content: String, is_error: bool },
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Tool-call id chosen by the model.
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Final result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl ToolOutcome {
    pub fn error(invocation: &ToolInvocation, error: &ToolError, elapsed: Duration) -> Self {
        Self {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            content: error.to_string(),
            is_error: true,
            elapsed,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Per-invocation failures. Each becomes that entry's error outcome; none
/// aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid input for {tool}: {message}")]
    InvalidInput { tool: String, message: String },

    #[error("{tool} is not allowed in plan mode")]
    PlanMode { tool: String },

    #[error("Validation failed for {tool}: {message}")]
    Validation { tool: String, message: String },

    #[error("{tool} failed: {message}")]
    Panicked { tool: String, message: String },

    #[error("{tool} finished without a result")]
    NoResult { tool: String },

    #[error("Interrupted")]
    Interrupted,
}

/// JSON kinds accepted by [`InputSchema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl JsonKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonKind::String => value.is_string(),
            JsonKind::Number => value.is_number(),
            JsonKind::Integer => value.is_i64() || value.is_u64(),
            JsonKind::Boolean => value.is_boolean(),
            JsonKind::Array => value.is_array(),
            JsonKind::Object => value.is_object(),
            JsonKind::Any => true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            JsonKind::String => "string",
            JsonKind::Number => "number",
            JsonKind::Integer => "integer",
            JsonKind::Boolean => "boolean",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
            JsonKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaProperty {
    pub name: String,
    pub kind: JsonKind,
    pub required: bool,
}

/// Shape of a tool's input: a JSON object with typed properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    pub properties: Vec<SchemaProperty>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: JsonKind) -> Self {
        self.properties.push(SchemaProperty {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: JsonKind) -> Self {
        self.properties.push(SchemaProperty {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Check `input`, returning the first violation.
    pub fn validate(&self, input: &Value) -> Result<(), String> {
        let Some(object) = input.as_object() else {
            return Err("input must be a JSON object".to_string());
        };
        for property in &self.properties {
            match object.get(&property.name) {
                None | Some(Value::Null) if property.required => {
                    return Err(format!("missing required property '{}'", property.name));
                }
                Some(value) if !value.is_null() && !property.kind.matches(value) => {
                    return Err(format!(
                        "property '{}' must be {}",
                        property.name,
                        property.kind.as_str()
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// JSON Schema rendering handed to the model.
    pub fn to_json(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for property in &self.properties {
            let schema = match property.kind {
                JsonKind::Any => serde_json::json!({}),
                kind => serde_json::json!({ "type": kind.as_str() }),
            };
            properties.insert(property.name.clone(), schema);
            if property.required {
                required.push(Value::String(property.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Plan-mode restriction: while active only read-only tools, or tools on the
/// allow-list, may run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanMode {
    pub active: bool,
    pub allow: HashSet<String>,
}

impl PlanMode {
    pub fn new(active: bool, allow: impl IntoIterator<Item = String>) -> Self {
        Self {
            active,
            allow: allow.into_iter().collect(),
        }
    }

    pub fn permits(&self, tool_name: &str, read_only: bool) -> bool {
        !self.active || read_only || self.allow.contains(tool_name)
    }
}

/// Receives streaming tool output as it is produced.
pub trait ToolDisplay: Send + Sync {
    fn output(&self, invocation_id: &str, tool_name: &str, content: &str);
}

/// Display that drops everything.
#[derive(Debug, Default)]
pub struct NullDisplay;

impl ToolDisplay for NullDisplay {
    fn output(&self, _invocation_id: &str, _tool_name: &str, _content: &str) {}
}

/// Ambient state every tool call sees.
#[derive(Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub plan_mode: Arc<PlanMode>,
    pub display: Arc<dyn ToolDisplay>,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            plan_mode: Arc::new(PlanMode::default()),
            display: Arc::new(NullDisplay),
        }
    }

    pub fn with_plan_mode(mut self, plan_mode: PlanMode) -> Self {
        self.plan_mode = Arc::new(plan_mode);
        self
    }

    pub fn with_display(mut self, display: Arc<dyn ToolDisplay>) -> Self {
        self.display = display;
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("plan_mode", &self.plan_mode)
            .finish()
    }
}
