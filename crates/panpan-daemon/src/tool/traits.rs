use super::{InputSchema, ToolContext, ToolEvent};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

/// A capability the agent can invoke.
///
/// The scheduler asks [`Tool::is_concurrency_safe`] once per invocation,
/// after schema validation, to decide whether the call may overlap others.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn input_schema(&self) -> InputSchema;

    /// Whether this invocation leaves the world unchanged. Gates plan mode.
    fn is_read_only(&self, input: &Value) -> bool;

    /// Whether this invocation may run alongside other safe invocations.
    fn is_concurrency_safe(&self, input: &Value) -> bool;

    /// Tool-specific checks beyond the schema.
    async fn validate(&self, _input: &Value, _ctx: &ToolContext) -> Result<(), String> {
        Ok(())
    }

    /// Start the tool. The stream should end after a [`ToolEvent::Result`].
    fn call(&self, input: Value, ctx: ToolContext) -> BoxStream<'static, ToolEvent>;
}
