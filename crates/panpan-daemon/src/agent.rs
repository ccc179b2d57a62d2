//! The agent loop: model turns interleaved with tool execution.
//!
//! Each turn asks the [`ModelClient`] for a reply, emits its thinking and text,
//! runs any requested tool calls through the [`ToolScheduler`], and feeds the
//! outcomes back as the next turn's input. The loop ends when a turn requests
//! no tools, when `max_turns` is reached, or when the cancellation token
//! fires. Cancellation is observed before every model call, raced against the
//! model call itself, and checked again after each tool batch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tool::{PlanMode, ToolContext, ToolDisplay, ToolInvocation, ToolOutcome, ToolScheduler};

/// Everything the loop reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking(String),
    Text(String),
    ToolUse(ToolInvocation),
    /// Streaming output of a tool that is still running.
    ToolOutput {
        invocation_id: String,
        tool_name: String,
        content: String,
    },
    ToolResult(ToolOutcome),
    Status(String),
}

/// Receives [`AgentEvent`]s in order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// Forwards tool output into an [`EventSink`].
struct SinkDisplay(Arc<dyn EventSink>);

impl ToolDisplay for SinkDisplay {
    fn output(&self, invocation_id: &str, tool_name: &str, content: &str) {
        self.0.emit(AgentEvent::ToolOutput {
            invocation_id: invocation_id.to_string(),
            tool_name: tool_name.to_string(),
            content: content.to_string(),
        });
    }
}

/// Conversation history handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        tool_calls: Vec<ToolInvocation>,
    },
    ToolResults {
        results: Vec<ToolOutcome>,
    },
}

/// One model request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    /// Tool descriptions from [`crate::tool::ToolRegistry::describe`].
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<Value>,
}

/// One model reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub thinking: Option<String>,
    pub text: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model request failed: {0}")]
    Model(String),

    #[error("execution cancelled")]
    Cancelled,
}

/// Language model backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, AgentError>;
}

/// Model that answers every prompt with the prompt itself. Used when no
/// model backend is configured.
#[derive(Debug, Default)]
pub struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn complete(
        &self,
        request: &ModelRequest,
        _cancel: &CancellationToken,
    ) -> Result<ModelTurn, AgentError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(ModelTurn {
            text: Some(prompt),
            ..Default::default()
        })
    }
}

/// Input for one [`AgentLoop::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub llm_config: Option<Value>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRun {
    pub turns: usize,
    pub final_text: Option<String>,
}

pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    scheduler: ToolScheduler,
    max_turns: usize,
    plan_mode: PlanMode,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn ModelClient>, scheduler: ToolScheduler, max_turns: usize) -> Self {
        Self {
            model,
            scheduler,
            max_turns: max_turns.max(1),
            plan_mode: PlanMode::default(),
        }
    }

    pub fn with_plan_mode(mut self, plan_mode: PlanMode) -> Self {
        self.plan_mode = plan_mode;
        self
    }

    pub async fn run(
        &self,
        request: AgentRequest,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<AgentRun, AgentError> {
        let ctx = ToolContext::new(cancel.clone())
            .with_plan_mode(self.plan_mode.clone())
            .with_display(Arc::new(SinkDisplay(sink.clone())));

        let mut model_request = ModelRequest {
            model: request.model,
            system_prompt: request.system_prompt,
            messages: vec![Message::User {
                content: request.prompt,
            }],
            tools: self.scheduler.registry().describe(),
            llm_config: request.llm_config,
        };
        let mut last_text = None;

        for turn in 1..=self.max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            debug!("Agent turn {turn}/{}", self.max_turns);
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                reply = self.model.complete(&model_request, &cancel) => reply?,
            };

            if let Some(thinking) = reply.thinking.filter(|t| !t.is_empty()) {
                sink.emit(AgentEvent::Thinking(thinking));
            }
            if let Some(text) = reply.text.as_ref().filter(|t| !t.is_empty()) {
                sink.emit(AgentEvent::Text(text.clone()));
            }
            if reply.text.is_some() {
                last_text = reply.text.clone();
            }

            if reply.tool_calls.is_empty() {
                return Ok(AgentRun {
                    turns: turn,
                    final_text: last_text,
                });
            }

            for call in &reply.tool_calls {
                sink.emit(AgentEvent::ToolUse(call.clone()));
            }
            model_request.messages.push(Message::Assistant {
                text: reply.text,
                tool_calls: reply.tool_calls.clone(),
            });

            let outcomes = self.scheduler.run(reply.tool_calls, &ctx).await;
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            for outcome in &outcomes {
                sink.emit(AgentEvent::ToolResult(outcome.clone()));
            }
            model_request
                .messages
                .push(Message::ToolResults { results: outcomes });
        }

        sink.emit(AgentEvent::Status(format!(
            "Stopped after reaching the limit of {} turns",
            self.max_turns
        )));
        Ok(AgentRun {
            turns: self.max_turns,
            final_text: last_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{InputSchema, JsonKind, Tool, ToolEvent, ToolRegistry};
    use futures_util::stream::{self, BoxStream};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<AgentEvent>>);

    impl EventSink for Collect {
        fn emit(&self, event: AgentEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// Replays canned turns and records the requests it saw.
    struct ScriptedModel {
        turns: Mutex<Vec<ModelTurn>>,
        seen: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<ModelTurn>) -> Self {
            Self {
                turns: Mutex::new(turns),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(
            &self,
            request: &ModelRequest,
            _cancel: &CancellationToken,
        ) -> Result<ModelTurn, AgentError> {
            self.seen.lock().unwrap().push(request.clone());
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                return Err(AgentError::Model("script exhausted".to_string()));
            }
            Ok(turns.remove(0))
        }
    }

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn input_schema(&self) -> InputSchema {
            InputSchema::new().required("text", JsonKind::String)
        }

        fn is_read_only(&self, _input: &Value) -> bool {
            true
        }

        fn is_concurrency_safe(&self, _input: &Value) -> bool {
            true
        }

        fn call(&self, input: Value, _ctx: ToolContext) -> BoxStream<'static, ToolEvent> {
            let text = input["text"].as_str().unwrap_or_default().to_uppercase();
            Box::pin(stream::iter(vec![
                ToolEvent::Output {
                    content: "converting".to_string(),
                },
                ToolEvent::Result {
                    content: text,
                    is_error: false,
                },
            ]))
        }
    }

    fn scheduler() -> ToolScheduler {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);
        ToolScheduler::new(Arc::new(registry))
    }

    fn request(prompt: &str) -> AgentRequest {
        AgentRequest {
            prompt: prompt.to_string(),
            model: "m1".to_string(),
            system_prompt: None,
            llm_config: None,
        }
    }

    fn upper_call(id: &str, text: &str) -> ToolInvocation {
        ToolInvocation {
            id: id.to_string(),
            name: "upper".to_string(),
            input: json!({"text": text}),
        }
    }

    #[tokio::test]
    async fn test_echo_model_single_turn() {
        let agent = AgentLoop::new(Arc::new(EchoModel), scheduler(), 25);
        let sink = Arc::new(Collect::default());
        let run = agent
            .run(request("hello"), sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.turns, 1);
        assert_eq!(run.final_text.as_deref(), Some("hello"));
        assert_eq!(*sink.0.lock().unwrap(), vec![AgentEvent::Text("hello".to_string())]);
    }

    #[tokio::test]
    async fn test_tool_round_trip_feeds_results_back() {
        let model = Arc::new(ScriptedModel::new(vec![
            ModelTurn {
                thinking: Some("need tools".to_string()),
                text: None,
                tool_calls: vec![upper_call("c1", "a"), upper_call("c2", "b")],
            },
            ModelTurn {
                text: Some("done".to_string()),
                ..Default::default()
            },
        ]));
        let agent = AgentLoop::new(model.clone(), scheduler(), 25);
        let sink = Arc::new(Collect::default());

        let run = agent
            .run(request("go"), sink.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.turns, 2);
        assert_eq!(run.final_text.as_deref(), Some("done"));

        let events = sink.0.lock().unwrap().clone();
        assert_eq!(events[0], AgentEvent::Thinking("need tools".to_string()));
        assert!(matches!(&events[1], AgentEvent::ToolUse(c) if c.id == "c1"));
        assert!(matches!(&events[2], AgentEvent::ToolUse(c) if c.id == "c2"));
        let results: Vec<&ToolOutcome> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolResult(o) => Some(o),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "A");
        assert_eq!(results[1].content, "B");
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolOutput { .. })));
        assert_eq!(events.last(), Some(&AgentEvent::Text("done".to_string())));

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].tools.len(), 1);
        assert!(matches!(seen[1].messages.last(), Some(Message::ToolResults { results }) if results.len() == 2));
    }

    #[tokio::test]
    async fn test_max_turns_stops_loop() {
        let turns = (0..5)
            .map(|i| ModelTurn {
                tool_calls: vec![upper_call(&format!("c{i}"), "x")],
                ..Default::default()
            })
            .collect();
        let agent = AgentLoop::new(Arc::new(ScriptedModel::new(turns)), scheduler(), 2);
        let sink = Arc::new(Collect::default());

        let run = agent
            .run(request("loop"), sink.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.turns, 2);
        assert!(matches!(
            sink.0.lock().unwrap().last(),
            Some(AgentEvent::Status(s)) if s.contains("limit of 2 turns")
        ));
    }

    #[tokio::test]
    async fn test_model_error_propagates() {
        let agent = AgentLoop::new(Arc::new(ScriptedModel::new(vec![])), scheduler(), 3);
        let err = agent
            .run(request("x"), Arc::new(Collect::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "model request failed: script exhausted");
    }

    struct StallingModel;

    #[async_trait]
    impl ModelClient for StallingModel {
        async fn complete(
            &self,
            _request: &ModelRequest,
            _cancel: &CancellationToken,
        ) -> Result<ModelTurn, AgentError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ModelTurn::default())
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_model_call() {
        let agent = AgentLoop::new(Arc::new(StallingModel), scheduler(), 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = agent
            .run(request("x"), Arc::new(Collect::default()), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
