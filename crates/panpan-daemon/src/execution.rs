//! Background prompt execution.
//!
//! `execute` records a running task and returns at once; the agent loop runs
//! on its own tokio task and streams events into the task's output buffer.
//! A task leaves `running` exactly once: whoever removes it from the active
//! map first (natural completion, `cancel`, or daemon shutdown) writes the
//! final `status` chunk and the terminal task status. Writing the final chunk
//! closes the output buffer, and that happens before the status changes, so
//! a reader that sees a terminal status has already been able to read every
//! chunk the task will ever have. Tool output that arrives after the close
//! is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use panpan_core::protocol::{
    ChunkType, CreateSessionParams, CreateTaskParams, ExecuteParams, ExecutionStatus,
    GetOutputParams, OutputPage, Task, TaskStatus, UpdateTaskParams,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentError, AgentEvent, AgentLoop, AgentRequest, AgentRun, EventSink, ModelClient};
use crate::output::{OutputBuffer, OutputBufferRegistry};
use crate::store::{SharedSessionStore, StoreError};
use crate::tool::{PlanMode, ToolRegistry, ToolScheduler};

/// Task type recorded for prompt executions.
pub const PROMPT_TASK_TYPE: &str = "prompt";

/// Longest task description derived from a prompt.
const DESCRIPTION_MAX_CHARS: usize = 120;

/// Knobs for executions.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub max_turns: usize,
    pub plan_mode: PlanMode,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_turns: 25,
            plan_mode: PlanMode::default(),
        }
    }
}

/// How a run ended.
enum Finish {
    Completed(AgentRun),
    Failed(String),
    Cancelled,
}

/// Owns running executions and the output buffers they write.
pub struct ExecutionManager {
    store: SharedSessionStore,
    buffers: Arc<OutputBufferRegistry>,
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    settings: ExecutionSettings,
    /// Cancellation token per running task.
    active: Mutex<HashMap<String, CancellationToken>>,
    /// Parent of every execution token; cancelled on daemon shutdown.
    root: CancellationToken,
}

impl ExecutionManager {
    pub fn new(
        store: SharedSessionStore,
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            store,
            buffers: Arc::new(OutputBufferRegistry::new()),
            model,
            tools,
            settings,
            active: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &SharedSessionStore {
        &self.store
    }

    pub fn buffers(&self) -> &Arc<OutputBufferRegistry> {
        &self.buffers
    }

    /// Number of tasks currently running.
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Start a prompt execution without waiting for it.
    pub async fn execute(self: &Arc<Self>, params: ExecuteParams) -> Result<ExecutionStatus, StoreError> {
        let session = match params.session_id {
            Some(ref id) => self.store.get_session(id).await?,
            None => {
                self.store
                    .create_session(CreateSessionParams {
                        project_root: params.project_root.clone(),
                        model: params.model.clone(),
                        metadata: None,
                    })
                    .await?
            }
        };

        let task = self
            .store
            .create_task(CreateTaskParams {
                session_id: session.id.clone(),
                task_type: PROMPT_TASK_TYPE.to_string(),
                description: describe_prompt(&params.prompt),
                status: Some(TaskStatus::Running),
            })
            .await?;

        let buffer = self.buffers.get_buffer(&task.id);
        let cancel = self.root.child_token();
        self.lock_active().insert(task.id.clone(), cancel.clone());
        info!("Executing task {} in session {}", task.id, session.id);

        let request = AgentRequest {
            prompt: params.prompt,
            model: params.model,
            system_prompt: params.system_prompt,
            llm_config: params.llm_config,
        };
        let agent = AgentLoop::new(
            self.model.clone(),
            ToolScheduler::new(self.tools.clone()),
            self.settings.max_turns,
        )
        .with_plan_mode(self.settings.plan_mode.clone());
        let sink: Arc<dyn EventSink> = Arc::new(BufferSink(buffer.clone()));

        let manager = self.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(async move { agent.run(request, sink, cancel).await });
            let finish = match run.await {
                Ok(Ok(run)) => Finish::Completed(run),
                Ok(Err(AgentError::Cancelled)) => Finish::Cancelled,
                Ok(Err(e)) => Finish::Failed(e.to_string()),
                Err(e) => {
                    error!("Agent loop for task {task_id} panicked: {e}");
                    Finish::Failed(format!("agent loop crashed: {e}"))
                }
            };
            manager.finalize(&task_id, finish).await;
        });

        Ok(ExecutionStatus::from_task(&task, buffer.len() as u64))
    }

    /// Cancel a running task. Returns whether one was found and signalled.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some(token) = self.take_active(task_id) else {
            debug!("Cancel requested for task {task_id} which is not running");
            return false;
        };
        token.cancel();
        self.write_terminal(task_id, Finish::Cancelled).await;
        info!("Cancelled task {task_id}");
        true
    }

    /// Cancel every running task; used on shutdown.
    pub async fn cancel_all(&self) {
        let running: Vec<String> = self.lock_active().keys().cloned().collect();
        if !running.is_empty() {
            info!("Cancelling {} running task(s)", running.len());
        }
        for task_id in running {
            self.cancel(&task_id).await;
        }
        // Anything started after the snapshot is stopped through the parent.
        self.root.cancel();
    }

    /// `task_update` entry point. A running execution can only be ended
    /// through [`Self::cancel`]: `cancelled` is routed there and any other
    /// terminal status is refused.
    pub async fn update_task(&self, params: UpdateTaskParams) -> Result<Task, StoreError> {
        let Some(status) = params.status.filter(TaskStatus::is_terminal) else {
            return self.store.update_task(params).await;
        };

        if !self.lock_active().contains_key(&params.task_id) {
            // Closed output with a running task: finalization is under way.
            let finalizing = self
                .buffers
                .find(&params.task_id)
                .is_some_and(|buffer| buffer.is_closed());
            if finalizing {
                let task = self.store.get_task(&params.task_id).await?;
                if task.status == TaskStatus::Running {
                    return Err(StoreError::TaskExecuting(params.task_id));
                }
            }
            return self.store.update_task(params).await;
        }

        if status != TaskStatus::Cancelled {
            return Err(StoreError::TaskExecuting(params.task_id));
        }
        self.cancel(&params.task_id).await;
        self.store
            .update_task(UpdateTaskParams {
                status: None,
                ..params
            })
            .await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<ExecutionStatus, StoreError> {
        let task = self.store.get_task(task_id).await?;
        let count = self.buffers.find(task_id).map(|b| b.len()).unwrap_or(0);
        Ok(ExecutionStatus::from_task(&task, count as u64))
    }

    /// Page of output. `hasMore` stays true while the task can still write
    /// or when `limit` cut the page short.
    pub async fn get_output(&self, params: &GetOutputParams) -> Result<OutputPage, StoreError> {
        // Read the status first so chunks written up to a terminal status are
        // always part of this page.
        let task = self.store.get_task(&params.task_id).await?;
        let (chunks, truncated) = match self.buffers.find(&params.task_id) {
            Some(buffer) => buffer.chunks_page(params.from_id, params.limit),
            None => (Vec::new(), false),
        };
        Ok(OutputPage {
            task_id: task.id,
            chunks,
            has_more: !task.status.is_terminal() || truncated,
            status: task.status,
        })
    }

    /// Drop buffers of tasks that have been terminal for longer than
    /// `retention`. Returns how many were removed.
    pub async fn sweep_output(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut removed = 0;

        for task_id in self.buffers.task_ids() {
            if self.lock_active().contains_key(&task_id) {
                continue;
            }
            let expired = match self.store.get_task(&task_id).await {
                Ok(task) => task.completed_at.is_some_and(|done| now - done >= retention),
                // Buffer without a task: nothing can ever read it.
                Err(StoreError::TaskNotFound(_)) => true,
                Err(e) => {
                    warn!("Retention check for task {task_id} failed: {e}");
                    false
                }
            };
            if expired && self.buffers.remove_buffer(&task_id) {
                debug!("Reclaimed output buffer of task {task_id}");
                removed += 1;
            }
        }
        removed
    }

    /// Sweep periodically until `cancel` fires.
    pub async fn run_retention(self: Arc<Self>, retention: Duration, cancel: CancellationToken) {
        let interval = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_output(retention).await;
                    if removed > 0 {
                        info!("Retention sweep reclaimed {removed} output buffer(s)");
                    }
                }
            }
        }
    }

    async fn finalize(&self, task_id: &str, finish: Finish) {
        if self.take_active(task_id).is_none() {
            debug!("Task {task_id} already finalized");
            return;
        }
        self.write_terminal(task_id, finish).await;
    }

    /// Close the buffer with the final chunks, then move the task to its
    /// terminal status. Events still in flight after this are dropped.
    async fn write_terminal(&self, task_id: &str, finish: Finish) {
        let buffer = self.buffers.get_buffer(task_id);
        let (closing, update) = match finish {
            Finish::Completed(run) => (
                vec![(
                    ChunkType::Status,
                    TaskStatus::Completed.to_string(),
                    Some(json!({"turns": run.turns})),
                )],
                UpdateTaskParams {
                    task_id: task_id.to_string(),
                    status: Some(TaskStatus::Completed),
                    result: Some(json!({"text": run.final_text, "turns": run.turns})),
                    error: None,
                },
            ),
            Finish::Failed(message) => (
                vec![
                    (ChunkType::Error, message.clone(), None),
                    (ChunkType::Status, TaskStatus::Failed.to_string(), None),
                ],
                UpdateTaskParams {
                    task_id: task_id.to_string(),
                    status: Some(TaskStatus::Failed),
                    result: None,
                    error: Some(message),
                },
            ),
            Finish::Cancelled => (
                vec![(ChunkType::Status, TaskStatus::Cancelled.to_string(), None)],
                UpdateTaskParams {
                    task_id: task_id.to_string(),
                    status: Some(TaskStatus::Cancelled),
                    result: None,
                    error: None,
                },
            ),
        };
        if buffer.close(closing).is_empty() {
            warn!("Output of task {task_id} was already closed");
        }

        let status = update.status;
        match self.store.update_task(update).await {
            Ok(task) => info!("Task {task_id} finished: {}", task.status),
            Err(e) => warn!("Could not record {status:?} for task {task_id}: {e}"),
        }
    }

    fn take_active(&self, task_id: &str) -> Option<CancellationToken> {
        self.lock_active().remove(task_id)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// First line of the prompt, trimmed and capped at 120 characters.
pub fn describe_prompt(prompt: &str) -> String {
    let first = prompt.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let mut description: String = first.chars().take(DESCRIPTION_MAX_CHARS).collect();
    if first.chars().count() > DESCRIPTION_MAX_CHARS {
        description.pop();
        description.push('…');
    }
    description
}

/// Writes agent events into a task's output buffer.
struct BufferSink(Arc<OutputBuffer>);

impl EventSink for BufferSink {
    fn emit(&self, event: AgentEvent) {
        match event {
            AgentEvent::Thinking(text) => {
                self.0.append(ChunkType::Thinking, text, None);
            }
            AgentEvent::Text(text) => {
                self.0.append(ChunkType::Text, text, None);
            }
            AgentEvent::ToolUse(call) => {
                self.0.append(
                    ChunkType::ToolUse,
                    call.name.clone(),
                    Some(json!({"toolUseId": call.id, "input": call.input})),
                );
            }
            AgentEvent::ToolOutput {
                invocation_id,
                tool_name,
                content,
            } => {
                self.0.append(
                    ChunkType::Text,
                    content,
                    Some(json!({"toolUseId": invocation_id, "tool": tool_name, "partial": true})),
                );
            }
            AgentEvent::ToolResult(outcome) => {
                self.0.append(
                    ChunkType::ToolResult,
                    outcome.content,
                    Some(json!({
                        "toolUseId": outcome.id,
                        "tool": outcome.name,
                        "isError": outcome.is_error,
                        "elapsedMs": outcome.elapsed.as_millis() as u64,
                    })),
                );
            }
            AgentEvent::Status(message) => {
                self.0.append(ChunkType::Status, message, None);
            }
        }
    }
}
