//! Per-turn tool scheduling.
//!
//! Entries are considered strictly in the order the model produced them. An
//! entry starts when nothing is executing, or when it and everything
//! executing are concurrency-safe. An unsafe entry is a barrier: the
//! scheduler waits for it before looking at the next entry. Safe entries
//! accumulate and are awaited together when the queue runs out or the next
//! entry is unsafe.
//!
//! Cancellation is checked before each start and raced against every wait.
//! Once it fires, no further entries start and `run` returns immediately;
//! in-flight executions keep running detached and see the same token through
//! their [`ToolContext`]. Every entry without a result is reported as
//! interrupted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Tool, ToolContext, ToolError, ToolEvent, ToolInvocation, ToolOutcome, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Queued,
    Executing,
    Completed,
}

struct QueueEntry {
    invocation: ToolInvocation,
    concurrency_safe: bool,
    status: EntryStatus,
    outcome: Option<ToolOutcome>,
}

/// A spawned execution resolving to its queue index and outcome.
type EntryFuture = Pin<Box<dyn Future<Output = (usize, ToolOutcome)> + Send>>;

type InFlight = FuturesUnordered<EntryFuture>;

/// Runs one turn's tool invocations.
#[derive(Clone)]
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute `invocations` and return one outcome per invocation, in input
    /// order.
    pub async fn run(&self, invocations: Vec<ToolInvocation>, ctx: &ToolContext) -> Vec<ToolOutcome> {
        let mut entries: Vec<QueueEntry> = invocations
            .into_iter()
            .map(|invocation| {
                let concurrency_safe = self.is_concurrency_safe(&invocation);
                QueueEntry {
                    invocation,
                    concurrency_safe,
                    status: EntryStatus::Queued,
                    outcome: None,
                }
            })
            .collect();

        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut cancelled = false;

        for index in 0..entries.len() {
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let safe = entries[index].concurrency_safe;
            // In-flight work is always safe here; an unsafe entry must wait
            // for all of it.
            if !safe && !in_flight.is_empty() && !drain(&mut in_flight, &mut entries, &ctx.cancel).await {
                cancelled = true;
                break;
            }
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            debug!(
                "Starting tool {} ({}) safe={safe}",
                entries[index].invocation.name, entries[index].invocation.id
            );
            entries[index].status = EntryStatus::Executing;
            in_flight.push(self.spawn_entry(index, entries[index].invocation.clone(), ctx.clone()));

            if !safe && !drain(&mut in_flight, &mut entries, &ctx.cancel).await {
                cancelled = true;
                break;
            }
        }

        if !cancelled && !in_flight.is_empty() {
            drain(&mut in_flight, &mut entries, &ctx.cancel).await;
        }

        // Anything still in `in_flight` is detached when it drops here.
        entries
            .into_iter()
            .map(|entry| match entry.outcome {
                Some(outcome) => outcome,
                None => {
                    if entry.status == EntryStatus::Executing {
                        debug!("Tool {} interrupted mid-flight", entry.invocation.id);
                    }
                    ToolOutcome::error(&entry.invocation, &ToolError::Interrupted, Duration::ZERO)
                }
            })
            .collect()
    }

    /// Unknown tools and inputs that fail the schema are never safe.
    fn is_concurrency_safe(&self, invocation: &ToolInvocation) -> bool {
        let Some(tool) = self.registry.get(&invocation.name) else {
            return false;
        };
        tool.input_schema().validate(&invocation.input).is_ok()
            && tool.is_concurrency_safe(&invocation.input)
    }

    fn spawn_entry(
        &self,
        index: usize,
        invocation: ToolInvocation,
        ctx: ToolContext,
    ) -> EntryFuture {
        let registry = self.registry.clone();
        let started = Instant::now();
        let for_panic = invocation.clone();
        let handle: JoinHandle<ToolOutcome> =
            tokio::spawn(async move { execute_entry(&registry, &invocation, &ctx).await });

        Box::pin(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "execution aborted".to_string()
                    };
                    warn!("Tool {} panicked: {message}", for_panic.name);
                    ToolOutcome::error(
                        &for_panic,
                        &ToolError::Panicked {
                            tool: for_panic.name.clone(),
                            message,
                        },
                        started.elapsed(),
                    )
                }
            };
            (index, outcome)
        })
    }
}

/// Wait for every in-flight execution. Returns `false` if cancellation fired
/// first.
async fn drain(in_flight: &mut InFlight, entries: &mut [QueueEntry], cancel: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            next = in_flight.next() => match next {
                Some((index, outcome)) => {
                    entries[index].status = EntryStatus::Completed;
                    entries[index].outcome = Some(outcome);
                }
                None => return true,
            },
        }
    }
}

/// Run one invocation through lookup, validation and the tool's event stream.
async fn execute_entry(registry: &ToolRegistry, invocation: &ToolInvocation, ctx: &ToolContext) -> ToolOutcome {
    let started = Instant::now();
    match run_tool(registry, invocation, ctx).await {
        Ok((content, is_error)) => ToolOutcome {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            content,
            is_error,
            elapsed: started.elapsed(),
        },
        Err(e) => {
            debug!("Tool {} ({}) failed: {e}", invocation.name, invocation.id);
            ToolOutcome::error(invocation, &e, started.elapsed())
        }
    }
}

async fn run_tool(
    registry: &ToolRegistry,
    invocation: &ToolInvocation,
    ctx: &ToolContext,
) -> Result<(String, bool), ToolError> {
    let tool: Arc<dyn Tool> = registry.get(&invocation.name).ok_or_else(|| ToolError::UnknownTool {
        name: invocation.name.clone(),
    })?;
    let input = &invocation.input;

    tool.input_schema()
        .validate(input)
        .map_err(|message| ToolError::InvalidInput {
            tool: invocation.name.clone(),
            message,
        })?;

    if !ctx.plan_mode.permits(&invocation.name, tool.is_read_only(input)) {
        return Err(ToolError::PlanMode {
            tool: invocation.name.clone(),
        });
    }

    tool.validate(input, ctx)
        .await
        .map_err(|message| ToolError::Validation {
            tool: invocation.name.clone(),
            message,
        })?;

    let mut events = tool.call(input.clone(), ctx.clone());
    while let Some(event) = events.next().await {
        match event {
            ToolEvent::Progress { message } => {
                trace!("Tool {} progress: {message}", invocation.name);
            }
            ToolEvent::Output { content } => {
                ctx.display.output(&invocation.id, &invocation.name, &content);
            }
            ToolEvent::Result { content, is_error } => return Ok((content, is_error)),
        }
    }

    Err(ToolError::NoResult {
        tool: invocation.name.clone(),
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}
