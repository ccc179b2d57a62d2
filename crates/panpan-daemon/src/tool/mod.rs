//! Tools and the per-turn tool scheduler.
//!
//! A turn's tool calls run through [`ToolScheduler::run`], which overlaps
//! concurrency-safe calls and serializes everything else while reporting
//! outcomes in the order the model asked for them.

mod registry;
mod scheduler;
mod traits;
mod types;

pub use registry::ToolRegistry;
pub use scheduler::ToolScheduler;
pub use traits::Tool;
pub use types::{
    InputSchema, JsonKind, NullDisplay, PlanMode, SchemaProperty, ToolContext, ToolDisplay,
    ToolError, ToolEvent, ToolInvocation, ToolOutcome,
};
