//! Print task output, once or following until the task ends

use anyhow::{Context, Result};
use clap::Args;
use futures_util::{StreamExt, pin_mut};
use panpan_core::protocol::{ChunkType, GetOutputParams, OutputChunk};
use panpan_core::DaemonClient;

use super::CliContext;

/// Print a task's output
#[derive(Args, Debug)]
pub struct OutputArgs {
    /// Task ID
    task: String,

    /// Keep polling until the task finishes
    #[arg(short, long)]
    follow: bool,

    /// First chunk ID to print (ignored with --follow)
    #[arg(long, value_name = "ID")]
    from: Option<u64>,

    /// Maximum number of chunks to print (ignored with --follow)
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Print raw chunks as JSON lines
    #[arg(long)]
    json: bool,
}

/// Execute output command
pub async fn execute(args: OutputArgs, ctx: &CliContext) -> Result<()> {
    let client = ctx.client().await?;

    if args.follow {
        return follow(&client, &args.task, args.json).await;
    }

    let page = client
        .get_output_page(&GetOutputParams {
            task_id: args.task.clone(),
            from_id: args.from,
            limit: args.limit,
        })
        .await
        .with_context(|| format!("Failed to read output of task {}", args.task))?;

    for chunk in &page.chunks {
        print_chunk(chunk, args.json)?;
    }
    if page.has_more && !args.json {
        eprintln!("(task is {}; more output may follow)", page.status);
    }
    Ok(())
}

/// Print every chunk of `task_id` as it arrives until the daemon reports no
/// more output.
pub(crate) async fn follow(client: &DaemonClient, task_id: &str, json: bool) -> Result<()> {
    let stream = client.stream_output(task_id);
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("Failed to read output of task {task_id}"))?;
        print_chunk(&chunk, json)?;
    }
    Ok(())
}

pub(crate) fn print_chunk(chunk: &OutputChunk, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(chunk)?);
        return Ok(());
    }
    match chunk.chunk_type {
        ChunkType::Error => eprintln!("{}", format_chunk(chunk)),
        _ => println!("{}", format_chunk(chunk)),
    }
    Ok(())
}

/// Human-readable rendering of one chunk.
pub(crate) fn format_chunk(chunk: &OutputChunk) -> String {
    match chunk.chunk_type {
        ChunkType::Text => chunk.content.clone(),
        ChunkType::Thinking => format!("[thinking] {}", chunk.content),
        ChunkType::ToolUse => format!("-> {}", chunk.content),
        ChunkType::ToolResult => {
            let failed = chunk
                .metadata
                .as_ref()
                .and_then(|m| m.get("isError"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if failed {
                format!("<- [error] {}", chunk.content)
            } else {
                format!("<- {}", chunk.content)
            }
        }
        ChunkType::Error => format!("error: {}", chunk.content),
        ChunkType::Status => format!("[{}]", chunk.content),
    }
}
