//! Core types and client plumbing for panpan.
//!
//! This crate holds everything the CLI and the daemon have to agree on:
//!
//! - the wire protocol ([`protocol`]) and its length-prefixed framing ([`framing`])
//! - endpoint selection and raw connections ([`transport`])
//! - the request/response client used by the CLI ([`client`])
//! - the daemon lifecycle manager that spawns and probes the daemon ([`lifecycle`])
//! - configuration, home directory resolution and logging setup

pub mod client;
pub mod config;
pub mod framing;
pub mod home;
pub mod lifecycle;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use client::{ClientError, DaemonClient};
pub use framing::{FrameError, MAX_FRAME_LEN};
pub use lifecycle::{DaemonLifecycle, LifecycleError, LifecycleOptions};
pub use protocol::{
    ChunkType, ExecutionStatus, OutputChunk, OutputPage, Request, Response, Session,
    SessionStatus, Task, TaskStatus,
};
pub use transport::Endpoint;
