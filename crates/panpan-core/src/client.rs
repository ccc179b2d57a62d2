//! Client for talking to the panpan daemon.
//!
//! A [`DaemonClient`] owns one connection. Requests are written as framed
//! [`Request`]s; a background reader task decodes framed [`Response`]s and
//! hands each one to the caller waiting on the matching `id`, so several
//! requests may be in flight on the same connection. A background writer
//! task owns the write half and takes whole frames from a channel, so a
//! request abandoned mid-send never leaves a partial frame on the wire.
//!
//! Every request races its response against a timeout
//! ([`DEFAULT_REQUEST_TIMEOUT`] unless configured). Nothing is retried
//! automatically; callers decide whether to re-issue.
//!
//! ```no_run
//! # async fn example() -> Result<(), panpan_core::ClientError> {
//! use panpan_core::{DaemonClient, Endpoint};
//! use std::path::Path;
//!
//! let endpoint = Endpoint::default_for_platform(Path::new("/home/me"));
//! let client = DaemonClient::connect(&endpoint).await?;
//! client.ping().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::Stream;
use futures_util::stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::framing::{FrameError, encode_frame, read_frame};
use crate::protocol::{
    CancelResult, CreateSessionParams, CreateTaskParams, ExecuteParams, ExecutionStatus,
    GetOutputParams, OutputChunk, OutputPage, Request, RequestType, Response, Session,
    SessionListFilter, SessionRef, Task, TaskRef, UpdateSessionParams, UpdateTaskParams,
};
use crate::transport::{BoxReader, BoxWriter, Endpoint};

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between `get_output` polls in [`DaemonClient::stream_output`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect timeout used by [`try_connect`].
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Frames queued for the writer task before senders wait.
const WRITE_QUEUE_DEPTH: usize = 32;

/// Errors surfaced by client calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint could not be reached.
    #[error("failed to connect to daemon at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Encoding failed (e.g. payload over the size ceiling) or a frame was
    /// malformed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// No response arrived within the request timeout.
    #[error("request '{request_type}' timed out after {timeout:?}")]
    Timeout {
        request_type: String,
        timeout: Duration,
    },

    /// The connection was severed before the response arrived.
    #[error("connection to daemon closed before a response arrived")]
    ConnectionClosed,

    /// The daemon answered with `success: false`.
    #[error("{0}")]
    Remote(String),

    /// The daemon answered with data of an unexpected shape.
    #[error("invalid response from daemon: {0}")]
    InvalidResponse(String),
}

/// In-flight requests waiting for a response.
#[derive(Default)]
struct PendingRequests {
    map: HashMap<String, oneshot::Sender<Response>>,
    /// Set once the reader task stops; no further requests are accepted.
    closed: bool,
}

impl PendingRequests {
    fn insert(&mut self, id: String, tx: oneshot::Sender<Response>) -> bool {
        if self.closed {
            return false;
        }
        self.map.insert(id, tx);
        true
    }

    fn complete(&mut self, id: &str) -> Option<oneshot::Sender<Response>> {
        self.map.remove(id)
    }

    /// Mark closed and drop every sender, waking their receivers with an error.
    fn close(&mut self) {
        self.closed = true;
        self.map.clear();
    }
}

/// One encoded frame and where to report the write result.
struct WriteJob {
    frame: Vec<u8>,
    done: oneshot::Sender<io::Result<()>>,
}

/// One connection to the daemon.
pub struct DaemonClient {
    endpoint: Endpoint,
    writer: mpsc::Sender<WriteJob>,
    pending: Arc<Mutex<PendingRequests>>,
    reader_task: JoinHandle<()>,
    request_timeout: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for DaemonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClient")
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Connect to `endpoint`, returning `None` when nothing is listening.
///
/// Never returns an error and never panics; any failure means "not reachable".
pub async fn try_connect(endpoint: &Endpoint) -> Option<DaemonClient> {
    match tokio::time::timeout(PROBE_CONNECT_TIMEOUT, DaemonClient::connect(endpoint)).await {
        Ok(Ok(client)) => Some(client),
        Ok(Err(e)) => {
            debug!("Daemon not reachable at {endpoint}: {e}");
            None
        }
        Err(_) => {
            debug!("Connecting to daemon at {endpoint} timed out");
            None
        }
    }
}

impl DaemonClient {
    /// Open a connection with the default request timeout and poll interval.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ClientError> {
        let (reader, writer) = endpoint.connect().await.map_err(|source| ClientError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Ok(Self::from_parts(endpoint.clone(), reader, writer))
    }

    /// Build a client over an already established connection.
    pub fn from_parts(endpoint: Endpoint, reader: BoxReader, writer: BoxWriter) -> Self {
        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let reader_task = tokio::spawn(read_responses(reader, pending.clone()));
        let (jobs, queue) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(write_requests(writer, queue));
        Self {
            endpoint,
            writer: jobs,
            pending,
            reader_task,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the delay between polls in [`Self::stream_output`].
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one request and wait for its response data.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Frame`] if the request cannot be encoded (nothing is sent)
    /// - [`ClientError::Timeout`] if no response arrives in time
    /// - [`ClientError::ConnectionClosed`] if the connection drops first
    /// - [`ClientError::Remote`] for a `success: false` response
    pub async fn request(
        &self,
        request_type: &str,
        payload: Option<Value>,
    ) -> Result<Value, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let frame = encode_frame(&Request::new(id.clone(), request_type, payload))?;

        let (tx, rx) = oneshot::channel();
        if !self.lock_pending().insert(id.clone(), tx) {
            return Err(ClientError::ConnectionClosed);
        }

        if let Err(e) = self.write_all(frame).await {
            self.lock_pending().complete(&id);
            return Err(map_write_error(e));
        }

        debug!("Sent request type={request_type} id={id}");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.lock_pending().complete(&id);
                Err(ClientError::Timeout {
                    request_type: request_type.to_string(),
                    timeout: self.request_timeout,
                })
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(response)) => {
                if response.success {
                    Ok(response.data.unwrap_or(Value::Null))
                } else {
                    Err(ClientError::Remote(
                        response
                            .error
                            .unwrap_or_else(|| "unknown daemon error".to_string()),
                    ))
                }
            }
        }
    }

    /// Queue a frame and wait until the writer task has flushed it. Once
    /// queued, the frame is written in full even if this future is dropped.
    async fn write_all(&self, frame: Vec<u8>) -> io::Result<()> {
        let (done, written) = oneshot::channel();
        self.writer
            .send(WriteJob { frame, done })
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        written
            .await
            .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingRequests> {
        // A poisoned map only means another caller panicked mid-insert; the
        // map itself is still consistent.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        request_type: RequestType,
        params: &P,
    ) -> Result<R, ClientError> {
        let payload =
            serde_json::to_value(params).map_err(|e| ClientError::Frame(FrameError::Json(e)))?;
        let data = self.request(request_type.as_str(), Some(payload)).await?;
        serde_json::from_value(data).map_err(|e| {
            ClientError::InvalidResponse(format!("{request_type}: {e}"))
        })
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let data = self.request(RequestType::Ping.as_str(), None).await?;
        if data.get("pong").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(ClientError::InvalidResponse(format!("unexpected ping reply: {data}")))
        }
    }

    /// Ask the daemon to exit. The daemon acknowledges before terminating.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(RequestType::Shutdown.as_str(), None).await?;
        Ok(())
    }

    pub async fn create_session(&self, params: &CreateSessionParams) -> Result<Session, ClientError> {
        self.call(RequestType::SessionCreate, params).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ClientError> {
        self.call(
            RequestType::SessionGet,
            &SessionRef {
                session_id: session_id.to_string(),
            },
        )
        .await
    }

    pub async fn list_sessions(&self, filter: &SessionListFilter) -> Result<Vec<Session>, ClientError> {
        self.call(RequestType::SessionList, filter).await
    }

    pub async fn update_session(&self, params: &UpdateSessionParams) -> Result<Session, ClientError> {
        self.call(RequestType::SessionUpdate, params).await
    }

    pub async fn create_task(&self, params: &CreateTaskParams) -> Result<Task, ClientError> {
        self.call(RequestType::TaskCreate, params).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, ClientError> {
        self.call(RequestType::TaskGet, &task_ref(task_id)).await
    }

    /// All tasks of one session, oldest first.
    pub async fn list_tasks(&self, session_id: &str) -> Result<Vec<Task>, ClientError> {
        self.call(
            RequestType::TaskList,
            &SessionRef {
                session_id: session_id.to_string(),
            },
        )
        .await
    }

    pub async fn update_task(&self, params: &UpdateTaskParams) -> Result<Task, ClientError> {
        self.call(RequestType::TaskUpdate, params).await
    }

    /// Start a prompt execution. Returns as soon as the task is running.
    pub async fn execute(&self, params: &ExecuteParams) -> Result<ExecutionStatus, ClientError> {
        self.call(RequestType::Execute, params).await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<ExecutionStatus, ClientError> {
        self.call(RequestType::GetStatus, &task_ref(task_id)).await
    }

    /// Fetch every chunk with `id >= from_id` (all chunks when `None`).
    pub async fn get_output(
        &self,
        task_id: &str,
        from_id: Option<u64>,
    ) -> Result<OutputPage, ClientError> {
        self.get_output_page(&GetOutputParams {
            task_id: task_id.to_string(),
            from_id,
            limit: None,
        })
        .await
    }

    /// Fetch one page of output, optionally bounded by `limit`.
    pub async fn get_output_page(&self, params: &GetOutputParams) -> Result<OutputPage, ClientError> {
        self.call(RequestType::GetOutput, params).await
    }

    /// Cancel a running task. `Ok(false)` when no running task was found.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, ClientError> {
        let result: CancelResult = self.call(RequestType::Cancel, &task_ref(task_id)).await?;
        Ok(result.cancelled)
    }

    /// Stream a task's output from the beginning until the daemon reports no
    /// more output pending.
    ///
    /// Each call starts a fresh stream at chunk 0. While the daemon reports
    /// `hasMore`, the stream sleeps the poll interval between requests. The
    /// stream ends after yielding the first error.
    pub fn stream_output<'a>(
        &'a self,
        task_id: &'a str,
    ) -> impl Stream<Item = Result<OutputChunk, ClientError>> + 'a {
        struct Cursor {
            next_id: u64,
            buffered: VecDeque<OutputChunk>,
            finished: bool,
            polled: bool,
        }

        let cursor = Cursor {
            next_id: 0,
            buffered: VecDeque::new(),
            finished: false,
            polled: false,
        };

        stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if let Some(chunk) = cursor.buffered.pop_front() {
                    return Some((Ok(chunk), cursor));
                }
                if cursor.finished {
                    return None;
                }
                if cursor.polled {
                    tokio::time::sleep(self.poll_interval).await;
                }
                cursor.polled = true;

                match self.get_output(task_id, Some(cursor.next_id)).await {
                    Ok(page) => {
                        if let Some(last) = page.chunks.last() {
                            cursor.next_id = last.id + 1;
                        }
                        cursor.finished = !page.has_more;
                        cursor.buffered.extend(page.chunks);
                    }
                    Err(e) => {
                        cursor.finished = true;
                        return Some((Err(e), cursor));
                    }
                }
            }
        })
    }
}

fn task_ref(task_id: &str) -> TaskRef {
    TaskRef {
        task_id: task_id.to_string(),
    }
}

fn map_write_error(e: io::Error) -> ClientError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => ClientError::ConnectionClosed,
        _ => ClientError::Frame(FrameError::Io(e)),
    }
}

/// Background loop writing queued frames one at a time. Stops at the first
/// write error or once every sender is gone.
async fn write_requests(mut writer: BoxWriter, mut queue: mpsc::Receiver<WriteJob>) {
    while let Some(WriteJob { frame, done }) = queue.recv().await {
        let result = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        if let Err(Err(e)) = done.send(result) {
            debug!("Write failed after its request was abandoned: {e}");
        }
        if failed {
            break;
        }
    }
}

/// Background loop routing responses to their waiting callers.
async fn read_responses(mut reader: BoxReader, pending: Arc<Mutex<PendingRequests>>) {
    loop {
        match read_frame::<_, Response>(&mut reader).await {
            Ok(Some(response)) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .complete(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("Dropping response for unknown request id {}", response.id),
                }
            }
            Ok(None) => {
                debug!("Daemon closed the connection");
                break;
            }
            Err(e) => {
                warn!("Failed to read daemon response: {e}");
                break;
            }
        }
    }

    pending.lock().unwrap_or_else(|e| e.into_inner()).close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::write_frame;
    use crate::protocol::{ChunkType, TaskStatus};
    use chrono::Utc;
    use futures_util::StreamExt;
    use serde_json::json;

    /// Serve one connection on an in-memory duplex pipe with `handler`.
    fn duplex_client<F>(handler: F) -> DaemonClient
    where
        F: Fn(Request) -> Option<Response> + Send + 'static,
    {
        duplex_client_with(64 * 1024, Duration::ZERO, handler)
    }

    /// Like [`duplex_client`] over a pipe of `capacity` bytes whose server
    /// starts reading after `read_delay`.
    fn duplex_client_with<F>(capacity: usize, read_delay: Duration, handler: F) -> DaemonClient
    where
        F: Fn(Request) -> Option<Response> + Send + 'static,
    {
        let (client_io, server_io) = tokio::io::duplex(capacity);
        let (client_r, client_w) = tokio::io::split(client_io);
        let (mut server_r, mut server_w) = tokio::io::split(server_io);

        tokio::spawn(async move {
            tokio::time::sleep(read_delay).await;
            while let Ok(Some(req)) = read_frame::<_, Request>(&mut server_r).await {
                match handler(req) {
                    Some(resp) => {
                        if write_frame(&mut server_w, &resp).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });

        DaemonClient::from_parts(
            Endpoint::Tcp(0),
            Box::new(client_r),
            Box::new(client_w),
        )
    }

    fn chunk(id: u64) -> OutputChunk {
        OutputChunk {
            id,
            timestamp: Utc::now(),
            chunk_type: ChunkType::Text,
            content: format!("chunk {id}"),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let client = duplex_client(|req| {
            assert_eq!(req.kind, "ping");
            Some(Response::ok(req.id, json!({"pong": true})))
        });
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let client = duplex_client(move |req| {
            seen_clone.lock().unwrap().push(req.id.clone());
            Some(Response::ok(req.id, json!({"pong": true})))
        });
        client.ping().await.unwrap();
        client.ping().await.unwrap();
        let ids = seen.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_remote_error_surfaces_message() {
        let client = duplex_client(|req| Some(Response::err(req.id, "Session not found: nope")));
        let err = client.get_session("nope").await.unwrap_err();
        match err {
            ClientError::Remote(msg) => assert_eq!(msg, "Session not found: nope"),
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_when_no_response() {
        let client = duplex_client(|_req| Some(Response::ok("someone-else", json!(null))))
            .with_timeout(Duration::from_millis(50));
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_connection_closed_before_response() {
        let client = duplex_client(|_req| None);
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed), "got {err:?}");
    }

    #[tokio::test]
    async fn test_oversized_request_fails_before_send() {
        let client = duplex_client(|req| panic!("nothing should be sent, got {}", req.kind));
        let big = "x".repeat(crate::framing::MAX_FRAME_LEN + 1);
        let err = client
            .request("execute", Some(json!({"prompt": big})))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Frame(FrameError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_abandoned_request_leaves_stream_intact() {
        let client = duplex_client_with(256, Duration::from_millis(50), |req| {
            Some(Response::ok(req.id, json!({"pong": true})))
        });

        // The pipe fills long before this frame is out, so the request is
        // dropped halfway through sending it.
        let big = "x".repeat(8 * 1024);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            client.request("execute", Some(json!({"prompt": big}))),
        )
        .await;
        assert!(abandoned.is_err());

        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_wrapper_reads_flag() {
        let client = duplex_client(|req| {
            assert_eq!(req.kind, "cancel");
            assert_eq!(req.payload.as_ref().unwrap()["taskId"], "t-1");
            Some(Response::ok(req.id, json!({"cancelled": true})))
        });
        assert!(client.cancel("t-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_output_polls_until_no_more() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let client = duplex_client(move |req| {
            let from = req.payload.as_ref().unwrap()["fromId"].as_u64().unwrap();
            let mut calls = calls_clone.lock().unwrap();
            calls.push(from);
            // First poll returns two chunks, the second nothing yet, the
            // third the tail with the task finished.
            let (chunks, has_more) = match calls.len() {
                1 => (vec![chunk(0), chunk(1)], true),
                2 => (vec![], true),
                _ => (vec![chunk(2)], false),
            };
            let page = OutputPage {
                task_id: "t".to_string(),
                chunks,
                has_more,
                status: if has_more {
                    TaskStatus::Running
                } else {
                    TaskStatus::Completed
                },
            };
            Some(Response::ok(req.id, serde_json::to_value(page).unwrap()))
        })
        .with_poll_interval(Duration::from_millis(5));

        let ids: Vec<u64> = client
            .stream_output("t")
            .map(|c| c.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(*calls.lock().unwrap(), vec![0, 2, 2]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_try_connect_returns_none_when_nothing_listens() {
        let dir = tempfile::TempDir::new().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("daemon.sock"));
        assert!(try_connect(&endpoint).await.is_none());
    }
}
