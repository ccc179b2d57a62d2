//! Per-task output buffers.
//!
//! An [`OutputBuffer`] is an append-only log of [`OutputChunk`]s for one task.
//! The execution driving the task is its only writer; any number of
//! `get_output` handlers read it concurrently. Live subscribers receive every
//! chunk appended after they subscribed and nothing from before.
//!
//! [`OutputBuffer::close`] writes a task's closing chunks and seals the
//! buffer. Appends after that are dropped, so the closing `status` chunk is
//! always the last one and the chunk count never changes once a reader has
//! seen a terminal status.
//!
//! [`OutputBufferRegistry`] maps task ids to buffers, creating them on first
//! access. Removing a buffer is how the daemon reclaims memory for finished
//! tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::Utc;
use panpan_core::protocol::{ChunkType, OutputChunk};
use serde_json::Value;

/// Callback invoked with each newly appended chunk.
pub type ChunkCallback = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

type SubscriberMap = Mutex<HashMap<u64, ChunkCallback>>;

/// Append-only chunk log for a single task.
pub struct OutputBuffer {
    task_id: String,
    chunks: RwLock<Vec<OutputChunk>>,
    /// Set and checked under the `chunks` write lock.
    closed: AtomicBool,
    subscribers: Arc<SubscriberMap>,
    next_subscriber: AtomicU64,
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("task_id", &self.task_id)
            .field("len", &self.len())
            .finish()
    }
}

impl OutputBuffer {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            chunks: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Append a chunk with the next sequential id and push it to every
    /// current subscriber. Returns `None` once the buffer is closed.
    pub fn append(
        &self,
        chunk_type: ChunkType,
        content: impl Into<String>,
        metadata: Option<Value>,
    ) -> Option<OutputChunk> {
        let chunk = {
            let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            push_chunk(&mut chunks, chunk_type, content.into(), metadata)
        };
        self.notify(std::slice::from_ref(&chunk));
        Some(chunk)
    }

    /// Append the closing chunks and seal the buffer in one step. Nothing
    /// can be appended after them. Returns the appended chunks, or nothing
    /// when the buffer was already closed.
    pub fn close<I>(&self, closing: I) -> Vec<OutputChunk>
    where
        I: IntoIterator<Item = (ChunkType, String, Option<Value>)>,
    {
        let appended: Vec<OutputChunk> = {
            let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return Vec::new();
            }
            closing
                .into_iter()
                .map(|(chunk_type, content, metadata)| {
                    push_chunk(&mut chunks, chunk_type, content, metadata)
                })
                .collect()
        };
        self.notify(&appended);
        appended
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Callbacks run outside every lock so they may read this buffer.
    fn notify(&self, appended: &[OutputChunk]) {
        if appended.is_empty() {
            return;
        }
        let subscribers: Vec<ChunkCallback> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for chunk in appended {
            for callback in &subscribers {
                callback(chunk);
            }
        }
    }

    /// All chunks with `id >= from_id` in ascending order; everything when
    /// `from_id` is `None`.
    pub fn chunks(&self, from_id: Option<u64>) -> Vec<OutputChunk> {
        self.chunks_page(from_id, None).0
    }

    /// Like [`Self::chunks`] but returns at most `limit` chunks. The flag is
    /// true when more chunks past the page already exist.
    pub fn chunks_page(&self, from_id: Option<u64>, limit: Option<usize>) -> (Vec<OutputChunk>, bool) {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        // Ids equal positions, so the start index is the id itself.
        let start = from_id.unwrap_or(0).min(chunks.len() as u64) as usize;
        let available = &chunks[start..];
        match limit {
            Some(limit) if available.len() > limit => (available[..limit].to_vec(), true),
            _ => (available.to_vec(), false),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the newest chunk, if any.
    pub fn last_id(&self) -> Option<u64> {
        self.len().checked_sub(1).map(|n| n as u64)
    }

    /// Register a live subscriber. Delivery stops when the returned handle is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OutputChunk) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn push_chunk(
    chunks: &mut Vec<OutputChunk>,
    chunk_type: ChunkType,
    content: String,
    metadata: Option<Value>,
) -> OutputChunk {
    let chunk = OutputChunk {
        id: chunks.len() as u64,
        timestamp: Utc::now(),
        chunk_type,
        content,
        metadata,
    };
    chunks.push(chunk.clone());
    chunk
}

/// Handle for a live subscription.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<SubscriberMap>,
}

impl Subscription {
    /// Stop delivery permanently.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

/// Task id → buffer map.
#[derive(Default)]
pub struct OutputBufferRegistry {
    buffers: Mutex<HashMap<String, Arc<OutputBuffer>>>,
}

impl OutputBufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer for `task_id`, created empty on first access.
    pub fn get_buffer(&self, task_id: &str) -> Arc<OutputBuffer> {
        self.lock()
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(OutputBuffer::new(task_id)))
            .clone()
    }

    /// The buffer for `task_id` without creating one.
    pub fn find(&self, task_id: &str) -> Option<Arc<OutputBuffer>> {
        self.lock().get(task_id).cloned()
    }

    pub fn has_buffer(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    /// Drop the registry's reference to a buffer. Readers still holding the
    /// `Arc` keep it alive until they finish.
    pub fn remove_buffer(&self, task_id: &str) -> bool {
        self.lock().remove(task_id).is_some()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<OutputBuffer>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(chunks: &[OutputChunk]) -> Vec<u64> {
        chunks.iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_append_assigns_sequential_ids() {
        let buffer = OutputBuffer::new("t1");
        assert_eq!(buffer.last_id(), None);
        for expected in 0..5u64 {
            let chunk = buffer.append(ChunkType::Text, format!("c{expected}"), None).unwrap();
            assert_eq!(chunk.id, expected);
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.last_id(), Some(4));
    }

    #[test]
    fn test_chunks_from_id_filters_exactly() {
        let buffer = OutputBuffer::new("t1");
        for i in 0..4 {
            buffer.append(ChunkType::Text, format!("c{i}"), None);
        }
        assert_eq!(ids(&buffer.chunks(None)), vec![0, 1, 2, 3]);
        assert_eq!(ids(&buffer.chunks(Some(0))), vec![0, 1, 2, 3]);
        assert_eq!(ids(&buffer.chunks(Some(2))), vec![2, 3]);
        assert!(buffer.chunks(Some(4)).is_empty());
        assert!(buffer.chunks(Some(100)).is_empty());
    }

    #[test]
    fn test_chunks_page_limit() {
        let buffer = OutputBuffer::new("t1");
        for i in 0..5 {
            buffer.append(ChunkType::Text, format!("c{i}"), None);
        }
        let (page, truncated) = buffer.chunks_page(Some(1), Some(2));
        assert_eq!(ids(&page), vec![1, 2]);
        assert!(truncated);

        let (page, truncated) = buffer.chunks_page(Some(3), Some(2));
        assert_eq!(ids(&page), vec![3, 4]);
        assert!(!truncated);
    }

    #[test]
    fn test_late_subscriber_sees_only_new_chunks() {
        let buffer = OutputBuffer::new("t1");
        buffer.append(ChunkType::Text, "A", None);
        buffer.append(ChunkType::Text, "B", None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let subscription = buffer.subscribe(move |chunk| {
            seen_clone.lock().unwrap().push(chunk.content.clone());
        });

        buffer.append(ChunkType::Text, "C", None);
        assert_eq!(*seen.lock().unwrap(), vec!["C".to_string()]);

        subscription.unsubscribe();
        buffer.append(ChunkType::Text, "D", None);
        assert_eq!(*seen.lock().unwrap(), vec!["C".to_string()]);
        assert_eq!(buffer.subscriber_count(), 0);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let buffer = OutputBuffer::new("t1");
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        {
            let _sub = buffer.subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            });
            buffer.append(ChunkType::Status, "running", None);
        }
        buffer.append(ChunkType::Status, "completed", None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscriber_may_read_buffer() {
        let buffer = Arc::new(OutputBuffer::new("t1"));
        let observed = Arc::new(AtomicU64::new(0));
        let (b, o) = (buffer.clone(), observed.clone());
        let _sub = buffer.subscribe(move |_| {
            o.store(b.len() as u64, Ordering::SeqCst);
        });
        buffer.append(ChunkType::Text, "x", None);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_seals_the_buffer() {
        let buffer = OutputBuffer::new("t1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = buffer.subscribe(move |chunk| {
            seen_clone.lock().unwrap().push(chunk.id);
        });

        buffer.append(ChunkType::Text, "work", None);
        let closing = buffer.close([
            (ChunkType::Error, "boom".to_string(), None),
            (ChunkType::Status, "failed".to_string(), None),
        ]);
        assert_eq!(ids(&closing), vec![1, 2]);
        assert!(buffer.is_closed());

        assert!(buffer.append(ChunkType::Text, "late", None).is_none());
        assert!(buffer.close([(ChunkType::Status, "cancelled".to_string(), None)]).is_empty());

        let chunks = buffer.chunks(None);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.last().unwrap().content, "failed");
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_registry_creates_lazily_and_removes() {
        let registry = OutputBufferRegistry::new();
        assert!(!registry.has_buffer("t1"));
        assert!(registry.find("t1").is_none());

        let buffer = registry.get_buffer("t1");
        buffer.append(ChunkType::Text, "hello", None);
        assert!(registry.has_buffer("t1"));
        assert_eq!(registry.get_buffer("t1").len(), 1);

        registry.get_buffer("t2");
        let mut ids = registry.task_ids();
        ids.sort();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);

        assert!(registry.remove_buffer("t1"));
        assert!(!registry.remove_buffer("t1"));
        assert!(!registry.has_buffer("t1"));
        // A fresh buffer starts over at id 0.
        let chunk = registry.get_buffer("t1").append(ChunkType::Text, "x", None).unwrap();
        assert_eq!(chunk.id, 0);
    }
}
