//! Connection Store: bookkeeping of live streaming sessions.
//!
//! In-memory only. Callers own it through an `Arc`; there is no global
//! instance. Locks are never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cardstream_sse::{format_frame, format_heartbeat, Frame};
use cardstream_types::{CardId, ConnectionId, Result, Stage, StreamError};

// ---------------------------------------------------------------------------
// FrameSink: the transport handle
// ---------------------------------------------------------------------------

/// Write side of one client's SSE body. The transport closes once every
/// sink clone is dropped; a dropped receiver means the client went away.
#[derive(Debug, Clone)]
pub struct FrameSink {
    connection: ConnectionId,
    tx: mpsc::Sender<String>,
}

impl FrameSink {
    pub fn channel(connection: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { connection, tx }, rx)
    }

    fn closed_error(&self) -> StreamError {
        StreamError::TransportAbort {
            connection: self.connection.clone(),
            reason: "client disconnected".into(),
        }
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = format_frame(frame)?;
        self.tx.send(text).await.map_err(|_| self.closed_error())
    }

    /// Non-waiting write; fails when the buffer is full or the client is gone.
    pub fn try_send_frame(&self, frame: &Frame) -> Result<()> {
        let text = format_frame(frame)?;
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => self.closed_error(),
            mpsc::error::TrySendError::Full(_) => StreamError::TransportAbort {
                connection: self.connection.clone(),
                reason: "frame buffer full".into(),
            },
        })
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        self.tx
            .send(format_heartbeat().to_string())
            .await
            .map_err(|_| self.closed_error())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the client side has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

/// What the store keeps per connection: the sink plus enough metadata to
/// cancel the session and answer diagnostics.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub sink: FrameSink,
    pub cancel: CancellationToken,
    pub topic: String,
    pub card_ids: Vec<CardId>,
    pub connected_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub topic: String,
    pub card_count: usize,
    pub last_stage: Option<Stage>,
    pub sequence: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub active: usize,
    pub total_registered: u64,
    pub total_removed: u64,
    pub average_duration_ms: u64,
}

struct Entry {
    handle: Arc<ConnectionHandle>,
    last_stage: Option<Stage>,
    sequence: u64,
    last_activity: Instant,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    by_card: HashMap<CardId, ConnectionId>,
    total_registered: u64,
    total_removed: u64,
    total_duration: Duration,
}

pub struct ConnectionStore {
    inner: Mutex<Inner>,
    max_connections: usize,
}

impl ConnectionStore {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: ConnectionHandle) -> Result<Arc<ConnectionHandle>> {
        let mut inner = self.lock();
        if inner.connections.contains_key(&handle.id) {
            tracing::error!(connection = %handle.id, "Duplicate connection registration");
            return Err(StreamError::DuplicateConnection(handle.id));
        }
        if inner.connections.len() >= self.max_connections {
            return Err(StreamError::CapacityExceeded {
                max: self.max_connections,
            });
        }

        let handle = Arc::new(handle);
        for card in &handle.card_ids {
            inner.by_card.insert(card.clone(), handle.id.clone());
        }
        inner.connections.insert(
            handle.id.clone(),
            Entry {
                handle: handle.clone(),
                last_stage: None,
                sequence: 0,
                last_activity: Instant::now(),
            },
        );
        inner.total_registered += 1;
        tracing::debug!(connection = %handle.id, active = inner.connections.len(), "Connection registered");
        Ok(handle)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.lock().connections.get(id).map(|e| e.handle.clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.lock().connections.contains_key(id)
    }

    /// Idempotent; removing an unknown id returns `None`.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let mut inner = self.lock();
        let entry = inner.connections.remove(id)?;
        for card in &entry.handle.card_ids {
            if inner.by_card.get(card) == Some(id) {
                inner.by_card.remove(card);
            }
        }
        inner.total_removed += 1;
        inner.total_duration += entry.handle.connected_at.elapsed();
        tracing::debug!(connection = %id, active = inner.connections.len(), "Connection removed");
        Some(entry.handle)
    }

    /// Call `f` for every live connection. Works on a snapshot, so `f` may
    /// remove entries (including the current one).
    pub fn for_each(&self, mut f: impl FnMut(&Arc<ConnectionHandle>)) {
        let snapshot: Vec<Arc<ConnectionHandle>> = self
            .lock()
            .connections
            .values()
            .map(|e| e.handle.clone())
            .collect();
        for handle in &snapshot {
            f(handle);
        }
    }

    /// Note that a frame was written. Returns the connection's new sequence
    /// number, or `None` if it is no longer registered.
    pub fn record_frame(&self, id: &ConnectionId, stage: Stage) -> Option<u64> {
        let mut inner = self.lock();
        let entry = inner.connections.get_mut(id)?;
        entry.sequence += 1;
        entry.last_stage = Some(stage);
        entry.last_activity = Instant::now();
        Some(entry.sequence)
    }

    pub fn touch(&self, id: &ConnectionId) {
        if let Some(entry) = self.lock().connections.get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn find_by_card(&self, card: &CardId) -> Option<ConnectionId> {
        self.lock().by_card.get(card).cloned()
    }

    pub fn info(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.lock().connections.get(id).map(entry_info)
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self.lock().connections.values().map(entry_info).collect();
        all.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        all
    }

    /// Connections idle longer than `idle`, or whose client is gone.
    pub fn stale(&self, idle: Duration) -> Vec<ConnectionId> {
        self.lock()
            .connections
            .values()
            .filter(|e| e.handle.sink.is_closed() || e.last_activity.elapsed() > idle)
            .map(|e| e.handle.id.clone())
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        let average_duration_ms = if inner.total_removed == 0 {
            0
        } else {
            (inner.total_duration.as_millis() / inner.total_removed as u128) as u64
        };
        StoreStats {
            active: inner.connections.len(),
            total_registered: inner.total_registered,
            total_removed: inner.total_removed,
            average_duration_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.connections.len();
        inner.connections.clear();
        inner.by_card.clear();
        inner.total_removed += count as u64;
        count
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

fn entry_info(entry: &Entry) -> ConnectionInfo {
    ConnectionInfo {
        connection_id: entry.handle.id.clone(),
        topic: entry.handle.topic.clone(),
        card_count: entry.handle.card_ids.len(),
        last_stage: entry.last_stage,
        sequence: entry.sequence,
        age_ms: entry.handle.connected_at.elapsed().as_millis() as u64,
        idle_ms: entry.last_activity.elapsed().as_millis() as u64,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
