//! Session lifecycle events.
//!
//! Emits [`StreamEvent`]s via a [`tokio::sync::broadcast`] channel so loggers,
//! stats collectors and tests can follow sessions without touching the
//! service internals.

use serde::{Deserialize, Serialize};

use cardstream_types::{CardId, ConnectionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    ClientConnected {
        connection: ConnectionId,
        topic: String,
        card_count: usize,
    },
    SkeletonSent {
        connection: ConnectionId,
        cards: Vec<CardId>,
    },
    ContentSent {
        connection: ConnectionId,
        card: CardId,
    },
    ImageSent {
        connection: ConnectionId,
        card: CardId,
        provider: String,
    },
    CardFailed {
        connection: ConnectionId,
        card: CardId,
        error: String,
    },
    SessionCompleted {
        connection: ConnectionId,
        duration_ms: u64,
    },
    SessionAborted {
        connection: ConnectionId,
        reason: String,
    },
    ClientDisconnected {
        connection: ConnectionId,
    },
}

impl StreamEvent {
    pub fn connection(&self) -> &ConnectionId {
        match self {
            StreamEvent::ClientConnected { connection, .. }
            | StreamEvent::SkeletonSent { connection, .. }
            | StreamEvent::ContentSent { connection, .. }
            | StreamEvent::ImageSent { connection, .. }
            | StreamEvent::CardFailed { connection, .. }
            | StreamEvent::SessionCompleted { connection, .. }
            | StreamEvent::SessionAborted { connection, .. }
            | StreamEvent::ClientDisconnected { connection } => connection,
        }
    }

    /// `true` for the last event a session ever emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::SessionCompleted { .. } | StreamEvent::SessionAborted { .. }
        )
    }
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<StreamEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all current subscribers; dropped silently when there are none.
    pub fn emit(&self, event: StreamEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
