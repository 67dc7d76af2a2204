//! Streaming Service: runs one presentation request end to end.
//!
//! `open` validates, registers the connection and writes the skeleton frame
//! before returning. A driver task then fans card work out to a `JoinSet`,
//! funnels per-card updates back through one channel and is the only writer
//! to the client's sink, so `done` can only follow every card's last frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use cardstream_images::{ImageGenerationService, ImageRequest, TrackerStats};
use cardstream_sse::Frame;
use cardstream_types::{
    CardId, CardSkeleton, ConnectionId, GenerationRequest, ImageAsset, ImageStatus, Result,
    Stage, StreamError,
};

use crate::catalog::{ContentSource, PlannedCard};
use crate::config::StreamingConfig;
use crate::events::{EventEmitter, StreamEvent};
use crate::session::{CardBoard, SessionEvent, SessionState};
use crate::store::{ConnectionHandle, ConnectionStore, FrameSink, StoreStats};

/// The client's side of an opened session: the frames already formatted for
/// the wire. The skeleton frame is buffered before `open` returns.
#[derive(Debug)]
pub struct SessionStream {
    pub connection_id: ConnectionId,
    pub card_ids: Vec<CardId>,
    frames: mpsc::Receiver<String>,
}

impl SessionStream {
    /// Next wire chunk; `None` once the server closed the stream.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<String> {
        ReceiverStream::new(self.frames)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ClientDisconnected,
    Cancelled,
    TimedOut,
    Shutdown,
    Internal,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ClientDisconnected => "client disconnected",
            AbortReason::Cancelled => "cancelled",
            AbortReason::TimedOut => "session timed out",
            AbortReason::Shutdown => "server shutting down",
            AbortReason::Internal => "internal error",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub connections: StoreStats,
    pub max_connections: usize,
    pub sessions_opened: u64,
    pub sessions_completed: u64,
    pub sessions_aborted: u64,
    pub images: TrackerStats,
    pub providers: Vec<String>,
}

pub struct StreamingService {
    config: StreamingConfig,
    store: Arc<ConnectionStore>,
    catalog: Arc<dyn ContentSource>,
    images: Arc<ImageGenerationService>,
    events: EventEmitter,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    counters: Arc<Counters>,
}

impl StreamingService {
    pub fn new(
        config: StreamingConfig,
        catalog: Arc<dyn ContentSource>,
        images: Arc<ImageGenerationService>,
    ) -> Self {
        let store = Arc::new(ConnectionStore::new(config.max_connections));
        Self {
            config,
            store,
            catalog,
            images,
            events: EventEmitter::default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn ContentSource> {
        &self.catalog
    }

    pub fn images(&self) -> &Arc<ImageGenerationService> {
        &self.images
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Start a session. Every rejection happens before the connection is
    /// registered or a byte is written.
    pub fn open(&self, request: GenerationRequest) -> Result<SessionStream> {
        if self.shutdown.is_cancelled() {
            return Err(StreamError::Other("Streaming service is shutting down".into()));
        }
        request.validate(self.config.max_card_count)?;
        let plan = self.catalog.plan(&request)?;
        if request.include_images {
            self.images.check_provider(&request.image_provider)?;
        }

        let connection_id = ConnectionId::new();
        let cards: Vec<(CardId, PlannedCard)> =
            plan.into_iter().map(|p| (CardId::new(), p)).collect();
        let card_ids: Vec<CardId> = cards.iter().map(|(id, _)| id.clone()).collect();
        let skeleton = Frame::skeleton(
            cards
                .iter()
                .map(|(id, p)| CardSkeleton {
                    id: id.clone(),
                    card_type: p.section.clone(),
                    layout: p.layout,
                })
                .collect(),
            Some(connection_id.clone()),
        );

        let (sink, frames) = FrameSink::channel(connection_id.clone(), self.config.frame_buffer);
        let cancel = self.shutdown.child_token();
        self.store.register(ConnectionHandle {
            id: connection_id.clone(),
            sink: sink.clone(),
            cancel: cancel.clone(),
            topic: request.topic.clone(),
            card_ids: card_ids.clone(),
            connected_at: Instant::now(),
        })?;

        if let Err(e) = sink.try_send_frame(&skeleton) {
            self.store.remove(&connection_id);
            return Err(e);
        }
        self.store.record_frame(&connection_id, Stage::Skeleton);
        self.counters.opened.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            connection = %connection_id,
            topic = %request.topic,
            cards = card_ids.len(),
            images = request.include_images,
            "Session opened"
        );
        self.events.emit(StreamEvent::ClientConnected {
            connection: connection_id.clone(),
            topic: request.topic.clone(),
            card_count: card_ids.len(),
        });
        self.events.emit(StreamEvent::SkeletonSent {
            connection: connection_id.clone(),
            cards: card_ids.clone(),
        });

        let board = CardBoard::new(
            card_ids
                .iter()
                .map(|id| (id.clone(), request.include_images)),
        );
        let driver = SessionDriver {
            id: connection_id.clone(),
            sink,
            cancel,
            shutdown: self.shutdown.clone(),
            deadline: Instant::now() + self.config.session_timeout,
            started: Instant::now(),
            state: SessionState::Init.transition(SessionEvent::SkeletonWritten)?,
            board,
            cards,
            request,
            config: self.config.clone(),
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            images: self.images.clone(),
            events: self.events.clone(),
            counters: self.counters.clone(),
        };
        self.tasks.spawn(driver.run());

        Ok(SessionStream {
            connection_id,
            card_ids,
            frames,
        })
    }

    /// Abort a live session. Returns `false` for unknown ids.
    pub fn cancel(&self, connection_id: &ConnectionId) -> bool {
        match self.store.remove(connection_id) {
            Some(handle) => {
                tracing::info!(connection = %connection_id, "Session cancelled");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every live session and wait for their drivers to exit.
    pub async fn shutdown(&self) {
        tracing::info!(active = self.store.len(), "Shutting down streaming service");
        self.shutdown.cancel();
        self.store.for_each(|handle| handle.cancel.cancel());
        self.tasks.close();
        self.tasks.wait().await;
        let leftover = self.store.clear();
        if leftover > 0 {
            tracing::warn!(leftover, "Connections still registered after shutdown");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Periodically reap stale connections and expired image statuses.
    pub fn spawn_janitor(&self) {
        let store = self.store.clone();
        let images = self.images.clone();
        let shutdown = self.shutdown.clone();
        let every = self.config.janitor_interval.max(Duration::from_millis(1));
        let idle = self.config.idle_timeout;

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let stale = store.stale(idle);
                        for id in &stale {
                            if let Some(handle) = store.remove(id) {
                                handle.cancel.cancel();
                            }
                        }
                        let images_removed = images.cleanup();
                        if !stale.is_empty() || images_removed > 0 {
                            tracing::info!(
                                connections = stale.len(),
                                images = images_removed,
                                "Janitor cleanup"
                            );
                        }
                    }
                }
            }
        });
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            connections: self.store.stats(),
            max_connections: self.store.max_connections(),
            sessions_opened: self.counters.opened.load(Ordering::Relaxed),
            sessions_completed: self.counters.completed.load(Ordering::Relaxed),
            sessions_aborted: self.counters.aborted.load(Ordering::Relaxed),
            images: self.images.tracker().stats(),
            providers: self.images.provider_names(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-card work
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CardUpdate {
    Content {
        card: CardId,
        content: serde_json::Value,
    },
    ContentFailed {
        card: CardId,
        error: StreamError,
    },
    Image {
        card: CardId,
        asset: ImageAsset,
    },
    ImageFailed {
        card: CardId,
        status: ImageStatus,
        error: StreamError,
    },
}

struct CardJob {
    card_id: CardId,
    planned: PlannedCard,
    topic: String,
    style: String,
    image_provider: Option<String>,
    delay: Duration,
    catalog: Arc<dyn ContentSource>,
    images: Arc<ImageGenerationService>,
    cancel: CancellationToken,
    updates: mpsc::Sender<CardUpdate>,
}

impl CardJob {
    async fn run(self) {
        let card = self.card_id.clone();

        // The image job starts right away and runs alongside content.
        let image = match &self.image_provider {
            Some(provider) => {
                let request = ImageRequest::new(card.clone(), self.planned.image_prompt.clone())
                    .for_layout(self.planned.layout)
                    .with_style(self.style.clone());
                match self.images.start(request, provider, &self.cancel) {
                    Ok(()) => Some(Ok(())),
                    Err(e) => {
                        tracing::warn!(card = %card, error = %e, "Could not start image job");
                        Some(Err(e))
                    }
                }
            }
            None => None,
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let content = match self.catalog.generate(&self.topic, &self.planned).await {
            Ok(content) => content,
            Err(e) => {
                if matches!(image, Some(Ok(()))) {
                    self.images.cancel(&card);
                }
                let error = match e {
                    e @ StreamError::CardGenerationFailure { .. } => e,
                    other => StreamError::CardGenerationFailure {
                        card: card.clone(),
                        message: other.to_string(),
                    },
                };
                let _ = self.updates.send(CardUpdate::ContentFailed { card, error }).await;
                return;
            }
        };

        if self
            .updates
            .send(CardUpdate::Content {
                card: card.clone(),
                content,
            })
            .await
            .is_err()
        {
            return;
        }

        let update = match image {
            None => return,
            Some(Err(e)) => CardUpdate::ImageFailed {
                card: card.clone(),
                status: ImageStatus::Failed,
                error: e,
            },
            Some(Ok(())) => match self.images.tracker().wait_terminal(&card).await {
                Some(job) => match job.asset() {
                    Some(asset) => CardUpdate::Image {
                        card: card.clone(),
                        asset,
                    },
                    None if job.status == ImageStatus::Cancelled => CardUpdate::ImageFailed {
                        card: card.clone(),
                        status: ImageStatus::Cancelled,
                        error: StreamError::ImageCancelled { card: card.clone() },
                    },
                    None => CardUpdate::ImageFailed {
                        card: card.clone(),
                        status: ImageStatus::Failed,
                        error: StreamError::ImageGenerationFailure {
                            card: card.clone(),
                            message: job.error.unwrap_or_else(|| "unknown error".into()),
                        },
                    },
                },
                None => CardUpdate::ImageFailed {
                    card: card.clone(),
                    status: ImageStatus::Failed,
                    error: StreamError::ImageGenerationFailure {
                        card: card.clone(),
                        message: "image status was discarded".into(),
                    },
                },
            },
        };
        let _ = self.updates.send(update).await;
    }
}

// ---------------------------------------------------------------------------
// SessionDriver
// ---------------------------------------------------------------------------

struct SessionDriver {
    id: ConnectionId,
    sink: FrameSink,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    deadline: Instant,
    started: Instant,
    state: SessionState,
    board: CardBoard,
    cards: Vec<(CardId, PlannedCard)>,
    request: GenerationRequest,
    config: StreamingConfig,
    store: Arc<ConnectionStore>,
    catalog: Arc<dyn ContentSource>,
    images: Arc<ImageGenerationService>,
    events: EventEmitter,
    counters: Arc<Counters>,
}

type Step = std::result::Result<(), AbortReason>;

impl SessionDriver {
    async fn run(mut self) {
        if let Err(e) = self.advance(SessionEvent::CardsStarted) {
            tracing::error!(connection = %self.id, error = %e, "Session could not start");
            self.abort(AbortReason::Internal);
            return;
        }

        let (updates_tx, mut updates) = mpsc::channel(self.cards.len().max(1) * 2);
        let mut tasks = JoinSet::new();
        let image_provider = self
            .request
            .include_images
            .then(|| self.request.image_provider.clone());
        for (index, (card_id, planned)) in std::mem::take(&mut self.cards).into_iter().enumerate() {
            let job = CardJob {
                card_id,
                planned,
                topic: self.request.topic.clone(),
                style: self.request.style.clone(),
                image_provider: image_provider.clone(),
                delay: self.config.card_delay(self.request.stream_delay, index),
                catalog: self.catalog.clone(),
                images: self.images.clone(),
                cancel: self.cancel.clone(),
                updates: updates_tx.clone(),
            };
            tasks.spawn(job.run());
        }
        drop(updates_tx);

        let every = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome: Step = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Err(self.cancel_reason()),
                _ = self.sink.closed() => break Err(AbortReason::ClientDisconnected),
                _ = sleep_until(self.deadline) => break Err(AbortReason::TimedOut),
                update = updates.recv() => match update {
                    Some(update) => {
                        if let Err(reason) = self.apply(update).await {
                            break Err(reason);
                        }
                    }
                    None => break Ok(()),
                },
                _ = heartbeat.tick() => {
                    if let Err(reason) = self.heartbeat().await {
                        break Err(reason);
                    }
                }
            }
        };

        let outcome = match outcome {
            Ok(()) => self.finish().await,
            Err(reason) => Err(reason),
        };
        if let Err(reason) = outcome {
            tasks.abort_all();
            self.abort(reason);
        }
    }

    fn cancel_reason(&self) -> AbortReason {
        if self.shutdown.is_cancelled() {
            AbortReason::Shutdown
        } else {
            AbortReason::Cancelled
        }
    }

    fn advance(&mut self, event: SessionEvent) -> Result<()> {
        let next = self.state.transition(event)?;
        tracing::debug!(connection = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        Ok(())
    }

    /// Write one frame, giving up if the session is cancelled or times out
    /// while the client is not reading.
    async fn write(&self, frame: &Frame) -> Step {
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancel_reason()),
            _ = sleep_until(self.deadline) => return Err(AbortReason::TimedOut),
            sent = self.sink.send_frame(frame) => sent,
        };
        match sent {
            Ok(()) => {
                let seq = self.store.record_frame(&self.id, frame.stage());
                tracing::debug!(connection = %self.id, stage = ?frame.stage(), card = ?frame.card_id(), seq = ?seq, "Frame sent");
                Ok(())
            }
            Err(StreamError::TransportAbort { .. }) => Err(AbortReason::ClientDisconnected),
            Err(e) => {
                tracing::error!(connection = %self.id, error = %e, "Failed to format frame");
                Err(AbortReason::Internal)
            }
        }
    }

    async fn heartbeat(&self) -> Step {
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancel_reason()),
            _ = sleep_until(self.deadline) => return Err(AbortReason::TimedOut),
            sent = self.sink.send_heartbeat() => sent,
        };
        match sent {
            Ok(()) => {
                self.store.touch(&self.id);
                Ok(())
            }
            Err(_) => Err(AbortReason::ClientDisconnected),
        }
    }

    async fn apply(&mut self, update: CardUpdate) -> Step {
        match update {
            CardUpdate::Content { card, content } => {
                if let Err(e) = self.board.content_ready(&card) {
                    tracing::warn!(connection = %self.id, card = %card, error = %e, "Dropping content update");
                    return Ok(());
                }
                self.write(&Frame::Content {
                    card_id: card.clone(),
                    content,
                })
                .await?;
                self.events.emit(StreamEvent::ContentSent {
                    connection: self.id.clone(),
                    card,
                });
            }
            CardUpdate::ContentFailed { card, error } => {
                if let Err(e) = self.board.content_failed(&card) {
                    tracing::warn!(connection = %self.id, card = %card, error = %e, "Dropping content failure");
                    return Ok(());
                }
                self.card_failed(card, error).await?;
            }
            CardUpdate::Image { card, asset } => {
                if let Err(e) = self.board.image_settled(&card, ImageStatus::Completed) {
                    tracing::warn!(connection = %self.id, card = %card, error = %e, "Dropping image update");
                    return Ok(());
                }
                let provider = asset.metadata.provider.clone();
                self.write(&Frame::Image {
                    card_id: card.clone(),
                    image: asset,
                })
                .await?;
                self.events.emit(StreamEvent::ImageSent {
                    connection: self.id.clone(),
                    card,
                    provider,
                });
            }
            CardUpdate::ImageFailed {
                card,
                status,
                error,
            } => {
                if let Err(e) = self.board.image_settled(&card, status) {
                    tracing::warn!(connection = %self.id, card = %card, error = %e, "Dropping image failure");
                    return Ok(());
                }
                self.card_failed(card, error).await?;
            }
        }
        Ok(())
    }

    async fn card_failed(&self, card: CardId, error: StreamError) -> Step {
        tracing::warn!(connection = %self.id, card = %card, error = %error, "Card failed");
        self.write(&Frame::card_error(card.clone(), &error)).await?;
        self.events.emit(StreamEvent::CardFailed {
            connection: self.id.clone(),
            card,
            error: error.to_string(),
        });
        Ok(())
    }

    /// Every card task has exited. Settle any card that never reported, then
    /// send `done`.
    async fn finish(&mut self) -> Step {
        for card in self.board.pending() {
            let content_done = self
                .board
                .get(&card)
                .is_some_and(|c| c.content.is_terminal());
            let (settled, error) = if content_done {
                (
                    self.board.image_settled(&card, ImageStatus::Failed),
                    StreamError::ImageGenerationFailure {
                        card: card.clone(),
                        message: "card task ended before the image was reported".into(),
                    },
                )
            } else {
                (
                    self.board.content_failed(&card),
                    StreamError::CardGenerationFailure {
                        card: card.clone(),
                        message: "card task ended before content was reported".into(),
                    },
                )
            };
            if settled.is_ok() {
                self.card_failed(card, error).await?;
            }
        }

        if let Err(e) = self.advance(SessionEvent::AllCardsTerminal) {
            tracing::error!(connection = %self.id, error = %e, "Cannot complete session");
            return Err(AbortReason::Internal);
        }
        self.write(&Frame::Done).await?;

        self.cancel.cancel();
        self.store.remove(&self.id);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        let duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(connection = %self.id, duration_ms, "Session completed");
        self.events.emit(StreamEvent::SessionCompleted {
            connection: self.id.clone(),
            duration_ms,
        });
        Ok(())
    }

    fn abort(&mut self, reason: AbortReason) {
        if self.state.is_terminal() {
            return;
        }
        if let Err(e) = self.advance(SessionEvent::Abort) {
            tracing::error!(connection = %self.id, error = %e, "Abort from unexpected state");
        }
        self.cancel.cancel();
        self.store.remove(&self.id);
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection = %self.id, reason = reason.as_str(), "Session aborted");
        if reason == AbortReason::ClientDisconnected {
            self.events.emit(StreamEvent::ClientDisconnected {
                connection: self.id.clone(),
            });
        }
        self.events.emit(StreamEvent::SessionAborted {
            connection: self.id.clone(),
            reason: reason.as_str().to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
