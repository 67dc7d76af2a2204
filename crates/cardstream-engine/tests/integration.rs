//! End-to-end tests for the streaming service.
//!
//! Each test opens a session, drains the wire chunks a client would read,
//! decodes them back into frames and checks the ordering rules.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use cardstream_engine::{
    ConnectionHandle, ContentSource, FrameSink, PlannedCard, SessionStream, StaticCatalog,
    StreamEvent, StreamingConfig, StreamingService,
};
use cardstream_images::{
    provider_failure, BackoffPolicy, ImageGenerationService, ImageProvider, ImageRequest,
    ImageServiceConfig, ImageStatusTracker,
};
use cardstream_sse::{Frame, FrameDecoder, TranscriptChecker, TranscriptReport};
use cardstream_types::{
    CardId, ConnectionId, GenerationRequest, ImageAsset, ImageMetadata, ImageStatus, Result,
    Stage, StreamError,
};

const TOPIC: &str = "AI in Product Discovery";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn images(config: ImageServiceConfig) -> ImageGenerationService {
    ImageGenerationService::new(config, Arc::new(ImageStatusTracker::new()))
}

fn service_with(
    config: StreamingConfig,
    source: Arc<dyn ContentSource>,
    images: ImageGenerationService,
) -> StreamingService {
    StreamingService::new(config, source, Arc::new(images))
}

fn service(config: StreamingConfig) -> StreamingService {
    service_with(
        config,
        Arc::new(StaticCatalog::new()),
        images(ImageServiceConfig::default()),
    )
}

/// What a client saw on the wire.
struct Transcript {
    frames: Vec<Frame>,
    /// Chunk kinds in arrival order: a stage name or "heartbeat".
    chunks: Vec<String>,
}

impl Transcript {
    fn heartbeats(&self) -> usize {
        self.chunks.iter().filter(|c| *c == "heartbeat").count()
    }

    fn stages(&self) -> Vec<Stage> {
        self.frames.iter().map(Frame::stage).collect()
    }

    fn check(&self, expect_images: bool) -> TranscriptReport {
        let mut checker = TranscriptChecker::new().expect_images(expect_images);
        for frame in &self.frames {
            checker.observe(frame);
        }
        checker.report()
    }

    /// Card ids of `stage` frames, in arrival order.
    fn cards_with(&self, stage: Stage) -> Vec<CardId> {
        self.frames
            .iter()
            .filter(|f| f.stage() == stage)
            .filter_map(|f| f.card_id().cloned())
            .collect()
    }
}

/// Read until the server closes the stream.
async fn drain(stream: &mut SessionStream) -> Transcript {
    let read = async {
        let mut decoder = FrameDecoder::new();
        let mut transcript = Transcript {
            frames: Vec::new(),
            chunks: Vec::new(),
        };
        while let Some(chunk) = stream.next_frame().await {
            decoder.push_str(&chunk);
            if chunk.starts_with(':') {
                transcript.chunks.push("heartbeat".into());
            }
            for frame in decoder.frames() {
                let frame = frame.expect("server sent an unparsable frame");
                transcript.chunks.push(frame.stage().as_str().to_string());
                transcript.frames.push(frame);
            }
        }
        assert!(decoder.remainder().is_empty(), "partial frame left on the wire");
        transcript
    };
    tokio::time::timeout(Duration::from_secs(600), read)
        .await
        .expect("stream never closed")
}

/// Collect events until the session's terminal event.
async fn events_until_terminal(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let read = async {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.expect("event channel closed");
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), read)
        .await
        .expect("no terminal event")
}

/// Content source that wraps the static catalog with per-section delays,
/// failures, or a hang.
#[derive(Default)]
struct ScriptedSource {
    inner: StaticCatalog,
    delays: HashMap<&'static str, Duration>,
    failing: HashSet<&'static str>,
    hang: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl ContentSource for ScriptedSource {
    fn topics(&self) -> Vec<String> {
        self.inner.topics()
    }

    fn plan(&self, request: &GenerationRequest) -> Result<Vec<PlannedCard>> {
        self.inner.plan(request)
    }

    async fn generate(&self, topic: &str, card: &PlannedCard) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delays.get(card.section.as_str()) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(card.section.as_str()) {
            return Err(StreamError::Other("model overloaded".into()));
        }
        self.inner.generate(topic, card).await
    }
}

struct BrokenProvider;

#[async_trait]
impl ImageProvider for BrokenProvider {
    fn name(&self) -> &str {
        "broken"
    }

    async fn generate(&self, request: &ImageRequest) -> Result<ImageAsset> {
        Err(provider_failure(&request.card_id, "quota exhausted"))
    }
}

/// Never finishes on its own; only cancellation ends its jobs.
struct StalledProvider;

#[async_trait]
impl ImageProvider for StalledProvider {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn generate(&self, _request: &ImageRequest) -> Result<ImageAsset> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ImageAsset {
            url: "https://example.invalid/stalled.png".into(),
            metadata: ImageMetadata {
                provider: "stalled".into(),
                aspect_ratio: None,
                placeholder_type: None,
                generated_at: None,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Test 1: Text-only session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn text_only_session_streams_skeleton_content_done() {
    let svc = service(StreamingConfig::default());
    let mut events = svc.subscribe();

    let mut stream = svc.open(GenerationRequest::new(TOPIC, 3)).unwrap();
    assert_eq!(stream.card_ids.len(), 3);

    let transcript = drain(&mut stream).await;
    let report = transcript.check(false);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
    assert!(report.completed);
    assert_eq!(report.card_ids, stream.card_ids);
    assert_eq!(report.content_frames, 3);
    assert_eq!(report.image_frames, 0);
    assert_eq!(transcript.stages().first(), Some(&Stage::Skeleton));
    assert_eq!(transcript.stages().last(), Some(&Stage::Done));

    // Card ids in content frames are exactly the skeleton's.
    let content: HashSet<CardId> = transcript.cards_with(Stage::Content).into_iter().collect();
    let skeleton: HashSet<CardId> = stream.card_ids.iter().cloned().collect();
    assert_eq!(content, skeleton);

    // Skeleton frame carries the connection id and the section names.
    match &transcript.frames[0] {
        Frame::Skeleton {
            cards,
            connection_id,
            ..
        } => {
            assert_eq!(connection_id.as_ref(), Some(&stream.connection_id));
            let types: Vec<&str> = cards.iter().map(|c| c.card_type.as_str()).collect();
            assert_eq!(types, vec!["title", "objectives", "process"]);
        }
        other => panic!("expected skeleton, got {other:?}"),
    }

    let events = events_until_terminal(&mut events).await;
    assert!(matches!(events[0], StreamEvent::ClientConnected { card_count: 3, .. }));
    assert!(matches!(events.last(), Some(StreamEvent::SessionCompleted { .. })));
    assert!(!svc.store().contains(&stream.connection_id));
    assert_eq!(svc.stats().sessions_completed, 1);
}

// ---------------------------------------------------------------------------
// Test 2: Unknown topic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_topic_is_rejected_before_registration() {
    let svc = service(StreamingConfig::default());
    let err = svc
        .open(GenerationRequest::new("Nonexistent Topic", 3))
        .unwrap_err();

    match &err {
        StreamError::UnknownTopic { topic, available } => {
            assert_eq!(topic, "Nonexistent Topic");
            assert_eq!(available.len(), 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.http_status(), 404);
    assert!(svc.store().is_empty());
    assert_eq!(svc.stats().connections.total_registered, 0);
}

// ---------------------------------------------------------------------------
// Test 3: Images follow their content
// ---------------------------------------------------------------------------

#[tokio::test]
async fn images_follow_content_and_done_waits_for_them() {
    let svc = service(StreamingConfig::default());
    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 6).with_images("placeholder"))
        .unwrap();

    let transcript = drain(&mut stream).await;
    let report = transcript.check(true);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
    assert!(report.completed);
    assert_eq!(report.content_frames, 6);
    assert_eq!(report.image_frames, 6);

    // Each card's image comes after its own content.
    for card in &stream.card_ids {
        let position = |stage: Stage| {
            transcript
                .frames
                .iter()
                .position(|f| f.stage() == stage && f.card_id() == Some(card))
                .unwrap_or_else(|| panic!("no {stage:?} frame for {card}"))
        };
        assert!(position(Stage::Content) < position(Stage::Image));
    }

    for frame in &transcript.frames {
        if let Frame::Image { image, .. } = frame {
            assert!(image.url.starts_with("data:image/svg+xml;base64,"));
            assert_eq!(image.metadata.provider, "placeholder");
        }
    }

    // Every image job ended up completed in the tracker.
    let tracker = svc.images().tracker();
    for card in &stream.card_ids {
        assert_eq!(tracker.get(card).unwrap().status, ImageStatus::Completed);
    }
}

// ---------------------------------------------------------------------------
// Test 4: Client goes away after the skeleton
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_aborts_the_session() {
    let source = Arc::new(ScriptedSource::default());
    let svc = service_with(
        StreamingConfig::default(),
        source.clone(),
        images(ImageServiceConfig::default()),
    );
    let mut events = svc.subscribe();

    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 3).with_delay(60_000))
        .unwrap();
    let id = stream.connection_id.clone();
    let skeleton = stream.next_frame().await.unwrap();
    assert!(skeleton.starts_with("data: {\"stage\":\"skeleton\""));
    drop(stream);

    let events = events_until_terminal(&mut events).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::ClientDisconnected { .. })));
    match events.last() {
        Some(StreamEvent::SessionAborted { connection, reason }) => {
            assert_eq!(connection, &id);
            assert_eq!(reason, "client disconnected");
        }
        other => panic!("expected abort, got {other:?}"),
    }

    assert!(!svc.store().contains(&id));
    assert_eq!(svc.stats().sessions_aborted, 1);
    // No card work ran past its stagger delay.
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Test 5: Out-of-order card completion
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cards_are_streamed_in_completion_order() {
    let source = Arc::new(ScriptedSource {
        delays: HashMap::from([
            ("title", Duration::from_millis(300)),
            ("objectives", Duration::from_millis(100)),
            ("process", Duration::from_millis(200)),
        ]),
        ..Default::default()
    });
    let svc = service_with(
        StreamingConfig::default(),
        source,
        images(ImageServiceConfig::default()),
    );

    let mut stream = svc.open(GenerationRequest::new(TOPIC, 3)).unwrap();
    let transcript = drain(&mut stream).await;

    let report = transcript.check(false);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
    let ids = &stream.card_ids;
    assert_eq!(
        transcript.cards_with(Stage::Content),
        vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]
    );
}

// ---------------------------------------------------------------------------
// Test 6: One card fails, siblings continue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn content_failure_is_card_scoped() {
    let source = Arc::new(ScriptedSource {
        failing: HashSet::from(["objectives"]),
        ..Default::default()
    });
    let svc = service_with(
        StreamingConfig::default(),
        source,
        images(ImageServiceConfig::default()),
    );

    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 3).with_images("placeholder"))
        .unwrap();
    let failed = stream.card_ids[1].clone();
    let transcript = drain(&mut stream).await;

    let report = transcript.check(true);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
    assert!(report.completed);
    assert_eq!(report.content_frames, 2);
    assert_eq!(report.error_frames, 1);

    let error = transcript
        .frames
        .iter()
        .find(|f| f.stage() == Stage::Error)
        .unwrap();
    match error {
        Frame::Error {
            card_id,
            error,
            code,
        } => {
            assert_eq!(card_id.as_ref(), Some(&failed));
            assert!(error.contains("model overloaded"));
            assert_eq!(code.as_deref(), Some("CARD_GENERATION_FAILURE"));
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    // The failed card never gets an image frame.
    assert!(!transcript.cards_with(Stage::Image).contains(&failed));
    assert_eq!(report.image_frames, 2);
}

// ---------------------------------------------------------------------------
// Test 7: Image provider failure without fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_failure_sends_card_error_after_content() {
    let images = images(ImageServiceConfig {
        fallback_chain: vec!["broken".into()],
        fallback_enabled: false,
        max_retries: 0,
        backoff: BackoffPolicy::None,
        ..Default::default()
    })
    .with_provider(BrokenProvider);
    let svc = service_with(
        StreamingConfig::default(),
        Arc::new(StaticCatalog::new()),
        images,
    );

    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 2).with_images("broken"))
        .unwrap();
    let transcript = drain(&mut stream).await;

    let report = transcript.check(true);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
    assert!(report.completed);
    assert_eq!(report.content_frames, 2);
    assert_eq!(report.image_frames, 0);
    assert_eq!(report.error_frames, 2);

    for frame in &transcript.frames {
        if let Frame::Error { code, error, .. } = frame {
            assert_eq!(code.as_deref(), Some("IMAGE_GENERATION_FAILURE"));
            assert!(error.contains("quota exhausted"));
        }
    }
    for card in &stream.card_ids {
        assert_eq!(
            svc.images().tracker().get(card).unwrap().status,
            ImageStatus::Failed
        );
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_image_is_reported_like_a_failure() {
    let images = images(ImageServiceConfig::default()).with_provider(StalledProvider);
    let svc = service_with(
        StreamingConfig::default(),
        Arc::new(StaticCatalog::new()),
        images,
    );

    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 2).with_images("stalled"))
        .unwrap();

    // Read until both cards have their content, then cancel the stalled jobs.
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    while frames.iter().filter(|f: &&Frame| f.stage() == Stage::Content).count() < 2 {
        let chunk = stream.next_frame().await.expect("stream closed early");
        decoder.push_str(&chunk);
        for frame in decoder.frames() {
            frames.push(frame.unwrap());
        }
    }
    for card in &stream.card_ids {
        assert!(svc.images().cancel(card));
    }
    let rest = drain(&mut stream).await;
    frames.extend(rest.frames);
    let transcript = Transcript {
        frames,
        chunks: Vec::new(),
    };

    assert_eq!(
        transcript.stages(),
        vec![
            Stage::Skeleton,
            Stage::Content,
            Stage::Content,
            Stage::Error,
            Stage::Error,
            Stage::Done
        ]
    );
    let report = transcript.check(true);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
    assert!(report.completed);
    assert_eq!(report.image_frames, 0);

    for frame in &transcript.frames {
        if let Frame::Error { card_id, code, .. } = frame {
            assert!(card_id.is_some());
            assert_eq!(code.as_deref(), Some("IMAGE_CANCELLED"));
        }
    }
    for card in &stream.card_ids {
        assert_eq!(
            svc.images().tracker().get(card).unwrap().status,
            ImageStatus::Cancelled
        );
    }
}

#[tokio::test]
async fn unknown_provider_is_rejected_without_fallback() {
    let images = images(ImageServiceConfig {
        fallback_enabled: false,
        ..Default::default()
    });
    let svc = service_with(
        StreamingConfig::default(),
        Arc::new(StaticCatalog::new()),
        images,
    );

    let err = svc
        .open(GenerationRequest::new(TOPIC, 2).with_images("dalle"))
        .unwrap_err();
    assert!(matches!(err, StreamError::UnknownProvider { .. }));
    assert!(svc.store().is_empty());
}

#[tokio::test]
async fn unknown_provider_falls_back_to_placeholder() {
    let svc = service(StreamingConfig::default());
    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 2).with_images("dalle"))
        .unwrap();
    let transcript = drain(&mut stream).await;

    let report = transcript.check(true);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
    assert_eq!(report.image_frames, 2);
}

// ---------------------------------------------------------------------------
// Test 8: Heartbeats and timeouts
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_a_slow_session_alive() {
    let svc = service(StreamingConfig {
        heartbeat_interval: Duration::from_secs(1),
        ..Default::default()
    });

    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 1).with_delay(2_500))
        .unwrap();
    let transcript = drain(&mut stream).await;

    assert_eq!(transcript.heartbeats(), 2);
    assert_eq!(
        transcript.chunks,
        vec!["skeleton", "heartbeat", "heartbeat", "content", "done"]
    );
    let report = transcript.check(false);
    assert!(report.is_clean(), "violations: {:?}", report.violations);
}

#[tokio::test(start_paused = true)]
async fn hung_session_times_out_without_done() {
    let source = Arc::new(ScriptedSource {
        hang: true,
        ..Default::default()
    });
    let svc = service_with(
        StreamingConfig {
            session_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        source,
        images(ImageServiceConfig::default()),
    );
    let mut events = svc.subscribe();

    let mut stream = svc.open(GenerationRequest::new(TOPIC, 2)).unwrap();
    let transcript = drain(&mut stream).await;
    assert_eq!(transcript.stages(), vec![Stage::Skeleton]);

    let events = events_until_terminal(&mut events).await;
    match events.last() {
        Some(StreamEvent::SessionAborted { reason, .. }) => {
            assert_eq!(reason, "session timed out");
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert!(svc.store().is_empty());
}

// ---------------------------------------------------------------------------
// Test 9: Explicit cancel and shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_ends_the_stream_and_frees_the_slot() {
    let svc = service(StreamingConfig::default());
    let mut stream = svc
        .open(GenerationRequest::new(TOPIC, 3).with_images("placeholder").with_delay(60_000))
        .unwrap();
    let id = stream.connection_id.clone();

    assert!(svc.cancel(&id));
    assert!(!svc.cancel(&id));
    assert!(!svc.store().contains(&id));

    let transcript = drain(&mut stream).await;
    assert_eq!(transcript.stages(), vec![Stage::Skeleton]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_every_live_session() {
    let svc = service(StreamingConfig::default());
    let mut first = svc
        .open(GenerationRequest::new(TOPIC, 2).with_delay(60_000))
        .unwrap();
    let mut second = svc
        .open(GenerationRequest::new("Remote Team Management", 2).with_delay(60_000))
        .unwrap();
    assert_eq!(svc.store().len(), 2);

    svc.shutdown().await;

    assert!(svc.store().is_empty());
    assert_eq!(drain(&mut first).await.stages(), vec![Stage::Skeleton]);
    assert_eq!(drain(&mut second).await.stages(), vec![Stage::Skeleton]);
    assert_eq!(svc.stats().sessions_aborted, 2);
    assert!(svc.open(GenerationRequest::new(TOPIC, 1)).is_err());
}

// ---------------------------------------------------------------------------
// Janitor
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn janitor_reaps_idle_connections_and_old_image_statuses() {
    let svc = service_with(
        StreamingConfig {
            janitor_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        Arc::new(StaticCatalog::new()),
        images(ImageServiceConfig {
            retention: Duration::ZERO,
            ..Default::default()
        }),
    );

    // A connection nobody writes to.
    let id = ConnectionId::from("client_idle");
    let (sink, _rx) = FrameSink::channel(id.clone(), 8);
    let cancel = CancellationToken::new();
    svc.store()
        .register(ConnectionHandle {
            id: id.clone(),
            sink,
            cancel: cancel.clone(),
            topic: TOPIC.into(),
            card_ids: Vec::new(),
            connected_at: tokio::time::Instant::now(),
        })
        .unwrap();

    // A finished image job past its retention window.
    let card = CardId::from("card_finished");
    svc.images()
        .start(
            ImageRequest::new(card.clone(), "a harbour at dawn"),
            "placeholder",
            &CancellationToken::new(),
        )
        .unwrap();
    let job = svc.images().tracker().wait_terminal(&card).await.unwrap();
    assert_eq!(job.status, ImageStatus::Completed);

    svc.spawn_janitor();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(svc.store().contains(&id), "reaped before the idle timeout");
    assert!(!cancel.is_cancelled());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!svc.store().contains(&id));
    assert!(cancel.is_cancelled());
    assert!(svc.images().tracker().get(&card).is_none());
    assert_eq!(svc.stats().connections.total_removed, 1);
}

// ---------------------------------------------------------------------------
// Test 10: Concurrent sessions stay isolated
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_sessions_do_not_share_cards() {
    let svc = Arc::new(service(StreamingConfig::default()));

    let mut handles = Vec::new();
    for topic in [TOPIC, "Digital Marketing Trends 2025", "Remote Team Management"] {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            let mut stream = svc
                .open(GenerationRequest::new(topic, 4).with_images("placeholder"))
                .unwrap();
            let transcript = drain(&mut stream).await;
            (stream.card_ids.clone(), transcript.check(true))
        }));
    }

    let mut all_cards = HashSet::new();
    for handle in handles {
        let (cards, report) = handle.await.unwrap();
        assert!(report.is_clean(), "violations: {:?}", report.violations);
        assert!(report.completed);
        for card in cards {
            assert!(all_cards.insert(card), "card id reused across sessions");
        }
    }
    assert_eq!(all_cards.len(), 12);
    assert!(svc.store().is_empty());
}
