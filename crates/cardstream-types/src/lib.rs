//! Shared types, errors, and the card/stage model for the Cardstream streaming engine.
//!
//! This crate provides the foundational types used across all other Cardstream crates:
//! - `StreamError`: unified error taxonomy
//! - `CardId` / `ConnectionId`: opaque identifiers minted per session
//! - `Stage`, `ContentStatus`, `ImageStatus`: wire stages and per-card progress
//! - `GenerationRequest`: the request surface consumed by the streaming service

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error type for all Cardstream subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    // === Request Errors ===
    #[error("Unknown topic '{topic}'. Available topics: {}", .available.join(", "))]
    UnknownTopic {
        topic: String,
        available: Vec<String>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Connection Errors ===
    #[error("Connection '{0}' is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("Maximum connections ({max}) reached")]
    CapacityExceeded { max: usize },

    #[error("Connection '{0}' not found")]
    ConnectionNotFound(ConnectionId),

    #[error("Transport aborted for connection '{connection}': {reason}")]
    TransportAbort {
        connection: ConnectionId,
        reason: String,
    },

    // === Card Errors ===
    #[error("Content generation failed for card '{card}': {message}")]
    CardGenerationFailure { card: CardId, message: String },

    #[error("Image generation failed for card '{card}': {message}")]
    ImageGenerationFailure { card: CardId, message: String },

    #[error("Image generation cancelled for card '{card}'")]
    ImageCancelled { card: CardId },

    #[error("No image job for card '{0}'")]
    ImageNotFound(CardId),

    #[error("Unknown image provider '{provider}'. Available: {}", .available.join(", "))]
    UnknownProvider {
        provider: String,
        available: Vec<String>,
    },

    // === State Machine Errors ===
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    // === Wire Errors ===
    #[error("Frame error: {0}")]
    Frame(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Returns `true` if the error is scoped to a single card and the session
    /// should keep streaming its siblings.
    pub fn is_card_scoped(&self) -> bool {
        matches!(
            self,
            StreamError::CardGenerationFailure { .. }
                | StreamError::ImageGenerationFailure { .. }
                | StreamError::ImageCancelled { .. }
        )
    }

    /// Returns `true` if a provider call that failed with this error may
    /// succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::ImageGenerationFailure { .. } | StreamError::Io(_)
        )
    }

    /// Returns `true` if the error terminates (or prevents) the whole session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::UnknownTopic { .. }
                | StreamError::InvalidRequest(_)
                | StreamError::DuplicateConnection(_)
                | StreamError::CapacityExceeded { .. }
                | StreamError::TransportAbort { .. }
        )
    }

    /// Maps the error to an HTTP status code for the request surface.
    pub fn http_status(&self) -> u16 {
        match self {
            StreamError::InvalidRequest(_) | StreamError::UnknownProvider { .. } => 400,
            StreamError::UnknownTopic { .. }
            | StreamError::ConnectionNotFound(_)
            | StreamError::ImageNotFound(_) => 404,
            StreamError::DuplicateConnection(_) | StreamError::InvalidTransition { .. } => 409,
            StreamError::TransportAbort { .. } => 499,
            StreamError::CapacityExceeded { .. } => 503,
            _ => 500,
        }
    }

    /// Stable machine-readable code, carried in error frames and JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::UnknownTopic { .. } => "UNKNOWN_TOPIC",
            StreamError::InvalidRequest(_) => "INVALID_REQUEST",
            StreamError::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            StreamError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            StreamError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            StreamError::TransportAbort { .. } => "TRANSPORT_ABORT",
            StreamError::CardGenerationFailure { .. } => "CARD_GENERATION_FAILURE",
            StreamError::ImageGenerationFailure { .. } => "IMAGE_GENERATION_FAILURE",
            StreamError::ImageCancelled { .. } => "IMAGE_CANCELLED",
            StreamError::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            StreamError::UnknownProvider { .. } => "UNKNOWN_PROVIDER",
            StreamError::InvalidTransition { .. } => "INVALID_TRANSITION",
            StreamError::Frame(_) => "FRAME_ERROR",
            StreamError::Io(_) | StreamError::Json(_) | StreamError::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// A convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identity of one card within a session. Minted at skeleton time and
/// used as the join key between stream frames and image status polling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    /// Mint a fresh, globally unique card id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier of one streaming connection (one session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("client_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Stage: the wire-level stage carried by every frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Skeleton,
    Content,
    Image,
    Error,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Skeleton => "skeleton",
            Stage::Content => "content",
            Stage::Image => "image",
            Stage::Error => "error",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Layout: the six adaptive card layouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    Split,
    NumberedList,
    Grid,
    Hero,
    HeroOverlay,
    ContentBullets,
}

impl Layout {
    pub const ALL: [Layout; 6] = [
        Layout::Split,
        Layout::NumberedList,
        Layout::Grid,
        Layout::Hero,
        Layout::HeroOverlay,
        Layout::ContentBullets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::Split => "split",
            Layout::NumberedList => "numbered-list",
            Layout::Grid => "grid",
            Layout::Hero => "hero",
            Layout::HeroOverlay => "hero-overlay",
            Layout::ContentBullets => "content-bullets",
        }
    }

    /// Hero layouts use a wide image, everything else a 4:3 one.
    pub fn aspect_ratio(&self) -> &'static str {
        match self {
            Layout::Hero | Layout::HeroOverlay => "16:9",
            _ => "4:3",
        }
    }
}

// ---------------------------------------------------------------------------
// Card model
// ---------------------------------------------------------------------------

/// Card shell announced in the skeleton frame: identity plus layout metadata,
/// no content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardSkeleton {
    pub id: CardId,
    #[serde(rename = "type")]
    pub card_type: String,
    pub layout: Layout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Pending,
    Ready,
    Failed,
}

impl ContentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContentStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    None,
    Generating,
    Completed,
    Failed,
    Cancelled,
}

impl ImageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ImageStatus::Generating)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::None => "none",
            ImageStatus::Generating => "generating",
            ImageStatus::Completed => "completed",
            ImageStatus::Failed => "failed",
            ImageStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-card progress, owned by the streaming service. Both statuses only move
/// forward: once terminal they never change again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardGenerationState {
    pub id: CardId,
    pub content: ContentStatus,
    pub image: ImageStatus,
}

impl CardGenerationState {
    pub fn new(id: CardId, wants_image: bool) -> Self {
        Self {
            id,
            content: ContentStatus::Pending,
            image: if wants_image {
                ImageStatus::Generating
            } else {
                ImageStatus::None
            },
        }
    }

    pub fn set_content(&mut self, next: ContentStatus) -> Result<()> {
        if self.content.is_terminal() || next == ContentStatus::Pending {
            return Err(StreamError::InvalidTransition {
                from: format!("content {:?}", self.content),
                event: format!("{next:?} for card {}", self.id),
            });
        }
        self.content = next;
        Ok(())
    }

    pub fn set_image(&mut self, next: ImageStatus) -> Result<()> {
        if self.image != ImageStatus::Generating || next == ImageStatus::Generating {
            return Err(StreamError::InvalidTransition {
                from: format!("image {:?}", self.image),
                event: format!("{next:?} for card {}", self.id),
            });
        }
        self.image = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.content.is_terminal() && self.image.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Which backend produced the asset (`placeholder` for synthesized fallbacks).
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub url: String,
    pub metadata: ImageMetadata,
}

// ---------------------------------------------------------------------------
// GenerationRequest: request surface of the streaming service
// ---------------------------------------------------------------------------

fn default_card_count() -> usize {
    6
}

fn default_style() -> String {
    "professional".to_string()
}

fn default_image_provider() -> String {
    "placeholder".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default = "default_card_count")]
    pub card_count: usize,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default)]
    pub include_images: bool,
    #[serde(default = "default_image_provider", alias = "provider")]
    pub image_provider: String,
    /// Artificial pacing hint in milliseconds (demo/test only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layouts: Option<Vec<Layout>>,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, card_count: usize) -> Self {
        Self {
            topic: topic.into(),
            card_count,
            style: default_style(),
            include_images: false,
            image_provider: default_image_provider(),
            stream_delay: None,
            layouts: None,
        }
    }

    pub fn with_images(mut self, provider: impl Into<String>) -> Self {
        self.include_images = true;
        self.image_provider = provider.into();
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.stream_delay = Some(delay_ms);
        self
    }

    /// Shape validation only; topic resolution belongs to the content catalog.
    pub fn validate(&self, max_card_count: usize) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(StreamError::InvalidRequest(
                "Field \"topic\" is required".into(),
            ));
        }
        if self.card_count == 0 || self.card_count > max_card_count {
            return Err(StreamError::InvalidRequest(format!(
                "Field \"cardCount\" must be between 1 and {max_card_count}"
            )));
        }
        if self.include_images && self.image_provider.trim().is_empty() {
            return Err(StreamError::InvalidRequest(
                "Field \"imageProvider\" must not be empty when images are requested".into(),
            ));
        }
        Ok(())
    }
}
