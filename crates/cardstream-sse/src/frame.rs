//! Frame model and formatter.
//!
//! A [`Frame`] is one logical stream event. [`format_frame`] turns it into the
//! exact bytes written to the transport: `data: {"stage":...}\n\n`. JSON
//! serialization escapes embedded newlines, so the blank-line delimiter is
//! never ambiguous.

use serde::{Deserialize, Serialize};

use cardstream_types::{CardId, CardSkeleton, ConnectionId, ImageAsset, Stage, StreamError};

/// Errors produced while formatting or parsing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to serialize frame: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("frame data is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

impl From<FrameError> for StreamError {
    fn from(err: FrameError) -> Self {
        StreamError::Frame(err.to_string())
    }
}

/// One stream event, tagged on the wire by its `stage` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of every session: one shell per card, no content.
    Skeleton {
        cards: Vec<CardSkeleton>,
        #[serde(rename = "cardCount")]
        card_count: usize,
        #[serde(
            rename = "connectionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        connection_id: Option<ConnectionId>,
    },
    Content {
        #[serde(rename = "cardId")]
        card_id: CardId,
        content: serde_json::Value,
    },
    Image {
        #[serde(rename = "cardId")]
        card_id: CardId,
        image: ImageAsset,
    },
    /// Card-scoped when `card_id` is set, session-scoped otherwise.
    Error {
        #[serde(rename = "cardId", default, skip_serializing_if = "Option::is_none")]
        card_id: Option<CardId>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Done,
}

impl Frame {
    pub fn skeleton(cards: Vec<CardSkeleton>, connection_id: Option<ConnectionId>) -> Self {
        let card_count = cards.len();
        Frame::Skeleton {
            cards,
            card_count,
            connection_id,
        }
    }

    pub fn card_error(card_id: CardId, err: &StreamError) -> Self {
        Frame::Error {
            card_id: Some(card_id),
            error: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Frame::Skeleton { .. } => Stage::Skeleton,
            Frame::Content { .. } => Stage::Content,
            Frame::Image { .. } => Stage::Image,
            Frame::Error { .. } => Stage::Error,
            Frame::Done => Stage::Done,
        }
    }

    /// The card this frame refers to; `None` for session-level frames.
    pub fn card_id(&self) -> Option<&CardId> {
        match self {
            Frame::Content { card_id, .. } | Frame::Image { card_id, .. } => Some(card_id),
            Frame::Error { card_id, .. } => card_id.as_ref(),
            Frame::Skeleton { .. } | Frame::Done => None,
        }
    }
}

/// Serialize one frame into its SSE wire form.
pub fn format_frame(frame: &Frame) -> Result<String, FrameError> {
    let json = serde_json::to_string(frame).map_err(FrameError::Serialize)?;
    Ok(format!("data: {json}\n\n"))
}

/// Keep-alive comment frame. Conformant clients ignore it.
pub fn format_heartbeat() -> &'static str {
    ": heartbeat\n\n"
}

/// Check the framing contract: blank-line terminated with a `data:` line.
pub fn is_valid_frame(message: &str) -> bool {
    message.ends_with("\n\n") && message.lines().any(|line| line.starts_with("data:"))
}
