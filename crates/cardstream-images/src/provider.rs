use async_trait::async_trait;

use cardstream_types::{CardId, ImageAsset, Layout};

/// What a provider is asked to draw for one card.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub card_id: CardId,
    pub prompt: String,
    pub aspect_ratio: String,
    pub style: String,
}

impl ImageRequest {
    pub fn new(card_id: CardId, prompt: impl Into<String>) -> Self {
        Self {
            card_id,
            prompt: prompt.into(),
            aspect_ratio: "16:9".into(),
            style: "professional".into(),
        }
    }

    pub fn for_layout(mut self, layout: Layout) -> Self {
        self.aspect_ratio = layout.aspect_ratio().to_string();
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }
}

// ---------------------------------------------------------------------------
// ImageProvider
// ---------------------------------------------------------------------------

/// A backend able to produce an image for a card. Failures should be reported
/// as [`cardstream_types::StreamError::ImageGenerationFailure`] so the service
/// can retry them and fall through to the next provider in the chain.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &ImageRequest) -> cardstream_types::Result<ImageAsset>;
}
