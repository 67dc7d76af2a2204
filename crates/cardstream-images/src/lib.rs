//! Image generation for Cardstream cards.
//!
//! - [`ImageStatusTracker`]: per-card job status, pollable and awaitable
//! - [`ImageProvider`]: the backend seam, with [`PlaceholderProvider`] built in
//! - [`ImageGenerationService`]: background jobs over a provider fallback chain

pub mod placeholder;
pub mod provider;
pub mod retry;
pub mod service;
pub mod tracker;

pub use placeholder::PlaceholderProvider;
pub use provider::{ImageProvider, ImageRequest};
pub use retry::{execute_with_retry, provider_failure, BackoffPolicy};
pub use service::{ImageGenerationService, ImageServiceConfig};
pub use tracker::{Generation, ImageJobStatus, ImageStatusTracker, TrackerStats};
