//! Cardstream streaming engine.
//!
//! A [`StreamingService`] turns a [`cardstream_types::GenerationRequest`] into
//! a stream of SSE frames: one skeleton, then per-card content and image
//! frames as they complete, then `done`. Live sessions are tracked in a
//! [`ConnectionStore`] owned by the service.

pub mod catalog;
pub mod config;
pub mod events;
pub mod service;
pub mod session;
pub mod store;

pub use catalog::{ContentSource, PlannedCard, StaticCatalog};
pub use config::StreamingConfig;
pub use events::{EventEmitter, StreamEvent};
pub use service::{AbortReason, ServiceStats, SessionStream, StreamingService};
pub use session::{CardBoard, SessionEvent, SessionState};
pub use store::{ConnectionHandle, ConnectionInfo, ConnectionStore, FrameSink, StoreStats};
