//! Server-Sent Events wire format for Cardstream sessions.
//!
//! Every frame is a single `data: <compact json>` line followed by a blank
//! line. This crate owns both directions of that contract: the formatter used
//! by the streaming service, and the incremental decoder plus transcript
//! checker used by clients and tests.

pub mod decode;
pub mod frame;
pub mod transcript;

pub use decode::{parse_block, FrameDecoder};
pub use frame::{format_frame, format_heartbeat, is_valid_frame, Frame, FrameError};
pub use transcript::{TranscriptChecker, TranscriptReport, Violation};
