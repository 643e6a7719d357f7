//! Server-sent event decoding: bytes to blocks, blocks to frames, frames to events.

pub mod decoder;
pub mod event;
pub mod frame;

pub use decoder::FrameDecoder;
pub use event::{parse_event, FinalAnswer, StreamEvent};
pub use frame::Frame;
