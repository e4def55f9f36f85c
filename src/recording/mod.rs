//! PreEventRingBuffer + Recorder (C8, spec §4.8).

pub mod recorder;
pub mod ring_buffer;

pub use recorder::{Recorder, RecorderConfig, VideoWriter};
pub use ring_buffer::PreEventRingBuffer;
