//! Screen and microphone recording into a single MP4.
//!
//! Two [`adapter::EncoderAdapter`]s drain their encoders on dedicated threads
//! into a shared [`muxer::Muxer`], which opens the container only once every
//! expected track has registered. [`pipeline::Pipeline`] wires the encoders to
//! the capture sources and owns the ordered teardown.

/// Registers FFmpeg components (format, device, etc.). Call once at startup
/// before using device inputs like x11grab or pulse.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod adapter;
pub mod backend;
pub mod capability;
pub mod capture;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod hw;
pub mod input;
pub mod muxer;
pub mod output;
pub mod pipeline;
pub mod sample;
pub mod scaler;
pub mod stream;

#[cfg(test)]
mod mock;

pub use error::{RecordError, RecordResult};
pub use ffmpeg_next::Rational;
