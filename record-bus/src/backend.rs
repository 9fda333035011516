use std::path::Path;

use crate::{
    capability::{AudioSettings, EncoderCapability, VideoSettings},
    capture::{
        AudioTarget, CaptureSession, CaptureTarget, PulseAudioSource, RawAudioSource,
        ScreenCapture, SessionClock,
    },
    device,
    encoder::{FRAME_QUEUE_BOUND, FfmpegEncoder},
    frame::EncoderInput,
    muxer::ContainerWriter,
    output::AvOutput,
};

/// Creates the platform collaborators a recording needs.
pub trait MediaBackend: Send + Sync {
    fn open_container(&self, path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>>;

    fn video_encoder(&self) -> anyhow::Result<Box<dyn EncoderCapability>>;

    fn audio_encoder(&self) -> anyhow::Result<Box<dyn EncoderCapability>>;

    /// Binds the capture source to a surface-fed encoder's input.
    fn attach_capture(
        &self,
        target: &CaptureTarget,
        settings: &VideoSettings,
        surface: EncoderInput,
        clock: SessionClock,
    ) -> anyhow::Result<Box<dyn CaptureSession>>;

    fn open_audio_source(
        &self,
        target: &AudioTarget,
        settings: &AudioSettings,
        clock: SessionClock,
    ) -> anyhow::Result<Box<dyn RawAudioSource>>;
}

/// x11grab + PulseAudio capture, libavcodec encoders and an MP4 container.
pub struct FfmpegBackend {
    queue_capacity: usize,
}

impl FfmpegBackend {
    pub fn new() -> Self {
        Self {
            queue_capacity: FRAME_QUEUE_BOUND,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_container(&self, path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(AvOutput::new(path)?))
    }

    fn video_encoder(&self) -> anyhow::Result<Box<dyn EncoderCapability>> {
        Ok(Box::new(
            FfmpegEncoder::video().with_queue_capacity(self.queue_capacity),
        ))
    }

    fn audio_encoder(&self) -> anyhow::Result<Box<dyn EncoderCapability>> {
        Ok(Box::new(
            FfmpegEncoder::audio().with_queue_capacity(self.queue_capacity),
        ))
    }

    fn attach_capture(
        &self,
        target: &CaptureTarget,
        settings: &VideoSettings,
        surface: EncoderInput,
        clock: SessionClock,
    ) -> anyhow::Result<Box<dyn CaptureSession>> {
        if !device::screen_capture_available() {
            anyhow::bail!("{} input device is not available", device::SCREEN_FORMAT);
        }
        Ok(Box::new(ScreenCapture::attach(
            target, settings, surface, clock,
        )?))
    }

    fn open_audio_source(
        &self,
        target: &AudioTarget,
        settings: &AudioSettings,
        clock: SessionClock,
    ) -> anyhow::Result<Box<dyn RawAudioSource>> {
        if !device::audio_capture_available() {
            anyhow::bail!("{} input device is not available", device::AUDIO_FORMAT);
        }
        Ok(Box::new(PulseAudioSource::open(target, settings, clock)?))
    }
}
