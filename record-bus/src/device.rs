use std::fmt::{Display, Formatter};

/// Screen grab input format.
pub const SCREEN_FORMAT: &str = "x11grab";
/// Microphone input format.
pub const AUDIO_FORMAT: &str = "pulse";

/// A libavdevice input format (x11grab, pulse, alsa, ...).
pub struct CaptureDevice {
    inner: ffmpeg_next::Format,
}

impl CaptureDevice {
    fn new(inner: ffmpeg_next::Format) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn description(&self) -> &str {
        self.inner.description()
    }
}

impl Display for CaptureDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "name: {}, description: {}", self.name(), self.description())
    }
}

pub fn input_video_list() -> Vec<CaptureDevice> {
    ffmpeg_next::device::input::video()
        .map(CaptureDevice::new)
        .collect()
}

pub fn input_audio_list() -> Vec<CaptureDevice> {
    ffmpeg_next::device::input::audio()
        .map(CaptureDevice::new)
        .collect()
}

/// Whether this FFmpeg build can grab the screen.
pub fn screen_capture_available() -> bool {
    input_video_list().iter().any(|d| d.name() == SCREEN_FORMAT)
}

/// Whether this FFmpeg build can record from the microphone.
pub fn audio_capture_available() -> bool {
    input_audio_list().iter().any(|d| d.name() == AUDIO_FORMAT)
}
