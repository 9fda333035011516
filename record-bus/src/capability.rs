use std::time::Duration;

use ffmpeg_next::Rational;

use crate::{
    frame::EncoderInput,
    sample::Sample,
    stream::{StreamDescriptor, TrackRole},
};

/// How raw input reaches an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// A capture source pushes frames into a bound target; severing the
    /// target ends the stream.
    Surface,
    /// A feed thread pulls buffers from a source and queues them; end of
    /// stream has to be signalled explicitly.
    Buffer,
}

/// What one poll of an encoder's output queue produced.
#[derive(Debug)]
pub enum DrainEvent {
    FormatChanged(StreamDescriptor),
    Output(Sample),
    TryAgainLater,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoSettings {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    /// bps
    pub bit_rate: usize,
    /// Seconds between key frames.
    pub keyframe_interval: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            width: 1280,
            height: 720,
            frame_rate: Rational(30, 1),
            bit_rate: 8 * 1024 * 1024,
            keyframe_interval: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSettings {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// bps
    pub bit_rate: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: "aac".to_string(),
            sample_rate: 44_100,
            channels: 2,
            bit_rate: 192_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderSettings {
    Video(VideoSettings),
    Audio(AudioSettings),
}

impl EncoderSettings {
    pub fn role(&self) -> TrackRole {
        match self {
            EncoderSettings::Video(_) => TrackRole::Video,
            EncoderSettings::Audio(_) => TrackRole::Audio,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            EncoderSettings::Video(v) => {
                if v.width == 0 || v.height == 0 || v.width % 2 != 0 || v.height % 2 != 0 {
                    anyhow::bail!("invalid video size {}x{}", v.width, v.height);
                }
                if v.frame_rate.0 <= 0 || v.frame_rate.1 <= 0 {
                    anyhow::bail!("invalid frame rate {}/{}", v.frame_rate.0, v.frame_rate.1);
                }
                if v.bit_rate == 0 {
                    anyhow::bail!("video bit rate must be positive");
                }
            }
            EncoderSettings::Audio(a) => {
                if a.sample_rate == 0 {
                    anyhow::bail!("audio sample rate must be positive");
                }
                if !(1..=2).contains(&a.channels) {
                    anyhow::bail!("unsupported channel count {}", a.channels);
                }
                if a.bit_rate == 0 {
                    anyhow::bail!("audio bit rate must be positive");
                }
            }
        }
        Ok(())
    }
}

/// An opaque encoder: configure, start, drain, release.
///
/// Input is fed through the [`EncoderInput`] returned by `start`; the
/// capability consumes it while it is being drained, so every operation
/// runs on the drain thread.
pub trait EncoderCapability: Send {
    fn role(&self) -> TrackRole;

    fn feed_mode(&self) -> FeedMode;

    fn configure(&mut self, settings: &EncoderSettings) -> anyhow::Result<()>;

    fn start(&mut self) -> anyhow::Result<EncoderInput>;

    /// Polls the output queue for at most `timeout`.
    fn dequeue_output(&mut self, timeout: Duration) -> anyhow::Result<DrainEvent>;

    /// Stops the encoder and frees it. Must tolerate repeated calls.
    fn release(&mut self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(
            EncoderSettings::Video(VideoSettings::default())
                .validate()
                .is_ok()
        );
        assert!(
            EncoderSettings::Audio(AudioSettings::default())
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_odd_video_size_is_rejected() {
        let settings = EncoderSettings::Video(VideoSettings {
            width: 1279,
            ..VideoSettings::default()
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_surround_audio_is_rejected() {
        let settings = EncoderSettings::Audio(AudioSettings {
            channels: 6,
            ..AudioSettings::default()
        });
        assert!(settings.validate().is_err());
        assert_eq!(settings.role(), TrackRole::Audio);
    }
}
