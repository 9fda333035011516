use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use record_bus::{
    Rational,
    capability::{AudioSettings, VideoSettings},
    pipeline::PipelineConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: usize,
    pub keyframe_interval: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        let settings = VideoSettings::default();
        Self {
            codec: settings.codec,
            width: settings.width,
            height: settings.height,
            frame_rate: settings.frame_rate.0 as u32,
            bit_rate: settings.bit_rate,
            keyframe_interval: settings.keyframe_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let settings = AudioSettings::default();
        Self {
            codec: settings.codec,
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            bit_rate: settings.bit_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub listen: String,
    pub output_dir: PathBuf,
    pub display: String,
    pub audio_device: String,
    pub audio_enabled: bool,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub poll_interval_ms: u64,
    pub drain_grace_ms: u64,
    pub ready_wait_ms: u64,
    pub queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            output_dir: PathBuf::from("recordings"),
            display: ":0.0".to_string(),
            audio_device: "default".to_string(),
            audio_enabled: true,
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            poll_interval_ms: 10,
            drain_grace_ms: 500,
            ready_wait_ms: 100,
            queue_capacity: 128,
        }
    }
}

impl RecorderConfig {
    /// Reads the JSON config at `path`; missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parse config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            video: VideoSettings {
                codec: self.video.codec.clone(),
                width: self.video.width,
                height: self.video.height,
                frame_rate: Rational(self.video.frame_rate as i32, 1),
                bit_rate: self.video.bit_rate,
                keyframe_interval: self.video.keyframe_interval,
            },
            audio: AudioSettings {
                codec: self.audio.codec.clone(),
                sample_rate: self.audio.sample_rate,
                channels: self.audio.channels,
                bit_rate: self.audio.bit_rate,
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            ready_wait: Duration::from_millis(self.ready_wait_ms),
        }
    }
}

static CONFIG: OnceLock<RecorderConfig> = OnceLock::new();

/// Installs the process-wide config. Only the first call has an effect.
pub fn init(config: RecorderConfig) {
    if CONFIG.set(config).is_err() {
        log::warn!("config already initialised, ignoring");
    }
}

pub fn config() -> &'static RecorderConfig {
    CONFIG.get_or_init(RecorderConfig::default)
}
