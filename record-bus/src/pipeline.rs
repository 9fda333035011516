//! Recording pipeline: builds the encoders, the multiplexer and the capture
//! sources for one session, and tears them down in a fixed order.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::{DEFAULT_DRAIN_GRACE, DEFAULT_POLL_INTERVAL, DrainStats, EncoderAdapter, StopSignal},
    backend::MediaBackend,
    capability::{AudioSettings, EncoderCapability, EncoderSettings, VideoSettings},
    capture::{AudioFeed, AudioTarget, CaptureSession, CaptureTarget, RawAudioSource, SessionClock},
    error::{RecordError, RecordResult},
    muxer::{DEFAULT_READY_WAIT, Muxer, MuxerState, MuxerStats},
    stream::{Track, TrackRole},
};

const EVENT_CHAN_CAP: usize = 16;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub poll_interval: Duration,
    /// Bound on each adapter's draining after stop.
    pub drain_grace: Duration,
    pub ready_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
            ready_wait: DEFAULT_READY_WAIT,
        }
    }
}

/// Permission to capture, handed over once per recording.
pub struct CaptureGrant {
    target: CaptureTarget,
    audio: Option<AudioTarget>,
    revoked: CancellationToken,
}

impl CaptureGrant {
    pub fn new(target: CaptureTarget) -> Self {
        Self {
            target,
            audio: None,
            revoked: CancellationToken::new(),
        }
    }

    /// Also permits recording from the given audio source.
    pub fn with_audio(mut self, audio: AudioTarget) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.target
    }

    pub fn audio(&self) -> Option<&AudioTarget> {
        self.audio.as_ref()
    }

    pub fn revoker(&self) -> GrantRevoker {
        GrantRevoker(self.revoked.clone())
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }
}

#[derive(Clone)]
pub struct GrantRevoker(CancellationToken);

impl GrantRevoker {
    pub fn revoke(&self) {
        self.0.cancel();
    }

    pub fn is_revoked(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn revoked(&self) {
        self.0.cancelled().await
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    TrackReady(Track),
    Stopped(SessionReport),
}

/// What a finished recording produced.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub path: PathBuf,
    /// Whether the container header was ever written.
    pub container_started: bool,
    pub tracks: Vec<Track>,
    pub video: Option<DrainStats>,
    pub audio: Option<DrainStats>,
    pub muxer: MuxerStats,
    pub release_errors: Vec<String>,
}

impl SessionReport {
    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.role() == TrackRole::Audio)
    }
}

enum Worker {
    Idle(EncoderAdapter),
    Running {
        signal: StopSignal,
        handle: JoinHandle<EncoderAdapter>,
    },
}

impl Worker {
    fn stop(&self) {
        match self {
            Worker::Idle(adapter) => adapter.stop(),
            Worker::Running { signal, .. } => signal.stop(),
        }
    }

    fn spawn(self, muxer: &Arc<Muxer>) -> RecordResult<Worker> {
        match self {
            Worker::Idle(adapter) => {
                let signal = adapter.stop_signal();
                let handle = adapter.spawn(muxer.clone())?;
                Ok(Worker::Running { signal, handle })
            }
            running => Ok(running),
        }
    }

    fn join(self) -> Option<EncoderAdapter> {
        match self {
            Worker::Idle(adapter) => Some(adapter),
            Worker::Running { signal, handle } => match handle.join() {
                Ok(adapter) => Some(adapter),
                Err(_) => {
                    log::error!("{} drain thread panicked", signal.role());
                    None
                }
            },
        }
    }
}

pub struct Pipeline {
    backend: Arc<dyn MediaBackend>,
    config: PipelineConfig,
    events: broadcast::Sender<PipelineEvent>,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn MediaBackend>, config: PipelineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHAN_CAP);
        Self {
            backend,
            config,
            events,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Starts a recording into `output`. The video track is mandatory; audio
    /// is attempted when requested and permitted, and the recording goes on
    /// with video only if it cannot be set up.
    pub fn start(
        &self,
        grant: CaptureGrant,
        audio_requested: bool,
        output: &Path,
    ) -> RecordResult<Recording> {
        if grant.is_revoked() {
            return Err(RecordError::GrantRevoked);
        }
        let mut recording = Recording {
            path: output.to_path_buf(),
            muxer: None,
            capture: None,
            audio_source: None,
            audio_feed: None,
            video: None,
            audio: None,
            revoker: grant.revoker(),
            events: self.events.clone(),
            finished: false,
        };
        match self.launch(&mut recording, &grant, audio_requested) {
            Ok(()) => {
                log::info!(
                    "recording started: {} ({})",
                    recording.path.display(),
                    if recording.audio.is_some() {
                        "video + audio"
                    } else {
                        "video only"
                    }
                );
                Ok(recording)
            }
            Err(e) => {
                log::error!("recording failed to start: {}", e);
                recording.shutdown();
                Err(e)
            }
        }
    }

    fn adapter(&self, capability: Box<dyn EncoderCapability>) -> EncoderAdapter {
        let events = self.events.clone();
        EncoderAdapter::new(capability)
            .with_poll_interval(self.config.poll_interval)
            .with_drain_grace(self.config.drain_grace)
            .with_track_ready_listener(Arc::new(move |track| {
                let _ = events.send(PipelineEvent::TrackReady(track));
            }))
    }

    fn launch(
        &self,
        recording: &mut Recording,
        grant: &CaptureGrant,
        audio_requested: bool,
    ) -> RecordResult<()> {
        let clock = SessionClock::start();

        let mut video = self.adapter(
            self.backend
                .video_encoder()
                .map_err(|e| RecordError::configuration(TrackRole::Video, e))?,
        );
        video.configure(&EncoderSettings::Video(self.config.video.clone()))?;
        recording.video = Some(Worker::Idle(video));

        if audio_requested {
            match grant.audio() {
                Some(target) => {
                    if let Err(e) = self.prepare_audio(recording, target, clock) {
                        log::warn!("audio unavailable, recording video only: {}", e);
                    }
                }
                None => log::info!("audio capture not permitted, recording video only"),
            }
        }

        // decided before any sample can flow
        let expected = if recording.audio.is_some() { 2 } else { 1 };
        let writer = self
            .backend
            .open_container(&recording.path)
            .map_err(RecordError::Container)?;
        let muxer = Arc::new(Muxer::new(writer, expected)?.with_ready_wait(self.config.ready_wait));
        recording.muxer = Some(muxer.clone());

        let Some(Worker::Idle(video)) = recording.video.as_mut() else {
            return Err(RecordError::capability(
                TrackRole::Video,
                anyhow::anyhow!("video encoder is not configured"),
            ));
        };
        let surface = video.start()?;
        let capture = self
            .backend
            .attach_capture(grant.target(), &self.config.video, surface, clock)
            .map_err(|e| RecordError::capability(TrackRole::Video, e))?;
        recording.capture = Some(capture);

        if let Some(Worker::Idle(adapter)) = recording.audio.as_mut() {
            match adapter.start() {
                Ok(input) => {
                    if let Some(source) = recording.audio_source.take() {
                        recording.audio_feed = Some(AudioFeed::spawn(source, input)?);
                    }
                }
                Err(e) => {
                    log::warn!("audio encoder failed to start, recording video only: {}", e);
                    recording.audio = None;
                    muxer.withdraw(TrackRole::Audio)?;
                }
            }
        }

        if let Some(worker) = recording.video.take() {
            recording.video = Some(worker.spawn(&muxer)?);
        }
        if let Some(worker) = recording.audio.take() {
            recording.audio = Some(worker.spawn(&muxer)?);
        }
        Ok(())
    }

    fn prepare_audio(
        &self,
        recording: &mut Recording,
        target: &AudioTarget,
        clock: SessionClock,
    ) -> RecordResult<()> {
        let source = self
            .backend
            .open_audio_source(target, &self.config.audio, clock)
            .map_err(|e| RecordError::capability(TrackRole::Audio, e))?;
        recording.audio_source = Some(source);

        let mut adapter = self.adapter(
            self.backend
                .audio_encoder()
                .map_err(|e| RecordError::configuration(TrackRole::Audio, e))?,
        );
        adapter.configure(&EncoderSettings::Audio(self.config.audio.clone()))?;
        recording.audio = Some(Worker::Idle(adapter));
        Ok(())
    }
}

/// A running recording. Dropping it without calling [`Recording::stop`]
/// tears it down on the dropping thread.
pub struct Recording {
    path: PathBuf,
    muxer: Option<Arc<Muxer>>,
    capture: Option<Box<dyn CaptureSession>>,
    audio_source: Option<Box<dyn RawAudioSource>>,
    audio_feed: Option<AudioFeed>,
    video: Option<Worker>,
    audio: Option<Worker>,
    revoker: GrantRevoker,
    events: broadcast::Sender<PipelineEvent>,
    finished: bool,
}

impl Recording {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn muxer_state(&self) -> MuxerState {
        self.muxer
            .as_ref()
            .map(|m| m.state())
            .unwrap_or(MuxerState::Stopped)
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.muxer.as_ref().map(|m| m.tracks()).unwrap_or_default()
    }

    pub fn revoker(&self) -> GrantRevoker {
        self.revoker.clone()
    }

    /// Requests the ordered shutdown on a background thread and returns at once.
    pub fn stop(self) -> RecordResult<StopHandle> {
        let mut recording = self;
        let name = "recording-stop".to_string();
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || recording.shutdown())
            .map(|handle| StopHandle { handle })
            .map_err(|source| RecordError::Spawn { name, source })
    }

    /// Stops every producer, waits for the drain threads, then releases
    /// capture, video encoder, audio source, audio encoder and container in
    /// that order. Each step runs even when an earlier one failed.
    fn shutdown(&mut self) -> SessionReport {
        if self.finished {
            return SessionReport {
                path: self.path.clone(),
                ..SessionReport::default()
            };
        }
        self.finished = true;
        log::info!("stopping recording: {}", self.path.display());

        for worker in [&self.video, &self.audio].into_iter().flatten() {
            worker.stop();
        }
        if let Some(feed) = &self.audio_feed {
            feed.stop();
        }

        if let Some(mut feed) = self.audio_feed.take() {
            if let Some(source) = feed.join() {
                self.audio_source = Some(source);
            }
        }
        let video = self.video.take().and_then(Worker::join);
        let audio = self.audio.take().and_then(Worker::join);

        let mut report = SessionReport {
            path: self.path.clone(),
            video: video.as_ref().map(|a| a.stats()),
            audio: audio.as_ref().map(|a| a.stats()),
            ..SessionReport::default()
        };
        let mut failed = |e: RecordError| {
            log::error!("{}", e);
            report.release_errors.push(e.to_string());
        };

        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.detach() {
                failed(RecordError::release("capture target", e));
            }
        }
        if let Some(mut adapter) = video {
            if let Err(e) = adapter.release() {
                failed(e);
            }
        }
        if let Some(mut source) = self.audio_source.take() {
            if let Err(e) = source.release() {
                failed(RecordError::release("audio source", e));
            }
        }
        if let Some(mut adapter) = audio {
            if let Err(e) = adapter.release() {
                failed(e);
            }
        }
        if let Some(muxer) = self.muxer.take() {
            let started = muxer.state() == MuxerState::Started;
            if let Err(e) = muxer.finalize() {
                failed(e);
            }
            report.container_started = started;
            report.tracks = muxer.tracks();
            report.muxer = muxer.stats();
        }

        log::info!(
            "recording stopped: {} ({} sample(s) written, {} dropped)",
            report.path.display(),
            report.muxer.written,
            report.muxer.dropped
        );
        let _ = self.events.send(PipelineEvent::Stopped(report.clone()));
        report
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        if !self.finished {
            self.shutdown();
        }
    }
}

/// Completion of an asynchronous stop.
pub struct StopHandle {
    handle: JoinHandle<SessionReport>,
}

impl StopHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until teardown completed.
    pub fn wait(self) -> SessionReport {
        match self.handle.join() {
            Ok(report) => report,
            Err(_) => {
                log::error!("recording stop thread panicked");
                SessionReport::default()
            }
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
