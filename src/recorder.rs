use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use record_bus::{
    backend::{FfmpegBackend, MediaBackend},
    capture::{AudioTarget, CaptureTarget},
    device,
    pipeline::{CaptureGrant, GrantRevoker, Pipeline, Recording, SessionReport},
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{config::RecorderConfig, storage::Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Prepared,
    Recording,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub container_started: bool,
    pub tracks: Vec<String>,
    pub written: u64,
    pub dropped: u64,
    pub release_errors: Vec<String>,
}

impl From<&SessionReport> for SessionSummary {
    fn from(report: &SessionReport) -> Self {
        Self {
            path: report.path.clone(),
            container_started: report.container_started,
            tracks: report.tracks.iter().map(|t| t.to_string()).collect(),
            written: report.muxer.written,
            dropped: report.muxer.dropped,
            release_errors: report.release_errors.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub state: RecorderState,
    pub audio_permitted: bool,
    pub current: Option<PathBuf>,
    pub last_session: Option<SessionSummary>,
}

struct Active {
    recording: Recording,
    /// Stops the revocation watcher once the recording ends normally.
    watcher: CancellationToken,
}

#[derive(Default)]
struct Inner {
    grant: Option<CaptureGrant>,
    active: Option<Active>,
    stopping: bool,
    last_session: Option<SessionSummary>,
}

/// Owns the capture grant and at most one running recording.
pub struct RecorderService {
    pipeline: Arc<Pipeline>,
    storage: Storage,
    display: String,
    audio_device: String,
    audio_enabled: bool,
    inner: Mutex<Inner>,
}

static RECORDER: LazyLock<Arc<RecorderService>> = LazyLock::new(|| {
    let config = crate::config::config();
    let backend = FfmpegBackend::new().with_queue_capacity(config.queue_capacity);
    RecorderService::new(config, Arc::new(backend))
});

pub(crate) fn get_recorder() -> &'static Arc<RecorderService> {
    &RECORDER
}

impl RecorderService {
    pub fn new(config: &RecorderConfig, backend: Arc<dyn MediaBackend>) -> Arc<Self> {
        Arc::new(Self {
            pipeline: Arc::new(Pipeline::new(backend, config.pipeline_config())),
            storage: Storage::new(&config.output_dir),
            display: config.display.clone(),
            audio_device: config.audio_device.clone(),
            audio_enabled: config.audio_enabled,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Issues a fresh capture grant, replacing any unused one. Audio is
    /// permitted when enabled and the audio input device exists.
    pub async fn prepare(&self) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.active.is_some() {
            anyhow::bail!("a recording is in progress");
        }
        if let Some(old) = inner.grant.take() {
            old.revoker().revoke();
        }
        let mut grant = CaptureGrant::new(CaptureTarget::new(self.display.clone()));
        let audio_permitted = self.audio_enabled && device::audio_capture_available();
        if audio_permitted {
            grant = grant.with_audio(AudioTarget {
                device: self.audio_device.clone(),
            });
        }
        inner.grant = Some(grant);
        log::info!("capture grant issued (audio permitted: {})", audio_permitted);
        Ok(audio_permitted)
    }

    /// Starts recording with the prepared grant, consuming it.
    pub async fn begin(self: &Arc<Self>) -> anyhow::Result<PathBuf> {
        let mut inner = self.inner.lock().await;
        if inner.active.is_some() {
            anyhow::bail!("already recording");
        }
        if inner.stopping {
            anyhow::bail!("previous recording is still stopping");
        }
        let grant = inner
            .grant
            .take()
            .ok_or_else(|| anyhow::anyhow!("no capture grant, prepare first"))?;
        let path = self.storage.next_path(chrono::Local::now())?;

        let pipeline = self.pipeline.clone();
        let audio = self.audio_enabled;
        let output = path.clone();
        let recording =
            tokio::task::spawn_blocking(move || pipeline.start(grant, audio, &output)).await??;

        let watcher = CancellationToken::new();
        self.watch_revocation(recording.revoker(), watcher.clone());
        inner.active = Some(Active { recording, watcher });
        Ok(path)
    }

    fn watch_revocation(self: &Arc<Self>, revoker: GrantRevoker, watcher: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.cancelled() => {}
                _ = revoker.revoked() => {
                    log::warn!("capture grant revoked, stopping recording");
                    if let Err(e) = service.end().await {
                        log::error!("stop after revocation failed: {:#}", e);
                    }
                }
            }
        });
    }

    /// Requests the active recording to stop and returns its path without
    /// waiting for teardown. A no-op when nothing is recording.
    pub async fn end(self: &Arc<Self>) -> anyhow::Result<Option<PathBuf>> {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.active.take() else {
            return Ok(None);
        };
        active.watcher.cancel();
        let path = active.recording.path().to_path_buf();
        let handle = active.recording.stop()?;
        inner.stopping = true;
        drop(inner);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let report = tokio::task::spawn_blocking(move || handle.wait()).await;
            let mut inner = service.inner.lock().await;
            inner.stopping = false;
            match report {
                Ok(report) => {
                    log::info!("recording saved: {}", report.path.display());
                    inner.last_session = Some(SessionSummary::from(&report));
                }
                Err(e) => log::error!("recording stop task failed: {}", e),
            }
        });
        Ok(Some(path))
    }

    /// Stops any active recording and waits until its file is finalized.
    pub async fn shutdown(&self) {
        let active = self.inner.lock().await.active.take();
        let Some(active) = active else {
            return;
        };
        active.watcher.cancel();
        let report = match active.recording.stop() {
            Ok(handle) => tokio::task::spawn_blocking(move || handle.wait()).await,
            Err(e) => {
                log::error!("failed to stop recording: {}", e);
                return;
            }
        };
        match report {
            Ok(report) => log::info!("recording saved: {}", report.path.display()),
            Err(e) => log::error!("recording stop task failed: {}", e),
        }
    }

    /// Invalidates the grant, stopping the recording made with it if any.
    pub async fn revoke(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(grant) = inner.grant.take() {
            grant.revoker().revoke();
        }
        if let Some(active) = &inner.active {
            active.recording.revoker().revoke();
        }
    }

    pub async fn status(&self) -> RecorderStatus {
        let inner = self.inner.lock().await;
        let state = if inner.active.is_some() {
            RecorderState::Recording
        } else if inner.stopping {
            RecorderState::Stopping
        } else if inner.grant.is_some() {
            RecorderState::Prepared
        } else {
            RecorderState::Idle
        };
        RecorderStatus {
            state,
            audio_permitted: inner.grant.as_ref().is_some_and(|g| g.audio().is_some())
                || inner.active.as_ref().is_some_and(|a| a.recording.has_audio()),
            current: inner
                .active
                .as_ref()
                .map(|a| a.recording.path().to_path_buf()),
            last_session: inner.last_session.clone(),
        }
    }
}
