//! Track registry and multiplexer.
//!
//! Encoders learn their output format asynchronously and at different
//! latencies, while the container needs every track declared before the first
//! sample. The multiplexer collects registrations and opens the container the
//! instant the expected set is complete. Writes that race ahead of that park
//! on the readiness barrier for a bounded window and are dropped if the
//! container still has not started.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::{
    error::{RecordError, RecordResult},
    sample::Sample,
    stream::{StreamDescriptor, Track, TrackRole},
};

/// How long a write may wait for the sibling track to register.
pub const DEFAULT_READY_WAIT: Duration = Duration::from_millis(100);

/// Log one "dropped before start" line every N drops.
const DROP_LOG_INTERVAL: u64 = 30;

/// The container file the multiplexer writes to.
pub trait ContainerWriter: Send {
    /// Declares a stream and returns its container index.
    fn add_track(&mut self, descriptor: &StreamDescriptor) -> anyhow::Result<usize>;
    /// Writes the container header. Called once, after every track is added.
    fn start(&mut self) -> anyhow::Result<()>;
    fn write_sample(&mut self, track: Track, sample: &Sample) -> anyhow::Result<()>;
    /// Flushes and closes the container. Called at most once.
    fn finish(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerState {
    Idle,
    AwaitingTracks,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The container never started within the readiness window.
    Dropped,
    /// The multiplexer is stopped.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxerStats {
    pub written: u64,
    pub dropped: u64,
    pub ignored: u64,
}

struct MuxerInner {
    state: MuxerState,
    expected: usize,
    tracks: Vec<Track>,
    writer: Box<dyn ContainerWriter>,
    first_registration: Option<Instant>,
    closed: bool,
    stats: MuxerStats,
}

impl MuxerInner {
    fn transition(&mut self, state: MuxerState) {
        if self.state != state {
            log::debug!("muxer state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn is_registered(&self, role: TrackRole) -> bool {
        self.tracks.iter().any(|t| t.role() == role)
    }
}

pub struct Muxer {
    inner: Mutex<MuxerInner>,
    ready: Condvar,
    ready_wait: Duration,
}

impl Muxer {
    /// `expected_track_count` is 1 for video only and 2 with audio.
    pub fn new(
        writer: Box<dyn ContainerWriter>,
        expected_track_count: usize,
    ) -> RecordResult<Self> {
        if !(1..=2).contains(&expected_track_count) {
            return Err(RecordError::InvalidTrackCount(expected_track_count));
        }
        let mut inner = MuxerInner {
            state: MuxerState::Idle,
            expected: expected_track_count,
            tracks: Vec::with_capacity(expected_track_count),
            writer,
            first_registration: None,
            closed: false,
            stats: MuxerStats::default(),
        };
        inner.transition(MuxerState::AwaitingTracks);
        Ok(Self {
            inner: Mutex::new(inner),
            ready: Condvar::new(),
            ready_wait: DEFAULT_READY_WAIT,
        })
    }

    pub fn with_ready_wait(mut self, ready_wait: Duration) -> Self {
        self.ready_wait = ready_wait;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MuxerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> MuxerState {
        self.lock().state
    }

    pub fn expected_track_count(&self) -> usize {
        self.lock().expected
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.lock().tracks.clone()
    }

    pub fn stats(&self) -> MuxerStats {
        self.lock().stats
    }

    /// Registers the stream of one encoder. A second registration for a role
    /// returns the existing track without touching the container.
    pub fn register_track(&self, descriptor: &StreamDescriptor) -> RecordResult<Track> {
        let role = descriptor.role();
        let mut inner = self.lock();
        match inner.state {
            MuxerState::Started => return Err(RecordError::MuxerStarted),
            MuxerState::Stopped => return Err(RecordError::MuxerStopped),
            MuxerState::Idle | MuxerState::AwaitingTracks => {}
        }
        if let Some(existing) = inner.tracks.iter().find(|t| t.role() == role).copied() {
            log::warn!("{} track already registered as {}, ignoring", role, existing);
            return Ok(existing);
        }
        if inner.tracks.len() >= inner.expected {
            return Err(RecordError::UnexpectedTrack(role));
        }

        let index = inner
            .writer
            .add_track(descriptor)
            .map_err(RecordError::Container)?;
        let track = Track::new(index, role);
        inner.tracks.push(track);
        inner.first_registration.get_or_insert_with(Instant::now);
        log::info!(
            "{} track registered: index {}, codec {} ({}/{} tracks)",
            role,
            index,
            descriptor.codec(),
            inner.tracks.len(),
            inner.expected
        );

        self.start_if_complete(&mut inner)?;
        Ok(track)
    }

    /// Gives up on a role that will never register, e.g. because its encoder
    /// failed. Starts the container if every remaining track is known.
    ///
    /// Video is required: withdrawing it stops the multiplexer instead, so the
    /// session ends without a container rather than as audio only.
    pub fn withdraw(&self, role: TrackRole) -> RecordResult<bool> {
        let mut inner = self.lock();
        if inner.state != MuxerState::AwaitingTracks || inner.is_registered(role) {
            return Ok(false);
        }
        if role == TrackRole::Video {
            log::error!("video track withdrawn before registering, stopping muxer");
            inner.transition(MuxerState::Stopped);
            self.ready.notify_all();
            return Ok(false);
        }
        if inner.expected <= 1 {
            return Ok(false);
        }
        inner.expected -= 1;
        log::warn!(
            "{} track withdrawn, expecting {} track(s)",
            role,
            inner.expected
        );
        self.start_if_complete(&mut inner)?;
        Ok(true)
    }

    fn start_if_complete(&self, inner: &mut MuxerInner) -> RecordResult<()> {
        if inner.state != MuxerState::AwaitingTracks || inner.tracks.len() < inner.expected {
            return Ok(());
        }
        if let Err(e) = inner.writer.start() {
            inner.transition(MuxerState::Stopped);
            self.ready.notify_all();
            return Err(RecordError::Container(e));
        }
        inner.transition(MuxerState::Started);
        log::info!("muxer started with {} track(s)", inner.tracks.len());
        self.ready.notify_all();
        Ok(())
    }

    /// Writes one sample. While tracks are still missing the caller parks on
    /// the readiness barrier until the window that opened with the first
    /// registration closes; after that the sample is dropped.
    pub fn write(&self, track: Track, sample: &Sample) -> RecordResult<WriteOutcome> {
        let mut inner = self.lock();
        if inner.state == MuxerState::AwaitingTracks {
            let deadline = inner
                .first_registration
                .map(|t| t + self.ready_wait)
                .unwrap_or_else(|| Instant::now() + self.ready_wait);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                let (guard, _) = self
                    .ready
                    .wait_timeout_while(inner, remaining, |i| {
                        i.state == MuxerState::AwaitingTracks
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                inner = guard;
            }
        }

        match inner.state {
            MuxerState::Started => {
                if !inner.tracks.contains(&track) {
                    return Err(RecordError::UnknownTrack(track));
                }
                inner
                    .writer
                    .write_sample(track, sample)
                    .map_err(|e| RecordError::capability(track.role(), e))?;
                inner.stats.written += 1;
                Ok(WriteOutcome::Written)
            }
            MuxerState::Idle | MuxerState::AwaitingTracks => {
                inner.stats.dropped += 1;
                if inner.stats.dropped % DROP_LOG_INTERVAL == 1 {
                    log::debug!(
                        "muxer not started, dropped {} sample(s) so far",
                        inner.stats.dropped
                    );
                }
                Ok(WriteOutcome::Dropped)
            }
            MuxerState::Stopped => {
                inner.stats.ignored += 1;
                Ok(WriteOutcome::Ignored)
            }
        }
    }

    /// Closes the container if it was started and moves to `Stopped`.
    /// Calling it again is a no-op.
    pub fn finalize(&self) -> RecordResult<()> {
        let mut inner = self.lock();
        let result = if inner.state == MuxerState::Started && !inner.closed {
            inner.closed = true;
            log::info!("finalizing container, {} sample(s) written", inner.stats.written);
            inner.writer.finish().map_err(RecordError::Container)
        } else {
            if inner.state == MuxerState::AwaitingTracks {
                log::warn!(
                    "muxer finalized before start ({}/{} tracks), no data written",
                    inner.tracks.len(),
                    inner.expected
                );
            }
            Ok(())
        };
        inner.transition(MuxerState::Stopped);
        self.ready.notify_all();
        result
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
