use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::{
    capability::{DrainEvent, EncoderCapability, EncoderSettings, FeedMode},
    error::{RecordError, RecordResult},
    frame::{EncoderInput, EndOfStreamFlag},
    muxer::{Muxer, WriteOutcome},
    sample::Sample,
    stream::{Track, TrackRole},
};

/// Bound on each output poll; also the latency of reacting to a stop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a stopped adapter keeps draining while it waits for the
/// encoder's terminal sample.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Invoked once, right after the adapter's track is registered.
pub type TrackReadyListener = Arc<dyn Fn(Track) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Configured,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub written: u64,
    /// Handed to the muxer but dropped because it had not started.
    pub dropped: u64,
    /// Empty, codec config or pre-roll samples never handed to the muxer.
    pub discarded: u64,
    pub duplicate_formats: u64,
}

/// Cloneable stop request for an adapter whose drain loop runs elsewhere.
#[derive(Clone)]
pub struct StopSignal {
    role: TrackRole,
    keep_running: CancellationToken,
    end_of_stream: Option<EndOfStreamFlag>,
}

impl StopSignal {
    /// Clears the keep-running flag and ends the encoder's input, so it stops
    /// accepting frames and the drain loop reaches a terminal sample.
    pub fn stop(&self) {
        if let Some(end_of_stream) = &self.end_of_stream {
            if !end_of_stream.is_signalled() {
                log::debug!("{} encoder: signalling end of stream", self.role);
                end_of_stream.signal();
            }
        }
        self.keep_running.cancel();
    }

    pub fn role(&self) -> TrackRole {
        self.role
    }
}

/// Drives one encoder capability and pushes its output into the muxer.
pub struct EncoderAdapter {
    role: TrackRole,
    feed_mode: FeedMode,
    capability: Box<dyn EncoderCapability>,
    state: AdapterState,
    track: Option<Track>,
    keep_running: CancellationToken,
    end_of_stream: Option<EndOfStreamFlag>,
    on_track_ready: Option<TrackReadyListener>,
    poll_interval: Duration,
    drain_grace: Duration,
    stats: DrainStats,
    released: bool,
}

impl EncoderAdapter {
    pub fn new(capability: Box<dyn EncoderCapability>) -> Self {
        Self {
            role: capability.role(),
            feed_mode: capability.feed_mode(),
            capability,
            state: AdapterState::Created,
            track: None,
            keep_running: CancellationToken::new(),
            end_of_stream: None,
            on_track_ready: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
            stats: DrainStats::default(),
            released: false,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Upper bound on draining after a stop request. An encoder that keeps
    /// producing output or never emits its terminal sample is cut off here.
    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    pub fn with_track_ready_listener(mut self, listener: TrackReadyListener) -> Self {
        self.on_track_ready = Some(listener);
        self
    }

    pub fn role(&self) -> TrackRole {
        self.role
    }

    pub fn feed_mode(&self) -> FeedMode {
        self.feed_mode
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn track(&self) -> Option<Track> {
        self.track
    }

    pub fn stats(&self) -> DrainStats {
        self.stats
    }

    pub fn configure(&mut self, settings: &EncoderSettings) -> RecordResult<()> {
        if self.state != AdapterState::Created {
            return Err(RecordError::configuration(
                self.role,
                anyhow::anyhow!("cannot configure in state {:?}", self.state),
            ));
        }
        if settings.role() != self.role {
            return Err(RecordError::configuration(
                self.role,
                anyhow::anyhow!("{} settings given to {} encoder", settings.role(), self.role),
            ));
        }
        let result = settings
            .validate()
            .and_then(|_| self.capability.configure(settings));
        if let Err(e) = result {
            log::error!("{} encoder configuration failed: {:#}", self.role, e);
            self.shutdown();
            return Err(RecordError::configuration(self.role, e));
        }
        self.state = AdapterState::Configured;
        Ok(())
    }

    /// Starts the encoder and returns the handle its input is fed through:
    /// the capture target for surface-fed encoders, the buffer queue for
    /// buffer-fed ones.
    pub fn start(&mut self) -> RecordResult<EncoderInput> {
        if self.state != AdapterState::Configured {
            return Err(RecordError::capability(
                self.role,
                anyhow::anyhow!("cannot start in state {:?}", self.state),
            ));
        }
        let input = match self.capability.start() {
            Ok(input) => input,
            Err(e) => {
                log::error!("{} encoder start failed: {:#}", self.role, e);
                self.shutdown();
                return Err(RecordError::capability(self.role, e));
            }
        };
        self.end_of_stream = Some(input.end_of_stream_flag());
        self.state = AdapterState::Running;
        log::info!("{} encoder started ({:?} fed)", self.role, self.feed_mode);
        Ok(input)
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            role: self.role,
            keep_running: self.keep_running.clone(),
            end_of_stream: self.end_of_stream.clone(),
        }
    }

    pub fn stop(&self) {
        self.stop_signal().stop();
    }

    /// Moves the adapter onto its own drain thread. Joining the handle gives
    /// the adapter back so it can be released.
    pub fn spawn(mut self, muxer: Arc<Muxer>) -> RecordResult<JoinHandle<EncoderAdapter>> {
        let name = format!("{}-drain", self.role);
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                self.run_drain_loop(&muxer);
                self
            })
            .map_err(|source| RecordError::Spawn { name, source })
    }

    /// Polls the encoder until it emits its terminal sample or fails. After a
    /// stop request draining is bounded by the drain grace.
    pub fn run_drain_loop(&mut self, muxer: &Muxer) {
        if self.state != AdapterState::Running {
            log::warn!(
                "{} drain loop not started, adapter is {:?}",
                self.role,
                self.state
            );
            return;
        }
        log::info!("{} drain loop started", self.role);

        let mut drain_deadline: Option<Instant> = None;
        let failure = loop {
            if self.keep_running.is_cancelled() {
                if self.state == AdapterState::Running {
                    self.state = AdapterState::Draining;
                }
                let deadline =
                    *drain_deadline.get_or_insert_with(|| Instant::now() + self.drain_grace);
                if Instant::now() >= deadline {
                    log::warn!(
                        "{} encoder produced no end of stream within {:?}",
                        self.role,
                        self.drain_grace
                    );
                    break None;
                }
            }

            let event = match self.capability.dequeue_output(self.poll_interval) {
                Ok(event) => event,
                Err(e) => break Some(RecordError::capability(self.role, e)),
            };

            match event {
                DrainEvent::FormatChanged(descriptor) => {
                    if self.track.is_some() {
                        self.stats.duplicate_formats += 1;
                        log::warn!(
                            "{} encoder reported its format again, keeping {:?}",
                            self.role,
                            self.track
                        );
                        continue;
                    }
                    match muxer.register_track(&descriptor) {
                        Ok(track) => {
                            self.track = Some(track);
                            if let Some(listener) = &self.on_track_ready {
                                listener(track);
                            }
                        }
                        Err(e) => break Some(e),
                    }
                }
                DrainEvent::Output(sample) => {
                    let end_of_stream = sample.is_end_of_stream();
                    if end_of_stream {
                        self.state = AdapterState::Draining;
                    }
                    if let Err(e) = self.deliver(muxer, &sample) {
                        break Some(e);
                    }
                    if end_of_stream {
                        log::info!("{} encoder reached end of stream", self.role);
                        break None;
                    }
                }
                DrainEvent::TryAgainLater => {}
            }
        };

        if self.track.is_none() {
            if let Err(e) = muxer.withdraw(self.role) {
                log::error!("{} track withdraw failed: {}", self.role, e);
            }
        }

        log::info!(
            "{} drain loop finished: written {}, dropped {}, discarded {}",
            self.role,
            self.stats.written,
            self.stats.dropped,
            self.stats.discarded
        );

        match failure {
            Some(e) => {
                log::error!("{} drain loop failed: {}", self.role, e);
                self.shutdown();
            }
            None => self.state = AdapterState::Stopped,
        }
    }

    fn deliver(&mut self, muxer: &Muxer, sample: &Sample) -> RecordResult<()> {
        if !sample.is_writable() {
            self.stats.discarded += 1;
            return Ok(());
        }
        let Some(track) = self.track else {
            // output before the format was reported has nowhere to go
            self.stats.discarded += 1;
            return Ok(());
        };
        match muxer.write(track, sample)? {
            WriteOutcome::Written => self.stats.written += 1,
            WriteOutcome::Dropped | WriteOutcome::Ignored => self.stats.dropped += 1,
        }
        Ok(())
    }

    /// Failure path: release everything owned and go straight to `Stopped`.
    fn shutdown(&mut self) {
        self.keep_running.cancel();
        if let Err(e) = self.release() {
            log::error!("{}", e);
        }
    }

    /// Stops and frees the encoder. Safe to call repeatedly; never call it
    /// while the drain loop is running on another thread.
    pub fn release(&mut self) -> RecordResult<()> {
        self.state = AdapterState::Stopped;
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.end_of_stream = None;
        let resource = match self.role {
            TrackRole::Video => "video encoder",
            TrackRole::Audio => "audio encoder",
        };
        self.capability
            .release()
            .map_err(|e| RecordError::release(resource, e))
    }
}

impl Drop for EncoderAdapter {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                log::error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
#[path = "adapter_test.rs"]
mod adapter_test;
