//! In-memory collaborators for exercising the pipeline without devices.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bytes::Bytes;
use ffmpeg_next::Rational;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::MediaBackend,
    capability::{
        AudioSettings, DrainEvent, EncoderCapability, EncoderSettings, FeedMode, VideoSettings,
    },
    capture::{AudioTarget, CaptureSession, CaptureTarget, RawAudioSource, SessionClock},
    frame::{EncoderInput, InputEvent, InputQueue, PcmBuffer, RawFrame, RawVideoFrame},
    muxer::ContainerWriter,
    sample::{MICROS, Sample, SampleFlags},
    stream::{MediaFormat, StreamDescriptor, Track, TrackRole},
};

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn push(log: &CallLog, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

pub fn descriptor(role: TrackRole) -> StreamDescriptor {
    match role {
        TrackRole::Video => StreamDescriptor::new(
            role,
            "libx264",
            MediaFormat::Video {
                width: 1280,
                height: 720,
                frame_rate: Rational(30, 1),
            },
            MICROS,
        ),
        TrackRole::Audio => StreamDescriptor::new(
            role,
            "aac",
            MediaFormat::Audio {
                sample_rate: 44_100,
                channels: 2,
            },
            Rational(1, 44_100),
        ),
    }
}

pub fn media(pts: i64) -> Sample {
    Sample::new(Bytes::from_static(&[0, 0, 0, 1, 0x65]), pts).with_flags(SampleFlags {
        key_frame: true,
        ..SampleFlags::default()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterCall {
    AddTrack(TrackRole),
    Start,
    Write { index: usize, pts: i64 },
    Finish,
}

#[derive(Clone, Default)]
pub struct MockWriter {
    calls: Arc<Mutex<Vec<WriterCall>>>,
    log: Option<CallLog>,
    fail_start: bool,
}

impl MockWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn calls(&self) -> Vec<WriterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&WriterCall) -> bool) -> usize {
        self.calls().iter().filter(|c| f(c)).count()
    }

    pub fn writes(&self) -> usize {
        self.count(|c| matches!(c, WriterCall::Write { .. }))
    }

    fn record(&self, call: WriterCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ContainerWriter for MockWriter {
    fn add_track(&mut self, descriptor: &StreamDescriptor) -> anyhow::Result<usize> {
        let index = self.count(|c| matches!(c, WriterCall::AddTrack(_)));
        self.record(WriterCall::AddTrack(descriptor.role()));
        Ok(index)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("header rejected");
        }
        self.record(WriterCall::Start);
        Ok(())
    }

    fn write_sample(&mut self, track: Track, sample: &Sample) -> anyhow::Result<()> {
        self.record(WriterCall::Write {
            index: track.index(),
            pts: sample.pts(),
        });
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.record(WriterCall::Finish);
        if let Some(log) = &self.log {
            push(log, "finalize container");
        }
        Ok(())
    }
}

pub enum Step {
    Format,
    Output(i64),
    Fail(&'static str),
    EndOfStream,
}

/// Encoder that first replays a script, then (when live) turns queued input
/// into one sample per frame.
pub struct MockEncoder {
    role: TrackRole,
    script: VecDeque<Step>,
    live: bool,
    format_delay: Duration,
    fail_configure: bool,
    fail_release: bool,
    queue: Option<InputQueue>,
    started_at: Option<Instant>,
    format_reported: bool,
    finished: bool,
    log: CallLog,
}

impl MockEncoder {
    pub fn scripted(role: TrackRole, script: Vec<Step>) -> Self {
        Self {
            role,
            script: script.into(),
            live: false,
            format_delay: Duration::ZERO,
            fail_configure: false,
            fail_release: false,
            queue: None,
            started_at: None,
            format_reported: false,
            finished: false,
            log: CallLog::default(),
        }
    }

    pub fn live(role: TrackRole) -> Self {
        Self {
            live: true,
            ..Self::scripted(role, Vec::new())
        }
    }

    pub fn with_format_delay(mut self, delay: Duration) -> Self {
        self.format_delay = delay;
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    fn idle(&self, timeout: Duration) -> DrainEvent {
        std::thread::sleep(timeout.min(Duration::from_millis(2)));
        DrainEvent::TryAgainLater
    }

    fn live_output(&mut self, timeout: Duration) -> DrainEvent {
        if self.finished {
            return self.idle(timeout);
        }
        let format_due = self
            .started_at
            .is_some_and(|t| t.elapsed() >= self.format_delay);
        if !self.format_reported && format_due {
            self.format_reported = true;
            return DrainEvent::FormatChanged(descriptor(self.role));
        }
        let Some(queue) = &self.queue else {
            return self.idle(timeout);
        };
        match queue.next(timeout) {
            InputEvent::Frame(_) if !self.format_reported => DrainEvent::TryAgainLater,
            InputEvent::Frame(RawFrame::Video(frame)) => {
                DrainEvent::Output(media(frame.pts().unwrap_or(0)))
            }
            InputEvent::Frame(RawFrame::Audio(buffer)) => DrainEvent::Output(media(buffer.pts)),
            InputEvent::Idle => DrainEvent::TryAgainLater,
            InputEvent::EndOfStream => {
                self.finished = true;
                DrainEvent::Output(Sample::end_of_stream(0))
            }
        }
    }
}

impl EncoderCapability for MockEncoder {
    fn role(&self) -> TrackRole {
        self.role
    }

    fn feed_mode(&self) -> FeedMode {
        match self.role {
            TrackRole::Video => FeedMode::Surface,
            TrackRole::Audio => FeedMode::Buffer,
        }
    }

    fn configure(&mut self, _settings: &EncoderSettings) -> anyhow::Result<()> {
        if self.fail_configure {
            anyhow::bail!("unsupported format");
        }
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<EncoderInput> {
        let (input, queue) = EncoderInput::channel(16);
        self.queue = Some(queue);
        self.started_at = Some(Instant::now());
        Ok(input)
    }

    fn dequeue_output(&mut self, timeout: Duration) -> anyhow::Result<DrainEvent> {
        match self.script.pop_front() {
            Some(Step::Format) => Ok(DrainEvent::FormatChanged(descriptor(self.role))),
            Some(Step::Output(pts)) => Ok(DrainEvent::Output(media(pts))),
            Some(Step::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Step::EndOfStream) => Ok(DrainEvent::Output(Sample::end_of_stream(0))),
            None if self.live => Ok(self.live_output(timeout)),
            None => Ok(self.idle(timeout)),
        }
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.queue = None;
        push(&self.log, format!("release {} encoder", self.role));
        if self.fail_release {
            anyhow::bail!("codec busy");
        }
        Ok(())
    }
}

/// Pushes an empty frame into the surface every few milliseconds.
pub struct MockCapture {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    fail_detach: bool,
    log: CallLog,
}

impl MockCapture {
    pub fn attach(surface: EncoderInput, clock: SessionClock, log: CallLog) -> Self {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = std::thread::spawn(move || {
            while !cancel_clone.is_cancelled() {
                let mut frame = RawVideoFrame::from(ffmpeg_next::frame::Video::empty());
                frame.set_pts(clock.now_us());
                if surface.try_queue(RawFrame::Video(frame)).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        Self {
            cancel,
            handle: Some(handle),
            fail_detach: false,
            log,
        }
    }
}

impl CaptureSession for MockCapture {
    fn detach(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        push(&self.log, "detach capture");
        if self.fail_detach {
            anyhow::bail!("display went away");
        }
        Ok(())
    }
}

/// Produces a 1024-frame stereo buffer every few milliseconds.
pub struct MockAudioSource {
    clock: SessionClock,
    fail_after: Option<usize>,
    reads: usize,
    log: CallLog,
}

impl RawAudioSource for MockAudioSource {
    fn read(&mut self) -> anyhow::Result<Option<PcmBuffer>> {
        std::thread::sleep(Duration::from_millis(5));
        if self.fail_after.is_some_and(|n| self.reads >= n) {
            anyhow::bail!("microphone unplugged");
        }
        self.reads += 1;
        Ok(Some(PcmBuffer {
            samples: vec![0; 2048],
            channels: 2,
            sample_rate: 44_100,
            pts: self.clock.now_us(),
        }))
    }

    fn release(&mut self) -> anyhow::Result<()> {
        push(&self.log, "release audio source");
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockOptions {
    pub video_configure_fails: bool,
    pub audio_configure_fails: bool,
    pub audio_source_unavailable: bool,
    pub audio_source_fails_after: Option<usize>,
    pub audio_format_delay: Duration,
    pub video_release_fails: bool,
    pub container_open_fails: bool,
    pub capture_detach_fails: bool,
}

pub struct MockBackend {
    options: MockOptions,
    log: CallLog,
    writer: MockWriter,
}

impl MockBackend {
    pub fn new(options: MockOptions) -> Self {
        let log = CallLog::default();
        Self {
            options,
            writer: MockWriter::new().with_log(log.clone()),
            log,
        }
    }

    pub fn log(&self) -> Vec<String> {
        entries(&self.log)
    }

    pub fn writer(&self) -> &MockWriter {
        &self.writer
    }
}

impl MediaBackend for MockBackend {
    fn open_container(&self, _path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>> {
        if self.options.container_open_fails {
            anyhow::bail!("disk full");
        }
        Ok(Box::new(self.writer.clone()))
    }

    fn video_encoder(&self) -> anyhow::Result<Box<dyn EncoderCapability>> {
        let mut encoder = MockEncoder::live(TrackRole::Video).with_log(self.log.clone());
        if self.options.video_configure_fails {
            encoder = encoder.failing_configure();
        }
        if self.options.video_release_fails {
            encoder = encoder.failing_release();
        }
        Ok(Box::new(encoder))
    }

    fn audio_encoder(&self) -> anyhow::Result<Box<dyn EncoderCapability>> {
        let mut encoder = MockEncoder::live(TrackRole::Audio)
            .with_format_delay(self.options.audio_format_delay)
            .with_log(self.log.clone());
        if self.options.audio_configure_fails {
            encoder = encoder.failing_configure();
        }
        Ok(Box::new(encoder))
    }

    fn attach_capture(
        &self,
        _target: &CaptureTarget,
        _settings: &VideoSettings,
        surface: EncoderInput,
        clock: SessionClock,
    ) -> anyhow::Result<Box<dyn CaptureSession>> {
        let mut capture = MockCapture::attach(surface, clock, self.log.clone());
        capture.fail_detach = self.options.capture_detach_fails;
        Ok(Box::new(capture))
    }

    fn open_audio_source(
        &self,
        _target: &AudioTarget,
        _settings: &AudioSettings,
        clock: SessionClock,
    ) -> anyhow::Result<Box<dyn RawAudioSource>> {
        if self.options.audio_source_unavailable {
            anyhow::bail!("no microphone");
        }
        Ok(Box::new(MockAudioSource {
            clock,
            fail_after: self.options.audio_source_fails_after,
            reads: 0,
            log: self.log.clone(),
        }))
    }
}
