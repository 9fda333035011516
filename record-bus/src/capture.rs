//! Raw input sources: the screen grab bound to the video encoder's surface and
//! the PCM source whose buffers a feed thread pulls into the audio encoder.

use std::{
    thread::JoinHandle,
    time::Instant,
};

use ffmpeg_next::Dictionary;
use tokio_util::sync::CancellationToken;

use crate::{
    capability::{AudioSettings, VideoSettings},
    decoder::VideoDecoder,
    error::{RecordError, RecordResult},
    frame::{EncoderInput, PcmBuffer, RawFrame},
    input::AvInput,
};

const DROP_LOG_INTERVAL: u64 = 30;

/// Shared origin for capture timestamps so both tracks line up.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds since the session started, never below 1.
    pub fn now_us(&self) -> i64 {
        (self.origin.elapsed().as_micros() as i64).max(1)
    }
}

/// What the screen grab reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    /// X11 display and offset, e.g. ":0.0+0,0".
    pub display: String,
    pub draw_mouse: bool,
}

impl CaptureTarget {
    pub fn new(display: impl Into<String>) -> Self {
        Self {
            display: display.into(),
            draw_mouse: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTarget {
    /// PulseAudio source name, "default" for the default source.
    pub device: String,
}

/// A capture source bound to a surface-fed encoder.
pub trait CaptureSession: Send {
    /// Unbinds the source from the encoder's input and stops it.
    fn detach(&mut self) -> anyhow::Result<()>;
}

/// A source of interleaved PCM buffers.
pub trait RawAudioSource: Send {
    /// Blocks until the next buffer is available. `None` when the source ended.
    fn read(&mut self) -> anyhow::Result<Option<PcmBuffer>>;

    fn release(&mut self) -> anyhow::Result<()>;
}

/// Grabs the X11 screen and pushes decoded frames into the video encoder's surface.
pub struct ScreenCapture {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScreenCapture {
    pub fn attach(
        target: &CaptureTarget,
        settings: &VideoSettings,
        surface: EncoderInput,
        clock: SessionClock,
    ) -> anyhow::Result<Self> {
        let mut options = Dictionary::new();
        options.set(
            "framerate",
            &format!("{}/{}", settings.frame_rate.0, settings.frame_rate.1),
        );
        options.set("draw_mouse", if target.draw_mouse { "1" } else { "0" });

        let mut input = AvInput::open(&target.display, "x11grab", options)?;
        let stream = input
            .first_video()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no video stream on display {}", target.display))?;
        let mut decoder = VideoDecoder::new(&stream)?;
        let video_index = stream.index();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("screen-capture".to_string())
            .spawn(move || {
                let mut dropped = 0u64;
                while !cancel_clone.is_cancelled() {
                    let packet = match input.read_packet() {
                        Ok(Some(packet)) => packet,
                        Ok(None) => {
                            log::info!("screen capture ended");
                            break;
                        }
                        Err(e) => {
                            log::error!("screen capture read failed: {:#}", e);
                            break;
                        }
                    };
                    if packet.stream_index() != video_index {
                        continue;
                    }
                    if let Err(e) = decoder.send_packet(packet) {
                        log::warn!("screen capture decode failed: {:#}", e);
                        continue;
                    }
                    loop {
                        match decoder.receive_frame() {
                            Ok(Some(mut frame)) => {
                                frame.set_pts(clock.now_us());
                                match surface.try_queue(RawFrame::Video(frame)) {
                                    Ok(true) => {}
                                    Ok(false) => {
                                        dropped += 1;
                                        if dropped % DROP_LOG_INTERVAL == 1 {
                                            log::debug!(
                                                "video encoder busy, dropped {} frame(s)",
                                                dropped
                                            );
                                        }
                                    }
                                    Err(_) => {
                                        log::info!("video surface closed, capture stopping");
                                        return;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                log::warn!("screen capture decode failed: {:#}", e);
                                break;
                            }
                        }
                    }
                }
            })?;

        log::info!("screen capture attached to {}", target.display);
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl CaptureSession for ScreenCapture {
    fn detach(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("screen capture thread panicked"))?;
            log::info!("screen capture detached");
        }
        Ok(())
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads s16le PCM from a PulseAudio source.
pub struct PulseAudioSource {
    input: Option<AvInput>,
    channels: u16,
    sample_rate: u32,
    clock: SessionClock,
}

impl PulseAudioSource {
    pub fn open(
        target: &AudioTarget,
        settings: &AudioSettings,
        clock: SessionClock,
    ) -> anyhow::Result<Self> {
        let mut options = Dictionary::new();
        options.set("sample_rate", &settings.sample_rate.to_string());
        options.set("channels", &settings.channels.to_string());

        let input = AvInput::open(&target.device, "pulse", options)?;
        let stream = input
            .first_audio()
            .ok_or_else(|| anyhow::anyhow!("no audio stream on {}", target.device))?;
        if stream.parameters().id() != ffmpeg_next::codec::Id::PCM_S16LE {
            anyhow::bail!(
                "audio source {} delivers {:?}, expected s16le",
                target.device,
                stream.parameters().id()
            );
        }
        log::info!(
            "audio source {} opened: {} Hz, {} channel(s)",
            target.device,
            settings.sample_rate,
            settings.channels
        );

        Ok(Self {
            input: Some(input),
            channels: settings.channels,
            sample_rate: settings.sample_rate,
            clock,
        })
    }
}

impl RawAudioSource for PulseAudioSource {
    fn read(&mut self) -> anyhow::Result<Option<PcmBuffer>> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("audio source released"))?;
        loop {
            let Some(packet) = input.read_packet()? else {
                return Ok(None);
            };
            if packet.data().is_empty() {
                continue;
            }
            return Ok(Some(PcmBuffer::from_le_bytes(
                packet.data(),
                self.channels,
                self.sample_rate,
                self.clock.now_us(),
            )));
        }
    }

    fn release(&mut self) -> anyhow::Result<()> {
        if self.input.take().is_some() {
            log::info!("audio source released");
        }
        Ok(())
    }
}

/// Pulls buffers from an audio source into the audio encoder's queue.
///
/// The thread exits when cancelled, when the encoder's input reached end of
/// stream, or when the source ends or fails; in the last two cases it
/// signals end of stream itself so the encoder flushes.
pub struct AudioFeed {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Box<dyn RawAudioSource>>>,
}

impl AudioFeed {
    pub fn spawn(mut source: Box<dyn RawAudioSource>, input: EncoderInput) -> RecordResult<Self> {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let name = "audio-feed".to_string();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut dropped = 0u64;
                while !cancel_clone.is_cancelled() && !input.is_end_of_stream() {
                    match source.read() {
                        Ok(Some(buffer)) => match input.try_queue(RawFrame::Audio(buffer)) {
                            Ok(true) => {}
                            Ok(false) => {
                                dropped += 1;
                                if dropped % DROP_LOG_INTERVAL == 1 {
                                    log::debug!("audio encoder busy, dropped {} buffer(s)", dropped);
                                }
                            }
                            Err(e) => {
                                log::warn!("audio feed stopping: {:#}", e);
                                break;
                            }
                        },
                        Ok(None) => {
                            log::info!("audio source ended");
                            input.signal_end_of_stream();
                            break;
                        }
                        Err(e) => {
                            log::error!("audio source read failed: {:#}", e);
                            input.signal_end_of_stream();
                            break;
                        }
                    }
                }
                source
            })
            .map_err(|source| RecordError::Spawn { name, source })?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the feed thread and hands the source back for release.
    pub fn join(&mut self) -> Option<Box<dyn RawAudioSource>> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(source) => Some(source),
            Err(_) => {
                log::error!("audio feed thread panicked");
                None
            }
        }
    }
}

impl Drop for AudioFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::frame::InputEvent;

    struct CountingSource {
        remaining: usize,
        released: Arc<Mutex<bool>>,
    }

    impl RawAudioSource for CountingSource {
        fn read(&mut self) -> anyhow::Result<Option<PcmBuffer>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(PcmBuffer {
                samples: vec![0; 2048],
                channels: 2,
                sample_rate: 44_100,
                pts: 1,
            }))
        }

        fn release(&mut self) -> anyhow::Result<()> {
            *self.released.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn test_feed_signals_end_of_stream_when_source_ends() {
        let released = Arc::new(Mutex::new(false));
        let source = CountingSource {
            remaining: 3,
            released: released.clone(),
        };
        let (input, queue) = EncoderInput::channel(8);
        let mut feed = AudioFeed::spawn(Box::new(source), input).unwrap();

        let mut frames = 0;
        loop {
            match queue.next(Duration::from_millis(50)) {
                InputEvent::Frame(_) => frames += 1,
                InputEvent::Idle => continue,
                InputEvent::EndOfStream => break,
            }
        }
        assert_eq!(frames, 3);

        let mut source = feed.join().unwrap();
        source.release().unwrap();
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn test_session_clock_is_positive() {
        let clock = SessionClock::start();
        assert!(clock.now_us() >= 1);
    }
}
