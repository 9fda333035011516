use std::time::Duration;

use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational, Rescale,
    codec::{self, Parameters},
    format::{Sample as SampleFormat, sample::Type as SampleType},
    software::resampling,
};

use crate::{
    capability::{
        AudioSettings, DrainEvent, EncoderCapability, EncoderSettings, FeedMode, VideoSettings,
    },
    frame::{EncoderInput, InputEvent, InputQueue, PcmBuffer, RawFrame, RawVideoFrame},
    hw::{find_hw_encoder, pixel_format_for_encoder},
    sample::{MICROS, Sample},
    scaler::Scaler,
    stream::{MediaFormat, StreamDescriptor, TrackRole},
};

/// Bounded input queue: when the encoder falls behind, producers drop frames
/// instead of growing memory.
pub const FRAME_QUEUE_BOUND: usize = 128;

struct Resampler {
    context: resampling::Context,
}

unsafe impl Send for Resampler {}

enum OpenedCodec {
    Video {
        encoder: codec::encoder::Video,
        scaler: Option<Scaler>,
    },
    Audio {
        encoder: codec::encoder::Audio,
        resampler: Resampler,
        layout: ChannelLayout,
        channels: u16,
        frame_size: usize,
        pending: Vec<i16>,
        /// Next frame pts in samples.
        next_pts: Option<i64>,
    },
}

/// An FFmpeg encoder behind the capability interface: video is fed by a
/// capture surface, audio by PCM buffers.
pub struct FfmpegEncoder {
    role: TrackRole,
    codec: Option<OpenedCodec>,
    descriptor: Option<StreamDescriptor>,
    time_base: Rational,
    queue_capacity: usize,
    queue: Option<InputQueue>,
    format_reported: bool,
    flushing: bool,
    finished: bool,
    last_pts: i64,
}

impl FfmpegEncoder {
    pub fn video() -> Self {
        Self::new(TrackRole::Video)
    }

    pub fn audio() -> Self {
        Self::new(TrackRole::Audio)
    }

    fn new(role: TrackRole) -> Self {
        Self {
            role,
            codec: None,
            descriptor: None,
            time_base: MICROS,
            queue_capacity: FRAME_QUEUE_BOUND,
            queue: None,
            format_reported: false,
            flushing: false,
            finished: false,
            last_pts: 0,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    fn open_video(&mut self, settings: &VideoSettings) -> anyhow::Result<()> {
        // Try hardware encoder first, then fall back to software encoder.
        let (context, selected) = match find_hw_encoder(&settings.codec) {
            Some(hw_codec) => {
                let hw_name = hw_codec.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                (codec::Context::new_with_codec(hw_codec), hw_name)
            }
            None => {
                log::info!(
                    "no hardware encoder found, using software encoder: {}",
                    settings.codec
                );
                (software_context(&settings.codec)?, settings.codec.clone())
            }
        };

        let encoder = match open_video_encoder(context, &selected, settings) {
            Ok(encoder) => {
                log::info!("video encoder opened: {}", selected);
                encoder
            }
            Err(e) if selected != settings.codec => {
                log::warn!(
                    "hardware encoder {} failed: {}, falling back to {}",
                    selected,
                    e,
                    settings.codec
                );
                let encoder = open_video_encoder(
                    software_context(&settings.codec)?,
                    &settings.codec,
                    settings,
                )?;
                log::info!("video encoder opened (fallback): {}", settings.codec);
                encoder
            }
            Err(e) => return Err(e),
        };

        self.time_base = unsafe { (*encoder.0.as_ptr()).time_base.into() };
        self.descriptor = Some(
            StreamDescriptor::new(
                TrackRole::Video,
                &selected,
                MediaFormat::Video {
                    width: settings.width,
                    height: settings.height,
                    frame_rate: settings.frame_rate,
                },
                self.time_base,
            )
            .with_parameters(Parameters::from(&encoder)),
        );
        self.codec = Some(OpenedCodec::Video {
            encoder,
            scaler: None,
        });
        Ok(())
    }

    fn open_audio(&mut self, settings: &AudioSettings) -> anyhow::Result<()> {
        let layout = if settings.channels == 1 {
            ChannelLayout::MONO
        } else {
            ChannelLayout::STEREO
        };
        let target = SampleFormat::F32(SampleType::Planar);

        let mut encoder = software_context(&settings.codec)?.encoder().audio()?;
        encoder.set_rate(settings.sample_rate as i32);
        encoder.set_channel_layout(layout);
        encoder.set_format(target);
        encoder.set_bit_rate(settings.bit_rate);
        encoder.set_time_base(Rational(1, settings.sample_rate as i32));
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        let encoder = encoder.open_with(Dictionary::new())?;

        let frame_size = match encoder.frame_size() {
            0 => 1024,
            n => n as usize,
        };
        let context = resampling::Context::get(
            SampleFormat::I16(SampleType::Packed),
            layout,
            settings.sample_rate,
            target,
            layout,
            settings.sample_rate,
        )?;
        log::info!(
            "audio encoder opened: {} {} Hz, {} channel(s), frame size {}",
            settings.codec,
            settings.sample_rate,
            settings.channels,
            frame_size
        );

        self.time_base = unsafe { (*encoder.0.as_ptr()).time_base.into() };
        self.descriptor = Some(
            StreamDescriptor::new(
                TrackRole::Audio,
                &settings.codec,
                MediaFormat::Audio {
                    sample_rate: settings.sample_rate,
                    channels: settings.channels,
                },
                self.time_base,
            )
            .with_parameters(Parameters::from(&encoder)),
        );
        self.codec = Some(OpenedCodec::Audio {
            encoder,
            resampler: Resampler { context },
            layout,
            channels: settings.channels,
            frame_size,
            pending: Vec::new(),
            next_pts: None,
        });
        Ok(())
    }

    fn codec_mut(&mut self) -> anyhow::Result<&mut OpenedCodec> {
        self.codec
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("{} encoder is not configured", self.role))
    }

    fn send(&mut self, frame: RawFrame) -> anyhow::Result<()> {
        let role = self.role;
        let time_base = self.time_base;
        match (self.codec_mut()?, frame) {
            (OpenedCodec::Video { encoder, scaler }, RawFrame::Video(frame)) => {
                send_video(encoder, scaler, frame)
            }
            (
                OpenedCodec::Audio {
                    encoder,
                    resampler,
                    layout,
                    channels,
                    frame_size,
                    pending,
                    next_pts,
                },
                RawFrame::Audio(buffer),
            ) => {
                if buffer.channels != *channels {
                    anyhow::bail!(
                        "audio buffer has {} channel(s), encoder expects {}",
                        buffer.channels,
                        channels
                    );
                }
                next_pts.get_or_insert_with(|| buffer.pts.rescale(MICROS, time_base));
                pending.extend_from_slice(&buffer.samples);
                let chunk = *frame_size * *channels as usize;
                while pending.len() >= chunk {
                    let samples: Vec<i16> = pending.drain(..chunk).collect();
                    let pts = next_pts.get_or_insert(0);
                    send_pcm(encoder, resampler, *layout, &samples, *frame_size, *pts)?;
                    *pts += *frame_size as i64;
                }
                Ok(())
            }
            _ => anyhow::bail!("invalid frame type for {} encoder", role),
        }
    }

    /// Pushes out any partial audio frame and puts the encoder into draining mode.
    fn flush(&mut self) -> anyhow::Result<()> {
        match self.codec_mut()? {
            OpenedCodec::Video { encoder, .. } => encoder.send_eof()?,
            OpenedCodec::Audio {
                encoder,
                resampler,
                layout,
                channels,
                frame_size,
                pending,
                next_pts,
            } => {
                if !pending.is_empty() {
                    let mut samples = std::mem::take(pending);
                    samples.resize(*frame_size * *channels as usize, 0);
                    let pts = next_pts.unwrap_or(0);
                    send_pcm(encoder, resampler, *layout, &samples, *frame_size, pts)?;
                }
                encoder.send_eof()?;
            }
        }
        self.flushing = true;
        log::debug!("{} encoder flushing", self.role);
        Ok(())
    }

    fn receive(&mut self) -> anyhow::Result<Option<DrainEvent>> {
        let time_base = self.time_base;
        let mut packet = ffmpeg_next::Packet::empty();
        let result = match self.codec_mut()? {
            OpenedCodec::Video { encoder, .. } => encoder.receive_packet(&mut packet),
            OpenedCodec::Audio { encoder, .. } => encoder.receive_packet(&mut packet),
        };
        match result {
            Ok(()) => {
                let sample = Sample::from_packet(&packet, time_base);
                self.last_pts = self.last_pts.max(sample.pts());
                Ok(Some(DrainEvent::Output(sample)))
            }
            Err(ffmpeg_next::Error::Eof) => {
                self.finished = true;
                Ok(Some(DrainEvent::Output(Sample::end_of_stream(self.last_pts))))
            }
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn software_context(name: &str) -> anyhow::Result<codec::Context> {
    let codec = ffmpeg_next::encoder::find_by_name(name)
        .ok_or_else(|| anyhow::anyhow!("codec not found: {}", name))?;
    Ok(codec::Context::new_with_codec(codec))
}

fn open_video_encoder(
    context: codec::Context,
    codec_name: &str,
    settings: &VideoSettings,
) -> anyhow::Result<codec::encoder::Video> {
    let mut encoder = context.encoder().video()?;
    encoder.set_width(settings.width);
    encoder.set_height(settings.height);
    encoder.set_format(pixel_format_for_encoder(codec_name));
    encoder.set_frame_rate(Some(settings.frame_rate));
    encoder.set_time_base(ffmpeg_next::util::mathematics::rescale::TIME_BASE);
    encoder.set_bit_rate(settings.bit_rate);
    encoder.set_max_b_frames(0);
    let gop = settings.keyframe_interval.max(1) * frames_per_second(settings.frame_rate);
    encoder.set_gop(gop);
    encoder.set_flags(codec::Flags::GLOBAL_HEADER);

    let mut opts = Dictionary::new();
    if codec_name == "libx264" || codec_name == "libx265" {
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
    }
    Ok(encoder.open_with(opts)?)
}

fn frames_per_second(rate: Rational) -> u32 {
    if rate.1 <= 0 {
        return 1;
    }
    ((rate.0 + rate.1 - 1) / rate.1).max(1) as u32
}

fn send_video(
    encoder: &mut codec::encoder::Video,
    scaler: &mut Option<Scaler>,
    mut frame: RawVideoFrame,
) -> anyhow::Result<()> {
    let target = (encoder.format(), encoder.width(), encoder.height());
    let source = (frame.format(), frame.width(), frame.height());
    if source == target {
        return Ok(encoder.send_frame(frame.get_mut())?);
    }
    let scaler = match scaler {
        Some(scaler) if scaler.accepts(frame.as_video()) => scaler,
        _ => scaler.insert(Scaler::new(source, target)?),
    };
    let mut converted = ffmpeg_next::frame::Video::empty();
    scaler.run(frame.as_video(), &mut converted)?;
    converted.set_pts(frame.pts());
    Ok(encoder.send_frame(&converted)?)
}

fn send_pcm(
    encoder: &mut codec::encoder::Audio,
    resampler: &mut Resampler,
    layout: ChannelLayout,
    samples: &[i16],
    frame_size: usize,
    pts: i64,
) -> anyhow::Result<()> {
    let mut input =
        ffmpeg_next::frame::Audio::new(SampleFormat::I16(SampleType::Packed), frame_size, layout);
    input.set_rate(resampler.context.input().rate);
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let plane = input.data_mut(0);
    let len = bytes.len().min(plane.len());
    plane[..len].copy_from_slice(&bytes[..len]);

    let mut output = ffmpeg_next::frame::Audio::empty();
    resampler.context.run(&input, &mut output)?;
    output.set_pts(Some(pts));
    encoder.send_frame(&output)?;
    Ok(())
}

impl EncoderCapability for FfmpegEncoder {
    fn role(&self) -> TrackRole {
        self.role
    }

    fn feed_mode(&self) -> FeedMode {
        match self.role {
            TrackRole::Video => FeedMode::Surface,
            TrackRole::Audio => FeedMode::Buffer,
        }
    }

    fn configure(&mut self, settings: &EncoderSettings) -> anyhow::Result<()> {
        match settings {
            EncoderSettings::Video(video) if self.role == TrackRole::Video => {
                self.open_video(video)
            }
            EncoderSettings::Audio(audio) if self.role == TrackRole::Audio => {
                self.open_audio(audio)
            }
            _ => anyhow::bail!("{} settings given to {} encoder", settings.role(), self.role),
        }
    }

    fn start(&mut self) -> anyhow::Result<EncoderInput> {
        if self.codec.is_none() {
            anyhow::bail!("{} encoder is not configured", self.role);
        }
        let (input, queue) = EncoderInput::channel(self.queue_capacity);
        self.queue = Some(queue);
        Ok(input)
    }

    fn dequeue_output(&mut self, timeout: Duration) -> anyhow::Result<DrainEvent> {
        if !self.format_reported {
            if let Some(descriptor) = self.descriptor.clone() {
                self.format_reported = true;
                return Ok(DrainEvent::FormatChanged(descriptor));
            }
        }
        if self.finished {
            std::thread::sleep(timeout);
            return Ok(DrainEvent::TryAgainLater);
        }
        if let Some(event) = self.receive()? {
            return Ok(event);
        }
        if self.flushing {
            return Ok(DrainEvent::TryAgainLater);
        }

        let next = match &self.queue {
            Some(queue) => queue.next(timeout),
            None => anyhow::bail!("{} encoder is not started", self.role),
        };
        match next {
            InputEvent::Frame(frame) => {
                if let Err(e) = self.send(frame) {
                    log::warn!("{} encoder rejected a frame: {:#}", self.role, e);
                }
            }
            InputEvent::Idle => return Ok(DrainEvent::TryAgainLater),
            InputEvent::EndOfStream => self.flush()?,
        }
        Ok(self.receive()?.unwrap_or(DrainEvent::TryAgainLater))
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.queue = None;
        if self.codec.take().is_some() {
            log::info!("{} encoder released", self.role);
        }
        Ok(())
    }
}
