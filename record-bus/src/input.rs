use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;

use ffmpeg_next::{Dictionary, Rational, codec::Parameters, format::stream};

unsafe impl Send for InputStream {}
unsafe impl Sync for InputStream {}

/// A stream of an opened capture device.
pub struct InputStream {
    index: usize,
    parameters: Parameters,
    time_base: Rational,
}

impl InputStream {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn is_video(&self) -> bool {
        self.parameters.medium() == ffmpeg_next::media::Type::Video
    }

    pub fn is_audio(&self) -> bool {
        self.parameters.medium() == ffmpeg_next::media::Type::Audio
    }
}

impl From<stream::Stream<'_>> for InputStream {
    fn from(stream: stream::Stream<'_>) -> Self {
        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
        }
    }
}

impl Clone for InputStream {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
        }
    }
}

pub struct InputPacket {
    packet: ffmpeg_next::Packet,
    time_base: Rational,
}

impl InputPacket {
    pub fn stream_index(&self) -> usize {
        self.packet.stream()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn data(&self) -> &[u8] {
        self.packet.data().unwrap_or_default()
    }

    pub fn get_mut(&mut self) -> &mut ffmpeg_next::Packet {
        &mut self.packet
    }
}

/// A capture device (x11grab, pulse, ...) opened through libavdevice.
pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    streams: HashMap<usize, InputStream>,
}

impl AvInput {
    /// Resolve input format by name (e.g. "x11grab", "pulse") via FFmpeg's av_find_input_format.
    fn find_input_format(name: &str) -> anyhow::Result<ffmpeg_next::format::format::Input> {
        let cname = CString::new(name)
            .map_err(|e| anyhow::anyhow!("invalid format name {:?}: {}", name, e))?;
        let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(anyhow::anyhow!("input format not found: {}", name));
        }
        Ok(unsafe { ffmpeg_next::format::format::Input::wrap(ptr as *mut _) })
    }

    pub fn open(url: &str, format: &str, options: Dictionary) -> anyhow::Result<Self> {
        use ffmpeg_next::format::format::Format;

        let fmt = Self::find_input_format(format)?;
        let input = ffmpeg_next::format::open_with(Path::new(url), &Format::Input(fmt), options)
            .map_err(|e| anyhow::anyhow!("open {} input {:?}: {}", format, url, e))?
            .input();

        let mut streams = HashMap::new();
        for stream in input.streams() {
            streams.insert(stream.index(), InputStream::from(stream));
        }
        log::debug!("opened {} input {:?} with {} stream(s)", format, url, streams.len());

        Ok(Self {
            inner: input,
            streams,
        })
    }

    pub fn first_video(&self) -> Option<&InputStream> {
        self.streams.values().find(|s| s.is_video())
    }

    pub fn first_audio(&self) -> Option<&InputStream> {
        self.streams.values().find(|s| s.is_audio())
    }

    /// Blocks until the device delivers the next packet. `None` at end of input.
    pub fn read_packet(&mut self) -> anyhow::Result<Option<InputPacket>> {
        let mut packet = ffmpeg_next::Packet::empty();
        match packet.read(&mut self.inner) {
            Ok(()) => {
                let time_base = self
                    .streams
                    .get(&packet.stream())
                    .map(|s| s.time_base())
                    .unwrap_or(crate::sample::MICROS);
                Ok(Some(InputPacket { packet, time_base }))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
