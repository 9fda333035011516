use std::fmt::{Display, Formatter};

use ffmpeg_next::{Rational, codec::Parameters};

/// Which elementary stream a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackRole {
    Video,
    Audio,
}

impl TrackRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackRole::Video => "video",
            TrackRole::Audio => "audio",
        }
    }
}

impl Display for TrackRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream registered with the multiplexer. Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Track {
    index: usize,
    role: TrackRole,
}

impl Track {
    pub(crate) fn new(index: usize, role: TrackRole) -> Self {
        Self { index, role }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> TrackRole {
        self.role
    }
}

impl Display for Track {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.role, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Video {
        width: u32,
        height: u32,
        frame_rate: Rational,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
    },
}

unsafe impl Send for StreamDescriptor {}
unsafe impl Sync for StreamDescriptor {}

/// Codec metadata of one encoded stream, known only once the encoder has
/// reported its output format.
pub struct StreamDescriptor {
    role: TrackRole,
    codec: String,
    format: MediaFormat,
    time_base: Rational,
    parameters: Option<Parameters>,
}

impl StreamDescriptor {
    pub fn new(role: TrackRole, codec: &str, format: MediaFormat, time_base: Rational) -> Self {
        Self {
            role,
            codec: codec.to_string(),
            format,
            time_base,
            parameters: None,
        }
    }

    /// Attach the codec parameters a container needs to declare the stream.
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn role(&self) -> TrackRole {
        self.role
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn format(&self) -> MediaFormat {
        self.format
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn parameters(&self) -> Option<&Parameters> {
        self.parameters.as_ref()
    }

    pub fn is_video(&self) -> bool {
        self.role == TrackRole::Video
    }

    pub fn is_audio(&self) -> bool {
        self.role == TrackRole::Audio
    }
}

impl Clone for StreamDescriptor {
    fn clone(&self) -> Self {
        Self {
            role: self.role,
            codec: self.codec.clone(),
            format: self.format,
            time_base: self.time_base,
            parameters: self.parameters.clone(),
        }
    }
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("role", &self.role)
            .field("codec", &self.codec)
            .field("format", &self.format)
            .field("time_base", &self.time_base)
            .field("has_parameters", &self.parameters.is_some())
            .finish()
    }
}
