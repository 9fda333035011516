use bytes::Bytes;
use ffmpeg_next::{Rational, Rescale};

/// Time base of every [`Sample`] timestamp.
pub const MICROS: Rational = Rational(1, 1_000_000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub key_frame: bool,
    /// Codec configuration data (SPS/PPS, AudioSpecificConfig), not media.
    pub codec_config: bool,
    pub end_of_stream: bool,
}

/// One unit of compressed encoder output.
#[derive(Clone)]
pub struct Sample {
    data: Bytes,
    pts: i64,
    dts: Option<i64>,
    duration: i64,
    flags: SampleFlags,
}

impl Sample {
    pub fn new(data: Bytes, pts: i64) -> Self {
        Self {
            data,
            pts,
            dts: None,
            duration: 0,
            flags: SampleFlags::default(),
        }
    }

    /// Terminal sample emitted once the encoder has flushed everything.
    pub fn end_of_stream(pts: i64) -> Self {
        Self::new(Bytes::new(), pts).with_flags(SampleFlags {
            end_of_stream: true,
            ..SampleFlags::default()
        })
    }

    pub fn with_flags(mut self, flags: SampleFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    /// Converts an encoder packet stamped in `time_base` into a sample in microseconds.
    pub(crate) fn from_packet(packet: &ffmpeg_next::Packet, time_base: Rational) -> Self {
        let data = packet
            .data()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        let pts = packet.pts().unwrap_or(0).rescale(time_base, MICROS);
        let mut sample = Self::new(data, pts)
            .with_duration(packet.duration().rescale(time_base, MICROS))
            .with_flags(SampleFlags {
                key_frame: packet.is_key(),
                ..SampleFlags::default()
            });
        if let Some(dts) = packet.dts() {
            sample = sample.with_dts(dts.rescale(time_base, MICROS));
        }
        sample
    }

    /// Presentation timestamp in microseconds.
    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn flags(&self) -> SampleFlags {
        self.flags
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.end_of_stream
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.codec_config
    }

    /// Only real media may reach the container: empty payloads, codec
    /// configuration and pre-roll (non-positive pts) are discarded.
    pub fn is_writable(&self) -> bool {
        self.size() > 0 && !self.flags.codec_config && self.pts > 0
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("size", &self.size())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writable_sample() {
        let sample = Sample::new(Bytes::from_static(&[0, 0, 1]), 33_000);
        assert!(sample.is_writable());
    }

    #[test]
    fn test_pre_roll_and_config_are_not_writable() {
        let zero_pts = Sample::new(Bytes::from_static(&[1, 2]), 0);
        assert!(!zero_pts.is_writable());

        let negative_pts = Sample::new(Bytes::from_static(&[1, 2]), -23_219);
        assert!(!negative_pts.is_writable());

        let empty = Sample::new(Bytes::new(), 40_000);
        assert!(!empty.is_writable());

        let config = Sample::new(Bytes::from_static(&[0x12, 0x10]), 40_000).with_flags(
            SampleFlags {
                codec_config: true,
                ..SampleFlags::default()
            },
        );
        assert!(!config.is_writable());
    }

    #[test]
    fn test_end_of_stream_marker() {
        let eos = Sample::end_of_stream(1_000_000);
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.size(), 0);
        assert!(!eos.is_writable());
    }

    #[test]
    fn test_from_packet_rescales_to_micros() {
        let mut packet = ffmpeg_next::Packet::copy(&[9u8; 16]);
        packet.set_pts(Some(44_100));
        packet.set_dts(Some(44_100));
        packet.set_duration(1024);
        let sample = Sample::from_packet(&packet, Rational(1, 44_100));
        assert_eq!(sample.pts(), 1_000_000);
        assert_eq!(sample.dts(), Some(1_000_000));
        assert_eq!(sample.size(), 16);
        assert_eq!(sample.duration(), 23_220);
    }
}
