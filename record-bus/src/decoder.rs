use ffmpeg_next::Rational;

use crate::{
    frame::RawVideoFrame,
    input::{InputPacket, InputStream},
};

/// Decodes the raw video packets a grab device produces into frames.
pub struct VideoDecoder {
    inner: ffmpeg_next::codec::decoder::Video,
    decoder_time_base: Rational,
}

impl VideoDecoder {
    pub fn new(stream: &InputStream) -> anyhow::Result<Self> {
        if !stream.is_video() {
            return Err(anyhow::anyhow!("stream {} is not video", stream.index()));
        }
        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = stream.time_base().into();
        }
        decoder_ctx.set_parameters(stream.parameters().clone())?;

        let decoder = decoder_ctx.decoder().video()?;
        if decoder.format() == ffmpeg_next::format::Pixel::None
            || decoder.width() == 0
            || decoder.height() == 0
        {
            return Err(anyhow::anyhow!("missing codec parameters"));
        }
        log::info!(
            "capture decoder: {}x{} {:?}",
            decoder.width(),
            decoder.height(),
            decoder.format()
        );

        Ok(Self {
            decoder_time_base: decoder.time_base(),
            inner: decoder,
        })
    }

    pub fn send_packet(&mut self, mut packet: InputPacket) -> anyhow::Result<()> {
        let time_base = packet.time_base();
        let p = packet.get_mut();
        p.rescale_ts(time_base, self.decoder_time_base);
        self.inner.send_packet(p)?;
        Ok(())
    }

    pub fn receive_frame(&mut self) -> anyhow::Result<Option<RawVideoFrame>> {
        let mut frame = ffmpeg_next::frame::Video::empty();
        match self.inner.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(RawVideoFrame::from(frame))),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}
