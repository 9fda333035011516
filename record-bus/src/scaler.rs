use ffmpeg_next::{format::Pixel, software::scaling};

/// Converts captured frames to the size and pixel format the encoder was opened with.
pub struct Scaler {
    context: scaling::Context,
    source: (Pixel, u32, u32),
}

impl Scaler {
    pub fn new(
        source: (Pixel, u32, u32),
        target: (Pixel, u32, u32),
    ) -> anyhow::Result<Self> {
        let context = scaling::Context::get(
            source.0,
            source.1,
            source.2,
            target.0,
            target.1,
            target.2,
            scaling::Flags::BILINEAR,
        )?;
        log::debug!(
            "scaler {:?} {}x{} -> {:?} {}x{}",
            source.0,
            source.1,
            source.2,
            target.0,
            target.1,
            target.2
        );
        Ok(Self { context, source })
    }

    /// Whether a frame with this geometry can go through the current context.
    pub fn accepts(&self, frame: &ffmpeg_next::frame::Video) -> bool {
        self.source == (frame.format(), frame.width(), frame.height())
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}
