use std::path::{Path, PathBuf};

use ffmpeg_next::Rational;

use crate::{
    muxer::ContainerWriter,
    sample::{MICROS, Sample},
    stream::{StreamDescriptor, Track},
};

/// An MP4 (or any extension-guessed) container file.
pub struct AvOutput {
    inner: ffmpeg_next::format::context::Output,
    path: PathBuf,
    have_written_header: bool,
    have_written_trailer: bool,
}

unsafe impl Send for AvOutput {}

impl AvOutput {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let output = ffmpeg_next::format::output(path)
            .map_err(|e| anyhow::anyhow!("open container {}: {}", path.display(), e))?;
        Ok(Self {
            inner: output,
            path: path.to_path_buf(),
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stream_time_base(&self, index: usize) -> anyhow::Result<Rational> {
        self.inner
            .stream(index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow::anyhow!("stream {} not found", index))
    }
}

impl ContainerWriter for AvOutput {
    fn add_track(&mut self, descriptor: &StreamDescriptor) -> anyhow::Result<usize> {
        let parameters = descriptor
            .parameters()
            .ok_or_else(|| anyhow::anyhow!("{} stream has no codec parameters", descriptor.role()))?;
        let mut writer_stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(parameters.id()))?;
        writer_stream.set_parameters(parameters.clone());
        writer_stream.set_time_base(descriptor.time_base());
        Ok(writer_stream.index())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.have_written_header {
            return Ok(());
        }
        self.inner.write_header()?;
        self.have_written_header = true;
        log::info!("container header written: {}", self.path.display());
        Ok(())
    }

    fn write_sample(&mut self, track: Track, sample: &Sample) -> anyhow::Result<()> {
        if !self.have_written_header {
            anyhow::bail!("container header not written");
        }
        let out_time_base = self.stream_time_base(track.index())?;

        let mut packet = ffmpeg_next::Packet::copy(sample.data());
        packet.set_pts(Some(sample.pts()));
        packet.set_dts(Some(sample.dts().unwrap_or(sample.pts())));
        packet.set_duration(sample.duration());
        if sample.flags().key_frame {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        packet.set_stream(track.index());
        packet.set_position(-1);
        packet.rescale_ts(MICROS, out_time_base);
        packet.write_interleaved(&mut self.inner)?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
            log::info!("container finalized: {}", self.path.display());
        }
        Ok(())
    }
}
