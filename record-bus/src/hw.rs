//! Hardware encoder discovery.
//!
//! Hardware H.264/HEVC encoders (NVENC/VAAPI/QSV/V4L2M2M) are tried before the
//! software codec; the caller falls back when opening one fails.

/// Try to find a hardware-accelerated encoder for the given software codec name.
/// Returns the first available hardware encoder, or None if none is found.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_encoder(codec_name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| codec_name.contains(suffix))
}

/// Pixel format the encoder is opened with. Grabbed screens arrive as packed
/// RGB and are always converted; hardware encoders prefer NV12.
pub fn pixel_format_for_encoder(codec_name: &str) -> ffmpeg_next::format::Pixel {
    if is_hw_encoder(codec_name) {
        ffmpeg_next::format::Pixel::NV12
    } else {
        ffmpeg_next::format::Pixel::YUV420P
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_for_encoder() {
        assert_eq!(
            pixel_format_for_encoder("libx264"),
            ffmpeg_next::format::Pixel::YUV420P
        );
        assert_eq!(
            pixel_format_for_encoder("h264_nvenc"),
            ffmpeg_next::format::Pixel::NV12
        );
    }

    #[test]
    fn test_unknown_codec_has_no_hw_encoder() {
        assert!(find_hw_encoder("pcm_s16le").is_none());
        assert!(!is_hw_encoder("aac"));
    }
}
