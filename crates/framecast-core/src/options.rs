//! Conversion options and the capability matrix.
//!
//! Validation happens before any I/O: an unsupported combination is rejected
//! up front with [`Error::UnsupportedConfig`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::media::{AudioCodec, ContainerFormat, VideoCodec};

/// Requested output container and codecs for a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionOptions {
    /// Target container.
    pub to: ContainerFormat,
    /// Target video codec.
    pub video_codec: VideoCodec,
    /// Target audio codec.
    pub audio_codec: AudioCodec,
}

impl ConversionOptions {
    /// The WebM target: VP8 video + Opus audio.
    pub fn webm() -> Self {
        Self {
            to: ContainerFormat::Webm,
            video_codec: VideoCodec::Vp8,
            audio_codec: AudioCodec::Opus,
        }
    }

    /// The MP4 target: H.264 video + AAC audio.
    pub fn mp4() -> Self {
        Self {
            to: ContainerFormat::Mp4,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
        }
    }

    /// Check this combination against the capability matrix.
    ///
    /// Accepted combinations: `webm` with vp8+opus, `mp4` with h264+aac.
    /// Everything else fails before any source byte is read.
    pub fn validate(&self) -> Result<()> {
        match self.to {
            ContainerFormat::Webm => {
                if self.video_codec != VideoCodec::Vp8 {
                    return Err(Error::unsupported_config("video_codec", self.video_codec));
                }
                if self.audio_codec != AudioCodec::Opus {
                    return Err(Error::unsupported_config("audio_codec", self.audio_codec));
                }
                Ok(())
            }
            ContainerFormat::Mp4 => {
                if self.video_codec != VideoCodec::H264 {
                    return Err(Error::unsupported_config("video_codec", self.video_codec));
                }
                if self.audio_codec != AudioCodec::Aac {
                    return Err(Error::unsupported_config("audio_codec", self.audio_codec));
                }
                Ok(())
            }
            ContainerFormat::Mkv => Err(Error::unsupported_config("to", self.to)),
        }
    }
}

/// Whether `container` natively carries `codec` for video tracks.
///
/// This drives the copy-vs-transcode decision: a track whose input codec is
/// already carried by the target container can be forwarded bit-for-bit.
pub fn container_carries_video(container: ContainerFormat, codec: VideoCodec) -> bool {
    match container {
        ContainerFormat::Webm => matches!(codec, VideoCodec::Vp8 | VideoCodec::Vp9),
        ContainerFormat::Mp4 => matches!(codec, VideoCodec::H264 | VideoCodec::H265),
        ContainerFormat::Mkv => true,
    }
}

/// Whether `container` natively carries `codec` for audio tracks.
pub fn container_carries_audio(container: ContainerFormat, codec: AudioCodec) -> bool {
    match container {
        ContainerFormat::Webm => matches!(codec, AudioCodec::Opus),
        ContainerFormat::Mp4 => matches!(codec, AudioCodec::Aac),
        ContainerFormat::Mkv => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webm_vp8_opus_accepted() {
        assert!(ConversionOptions::webm().validate().is_ok());
    }

    #[test]
    fn mp4_h264_aac_accepted() {
        assert!(ConversionOptions::mp4().validate().is_ok());
    }

    #[test]
    fn webm_with_h264_rejected() {
        let opts = ConversionOptions {
            video_codec: VideoCodec::H264,
            ..ConversionOptions::webm()
        };
        let err = opts.validate().unwrap_err();
        match err {
            Error::UnsupportedConfig { option, value } => {
                assert_eq!(option, "video_codec");
                assert_eq!(value, "h264");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mp4_with_opus_rejected() {
        let opts = ConversionOptions {
            audio_codec: AudioCodec::Opus,
            ..ConversionOptions::mp4()
        };
        assert!(matches!(
            opts.validate(),
            Err(Error::UnsupportedConfig { .. })
        ));
    }

    #[test]
    fn mkv_target_rejected() {
        let opts = ConversionOptions {
            to: ContainerFormat::Mkv,
            ..ConversionOptions::webm()
        };
        assert!(matches!(
            opts.validate(),
            Err(Error::UnsupportedConfig { .. })
        ));
    }

    #[test]
    fn copy_matrix() {
        assert!(container_carries_video(ContainerFormat::Webm, VideoCodec::Vp9));
        assert!(!container_carries_video(ContainerFormat::Webm, VideoCodec::H264));
        assert!(container_carries_video(ContainerFormat::Mp4, VideoCodec::H265));
        assert!(container_carries_audio(ContainerFormat::Mp4, AudioCodec::Aac));
        assert!(!container_carries_audio(ContainerFormat::Mp4, AudioCodec::Opus));
    }
}
