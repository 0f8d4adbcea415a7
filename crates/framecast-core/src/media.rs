//! Media-domain types shared across the demuxers, the pipeline, and the
//! muxers: container/codec enums, track descriptors, sample positions, and
//! encoded chunks.
//!
//! All enums serialize in lowercase and implement `Display` manually for
//! consistent string representation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ContainerFormat
// ---------------------------------------------------------------------------

/// Supported container formats.
///
/// `Mkv` appears only on the input side; conversion targets are `Webm` and
/// `Mp4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    Webm,
    Mkv,
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mp4 => write!(f, "mp4"),
            Self::Webm => write!(f, "webm"),
            Self::Mkv => write!(f, "mkv"),
        }
    }
}

// ---------------------------------------------------------------------------
// VideoCodec
// ---------------------------------------------------------------------------

/// Supported video codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::H265 => write!(f, "h265"),
            Self::Vp8 => write!(f, "vp8"),
            Self::Vp9 => write!(f, "vp9"),
            Self::Av1 => write!(f, "av1"),
        }
    }
}

// ---------------------------------------------------------------------------
// AudioCodec
// ---------------------------------------------------------------------------

/// Supported audio codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Pcm,
    Mp3,
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aac => write!(f, "aac"),
            Self::Opus => write!(f, "opus"),
            Self::Pcm => write!(f, "pcm"),
            Self::Mp3 => write!(f, "mp3"),
        }
    }
}

// ---------------------------------------------------------------------------
// Track geometry helpers
// ---------------------------------------------------------------------------

/// Display rotation derived from the tkhd matrix (or absent for Matroska).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    None,
    #[serde(rename = "90")]
    Cw90,
    #[serde(rename = "180")]
    Cw180,
    #[serde(rename = "270")]
    Cw270,
}

impl Rotation {
    /// Clockwise rotation in degrees.
    pub fn degrees(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }
}

/// Pixel aspect ratio as numerator/denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleAspect {
    pub num: u32,
    pub den: u32,
}

impl Default for SampleAspect {
    fn default() -> Self {
        Self { num: 1, den: 1 }
    }
}

impl SampleAspect {
    pub fn is_square(&self) -> bool {
        self.num == self.den
    }
}

/// Colour description carried from the container, when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorInfo {
    pub primaries: Option<u16>,
    pub transfer: Option<u16>,
    pub matrix: Option<u16>,
    pub full_range: Option<bool>,
}

// ---------------------------------------------------------------------------
// TrackDescriptor
// ---------------------------------------------------------------------------

/// Video-specific track properties.
#[derive(Debug, Clone)]
pub struct VideoProperties {
    pub codec: VideoCodec,
    /// RFC 6381 codec string, e.g. `avc1.64001F`.
    pub codec_string: String,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Display aspect as carried by the container (tkhd for MP4,
    /// DisplayWidth/Height for Matroska). Falls back to coded dimensions.
    pub display_width: u32,
    pub display_height: u32,
    pub rotation: Rotation,
    pub sample_aspect: SampleAspect,
    pub color: Option<ColorInfo>,
    /// Opaque decoder initialization bytes (AVCC record, vpcC payload, ...).
    pub codec_private: Option<Bytes>,
}

/// Audio-specific track properties.
#[derive(Debug, Clone)]
pub struct AudioProperties {
    pub codec: AudioCodec,
    /// RFC 6381 codec string, e.g. `mp4a.40.2`.
    pub codec_string: String,
    pub channels: u32,
    pub sample_rate: u32,
    /// Opaque decoder initialization bytes (AudioSpecificConfig, OpusHead, ...).
    pub codec_private: Option<Bytes>,
}

/// Per-kind track properties.
#[derive(Debug, Clone)]
pub enum TrackProperties {
    Video(VideoProperties),
    Audio(AudioProperties),
}

/// One elementary track as described by the input container.
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
    /// Container-unique track identifier.
    pub id: u32,
    /// Ticks per second for this track's sample timestamps.
    pub timescale: u32,
    pub properties: TrackProperties,
}

impl TrackDescriptor {
    pub fn is_video(&self) -> bool {
        matches!(self.properties, TrackProperties::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.properties, TrackProperties::Audio(_))
    }

    pub fn video(&self) -> Option<&VideoProperties> {
        match &self.properties {
            TrackProperties::Video(v) => Some(v),
            TrackProperties::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioProperties> {
        match &self.properties {
            TrackProperties::Audio(a) => Some(a),
            TrackProperties::Video(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SamplePosition / EncodedChunk
// ---------------------------------------------------------------------------

/// One sample's location and timing within the source, in track timescale
/// ticks and decode order.
///
/// Invariants enforced by the demuxers: `size > 0`, `duration > 0`, and per
/// track `dts` strictly increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePosition {
    /// Absolute byte offset of the sample payload in the source.
    pub file_offset: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Decode timestamp in track timescale ticks.
    pub dts: i64,
    /// Composition timestamp in track timescale ticks.
    pub cts: i64,
    /// Duration in track timescale ticks.
    pub duration: u32,
    /// Whether the sample can start decoding (sync sample).
    pub is_keyframe: bool,
}

/// One encoded sample with its payload, timestamps normalized to microseconds.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub track_id: u32,
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub timestamp_micros: i64,
    pub duration_micros: u32,
    pub is_keyframe: bool,
}

/// Convert timescale ticks to microseconds, rounding to the nearest value.
///
/// Rounding (rather than truncation) matters: a truncated 48 kHz Opus frame
/// loses one tick per frame and drifts audibly over long inputs.
pub fn ticks_to_micros(ticks: i64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    let scale = i128::from(timescale);
    let micros = (i128::from(ticks) * 1_000_000 + scale / 2) / scale;
    micros as i64
}

/// Convert microseconds to timescale ticks, rounding to the nearest value.
pub fn micros_to_ticks(micros: i64, timescale: u32) -> i64 {
    let micros = i128::from(micros);
    let ticks = (micros * i128::from(timescale) + 500_000) / 1_000_000;
    ticks as i64
}
