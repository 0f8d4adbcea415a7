//! The platform codec facility seam.
//!
//! Real codec implementations (WebCodecs, hardware encoders, software
//! fallbacks) live in the host; the pipeline only sees these traits. The
//! decode/encode calls are poll-style: each submission returns whatever
//! output became available, possibly empty while the codec buffers for
//! reordering, and `flush` drains the rest.

use async_trait::async_trait;
use bytes::Bytes;
use framecast_core::media::{AudioCodec, EncodedChunk, VideoCodec};

use crate::frame::{AudioFrame, VideoFrame};

/// Latency/quality tradeoff requested from encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyMode {
    Realtime,
    #[default]
    Quality,
}

/// One encoded sample produced by an encoder, before a track id is assigned.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub timestamp_micros: i64,
    pub duration_micros: u32,
    pub is_keyframe: bool,
}

impl EncodedPacket {
    /// Attach a muxer track id, producing a chunk.
    pub fn into_chunk(self, track_id: u32) -> EncodedChunk {
        EncodedChunk {
            track_id,
            data: self.data,
            timestamp_micros: self.timestamp_micros,
            duration_micros: self.duration_micros,
            is_keyframe: self.is_keyframe,
        }
    }
}

// ---------------------------------------------------------------------------
// Configurations
// ---------------------------------------------------------------------------

/// Configuration for a video decoder.
#[derive(Debug, Clone)]
pub struct VideoDecoderConfig {
    /// RFC 6381 codec string from the track descriptor.
    pub codec_string: String,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Codec-private initialization bytes (AVCC record, vpcC, ...).
    pub description: Option<Bytes>,
}

/// Configuration for a video encoder.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    pub framerate: f64,
    pub latency_mode: LatencyMode,
}

/// Configuration for an audio decoder.
#[derive(Debug, Clone)]
pub struct AudioDecoderConfig {
    pub codec_string: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub description: Option<Bytes>,
}

/// Configuration for an audio encoder.
#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    pub codec: AudioCodec,
    pub channels: u32,
    pub sample_rate: u32,
    pub bitrate: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error surfaced by a codec implementation.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The configuration is not supported by this codec.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The codec was used before `configure` or after `close`.
    #[error("codec closed")]
    Closed,

    /// The codec failed mid-stream.
    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Codec traits
// ---------------------------------------------------------------------------

/// Decodes encoded video chunks into raw frames.
#[async_trait]
pub trait VideoDecoder: Send {
    fn configure(&mut self, config: &VideoDecoderConfig) -> Result<(), CodecError>;

    /// Submit one chunk. Returns the frames that became available; may be
    /// empty while the decoder buffers for reordering.
    async fn decode(&mut self, chunk: &EncodedChunk) -> Result<Vec<VideoFrame>, CodecError>;

    /// Drain all remaining frames.
    async fn flush(&mut self) -> Result<Vec<VideoFrame>, CodecError>;

    fn close(&mut self);
}

/// Encodes raw video frames into an elementary stream.
#[async_trait]
pub trait VideoEncoder: Send {
    fn configure(&mut self, config: &VideoEncoderConfig) -> Result<(), CodecError>;

    /// Submit one frame. `force_keyframe` requests a sync point.
    async fn encode(
        &mut self,
        frame: VideoFrame,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedPacket>, CodecError>;

    /// Drain all remaining packets.
    async fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError>;

    /// Codec-private bytes for container registration (e.g. OpusHead,
    /// AVCC), available after `configure`.
    fn codec_private(&self) -> Option<Bytes>;

    fn close(&mut self);
}

/// Decodes encoded audio chunks into PCM frames.
#[async_trait]
pub trait AudioDecoder: Send {
    fn configure(&mut self, config: &AudioDecoderConfig) -> Result<(), CodecError>;

    async fn decode(&mut self, chunk: &EncodedChunk) -> Result<Vec<AudioFrame>, CodecError>;

    async fn flush(&mut self) -> Result<Vec<AudioFrame>, CodecError>;

    fn close(&mut self);
}

/// Encodes PCM frames into an elementary stream.
#[async_trait]
pub trait AudioEncoder: Send {
    fn configure(&mut self, config: &AudioEncoderConfig) -> Result<(), CodecError>;

    async fn encode(&mut self, frame: AudioFrame) -> Result<Vec<EncodedPacket>, CodecError>;

    async fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError>;

    fn codec_private(&self) -> Option<Bytes>;

    fn close(&mut self);
}

/// Factory handing out codec instances for the transcode path.
pub trait CodecProvider: Send + Sync {
    fn video_decoder(&self) -> Result<Box<dyn VideoDecoder>, CodecError>;
    fn video_encoder(&self) -> Result<Box<dyn VideoEncoder>, CodecError>;
    fn audio_decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError>;
    fn audio_encoder(&self) -> Result<Box<dyn AudioEncoder>, CodecError>;
}
