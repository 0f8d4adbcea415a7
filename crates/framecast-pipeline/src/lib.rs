//! Framecast pipeline: the conversion engine.
//!
//! Wires a container demuxer to per-track codec stages and a target muxer,
//! with cooperative cancellation, bounded in-flight windows, and progress
//! snapshots. Codec implementations are supplied by the host through the
//! [`codec::CodecProvider`] seam.

pub mod codec;
pub mod context;
pub mod controller;
pub mod frame;
pub mod stage;

pub use codec::{
    AudioDecoder, AudioDecoderConfig, AudioEncoder, AudioEncoderConfig, CodecError, CodecProvider,
    EncodedPacket, LatencyMode, VideoDecoder, VideoDecoderConfig, VideoEncoder, VideoEncoderConfig,
};
pub use context::PipelineContext;
pub use controller::{convert, Conversion, ConvertRequest};
pub use frame::{AudioFrame, PixelFormat, VideoFrame};
pub use stage::{CodecStage, StageOutput, VideoFrameHook, AUDIO_IN_FLIGHT, VIDEO_IN_FLIGHT};
