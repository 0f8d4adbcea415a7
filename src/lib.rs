//! Framecast - streaming media converter core.
//!
//! Reads MP4 (plain or fragmented) and Matroska/WebM sources, demuxes their
//! elementary tracks, optionally re-encodes frames through a pluggable codec
//! facility, and remuxes into WebM (VP8 + Opus) or MP4 (H.264 + AAC).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framecast::{convert, ConversionOptions, ConvertRequest, MemoryReader};
//!
//! # async fn run() -> framecast::Result<()> {
//! let source = std::fs::read("input.mp4")?;
//! let request = ConvertRequest::new(
//!     ConversionOptions::mp4(),
//!     Arc::new(MemoryReader::new(source)),
//! );
//! let conversion = convert(request).await?;
//! std::fs::write("output.mp4", conversion.save())?;
//! # Ok(())
//! # }
//! ```
//!
//! The copy path forwards tracks whose codec the target container already
//! carries; everything else requires a [`CodecProvider`] supplied in the
//! request. Cancellation is cooperative through the request's `signal`
//! token, and progress arrives as [`MediaState`] snapshots.

pub use framecast_core::{
    AudioCodec, BufferWriter, ContainerFormat, ConversionOptions, EncodedChunk, Error, MediaState,
    MemoryReader, OutputWriter, ProgressSender, Result, SamplePosition, SourceReader,
    TrackDescriptor, TrackProperties, VideoCodec,
};
pub use framecast_media::{
    demuxer_for, detect_format, DemuxEvent, Demuxer, MkvDemuxer, Mp4Demuxer, Mp4Muxer,
    Mp4MuxerOptions, WebmMuxer,
};
pub use framecast_pipeline::{
    convert, AudioDecoder, AudioEncoder, CodecError, CodecProvider, Conversion, ConvertRequest,
    EncodedPacket, LatencyMode, VideoDecoder, VideoEncoder, VideoFrame, VideoFrameHook,
};
