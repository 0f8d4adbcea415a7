//! Framecast media: container demuxing and muxing.
//!
//! The demuxers are incremental push-driven state machines over MP4
//! (ISO-BMFF) and Matroska/WebM; they emit track descriptors and per-sample
//! positions without buffering payload data. The muxers serialize encoded
//! chunks back into WebM (VP8/VP9 + Opus) or MP4 (H.264 + AAC).

pub mod cursor;
pub mod demux;
pub mod error;
pub mod mkv;
pub mod mp4;
pub mod mux;

pub use cursor::ByteCursor;
pub use demux::{demuxer_for, detect_format, DemuxEvent, Demuxer};
pub use error::{ParseError, ParseResult};
pub use mkv::MkvDemuxer;
pub use mp4::Mp4Demuxer;
pub use mux::{Mp4Muxer, Mp4MuxerOptions, WebmMuxer};
