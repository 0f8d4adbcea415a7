//! Container muxers.
//!
//! - [`mp4`] - ftyp/moov/mdat writer for H.264 + AAC
//! - [`webm`] - EBML/Matroska writer for VP8/VP9 + Opus

pub mod mp4;
pub mod webm;

pub use mp4::{Mp4Muxer, Mp4MuxerOptions};
pub use webm::WebmMuxer;
