//! ISO-BMFF muxing.

pub(crate) mod boxes;
mod muxer;

pub use muxer::{Mp4Muxer, Mp4MuxerOptions};
