//! ISO-BMFF (MP4) container parsing.
//!
//! - [`atoms`] - box identification and header parsing
//! - [`codec`] - RFC 6381 codec strings from sample-entry children
//! - [`sample_table`] - stbl resolution for non-fragmented files
//! - [`fragments`] - moof/traf/trun resolution for fragmented files
//! - [`demuxer`] - the incremental top-level state machine

pub mod atoms;
pub mod codec;
pub mod demuxer;
pub mod fragments;
pub mod sample_table;

pub use atoms::{BoxHeader, FourCc, OpaqueBox};
pub use demuxer::Mp4Demuxer;
pub use fragments::{Tfhd, TrackFragment, Trex, Trun, TrunSample};
pub use sample_table::{resolve_positions, SampleTables};
