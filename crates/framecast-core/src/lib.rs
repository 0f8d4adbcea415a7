//! Framecast core: shared domain types for the media converter.
//!
//! This crate carries everything the container layer and the pipeline agree
//! on: codec and container enums, track descriptors, sample positions,
//! encoded chunks, the unified error type, conversion options with their
//! capability matrix, progress snapshots, and the reader/writer seams to the
//! host environment.

pub mod error;
pub mod io;
pub mod media;
pub mod options;
pub mod progress;

pub use error::{CodecDirection, Error, Result};
pub use io::{BufferWriter, MemoryReader, OutputWriter, SourceReader};
pub use media::{
    micros_to_ticks, ticks_to_micros, AudioCodec, AudioProperties, ColorInfo, ContainerFormat,
    EncodedChunk, Rotation, SampleAspect, SamplePosition, TrackDescriptor, TrackProperties,
    VideoCodec, VideoProperties,
};
pub use options::{container_carries_audio, container_carries_video, ConversionOptions};
pub use progress::{MediaState, ProgressSender};
