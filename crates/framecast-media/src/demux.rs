//! Shared demuxer contract for both container formats.
//!
//! A demuxer is a push-driven state machine: the driver feeds it byte windows
//! in file order and drains typed events. Incomplete structures are buffered
//! internally and replayed when more bytes arrive, so the driver never sees
//! `Incomplete`; malformed data surfaces as a fatal [`ParseError`].

use framecast_core::media::{ContainerFormat, SamplePosition, TrackDescriptor};

use crate::error::ParseResult;
use crate::mkv::MkvDemuxer;
use crate::mp4::Mp4Demuxer;

/// One demuxer output.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// A newly discovered track. Emitted before any of its samples.
    Track(TrackDescriptor),
    /// A batch of sample positions for one track, in decode order.
    Samples {
        track_id: u32,
        positions: Vec<SamplePosition>,
    },
    /// The container is fully parsed; no further events follow.
    Done,
}

/// Push-driven container demuxer.
pub trait Demuxer: Send {
    /// The container format this demuxer parses.
    fn format(&self) -> ContainerFormat;

    /// Feed the next window of source bytes, in file order.
    fn push(&mut self, data: &[u8]) -> ParseResult<()>;

    /// Drain the next pending event, if any.
    fn poll_event(&mut self) -> Option<DemuxEvent>;

    /// Signal end of input. Fails when the source ends mid-structure.
    fn finish(&mut self) -> ParseResult<()>;
}

/// Sniff the container format from the first bytes of the source.
///
/// ISO-BMFF starts with a box header whose type is almost always `ftyp`;
/// Matroska/WebM starts with the EBML magic `0x1A45DFA3`.
pub fn detect_format(head: &[u8]) -> Option<ContainerFormat> {
    if head.len() >= 4 && head[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return Some(ContainerFormat::Webm);
    }
    if head.len() >= 8 {
        let four_cc = &head[4..8];
        if matches!(four_cc, b"ftyp" | b"moov" | b"moof" | b"free" | b"skip" | b"wide") {
            return Some(ContainerFormat::Mp4);
        }
    }
    None
}

/// Construct a demuxer for the detected input format.
pub fn demuxer_for(format: ContainerFormat) -> Box<dyn Demuxer> {
    match format {
        ContainerFormat::Mp4 => Box::new(Mp4Demuxer::new()),
        ContainerFormat::Webm | ContainerFormat::Mkv => Box::new(MkvDemuxer::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_mp4_by_ftyp() {
        let mut head = Vec::new();
        head.extend_from_slice(&24u32.to_be_bytes());
        head.extend_from_slice(b"ftyp");
        assert_eq!(detect_format(&head), Some(ContainerFormat::Mp4));
    }

    #[test]
    fn detect_webm_by_ebml_magic() {
        let head = [0x1A, 0x45, 0xDF, 0xA3, 0x9F];
        assert_eq!(detect_format(&head), Some(ContainerFormat::Webm));
    }

    #[test]
    fn detect_rejects_garbage() {
        assert_eq!(detect_format(b"RIFF....WAVE"), None);
        assert_eq!(detect_format(&[0x00]), None);
    }
}
