//! Incremental ISO-BMFF demuxer.
//!
//! The top-level scan is a three-state machine: read a box header, collect
//! `moov`/`moof` in full, skip everything else without buffering (`mdat` in
//! particular never lands in memory). Collected boxes are walked recursively;
//! track descriptors and sample positions come out as [`DemuxEvent`]s.

use bytes::Bytes;
use framecast_core::media::{
    AudioProperties, ColorInfo, ContainerFormat, Rotation, SampleAspect, SamplePosition,
    TrackDescriptor, TrackProperties, VideoCodec, VideoProperties,
};
use std::collections::{HashMap, VecDeque};

use crate::cursor::ByteCursor;
use crate::demux::{DemuxEvent, Demuxer};
use crate::error::{ParseError, ParseResult};
use crate::mp4::atoms::{BoxHeader, FourCc, OpaqueBox};
use crate::mp4::codec;
use crate::mp4::fragments::{self as frag, Tfhd, TrackFragment, Trex, Trun, TrunSample};
use crate::mp4::sample_table::{
    resolve_positions, CttsEntry, SampleTables, StscEntry, SttsEntry,
};

/// Top-level scan state.
#[derive(Debug, Clone, Copy)]
enum ScanState {
    /// Waiting for the next box header; `buf[0]` is the start of a box.
    Scan,
    /// Buffering a full moov/moof of the given total size.
    Collect { header: BoxHeader },
    /// Discarding the remainder of a skipped box. `None` means "to end of
    /// file" (wire size 0).
    Skip { remaining: Option<u64> },
}

/// Incremental MP4/ISO-BMFF demuxer.
pub struct Mp4Demuxer {
    state: ScanState,
    buf: Vec<u8>,
    /// Absolute source offset of `buf[0]`.
    buf_base: u64,
    events: VecDeque<DemuxEvent>,
    /// trex defaults keyed by track id, from moov/mvex.
    trex: HashMap<u32, Trex>,
    /// Running decode time per track across fragments.
    decode_times: HashMap<u32, u64>,
    /// Last emitted DTS per track, for the monotonicity invariant.
    last_dts: HashMap<u32, i64>,
    /// Boxes we do not interpret, preserved for diagnostics.
    unknown: Vec<OpaqueBox>,
    moov_seen: bool,
    moov_offset: Option<u64>,
    mdat_offset: Option<u64>,
    finished: bool,
}

impl Default for Mp4Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mp4Demuxer {
    pub fn new() -> Self {
        Self {
            state: ScanState::Scan,
            buf: Vec::new(),
            buf_base: 0,
            events: VecDeque::new(),
            trex: HashMap::new(),
            decode_times: HashMap::new(),
            last_dts: HashMap::new(),
            unknown: Vec::new(),
            moov_seen: false,
            moov_offset: None,
            mdat_offset: None,
            finished: false,
        }
    }

    /// Boxes the demuxer skipped without interpreting.
    pub fn unknown_boxes(&self) -> &[OpaqueBox] {
        &self.unknown
    }

    /// Whether moov precedes mdat (progressive playback without seeking).
    pub fn has_faststart(&self) -> bool {
        match (self.moov_offset, self.mdat_offset) {
            (Some(moov), Some(mdat)) => moov < mdat,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.buf_base += n as u64;
    }

    fn drive(&mut self) -> ParseResult<()> {
        loop {
            match self.state {
                ScanState::Scan => {
                    let mut cursor = ByteCursor::new(&self.buf, self.buf_base);
                    let header = match BoxHeader::parse(&mut cursor) {
                        Ok(h) => h,
                        Err(ParseError::Incomplete) => return Ok(()),
                        Err(e) => return Err(e),
                    };

                    match header.four_cc {
                        FourCc::MOOV | FourCc::MOOF => {
                            if header.four_cc == FourCc::MOOV && self.moov_offset.is_none() {
                                self.moov_offset = Some(header.offset);
                            }
                            let size = header.size.ok_or_else(|| {
                                ParseError::malformed(
                                    "box header",
                                    header.offset,
                                    format!("{} with unbounded size", header.four_cc),
                                )
                            })?;
                            if size > MAX_COLLECTED_BOX {
                                return Err(ParseError::malformed(
                                    "box header",
                                    header.offset,
                                    format!("{} of {size} bytes exceeds limit", header.four_cc),
                                ));
                            }
                            self.state = ScanState::Collect { header };
                        }
                        other => {
                            if other == FourCc::MDAT && self.mdat_offset.is_none() {
                                self.mdat_offset = Some(header.offset);
                            }
                            if !matches!(other, FourCc::FTYP | FourCc::MDAT | FourCc::FREE | FourCc::SKIP)
                            {
                                tracing::debug!(box_type = %other, offset = header.offset, "skipping box");
                            }
                            self.unknown.push(OpaqueBox {
                                four_cc: other,
                                offset: header.offset,
                                size: header.size.unwrap_or(0),
                            });
                            let consumed = u64::from(header.header_len);
                            self.consume(header.header_len as usize);
                            self.state = ScanState::Skip {
                                remaining: header.size.map(|s| s - consumed),
                            };
                        }
                    }
                }
                ScanState::Collect { header } => {
                    let total = header.size.unwrap_or(0);
                    if (self.buf.len() as u64) < total {
                        return Ok(());
                    }
                    let total = total as usize;
                    let payload_start = header.header_len as usize;
                    let payload = &self.buf[payload_start..total];
                    let payload_base = self.buf_base + payload_start as u64;

                    if header.four_cc == FourCc::MOOV {
                        let events = parse_moov(
                            payload,
                            payload_base,
                            &mut self.trex,
                            &mut self.last_dts,
                        )
                        .map_err(|e| fatal(e, "moov", header.offset))?;
                        self.events.extend(events);
                        self.moov_seen = true;
                    } else {
                        let events = parse_moof(
                            payload,
                            payload_base,
                            header.offset,
                            &self.trex,
                            &mut self.decode_times,
                            &mut self.last_dts,
                        )
                        .map_err(|e| fatal(e, "moof", header.offset))?;
                        self.events.extend(events);
                    }

                    self.consume(total);
                    self.state = ScanState::Scan;
                }
                ScanState::Skip { remaining } => {
                    match remaining {
                        None => {
                            // Runs to end of file; keep discarding.
                            let n = self.buf.len();
                            self.consume(n);
                            return Ok(());
                        }
                        Some(remaining) => {
                            let take = remaining.min(self.buf.len() as u64) as usize;
                            self.consume(take);
                            let left = remaining - take as u64;
                            if left == 0 {
                                self.state = ScanState::Scan;
                            } else {
                                self.state = ScanState::Skip {
                                    remaining: Some(left),
                                };
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Upper bound for boxes collected in memory, guarding against malformed
/// sizes pointing at the whole file.
const MAX_COLLECTED_BOX: u64 = 256 * 1024 * 1024;

/// A fully collected box that still runs out of bytes mid-parse is
/// malformed, not incomplete: there are no more bytes coming for it.
fn fatal(e: ParseError, context: &'static str, offset: u64) -> ParseError {
    if e.is_incomplete() {
        ParseError::malformed(context, offset, "truncated box content")
    } else {
        e
    }
}

impl Demuxer for Mp4Demuxer {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Mp4
    }

    fn push(&mut self, data: &[u8]) -> ParseResult<()> {
        if self.finished {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        self.drive()
    }

    fn poll_event(&mut self) -> Option<DemuxEvent> {
        self.events.pop_front()
    }

    fn finish(&mut self) -> ParseResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        match &self.state {
            ScanState::Collect { header } => {
                return Err(ParseError::malformed(
                    "box",
                    header.offset,
                    format!("source ended inside {}", header.four_cc),
                ));
            }
            ScanState::Skip {
                remaining: Some(left),
            } if *left > 0 => {
                tracing::warn!(missing = left, "source ended inside a skipped box");
            }
            ScanState::Scan if !self.buf.is_empty() => {
                return Err(ParseError::malformed(
                    "box header",
                    self.buf_base,
                    format!("{} trailing bytes", self.buf.len()),
                ));
            }
            _ => {}
        }

        if !self.moov_seen {
            return Err(ParseError::malformed("moov", 0, "no moov box in source"));
        }

        self.events.push_back(DemuxEvent::Done);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Box-tree walking
// ---------------------------------------------------------------------------

/// Call `f` for every child box of `data`, passing the header, the payload
/// slice, and the payload's absolute offset.
fn for_each_child<'a>(
    data: &'a [u8],
    base: u64,
    mut f: impl FnMut(BoxHeader, &'a [u8], u64) -> ParseResult<()>,
) -> ParseResult<()> {
    let mut pos = 0usize;
    while pos < data.len() {
        let mut cursor = ByteCursor::new(&data[pos..], base + pos as u64);
        let header = BoxHeader::parse(&mut cursor).map_err(|e| {
            if e.is_incomplete() {
                ParseError::malformed("box header", base + pos as u64, "truncated child box")
            } else {
                e
            }
        })?;
        let total = header.size.unwrap_or((data.len() - pos) as u64) as usize;
        if pos + total > data.len() {
            return Err(ParseError::malformed(
                "box",
                header.offset,
                format!("{} overflows its parent", header.four_cc),
            ));
        }
        let payload = &data[pos + header.header_len as usize..pos + total];
        f(header, payload, header.offset + u64::from(header.header_len))?;
        pos += total;
    }
    Ok(())
}

fn parse_moov(
    data: &[u8],
    base: u64,
    trex_out: &mut HashMap<u32, Trex>,
    last_dts: &mut HashMap<u32, i64>,
) -> ParseResult<Vec<DemuxEvent>> {
    let mut events = Vec::new();

    for_each_child(data, base, |header, payload, payload_base| {
        match header.four_cc {
            FourCc::TRAK => {
                let (track, positions) = parse_trak(payload, payload_base, header.offset)?;
                tracing::debug!(
                    track_id = track.id,
                    timescale = track.timescale,
                    samples = positions.len(),
                    "discovered track"
                );
                let track_id = track.id;
                events.push(DemuxEvent::Track(track));
                if !positions.is_empty() {
                    check_monotonic(track_id, &positions, last_dts, header.offset)?;
                    events.push(DemuxEvent::Samples {
                        track_id,
                        positions,
                    });
                }
            }
            FourCc::MVEX => {
                for_each_child(payload, payload_base, |child, child_payload, _| {
                    if child.four_cc == FourCc::TREX {
                        let trex = parse_trex(child_payload, child.offset)?;
                        trex_out.insert(trex.track_id, trex);
                    }
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(events)
}

fn parse_moof(
    data: &[u8],
    base: u64,
    moof_offset: u64,
    trex: &HashMap<u32, Trex>,
    decode_times: &mut HashMap<u32, u64>,
    last_dts: &mut HashMap<u32, i64>,
) -> ParseResult<Vec<DemuxEvent>> {
    let mut trafs = Vec::new();

    for_each_child(data, base, |header, payload, payload_base| {
        if header.four_cc == FourCc::TRAF {
            trafs.push(parse_traf(payload, payload_base, header.offset)?);
        }
        Ok(())
    })?;

    let resolved = frag::resolve_fragments(moof_offset, &trafs, trex, decode_times)?;
    let mut events = Vec::with_capacity(resolved.len());
    for (track_id, positions) in resolved {
        if positions.is_empty() {
            continue;
        }
        check_monotonic(track_id, &positions, last_dts, moof_offset)?;
        events.push(DemuxEvent::Samples {
            track_id,
            positions,
        });
    }
    Ok(events)
}

fn check_monotonic(
    track_id: u32,
    positions: &[SamplePosition],
    last_dts: &mut HashMap<u32, i64>,
    offset: u64,
) -> ParseResult<()> {
    let mut previous = last_dts.get(&track_id).copied();
    for p in positions {
        if let Some(prev) = previous {
            if p.dts <= prev {
                return Err(ParseError::malformed(
                    "sample timing",
                    offset,
                    format!("track {track_id} dts {} not after {prev}", p.dts),
                ));
            }
        }
        previous = Some(p.dts);
    }
    if let Some(prev) = previous {
        last_dts.insert(track_id, prev);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// trak parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrakState {
    track_id: u32,
    timescale: u32,
    handler: Option<[u8; 4]>,
    display_width: u32,
    display_height: u32,
    rotation: Rotation,
    tables: SampleTables,
    entry: Option<SampleEntry>,
}

#[derive(Debug)]
struct SampleEntry {
    four_cc: FourCc,
    coded_width: u32,
    coded_height: u32,
    channels: u32,
    sample_rate: u32,
    sample_aspect: SampleAspect,
    color: Option<ColorInfo>,
    video: Option<codec::VideoCodecInfo>,
    audio: Option<codec::AudioCodecInfo>,
}

fn parse_trak(
    data: &[u8],
    base: u64,
    trak_offset: u64,
) -> ParseResult<(TrackDescriptor, Vec<SamplePosition>)> {
    let mut state = TrakState::default();

    for_each_child(data, base, |header, payload, payload_base| {
        match header.four_cc {
            FourCc::TKHD => parse_tkhd(payload, header.offset, &mut state),
            FourCc::MDIA => parse_mdia(payload, payload_base, &mut state),
            FourCc::EDTS => parse_edts(payload, payload_base),
            _ => Ok(()),
        }
    })?;

    let handler = state.handler.ok_or_else(|| {
        ParseError::malformed("trak", trak_offset, "no hdlr box")
    })?;
    let entry = state.entry.take().ok_or_else(|| {
        ParseError::malformed("trak", trak_offset, "no stsd sample entry")
    })?;
    if state.timescale == 0 {
        return Err(ParseError::malformed("mdhd", trak_offset, "zero timescale"));
    }

    let properties = match &handler {
        b"vide" => {
            let info = entry.video.ok_or_else(|| {
                ParseError::unsupported("codec", entry.four_cc.to_string())
            })?;
            TrackProperties::Video(VideoProperties {
                codec: info.codec,
                codec_string: info.codec_string,
                coded_width: entry.coded_width,
                coded_height: entry.coded_height,
                display_width: if state.display_width != 0 {
                    state.display_width
                } else {
                    entry.coded_width
                },
                display_height: if state.display_height != 0 {
                    state.display_height
                } else {
                    entry.coded_height
                },
                rotation: state.rotation,
                sample_aspect: entry.sample_aspect,
                color: entry.color,
                codec_private: info.codec_private,
            })
        }
        b"soun" => {
            let info = entry.audio.ok_or_else(|| {
                ParseError::unsupported("codec", entry.four_cc.to_string())
            })?;
            TrackProperties::Audio(AudioProperties {
                codec: info.codec,
                codec_string: info.codec_string,
                channels: entry.channels,
                sample_rate: entry.sample_rate,
                codec_private: info.codec_private,
            })
        }
        other => {
            return Err(ParseError::unsupported(
                "handler",
                String::from_utf8_lossy(other).into_owned(),
            ));
        }
    };

    let descriptor = TrackDescriptor {
        id: state.track_id,
        timescale: state.timescale,
        properties,
    };
    let positions = resolve_positions(&state.tables, trak_offset)?;
    Ok((descriptor, positions))
}

fn parse_tkhd(data: &[u8], offset: u64, state: &mut TrakState) -> ParseResult<()> {
    let mut cursor = ByteCursor::new(data, offset);
    let version = cursor.read_u8()?;
    cursor.skip(3)?; // flags

    let matrix_offset;
    if version == 0 {
        cursor.skip(8)?; // creation + modification
        state.track_id = cursor.read_u32()?;
        matrix_offset = 40usize;
    } else {
        cursor.skip(16)?;
        state.track_id = cursor.read_u32()?;
        matrix_offset = 52usize;
    }

    if data.len() >= matrix_offset + 36 + 8 {
        let mut m = ByteCursor::new(&data[matrix_offset..], offset + matrix_offset as u64);
        let a = m.read_i32()?;
        let b = m.read_i32()?;
        let _u = m.read_i32()?;
        let c = m.read_i32()?;
        let d = m.read_i32()?;
        state.rotation = rotation_from_matrix(a, b, c, d);

        let mut wh = ByteCursor::new(
            &data[matrix_offset + 36..],
            offset + (matrix_offset + 36) as u64,
        );
        state.display_width = wh.read_u32()? >> 16;
        state.display_height = wh.read_u32()? >> 16;
    }

    Ok(())
}

/// Map the tkhd 2x2 rotation sub-matrix to one of the four standard
/// rotations; anything else is treated as unrotated.
fn rotation_from_matrix(a: i32, b: i32, c: i32, d: i32) -> Rotation {
    const ONE: i32 = 0x0001_0000; // 16.16 fixed-point unity
    if (a, b, c, d) == (ONE, 0, 0, ONE) {
        Rotation::None
    } else if (a, b, c, d) == (0, ONE, -ONE, 0) {
        Rotation::Cw90
    } else if (a, b, c, d) == (-ONE, 0, 0, -ONE) {
        Rotation::Cw180
    } else if (a, b, c, d) == (0, -ONE, ONE, 0) {
        Rotation::Cw270
    } else {
        Rotation::None
    }
}

fn parse_mdia(data: &[u8], base: u64, state: &mut TrakState) -> ParseResult<()> {
    for_each_child(data, base, |header, payload, payload_base| {
        match header.four_cc {
            FourCc::MDHD => {
                let mut cursor = ByteCursor::new(payload, header.offset);
                let version = cursor.read_u8()?;
                cursor.skip(3)?;
                if version == 0 {
                    cursor.skip(8)?;
                } else {
                    cursor.skip(16)?;
                }
                state.timescale = cursor.read_u32()?;
                Ok(())
            }
            FourCc::HDLR => {
                let mut cursor = ByteCursor::new(payload, header.offset);
                cursor.skip(8)?; // version/flags + pre_defined
                let raw = cursor.read_exact(4)?;
                state.handler = Some([raw[0], raw[1], raw[2], raw[3]]);
                Ok(())
            }
            FourCc::MINF => for_each_child(payload, payload_base, |child, child_payload, child_base| {
                if child.four_cc == FourCc::STBL {
                    parse_stbl(child_payload, child_base, state)
                } else {
                    Ok(())
                }
            }),
            _ => Ok(()),
        }
    })
}

/// Edit lists are parsed for well-formedness but their offsets are not
/// applied: rewriting timestamps is out of scope.
fn parse_edts(data: &[u8], base: u64) -> ParseResult<()> {
    for_each_child(data, base, |header, payload, _| {
        if header.four_cc == FourCc::ELST {
            let mut cursor = ByteCursor::new(payload, header.offset);
            let version = cursor.read_u8()?;
            cursor.skip(3)?;
            let entries = cursor.read_u32()?;
            for _ in 0..entries {
                if version == 0 {
                    cursor.skip(8)?; // duration + media_time
                } else {
                    cursor.skip(16)?;
                }
                cursor.skip(4)?; // media_rate
            }
            tracing::debug!(entries, "edit list present, not applied");
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// stbl parsing
// ---------------------------------------------------------------------------

fn parse_stbl(data: &[u8], base: u64, state: &mut TrakState) -> ParseResult<()> {
    for_each_child(data, base, |header, payload, payload_base| {
        let mut cursor = ByteCursor::new(payload, header.offset);
        match header.four_cc {
            FourCc::STSD => {
                state.entry = Some(parse_stsd(payload, payload_base, header.offset)?);
                Ok(())
            }
            FourCc::STTS => {
                cursor.skip(4)?;
                let count = cursor.read_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(SttsEntry {
                        count: cursor.read_u32()?,
                        delta: cursor.read_u32()?,
                    });
                }
                state.tables.stts = entries;
                Ok(())
            }
            FourCc::CTTS => {
                let version = cursor.read_u8()?;
                cursor.skip(3)?;
                let count = cursor.read_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let count = cursor.read_u32()?;
                    let offset = if version == 0 {
                        cursor.read_u32()? as i32
                    } else {
                        cursor.read_i32()?
                    };
                    entries.push(CttsEntry { count, offset });
                }
                state.tables.ctts = entries;
                Ok(())
            }
            FourCc::STSS => {
                cursor.skip(4)?;
                let count = cursor.read_u32()?;
                let mut samples = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    samples.push(cursor.read_u32()?);
                }
                state.tables.sync_samples = Some(samples);
                Ok(())
            }
            FourCc::STSC => {
                cursor.skip(4)?;
                let count = cursor.read_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let first_chunk = cursor.read_u32()?;
                    let samples_per_chunk = cursor.read_u32()?;
                    cursor.skip(4)?; // sample description index
                    entries.push(StscEntry {
                        first_chunk,
                        samples_per_chunk,
                    });
                }
                state.tables.stsc = entries;
                Ok(())
            }
            FourCc::STSZ => {
                cursor.skip(4)?;
                state.tables.uniform_size = cursor.read_u32()?;
                let count = cursor.read_u32()?;
                state.tables.sample_count = count;
                if state.tables.uniform_size == 0 {
                    let mut sizes = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        sizes.push(cursor.read_u32()?);
                    }
                    state.tables.sizes = sizes;
                }
                Ok(())
            }
            FourCc::STZ2 => {
                cursor.skip(4)?;
                cursor.skip(3)?; // reserved
                let field_size = cursor.read_u8()?;
                let count = cursor.read_u32()?;
                state.tables.sample_count = count;
                let mut sizes = Vec::with_capacity(count as usize);
                match field_size {
                    16 => {
                        for _ in 0..count {
                            sizes.push(u32::from(cursor.read_u16()?));
                        }
                    }
                    8 => {
                        for _ in 0..count {
                            sizes.push(u32::from(cursor.read_u8()?));
                        }
                    }
                    4 => {
                        let mut i = 0;
                        while i < count {
                            let b = cursor.read_u8()?;
                            sizes.push(u32::from(b >> 4));
                            i += 1;
                            if i < count {
                                sizes.push(u32::from(b & 0x0F));
                                i += 1;
                            }
                        }
                    }
                    other => {
                        return Err(ParseError::malformed(
                            "stz2",
                            header.offset,
                            format!("field size {other}"),
                        ));
                    }
                }
                state.tables.sizes = sizes;
                Ok(())
            }
            FourCc::STCO => {
                cursor.skip(4)?;
                let count = cursor.read_u32()?;
                let mut offsets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    offsets.push(u64::from(cursor.read_u32()?));
                }
                state.tables.chunk_offsets = offsets;
                Ok(())
            }
            FourCc::CO64 => {
                cursor.skip(4)?;
                let count = cursor.read_u32()?;
                let mut offsets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    offsets.push(cursor.read_u64()?);
                }
                state.tables.chunk_offsets = offsets;
                Ok(())
            }
            _ => Ok(()),
        }
    })
}

// ---------------------------------------------------------------------------
// stsd / sample entries
// ---------------------------------------------------------------------------

fn parse_stsd(data: &[u8], base: u64, stsd_offset: u64) -> ParseResult<SampleEntry> {
    let mut cursor = ByteCursor::new(data, stsd_offset);
    cursor.skip(4)?; // version/flags
    let entry_count = cursor.read_u32()?;
    if entry_count == 0 {
        return Err(ParseError::malformed("stsd", stsd_offset, "no sample entries"));
    }

    // Only the first sample entry is interpreted.
    let entries = &data[8..];
    let mut result: Option<SampleEntry> = None;
    for_each_child(entries, base + 8, |header, payload, payload_base| {
        if result.is_none() {
            result = Some(parse_sample_entry(
                header.four_cc,
                payload,
                payload_base,
                header.offset,
            )?);
        }
        Ok(())
    })?;

    result.ok_or_else(|| ParseError::malformed("stsd", stsd_offset, "empty sample entry list"))
}

fn parse_sample_entry(
    four_cc: FourCc,
    payload: &[u8],
    payload_base: u64,
    entry_offset: u64,
) -> ParseResult<SampleEntry> {
    let mut entry = SampleEntry {
        four_cc,
        coded_width: 0,
        coded_height: 0,
        channels: 0,
        sample_rate: 0,
        sample_aspect: SampleAspect::default(),
        color: None,
        video: None,
        audio: None,
    };

    match four_cc {
        FourCc::AVC1 | FourCc::HEV1 | FourCc::HVC1 | FourCc::VP08 | FourCc::VP09 | FourCc::AV01 => {
            // VisualSampleEntry: 6 reserved + 2 dri + 16 pre_defined, then
            // width/height and the fixed tail up to 78 bytes.
            let mut cursor = ByteCursor::new(payload, payload_base);
            cursor.skip(24)?;
            entry.coded_width = u32::from(cursor.read_u16()?);
            entry.coded_height = u32::from(cursor.read_u16()?);

            if payload.len() < 78 {
                return Err(ParseError::malformed(
                    "sample entry",
                    entry_offset,
                    "visual entry shorter than 78 bytes",
                ));
            }
            parse_visual_children(&payload[78..], payload_base + 78, &mut entry)?;

            if entry.video.is_none() {
                return Err(ParseError::malformed(
                    "sample entry",
                    entry_offset,
                    format!("{four_cc} entry without decoder configuration"),
                ));
            }
        }
        FourCc::MP4A | FourCc::OPUS => {
            // AudioSampleEntry: 6 reserved + 2 dri + 8 version/revision/
            // vendor + channels + sample size + 4 + sample rate (16.16).
            let mut cursor = ByteCursor::new(payload, payload_base);
            cursor.skip(16)?;
            entry.channels = u32::from(cursor.read_u16()?);
            cursor.skip(2)?; // sample size
            cursor.skip(4)?; // pre_defined + reserved
            entry.sample_rate = cursor.read_u32()? >> 16;

            if payload.len() < 28 {
                return Err(ParseError::malformed(
                    "sample entry",
                    entry_offset,
                    "audio entry shorter than 28 bytes",
                ));
            }
            parse_audio_children(four_cc, &payload[28..], payload_base + 28, &mut entry)?;

            if entry.audio.is_none() {
                // A bare Opus entry without dOps still identifies the codec.
                if four_cc == FourCc::OPUS {
                    entry.audio = Some(codec::AudioCodecInfo {
                        codec: framecast_core::media::AudioCodec::Opus,
                        codec_string: "opus".into(),
                        codec_private: None,
                    });
                } else {
                    return Err(ParseError::malformed(
                        "sample entry",
                        entry_offset,
                        "mp4a entry without esds",
                    ));
                }
            }
        }
        other => {
            return Err(ParseError::unsupported("codec", other.to_string()));
        }
    }

    Ok(entry)
}

fn parse_visual_children(
    data: &[u8],
    base: u64,
    entry: &mut SampleEntry,
) -> ParseResult<()> {
    for_each_child(data, base, |header, payload, _| {
        match header.four_cc {
            FourCc::AVCC => {
                entry.video = Some(codec::VideoCodecInfo {
                    codec: VideoCodec::H264,
                    codec_string: codec::avc_codec_string(payload)?,
                    codec_private: Some(Bytes::copy_from_slice(payload)),
                });
            }
            FourCc::HVCC => {
                entry.video = Some(codec::VideoCodecInfo {
                    codec: VideoCodec::H265,
                    codec_string: codec::hevc_codec_string(payload)?,
                    codec_private: Some(Bytes::copy_from_slice(payload)),
                });
            }
            FourCc::VPCC => {
                let codec = if entry.four_cc == FourCc::VP08 {
                    VideoCodec::Vp8
                } else {
                    VideoCodec::Vp9
                };
                entry.video = Some(codec::VideoCodecInfo {
                    codec,
                    codec_string: codec::vp_codec_string(codec, payload)?,
                    codec_private: Some(Bytes::copy_from_slice(payload)),
                });
            }
            FourCc::AV1C => {
                entry.video = Some(codec::VideoCodecInfo {
                    codec: VideoCodec::Av1,
                    codec_string: codec::av1_codec_string(payload)?,
                    codec_private: Some(Bytes::copy_from_slice(payload)),
                });
            }
            FourCc::PASP => {
                let mut cursor = ByteCursor::new(payload, header.offset);
                let num = cursor.read_u32()?;
                let den = cursor.read_u32()?;
                if num != 0 && den != 0 {
                    entry.sample_aspect = SampleAspect { num, den };
                }
            }
            FourCc::COLR => {
                let mut cursor = ByteCursor::new(payload, header.offset);
                let colour_type = cursor.read_exact(4)?;
                if colour_type == b"nclx" {
                    let primaries = cursor.read_u16()?;
                    let transfer = cursor.read_u16()?;
                    let matrix = cursor.read_u16()?;
                    let full_range = cursor.read_u8()? >> 7 == 1;
                    entry.color = Some(ColorInfo {
                        primaries: Some(primaries),
                        transfer: Some(transfer),
                        matrix: Some(matrix),
                        full_range: Some(full_range),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    })
}

fn parse_audio_children(
    entry_type: FourCc,
    data: &[u8],
    base: u64,
    entry: &mut SampleEntry,
) -> ParseResult<()> {
    for_each_child(data, base, |header, payload, _| {
        match header.four_cc {
            FourCc::ESDS if entry_type == FourCc::MP4A => {
                // Skip the FullBox header in front of the descriptor chain.
                if payload.len() < 4 {
                    return Err(ParseError::malformed("esds", header.offset, "truncated"));
                }
                let (codec_string, private) = codec::aac_codec_string(&payload[4..])?;
                entry.audio = Some(codec::AudioCodecInfo {
                    codec: framecast_core::media::AudioCodec::Aac,
                    codec_string,
                    codec_private: private,
                });
            }
            FourCc::DOPS if entry_type == FourCc::OPUS => {
                entry.audio = Some(codec::AudioCodecInfo {
                    codec: framecast_core::media::AudioCodec::Opus,
                    codec_string: "opus".into(),
                    codec_private: Some(Bytes::copy_from_slice(payload)),
                });
            }
            _ => {}
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Fragment boxes
// ---------------------------------------------------------------------------

fn parse_trex(data: &[u8], offset: u64) -> ParseResult<Trex> {
    let mut cursor = ByteCursor::new(data, offset);
    cursor.skip(4)?; // version/flags
    let track_id = cursor.read_u32()?;
    cursor.skip(4)?; // default sample description index
    Ok(Trex {
        track_id,
        default_sample_duration: cursor.read_u32()?,
        default_sample_size: cursor.read_u32()?,
        default_sample_flags: cursor.read_u32()?,
    })
}

fn parse_traf(data: &[u8], base: u64, traf_offset: u64) -> ParseResult<TrackFragment> {
    let mut tfhd: Option<Tfhd> = None;
    let mut base_media_decode_time = None;
    let mut truns = Vec::new();

    for_each_child(data, base, |header, payload, _| {
        match header.four_cc {
            FourCc::TFHD => {
                tfhd = Some(parse_tfhd(payload, header.offset)?);
            }
            FourCc::TFDT => {
                let mut cursor = ByteCursor::new(payload, header.offset);
                let version = cursor.read_u8()?;
                cursor.skip(3)?;
                base_media_decode_time = Some(if version == 1 {
                    cursor.read_u64()?
                } else {
                    u64::from(cursor.read_u32()?)
                });
            }
            FourCc::TRUN => {
                truns.push(parse_trun(payload, header.offset)?);
            }
            _ => {}
        }
        Ok(())
    })?;

    let tfhd = tfhd.ok_or_else(|| ParseError::malformed("traf", traf_offset, "no tfhd box"))?;
    Ok(TrackFragment {
        tfhd,
        base_media_decode_time,
        truns,
        offset: traf_offset,
    })
}

fn parse_tfhd(data: &[u8], offset: u64) -> ParseResult<Tfhd> {
    let mut cursor = ByteCursor::new(data, offset);
    let flags = cursor.read_u32()? & 0x00FF_FFFF;
    let track_id = cursor.read_u32()?;

    let base_data_offset = if flags & frag::TFHD_BASE_DATA_OFFSET != 0 {
        Some(cursor.read_u64()?)
    } else {
        None
    };
    if flags & frag::TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        cursor.skip(4)?;
    }
    let default_sample_duration = if flags & frag::TFHD_DEFAULT_SAMPLE_DURATION != 0 {
        Some(cursor.read_u32()?)
    } else {
        None
    };
    let default_sample_size = if flags & frag::TFHD_DEFAULT_SAMPLE_SIZE != 0 {
        Some(cursor.read_u32()?)
    } else {
        None
    };
    let default_sample_flags = if flags & frag::TFHD_DEFAULT_SAMPLE_FLAGS != 0 {
        Some(cursor.read_u32()?)
    } else {
        None
    };

    Ok(Tfhd {
        track_id,
        flags,
        base_data_offset,
        default_sample_duration,
        default_sample_size,
        default_sample_flags,
    })
}

fn parse_trun(data: &[u8], offset: u64) -> ParseResult<Trun> {
    let mut cursor = ByteCursor::new(data, offset);
    let version_flags = cursor.read_u32()?;
    let version = (version_flags >> 24) as u8;
    let flags = version_flags & 0x00FF_FFFF;
    let sample_count = cursor.read_u32()?;

    let data_offset = if flags & frag::TRUN_DATA_OFFSET != 0 {
        Some(cursor.read_i32()?)
    } else {
        None
    };
    let first_sample_flags = if flags & frag::TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(cursor.read_u32()?)
    } else {
        None
    };

    let mut samples = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        let duration = if flags & frag::TRUN_SAMPLE_DURATION != 0 {
            Some(cursor.read_u32()?)
        } else {
            None
        };
        let size = if flags & frag::TRUN_SAMPLE_SIZE != 0 {
            Some(cursor.read_u32()?)
        } else {
            None
        };
        let sample_flags = if flags & frag::TRUN_SAMPLE_FLAGS != 0 {
            Some(cursor.read_u32()?)
        } else {
            None
        };
        let cts_offset = if flags & frag::TRUN_SAMPLE_CTS_OFFSET != 0 {
            if version == 0 {
                cursor.read_u32()? as i32
            } else {
                cursor.read_i32()?
            }
        } else {
            0
        };
        samples.push(TrunSample {
            duration,
            size,
            flags: sample_flags,
            cts_offset,
        });
    }

    Ok(Trun {
        flags,
        data_offset,
        first_sample_flags,
        samples,
    })
}
