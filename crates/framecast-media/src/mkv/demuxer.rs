//! Incremental Matroska/WebM demuxer.
//!
//! Top level: `AwaitEbmlHeader -> AwaitSegment -> InSegment -> Done`. Inside
//! the segment, Info, Tracks, and Cluster payloads are collected whole and
//! walked; every other element is skipped by size. The TimestampScale from
//! Info is threaded through the parser context and consulted by all later
//! timestamp math.

use bytes::Bytes;
use framecast_core::media::{
    AudioCodec, AudioProperties, ColorInfo, ContainerFormat, Rotation, SampleAspect,
    SamplePosition, TrackDescriptor, TrackProperties, VideoCodec, VideoProperties,
};
use std::collections::{HashMap, VecDeque};

use crate::cursor::ByteCursor;
use crate::demux::{DemuxEvent, Demuxer};
use crate::error::{ParseError, ParseResult};
use crate::mkv::element_id as id;
use crate::mp4::codec as mp4_codec;

/// Default TimestampScale: timestamps in milliseconds.
const DEFAULT_TIMESTAMP_SCALE_NS: u64 = 1_000_000;

/// Upper bound for elements collected in memory.
const MAX_COLLECTED_ELEMENT: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitEbmlHeader,
    AwaitSegment,
    InSegment,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    /// `buf[0]` is the start of an element header.
    Parse,
    /// Collecting a full element of `total` bytes (header included).
    Collect {
        element: u32,
        total: usize,
        payload_start: usize,
    },
    /// Discarding the rest of a skipped element.
    Skip { remaining: u64 },
}

/// Per-track state carried from the Tracks element into cluster parsing.
#[derive(Debug, Clone)]
struct MkvTrack {
    is_video: bool,
    /// DefaultDuration converted to timescale ticks, when present.
    default_duration_ticks: Option<u32>,
}

/// Incremental Matroska demuxer.
pub struct MkvDemuxer {
    phase: Phase,
    pending: Pending,
    buf: Vec<u8>,
    buf_base: u64,
    events: VecDeque<DemuxEvent>,
    timestamp_scale_ns: u64,
    tracks: HashMap<u64, MkvTrack>,
    last_dts: HashMap<u32, i64>,
    finished: bool,
}

impl Default for MkvDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl MkvDemuxer {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitEbmlHeader,
            pending: Pending::Parse,
            buf: Vec::new(),
            buf_base: 0,
            events: VecDeque::new(),
            timestamp_scale_ns: DEFAULT_TIMESTAMP_SCALE_NS,
            tracks: HashMap::new(),
            last_dts: HashMap::new(),
            finished: false,
        }
    }

    /// Ticks per second implied by the current TimestampScale.
    fn ticks_per_second(&self) -> u32 {
        (1_000_000_000 / self.timestamp_scale_ns.max(1)) as u32
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.buf_base += n as u64;
    }

    fn drive(&mut self) -> ParseResult<()> {
        loop {
            match self.pending {
                Pending::Parse => {
                    let mut cursor = ByteCursor::new(&self.buf, self.buf_base);
                    let offset = cursor.position();
                    let (element, size, header_len) = match parse_element_header(&mut cursor) {
                        Ok(h) => h,
                        Err(ParseError::Incomplete) => return Ok(()),
                        Err(e) => return Err(e),
                    };

                    match self.phase {
                        Phase::AwaitEbmlHeader => {
                            if element != id::EBML_HEADER {
                                return Err(ParseError::malformed(
                                    "EBML header",
                                    offset,
                                    format!("leading element 0x{element:X} is not an EBML header"),
                                ));
                            }
                            let size = known_size(size, element, offset)?;
                            self.pending = collect(element, size, header_len, offset)?;
                        }
                        Phase::AwaitSegment => match element {
                            id::SEGMENT => {
                                // Segment size (known or unknown) is ignored;
                                // children run to end of input.
                                self.consume(header_len);
                                self.phase = Phase::InSegment;
                            }
                            id::VOID | id::CRC32 => {
                                let size = known_size(size, element, offset)?;
                                self.consume(header_len);
                                self.pending = Pending::Skip { remaining: size };
                            }
                            other => {
                                return Err(ParseError::malformed(
                                    "segment",
                                    offset,
                                    format!("unexpected element 0x{other:X} before Segment"),
                                ));
                            }
                        },
                        Phase::InSegment => match element {
                            id::INFO | id::TRACKS | id::CLUSTER => {
                                let size = known_size(size, element, offset)?;
                                self.pending = collect(element, size, header_len, offset)?;
                            }
                            other => {
                                let size = known_size(size, other, offset)?;
                                tracing::debug!(element = other, offset, "skipping element");
                                self.consume(header_len);
                                self.pending = Pending::Skip { remaining: size };
                            }
                        },
                    }
                }
                Pending::Collect {
                    element,
                    total,
                    payload_start,
                } => {
                    if self.buf.len() < total {
                        return Ok(());
                    }
                    let payload = &self.buf[payload_start..total];
                    let payload_base = self.buf_base + payload_start as u64;

                    match element {
                        id::EBML_HEADER => {
                            parse_ebml_header(payload, payload_base)?;
                            self.phase = Phase::AwaitSegment;
                        }
                        id::INFO => {
                            if let Some(scale) = parse_info(payload, payload_base)? {
                                self.timestamp_scale_ns = scale;
                            }
                        }
                        id::TRACKS => {
                            let ticks = self.ticks_per_second();
                            let (descriptors, tracks) =
                                parse_tracks(payload, payload_base, ticks)?;
                            self.tracks.extend(tracks);
                            for descriptor in descriptors {
                                tracing::debug!(
                                    track_id = descriptor.id,
                                    timescale = descriptor.timescale,
                                    "discovered track"
                                );
                                self.events.push_back(DemuxEvent::Track(descriptor));
                            }
                        }
                        id::CLUSTER => {
                            let batches =
                                parse_cluster(payload, payload_base, &self.tracks)?;
                            for (track_id, positions) in batches {
                                check_monotonic(
                                    track_id,
                                    &positions,
                                    &mut self.last_dts,
                                    payload_base,
                                )?;
                                self.events.push_back(DemuxEvent::Samples {
                                    track_id,
                                    positions,
                                });
                            }
                        }
                        other => {
                            return Err(ParseError::malformed(
                                "element",
                                payload_base,
                                format!("collected unexpected element 0x{other:X}"),
                            ));
                        }
                    }

                    self.consume(total);
                    self.pending = Pending::Parse;
                }
                Pending::Skip { remaining } => {
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    self.consume(take);
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.pending = Pending::Parse;
                    } else {
                        self.pending = Pending::Skip { remaining: left };
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn known_size(size: Option<u64>, element: u32, offset: u64) -> ParseResult<u64> {
    size.ok_or_else(|| {
        ParseError::malformed(
            "element",
            offset,
            format!("element 0x{element:X} with unknown size"),
        )
    })
}

fn collect(element: u32, size: u64, header_len: usize, offset: u64) -> ParseResult<Pending> {
    if size > MAX_COLLECTED_ELEMENT {
        return Err(ParseError::malformed(
            "element",
            offset,
            format!("element 0x{element:X} of {size} bytes exceeds limit"),
        ));
    }
    Ok(Pending::Collect {
        element,
        total: header_len + size as usize,
        payload_start: header_len,
    })
}

impl Demuxer for MkvDemuxer {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Webm
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

        match self.pending {
            Pending::Collect { element, .. } => {
                return Err(ParseError::malformed(
                    "element",
                    self.buf_base,
                    format!("source ended inside element 0x{element:X}"),
                ));
            }
            Pending::Skip { remaining } if remaining > 0 => {
                tracing::warn!(missing = remaining, "source ended inside a skipped element");
            }
            Pending::Parse if !self.buf.is_empty() => {
                return Err(ParseError::malformed(
                    "element",
                    self.buf_base,
                    format!("{} trailing bytes", self.buf.len()),
                ));
            }
            _ => {}
        }

        if self.phase != Phase::InSegment {
            return Err(ParseError::malformed(
                "segment",
                0,
                "source ended before the Segment element",
            ));
        }

        self.events.push_back(DemuxEvent::Done);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Element walking
// ---------------------------------------------------------------------------

/// Parse `(id, size, header_len)`; size `None` is the unknown-size encoding.
fn parse_element_header(cursor: &mut ByteCursor<'_>) -> ParseResult<(u32, Option<u64>, usize)> {
    let start = cursor.relative_position();
    let result = (|| {
        let element = cursor.read_element_id()?;
        let size = cursor.read_vint_size()?;
        Ok((element, size, cursor.relative_position() - start))
    })();
    if matches!(result, Err(ParseError::Incomplete)) {
        cursor.seek_to(start);
    }
    result
}

/// Call `f` for each child element of a fully collected payload.
fn for_each_element<'a>(
    data: &'a [u8],
    base: u64,
    mut f: impl FnMut(u32, &'a [u8], u64) -> ParseResult<()>,
) -> ParseResult<()> {
    let mut pos = 0usize;
    while pos < data.len() {
        let mut cursor = ByteCursor::new(&data[pos..], base + pos as u64);
        let offset = cursor.position();
        let (element, size, header_len) = parse_element_header(&mut cursor).map_err(|e| {
            if e.is_incomplete() {
                ParseError::malformed("element", offset, "truncated element header")
            } else {
                e
            }
        })?;
        let size = known_size(size, element, offset)? as usize;
        if pos + header_len + size > data.len() {
            return Err(ParseError::malformed(
                "element",
                offset,
                format!("element 0x{element:X} overflows its parent"),
            ));
        }
        let payload = &data[pos + header_len..pos + header_len + size];
        f(element, payload, base + (pos + header_len) as u64)?;
        pos += header_len + size;
    }
    Ok(())
}

/// Big-endian unsigned integer of 0-8 bytes (0 bytes decodes as 0).
fn read_uint(data: &[u8], offset: u64) -> ParseResult<u64> {
    if data.len() > 8 {
        return Err(ParseError::malformed(
            "integer",
            offset,
            format!("{}-byte integer", data.len()),
        ));
    }
    let mut value = 0u64;
    for &b in data {
        value = (value << 8) | u64::from(b);
    }
    Ok(value)
}

/// 4- or 8-byte big-endian IEEE float.
fn read_float(data: &[u8], offset: u64) -> ParseResult<f64> {
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f64::from(f32::from_be_bytes([
            data[0], data[1], data[2], data[3],
        ]))),
        8 => Ok(f64::from_be_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ])),
        other => Err(ParseError::malformed(
            "float",
            offset,
            format!("{other}-byte float"),
        )),
    }
}

fn read_string(data: &[u8], offset: u64) -> ParseResult<String> {
    let trimmed = data.split(|&b| b == 0).next().unwrap_or(data);
    std::str::from_utf8(trimmed)
        .map(str::to_owned)
        .map_err(|_| ParseError::malformed("string", offset, "invalid UTF-8"))
}

// ---------------------------------------------------------------------------
// Header / Info
// ---------------------------------------------------------------------------

fn parse_ebml_header(data: &[u8], base: u64) -> ParseResult<()> {
    let mut doc_type = None;
    for_each_element(data, base, |element, payload, offset| {
        if element == id::DOC_TYPE {
            doc_type = Some(read_string(payload, offset)?);
        }
        Ok(())
    })?;

    match doc_type.as_deref() {
        Some("matroska") | Some("webm") => Ok(()),
        Some(other) => Err(ParseError::malformed(
            "EBML header",
            base,
            format!("unsupported DocType {other}"),
        )),
        None => Err(ParseError::malformed("EBML header", base, "missing DocType")),
    }
}

/// Returns the TimestampScale when the Info element carries one.
fn parse_info(data: &[u8], base: u64) -> ParseResult<Option<u64>> {
    let mut scale = None;
    for_each_element(data, base, |element, payload, offset| {
        if element == id::TIMESTAMP_SCALE {
            let value = read_uint(payload, offset)?;
            if value == 0 {
                return Err(ParseError::malformed("TimestampScale", offset, "zero"));
            }
            scale = Some(value);
        }
        Ok(())
    })?;
    Ok(scale)
}

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrackEntryState {
    number: Option<u64>,
    track_type: Option<u64>,
    codec_id: Option<String>,
    codec_private: Option<Bytes>,
    default_duration_ns: Option<u64>,
    pixel_width: u32,
    pixel_height: u32,
    display_width: u32,
    display_height: u32,
    color: Option<ColorInfo>,
    channels: u32,
    sample_rate: u32,
}

type ParsedTracks = (Vec<TrackDescriptor>, HashMap<u64, MkvTrack>);

fn parse_tracks(data: &[u8], base: u64, ticks_per_second: u32) -> ParseResult<ParsedTracks> {
    let mut descriptors = Vec::new();
    let mut tracks = HashMap::new();

    for_each_element(data, base, |element, payload, offset| {
        if element != id::TRACK_ENTRY {
            return Ok(());
        }
        let mut entry = TrackEntryState::default();
        parse_track_entry(payload, offset, &mut entry)?;

        let number = entry
            .number
            .ok_or_else(|| ParseError::malformed("TrackEntry", offset, "missing TrackNumber"))?;
        let track_type = entry.track_type.unwrap_or(0);

        match track_type {
            id::TRACK_TYPE_VIDEO | id::TRACK_TYPE_AUDIO => {}
            other => {
                tracing::debug!(track = number, track_type = other, "ignoring track");
                return Ok(());
            }
        }

        let codec_id = entry
            .codec_id
            .ok_or_else(|| ParseError::malformed("TrackEntry", offset, "missing CodecID"))?;

        let default_duration_ticks = entry.default_duration_ns.map(|ns| {
            ((ns as u128 * u128::from(ticks_per_second) + 500_000_000) / 1_000_000_000) as u32
        });

        let descriptor = if track_type == id::TRACK_TYPE_VIDEO {
            let (codec, codec_string) =
                video_codec_from_id(&codec_id, entry.codec_private.as_deref(), offset)?;
            TrackDescriptor {
                id: number as u32,
                timescale: ticks_per_second,
                properties: TrackProperties::Video(VideoProperties {
                    codec,
                    codec_string,
                    coded_width: entry.pixel_width,
                    coded_height: entry.pixel_height,
                    display_width: if entry.display_width != 0 {
                        entry.display_width
                    } else {
                        entry.pixel_width
                    },
                    display_height: if entry.display_height != 0 {
                        entry.display_height
                    } else {
                        entry.pixel_height
                    },
                    rotation: Rotation::None,
                    sample_aspect: SampleAspect::default(),
                    color: entry.color,
                    codec_private: entry.codec_private.clone(),
                }),
            }
        } else {
            let (codec, codec_string) =
                audio_codec_from_id(&codec_id, entry.codec_private.as_deref(), offset)?;
            TrackDescriptor {
                id: number as u32,
                timescale: ticks_per_second,
                properties: TrackProperties::Audio(AudioProperties {
                    codec,
                    codec_string,
                    channels: entry.channels.max(1),
                    sample_rate: entry.sample_rate,
                    codec_private: entry.codec_private.clone(),
                }),
            }
        };

        tracks.insert(
            number,
            MkvTrack {
                is_video: track_type == id::TRACK_TYPE_VIDEO,
                default_duration_ticks,
            },
        );
        descriptors.push(descriptor);
        Ok(())
    })?;

    Ok((descriptors, tracks))
}

fn parse_track_entry(
    data: &[u8],
    base: u64,
    entry: &mut TrackEntryState,
) -> ParseResult<()> {
    for_each_element(data, base, |element, payload, offset| {
        match element {
            id::TRACK_NUMBER => entry.number = Some(read_uint(payload, offset)?),
            id::TRACK_TYPE => entry.track_type = Some(read_uint(payload, offset)?),
            id::CODEC_ID => entry.codec_id = Some(read_string(payload, offset)?),
            id::CODEC_PRIVATE => entry.codec_private = Some(Bytes::copy_from_slice(payload)),
            id::DEFAULT_DURATION => {
                entry.default_duration_ns = Some(read_uint(payload, offset)?)
            }
            id::VIDEO => {
                for_each_element(payload, offset, |child, child_payload, child_offset| {
                    match child {
                        id::PIXEL_WIDTH => {
                            entry.pixel_width = read_uint(child_payload, child_offset)? as u32
                        }
                        id::PIXEL_HEIGHT => {
                            entry.pixel_height = read_uint(child_payload, child_offset)? as u32
                        }
                        id::DISPLAY_WIDTH => {
                            entry.display_width = read_uint(child_payload, child_offset)? as u32
                        }
                        id::DISPLAY_HEIGHT => {
                            entry.display_height = read_uint(child_payload, child_offset)? as u32
                        }
                        id::COLOUR => {
                            let mut color = ColorInfo::default();
                            for_each_element(
                                child_payload,
                                child_offset,
                                |c, p, o| {
                                    match c {
                                        id::PRIMARIES => {
                                            color.primaries = Some(read_uint(p, o)? as u16)
                                        }
                                        id::TRANSFER_CHARACTERISTICS => {
                                            color.transfer = Some(read_uint(p, o)? as u16)
                                        }
                                        id::MATRIX_COEFFICIENTS => {
                                            color.matrix = Some(read_uint(p, o)? as u16)
                                        }
                                        id::RANGE => {
                                            color.full_range = Some(read_uint(p, o)? == 2)
                                        }
                                        _ => {}
                                    }
                                    Ok(())
                                },
                            )?;
                            entry.color = Some(color);
                        }
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            id::AUDIO => {
                for_each_element(payload, offset, |child, child_payload, child_offset| {
                    match child {
                        id::CHANNELS => {
                            entry.channels = read_uint(child_payload, child_offset)? as u32
                        }
                        id::SAMPLING_FREQUENCY => {
                            entry.sample_rate =
                                read_float(child_payload, child_offset)? as u32
                        }
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })
}

fn video_codec_from_id(
    codec_id: &str,
    codec_private: Option<&[u8]>,
    offset: u64,
) -> ParseResult<(VideoCodec, String)> {
    match codec_id {
        "V_VP8" => Ok((VideoCodec::Vp8, "vp8".into())),
        "V_VP9" => Ok((VideoCodec::Vp9, "vp09.00.10.08".into())),
        "V_AV1" => {
            let codec_string = match codec_private {
                Some(av1c) => mp4_codec::av1_codec_string(av1c)?,
                None => "av01.0.04M.08".into(),
            };
            Ok((VideoCodec::Av1, codec_string))
        }
        "V_MPEG4/ISO/AVC" => {
            let avcc = codec_private.ok_or_else(|| {
                ParseError::malformed("TrackEntry", offset, "AVC track without CodecPrivate")
            })?;
            Ok((VideoCodec::H264, mp4_codec::avc_codec_string(avcc)?))
        }
        "V_MPEGH/ISO/HEVC" => {
            let hvcc = codec_private.ok_or_else(|| {
                ParseError::malformed("TrackEntry", offset, "HEVC track without CodecPrivate")
            })?;
            Ok((VideoCodec::H265, mp4_codec::hevc_codec_string(hvcc)?))
        }
        other => Err(ParseError::unsupported("codec", other.to_string())),
    }
}

fn audio_codec_from_id(
    codec_id: &str,
    codec_private: Option<&[u8]>,
    _offset: u64,
) -> ParseResult<(AudioCodec, String)> {
    if codec_id == "A_OPUS" {
        return Ok((AudioCodec::Opus, "opus".into()));
    }
    if codec_id == "A_AAC" || codec_id.starts_with("A_AAC/") {
        let aot = codec_private
            .filter(|p| !p.is_empty())
            .map(|p| p[0] >> 3)
            .filter(|&aot| aot != 0)
            .unwrap_or(2);
        return Ok((AudioCodec::Aac, format!("mp4a.40.{aot}")));
    }
    match codec_id {
        "A_PCM/INT/LIT" => Ok((AudioCodec::Pcm, "pcm".into())),
        "A_MPEG/L3" => Ok((AudioCodec::Mp3, "mp3".into())),
        other => Err(ParseError::unsupported("codec", other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Clusters and blocks
// ---------------------------------------------------------------------------

/// A decoded block frame before duration fix-up.
struct PendingFrame {
    track: u64,
    position: SamplePosition,
    /// Duration still unknown; fill from the next frame's dts.
    needs_duration: bool,
}

fn parse_cluster(
    data: &[u8],
    base: u64,
    tracks: &HashMap<u64, MkvTrack>,
) -> ParseResult<Vec<(u32, Vec<SamplePosition>)>> {
    let mut cluster_ts: i64 = 0;
    let mut frames: Vec<PendingFrame> = Vec::new();

    for_each_element(data, base, |element, payload, offset| {
        match element {
            id::TIMESTAMP => {
                cluster_ts = read_uint(payload, offset)? as i64;
            }
            id::SIMPLE_BLOCK => {
                parse_block(payload, offset, cluster_ts, tracks, None, &mut frames)?;
            }
            id::BLOCK_GROUP => {
                let mut block: Option<(&[u8], u64)> = None;
                let mut has_reference = false;
                let mut block_duration: Option<u64> = None;
                for_each_element(payload, offset, |child, child_payload, child_offset| {
                    match child {
                        id::BLOCK => block = Some((child_payload, child_offset)),
                        id::REFERENCE_BLOCK => has_reference = true,
                        id::BLOCK_DURATION => {
                            block_duration = Some(read_uint(child_payload, child_offset)?)
                        }
                        _ => {}
                    }
                    Ok(())
                })?;
                if let Some((block_payload, block_offset)) = block {
                    parse_block(
                        block_payload,
                        block_offset,
                        cluster_ts,
                        tracks,
                        Some(BlockGroupContext {
                            has_reference,
                            duration: block_duration,
                        }),
                        &mut frames,
                    )?;
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    // Fix up unknown durations from the next frame of the same track; the
    // last frame of a track falls back to its predecessor's duration.
    let mut by_track: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, frame) in frames.iter().enumerate() {
        by_track.entry(frame.track).or_default().push(i);
    }
    for indices in by_track.values() {
        for pair in indices.windows(2) {
            let next_dts = frames[pair[1]].position.dts;
            let frame = &mut frames[pair[0]];
            if frame.needs_duration {
                let delta = next_dts - frame.position.dts;
                frame.position.duration = if delta > 0 { delta as u32 } else { 1 };
            }
        }
        if let Some(&last) = indices.last() {
            if frames[last].needs_duration {
                let prev_duration = indices
                    .iter()
                    .rev()
                    .nth(1)
                    .map(|&i| frames[i].position.duration);
                frames[last].position.duration = prev_duration.unwrap_or(1).max(1);
            }
        }
    }

    // Group per track, preserving decode order.
    let mut order: Vec<u64> = Vec::new();
    let mut grouped: HashMap<u64, Vec<SamplePosition>> = HashMap::new();
    for frame in frames {
        if !grouped.contains_key(&frame.track) {
            order.push(frame.track);
        }
        grouped.entry(frame.track).or_default().push(frame.position);
    }

    Ok(order
        .into_iter()
        .map(|track| {
            let positions = grouped.remove(&track).unwrap_or_default();
            (track as u32, positions)
        })
        .collect())
}

struct BlockGroupContext {
    has_reference: bool,
    duration: Option<u64>,
}

/// Decode a Block/SimpleBlock header and its laced frames into positions.
fn parse_block(
    data: &[u8],
    base: u64,
    cluster_ts: i64,
    tracks: &HashMap<u64, MkvTrack>,
    group: Option<BlockGroupContext>,
    frames: &mut Vec<PendingFrame>,
) -> ParseResult<()> {
    let mut cursor = ByteCursor::new(data, base);
    let track_number = cursor.read_vint().map_err(|e| fatal_block(e, base))?;
    let relative_ts = cursor.read_i16().map_err(|e| fatal_block(e, base))?;
    let flags = cursor.read_u8().map_err(|e| fatal_block(e, base))?;

    let track = match tracks.get(&track_number) {
        Some(t) => t,
        None => {
            // Blocks for undeclared (e.g. subtitle) tracks are skipped.
            tracing::debug!(track = track_number, "block for undeclared track");
            return Ok(());
        }
    };

    let is_keyframe = match &group {
        // SimpleBlock: bit 7 of the flag byte.
        None => flags & 0x80 != 0,
        // Block in a BlockGroup: keyframe iff no ReferenceBlock sibling.
        Some(g) => !g.has_reference,
    };
    // Audio frames are always independently decodable.
    let is_keyframe = if track.is_video { is_keyframe } else { true };

    let lacing = (flags >> 1) & 0x3;
    let lace_sizes = parse_lacing(&mut cursor, lacing, base)?;

    let block_dts = cluster_ts + i64::from(relative_ts);
    let group_duration = group.and_then(|g| g.duration);

    let mut lace_offset = cursor.relative_position();
    let lace_count = lace_sizes.len();
    for (i, size) in lace_sizes.into_iter().enumerate() {
        if lace_offset + size > data.len() {
            return Err(ParseError::malformed(
                "block",
                base,
                "lace sizes overflow the block payload",
            ));
        }
        if size == 0 {
            return Err(ParseError::malformed("block", base, "zero-size lace frame"));
        }

        // Laced frames are spaced by the track default duration.
        let spacing = track.default_duration_ticks.unwrap_or(1);
        let dts = block_dts + i64::from(i as u32) * i64::from(spacing);

        let (duration, needs_duration) = match track.default_duration_ticks {
            Some(d) => (d.max(1), false),
            None => match group_duration {
                // A BlockGroup duration covers the whole block.
                Some(d) if lace_count == 1 => ((d as u32).max(1), false),
                _ => (0, true),
            },
        };

        frames.push(PendingFrame {
            track: track_number,
            position: SamplePosition {
                file_offset: base + lace_offset as u64,
                size: size as u32,
                dts,
                cts: dts,
                duration,
                is_keyframe,
            },
            needs_duration,
        });
        lace_offset += size;
    }

    Ok(())
}

/// Decode the lace size list. Returns one entry per frame.
fn parse_lacing(
    cursor: &mut ByteCursor<'_>,
    lacing: u8,
    block_offset: u64,
) -> ParseResult<Vec<usize>> {
    match lacing {
        // No lacing: a single frame spans the rest of the block.
        0 => Ok(vec![cursor.remaining()]),
        // Xiph: sizes as 255-run sums, last frame implicit.
        1 => {
            let count = usize::from(cursor.read_u8().map_err(|e| fatal_block(e, block_offset))?) + 1;
            let mut sizes = Vec::with_capacity(count);
            let mut total = 0usize;
            for _ in 0..count - 1 {
                let mut size = 0usize;
                loop {
                    let b = cursor.read_u8().map_err(|e| fatal_block(e, block_offset))?;
                    size += usize::from(b);
                    if b != 255 {
                        break;
                    }
                }
                total += size;
                sizes.push(size);
            }
            let remaining = cursor.remaining();
            if total > remaining {
                return Err(ParseError::malformed(
                    "block",
                    block_offset,
                    "Xiph lace sizes exceed payload",
                ));
            }
            sizes.push(remaining - total);
            Ok(sizes)
        }
        // Fixed-size: equal split of the remainder.
        2 => {
            let count = usize::from(cursor.read_u8().map_err(|e| fatal_block(e, block_offset))?) + 1;
            let remaining = cursor.remaining();
            if remaining % count != 0 {
                return Err(ParseError::malformed(
                    "block",
                    block_offset,
                    format!("{remaining} bytes do not split into {count} fixed laces"),
                ));
            }
            Ok(vec![remaining / count; count])
        }
        // EBML: first size explicit, then signed deltas.
        3 => {
            let count = usize::from(cursor.read_u8().map_err(|e| fatal_block(e, block_offset))?) + 1;
            let mut sizes = Vec::with_capacity(count);
            let first = cursor.read_vint().map_err(|e| fatal_block(e, block_offset))? as usize;
            sizes.push(first);
            let mut previous = first as i64;
            let mut total = first;
            for _ in 1..count - 1 {
                let delta = cursor
                    .read_vint_signed()
                    .map_err(|e| fatal_block(e, block_offset))?;
                previous += delta;
                if previous <= 0 {
                    return Err(ParseError::malformed(
                        "block",
                        block_offset,
                        "EBML lace size underflow",
                    ));
                }
                total += previous as usize;
                sizes.push(previous as usize);
            }
            let remaining = cursor.remaining();
            if total > remaining {
                return Err(ParseError::malformed(
                    "block",
                    block_offset,
                    "EBML lace sizes exceed payload",
                ));
            }
            if count > 1 {
                sizes.push(remaining - total);
            }
            Ok(sizes)
        }
        _ => unreachable!("lacing is a 2-bit field"),
    }
}

/// A truncated structure inside a fully collected cluster is malformed.
fn fatal_block(e: ParseError, offset: u64) -> ParseError {
    if e.is_incomplete() {
        ParseError::malformed("block", offset, "truncated block header")
    } else {
        e
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::webm::ebml;

    fn ebml_header() -> Vec<u8> {
        let mut children = Vec::new();
        ebml::write_string_element(&mut children, id::DOC_TYPE, "webm");
        ebml::write_uint_element(&mut children, id::DOC_TYPE_VERSION, 2);
        ebml::write_uint_element(&mut children, id::DOC_TYPE_READ_VERSION, 2);
        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::EBML_HEADER, &children);
        out
    }

    fn info(scale_ns: u64) -> Vec<u8> {
        let mut children = Vec::new();
        ebml::write_uint_element(&mut children, id::TIMESTAMP_SCALE, scale_ns);
        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::INFO, &children);
        out
    }

    fn video_track_entry(number: u64, default_duration_ns: Option<u64>) -> Vec<u8> {
        let mut entry = Vec::new();
        ebml::write_uint_element(&mut entry, id::TRACK_NUMBER, number);
        ebml::write_uint_element(&mut entry, id::TRACK_TYPE, id::TRACK_TYPE_VIDEO);
        ebml::write_string_element(&mut entry, id::CODEC_ID, "V_VP8");
        if let Some(ns) = default_duration_ns {
            ebml::write_uint_element(&mut entry, id::DEFAULT_DURATION, ns);
        }
        let mut video = Vec::new();
        ebml::write_uint_element(&mut video, id::PIXEL_WIDTH, 320);
        ebml::write_uint_element(&mut video, id::PIXEL_HEIGHT, 240);
        ebml::write_master_element(&mut entry, id::VIDEO, &video);
        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::TRACK_ENTRY, &entry);
        out
    }

    fn audio_track_entry(number: u64) -> Vec<u8> {
        let mut entry = Vec::new();
        ebml::write_uint_element(&mut entry, id::TRACK_NUMBER, number);
        ebml::write_uint_element(&mut entry, id::TRACK_TYPE, id::TRACK_TYPE_AUDIO);
        ebml::write_string_element(&mut entry, id::CODEC_ID, "A_OPUS");
        ebml::write_uint_element(&mut entry, id::DEFAULT_DURATION, 20_000_000);
        let mut audio = Vec::new();
        let mut freq = Vec::new();
        ebml::write_element_id(&mut freq, id::SAMPLING_FREQUENCY);
        ebml::write_vint(&mut freq, 8);
        freq.extend_from_slice(&48_000f64.to_be_bytes());
        audio.extend_from_slice(&freq);
        ebml::write_uint_element(&mut audio, id::CHANNELS, 2);
        ebml::write_master_element(&mut entry, id::AUDIO, &audio);
        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::TRACK_ENTRY, &entry);
        out
    }

    fn tracks(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut children = Vec::new();
        for e in entries {
            children.extend_from_slice(e);
        }
        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::TRACKS, &children);
        out
    }

    fn simple_block(track: u64, relative: i16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut block = Vec::new();
        ebml::write_vint(&mut block, track);
        block.extend_from_slice(&relative.to_be_bytes());
        block.push(flags);
        block.extend_from_slice(payload);
        let mut out = Vec::new();
        ebml::write_binary_element(&mut out, id::SIMPLE_BLOCK, &block);
        out
    }

    fn cluster(timestamp: u64, blocks: &[Vec<u8>]) -> Vec<u8> {
        let mut children = Vec::new();
        ebml::write_uint_element(&mut children, id::TIMESTAMP, timestamp);
        for b in blocks {
            children.extend_from_slice(b);
        }
        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::CLUSTER, &children);
        out
    }

    fn segment(children: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        ebml::write_element_id(&mut out, id::SEGMENT);
        ebml::write_unknown_size(&mut out);
        for c in children {
            out.extend_from_slice(c);
        }
        out
    }

    fn run(file: &[u8]) -> Vec<DemuxEvent> {
        let mut demuxer = MkvDemuxer::new();
        demuxer.push(file).unwrap();
        demuxer.finish().unwrap();
        let mut events = Vec::new();
        while let Some(e) = demuxer.poll_event() {
            events.push(e);
        }
        events
    }

    fn sample_events(events: &[DemuxEvent], track: u32) -> Vec<SamplePosition> {
        events
            .iter()
            .filter_map(|e| match e {
                DemuxEvent::Samples { track_id, positions } if *track_id == track => {
                    Some(positions.clone())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn simple_block_timing_and_keyframe() {
        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[video_track_entry(1, None)]),
            cluster(1000, &[simple_block(1, 17, 0x80, &[0u8; 512])]),
        ]));

        let events = run(&file);
        match &events[0] {
            DemuxEvent::Track(track) => {
                assert_eq!(track.id, 1);
                // 1 ms ticks at the default TimestampScale.
                assert_eq!(track.timescale, 1000);
                let video = track.video().unwrap();
                assert_eq!(video.codec, VideoCodec::Vp8);
                assert_eq!(video.coded_width, 320);
            }
            other => panic!("expected track, got {other:?}"),
        }

        let positions = sample_events(&events, 1);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].dts, 1017);
        assert_eq!(positions[0].size, 512);
        assert!(positions[0].is_keyframe);
        assert!(matches!(events.last(), Some(DemuxEvent::Done)));
    }

    #[test]
    fn block_payload_offset_points_into_source() {
        let payload = [0xAA, 0xBB, 0xCC, 0xDD];
        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[video_track_entry(1, None)]),
            cluster(0, &[simple_block(1, 0, 0x80, &payload)]),
        ]));

        let events = run(&file);
        let positions = sample_events(&events, 1);
        let offset = positions[0].file_offset as usize;
        assert_eq!(&file[offset..offset + 4], &payload);
    }

    #[test]
    fn block_group_without_reference_is_keyframe() {
        let make_group = |with_reference: bool| {
            let mut block = Vec::new();
            ebml::write_vint(&mut block, 1);
            block.extend_from_slice(&0i16.to_be_bytes());
            block.push(0);
            block.extend_from_slice(&[1, 2, 3]);

            let mut group = Vec::new();
            ebml::write_binary_element(&mut group, id::BLOCK, &block);
            if with_reference {
                ebml::write_uint_element(&mut group, id::REFERENCE_BLOCK, 0x7F);
            }
            let mut out = Vec::new();
            ebml::write_master_element(&mut out, id::BLOCK_GROUP, &group);
            out
        };

        let mut keyframe_file = ebml_header();
        keyframe_file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[video_track_entry(1, None)]),
            cluster(0, &[make_group(false)]),
        ]));
        let positions = sample_events(&run(&keyframe_file), 1);
        assert!(positions[0].is_keyframe);

        let mut delta_file = ebml_header();
        delta_file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[video_track_entry(1, None)]),
            cluster(0, &[make_group(true)]),
        ]));
        let positions = sample_events(&run(&delta_file), 1);
        assert!(!positions[0].is_keyframe);
    }

    #[test]
    fn fixed_lacing_splits_evenly() {
        // Two 6-byte frames, fixed lacing (flag bits 0b100), count byte 1.
        let mut block = Vec::new();
        ebml::write_vint(&mut block, 1);
        block.extend_from_slice(&0i16.to_be_bytes());
        block.push(0x80 | 0x04);
        block.push(1); // frame count - 1
        block.extend_from_slice(&[0x11; 6]);
        block.extend_from_slice(&[0x22; 6]);
        let mut sb = Vec::new();
        ebml::write_binary_element(&mut sb, id::SIMPLE_BLOCK, &block);

        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(1_000_000),
            // 40 ms per frame so laced frames get distinct timestamps.
            tracks(&[video_track_entry(1, Some(40_000_000))]),
            cluster(0, &[sb]),
        ]));

        let events = run(&file);
        let positions = sample_events(&events, 1);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].size, 6);
        assert_eq!(positions[1].size, 6);
        assert_eq!(positions[1].file_offset, positions[0].file_offset + 6);
        assert_eq!(positions[0].dts, 0);
        assert_eq!(positions[1].dts, 40);
        assert_eq!(positions[0].duration, 40);
    }

    #[test]
    fn xiph_lacing_sizes() {
        // Frames of 3 and 5 bytes; Xiph lacing (flag bits 0b010).
        let mut block = Vec::new();
        ebml::write_vint(&mut block, 2);
        block.extend_from_slice(&0i16.to_be_bytes());
        block.push(0x80 | 0x02);
        block.push(1); // frame count - 1
        block.push(3); // first frame size
        block.extend_from_slice(&[0xAA; 3]);
        block.extend_from_slice(&[0xBB; 5]);
        let mut sb = Vec::new();
        ebml::write_binary_element(&mut sb, id::SIMPLE_BLOCK, &block);

        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[audio_track_entry(2)]),
            cluster(0, &[sb]),
        ]));

        let positions = sample_events(&run(&file), 2);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].size, 3);
        assert_eq!(positions[1].size, 5);
        // Opus DefaultDuration of 20 ms spaces the laced frames.
        assert_eq!(positions[1].dts - positions[0].dts, 20);
        assert!(positions.iter().all(|p| p.is_keyframe));
    }

    #[test]
    fn timestamp_scale_changes_tick_rate() {
        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(500_000), // 0.5 ms ticks => 2000 ticks/second
            tracks(&[video_track_entry(1, None)]),
            cluster(100, &[simple_block(1, 4, 0x80, &[0u8; 8])]),
        ]));

        let events = run(&file);
        match &events[0] {
            DemuxEvent::Track(track) => assert_eq!(track.timescale, 2000),
            other => panic!("expected track, got {other:?}"),
        }
        let positions = sample_events(&events, 1);
        assert_eq!(positions[0].dts, 104);
    }

    #[test]
    fn byte_at_a_time_push_is_equivalent() {
        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[video_track_entry(1, None)]),
            cluster(0, &[simple_block(1, 0, 0x80, &[0u8; 16])]),
        ]));

        let mut demuxer = MkvDemuxer::new();
        for byte in &file {
            demuxer.push(std::slice::from_ref(byte)).unwrap();
        }
        demuxer.finish().unwrap();

        let mut events = Vec::new();
        while let Some(e) = demuxer.poll_event() {
            events.push(e);
        }
        assert!(matches!(events[0], DemuxEvent::Track(_)));
        assert!(matches!(events[1], DemuxEvent::Samples { .. }));
        assert!(matches!(events[2], DemuxEvent::Done));
    }

    #[test]
    fn non_matroska_doc_type_rejected() {
        let mut children = Vec::new();
        ebml::write_string_element(&mut children, id::DOC_TYPE, "tiff");
        let mut file = Vec::new();
        ebml::write_master_element(&mut file, id::EBML_HEADER, &children);

        let mut demuxer = MkvDemuxer::new();
        let err = demuxer.push(&file).unwrap_err();
        assert!(err.to_string().contains("DocType"));
    }

    #[test]
    fn truncated_cluster_fails_on_finish() {
        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[video_track_entry(1, None)]),
            cluster(0, &[simple_block(1, 0, 0x80, &[0u8; 64])]),
        ]));
        file.truncate(file.len() - 10);

        let mut demuxer = MkvDemuxer::new();
        demuxer.push(&file).unwrap();
        assert!(demuxer.finish().is_err());
    }

    #[test]
    fn blocks_for_undeclared_tracks_are_skipped() {
        let mut file = ebml_header();
        file.extend_from_slice(&segment(&[
            info(1_000_000),
            tracks(&[video_track_entry(1, None)]),
            cluster(
                0,
                &[
                    simple_block(9, 0, 0x80, &[0u8; 4]),
                    simple_block(1, 1, 0x80, &[0u8; 4]),
                ],
            ),
        ]));

        let events = run(&file);
        assert!(sample_events(&events, 9).is_empty());
        assert_eq!(sample_events(&events, 1).len(), 1);
    }
}
