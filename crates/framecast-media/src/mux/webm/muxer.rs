//! WebM (Matroska) muxer.
//!
//! Emits the EBML header, a Segment of unknown size containing SeekHead,
//! Info (Duration patched on finalize), Tracks, Clusters, and Cues. Video is
//! carried as VP8/VP9, audio as Opus; anything else is rejected at track
//! registration.

use bytes::Bytes;
use framecast_core::{
    media::{AudioCodec, EncodedChunk, TrackDescriptor, TrackProperties, VideoCodec},
    Error, OutputWriter, Result,
};

use super::ebml;
use crate::mkv::element_id as id;

/// Timestamps are expressed in milliseconds.
const TIMESTAMP_SCALE_NS: u64 = 1_000_000;

/// Cluster rollover thresholds.
const MAX_CLUSTER_BYTES: usize = 5 * 1024 * 1024;
const MAX_CLUSTER_SPAN_MS: i64 = 5_000;
const KEYFRAME_CLUSTER_MS: i64 = 1_000;

const MUXING_APP: &str = "framecast";

#[derive(Debug)]
struct WebmTrack {
    number: u64,
    is_video: bool,
    /// Timestamp of the last block written for this track, for
    /// ReferenceBlock deltas.
    last_written_ms: Option<i64>,
}

#[derive(Debug)]
struct PendingBlock {
    track_number: u64,
    ts_ms: i64,
    is_keyframe: bool,
    is_video: bool,
    data: Bytes,
}

#[derive(Debug)]
struct PendingCluster {
    start_ms: i64,
    blocks: Vec<PendingBlock>,
    byte_size: usize,
}

struct CuePoint {
    time_ms: u64,
    /// Cluster offset relative to the segment payload start.
    cluster_position: u64,
}

/// Buffered-cluster WebM muxer over an [`OutputWriter`].
pub struct WebmMuxer<W: OutputWriter> {
    writer: W,
    tracks: Vec<(TrackDescriptor, WebmTrack)>,
    started: bool,
    finalized: bool,
    /// Absolute offset of the first byte after the Segment size field.
    segment_payload_start: u64,
    /// Absolute offset of the Duration float payload.
    duration_payload_pos: u64,
    /// Absolute offset of the Cues SeekPosition payload (8-byte uint).
    cues_seek_pos: u64,
    cluster: Option<PendingCluster>,
    cues: Vec<CuePoint>,
    /// Highest block end time seen, in microseconds.
    max_end_micros: i64,
}

impl<W: OutputWriter> WebmMuxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            tracks: Vec::new(),
            started: false,
            finalized: false,
            segment_payload_start: 0,
            duration_payload_pos: 0,
            cues_seek_pos: 0,
            cluster: None,
            cues: Vec::new(),
            max_end_micros: 0,
        }
    }

    /// Register a track before the first sample. Returns the Matroska track
    /// number (1-based).
    pub fn add_track(&mut self, descriptor: &TrackDescriptor) -> Result<u32> {
        if self.started {
            return Err(Error::writer("add_track after the header was written"));
        }
        let is_video = match &descriptor.properties {
            TrackProperties::Video(v) => {
                if !matches!(v.codec, VideoCodec::Vp8 | VideoCodec::Vp9) {
                    return Err(Error::unsupported_codec(v.codec.to_string(), "webm muxer"));
                }
                true
            }
            TrackProperties::Audio(a) => {
                if a.codec != AudioCodec::Opus {
                    return Err(Error::unsupported_codec(a.codec.to_string(), "webm muxer"));
                }
                false
            }
        };

        let number = self.tracks.len() as u64 + 1;
        self.tracks.push((
            descriptor.clone(),
            WebmTrack {
                number,
                is_video,
                last_written_ms: None,
            },
        ));
        Ok(number as u32)
    }

    /// Append one encoded chunk to a registered track.
    pub fn add_sample(&mut self, track_number: u32, chunk: &EncodedChunk) -> Result<()> {
        if self.finalized {
            return Err(Error::writer("add_sample after finalize"));
        }
        if !self.started {
            self.write_header()?;
        }

        let (_, track) = self
            .tracks
            .get(track_number.saturating_sub(1) as usize)
            .ok_or_else(|| Error::writer(format!("unknown track {track_number}")))?;
        let is_video = track.is_video;
        let number = track.number;

        let ts_ms = (chunk.timestamp_micros + 500) / 1000;
        let end = chunk.timestamp_micros + i64::from(chunk.duration_micros);
        if end > self.max_end_micros {
            self.max_end_micros = end;
        }

        // Cluster rollover policy.
        let needs_new = match &self.cluster {
            None => true,
            Some(cluster) => {
                cluster.byte_size >= MAX_CLUSTER_BYTES
                    || ts_ms - cluster.start_ms >= MAX_CLUSTER_SPAN_MS
                    || (is_video
                        && chunk.is_keyframe
                        && ts_ms - cluster.start_ms >= KEYFRAME_CLUSTER_MS)
            }
        };
        if needs_new {
            self.flush_cluster()?;
        }
        let cluster = self.cluster.get_or_insert_with(|| PendingCluster {
            start_ms: ts_ms,
            blocks: Vec::new(),
            byte_size: 0,
        });
        let relative = ts_ms - cluster.start_ms;
        if i16::try_from(relative).is_err() {
            return Err(Error::writer(format!(
                "block timestamp {relative} ms out of cluster range"
            )));
        }

        cluster.byte_size += chunk.data.len() + 16;
        cluster.blocks.push(PendingBlock {
            track_number: number,
            ts_ms,
            // Audio frames are always independently decodable.
            is_keyframe: chunk.is_keyframe || !is_video,
            is_video,
            data: chunk.data.clone(),
        });
        Ok(())
    }

    /// Flush the open cluster, write Cues, and patch the deferred fields.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if !self.started {
            self.write_header()?;
        }
        self.flush_cluster()?;

        // Cues: one point per cluster that opened with a video keyframe.
        let cues_position = self.writer.written_len() - self.segment_payload_start;
        let video_track = self.tracks.iter().find(|(_, t)| t.is_video).map(|(_, t)| t.number);
        if let Some(video_track) = video_track {
            let mut cues = Vec::new();
            for cue in &self.cues {
                let mut point = Vec::new();
                ebml::write_uint_element(&mut point, id::CUE_TIME, cue.time_ms);
                let mut positions = Vec::new();
                ebml::write_uint_element(&mut positions, id::CUE_TRACK, video_track);
                ebml::write_uint_element(
                    &mut positions,
                    id::CUE_CLUSTER_POSITION,
                    cue.cluster_position,
                );
                ebml::write_master_element(&mut point, id::CUE_TRACK_POSITIONS, &positions);
                ebml::write_master_element(&mut cues, id::CUE_POINT, &point);
            }
            let mut out = Vec::new();
            ebml::write_master_element(&mut out, id::CUES, &cues);
            self.writer.write(&out).map_err(Error::writer)?;

            // Point the SeekHead entry at the Cues we just wrote.
            self.writer
                .update_data_at(self.cues_seek_pos, &cues_position.to_be_bytes())
                .map_err(Error::writer)?;
        }

        // Patch the Duration float with the final timeline end.
        let duration_ms = self.max_end_micros as f64 / 1000.0;
        self.writer
            .update_data_at(self.duration_payload_pos, &duration_ms.to_be_bytes())
            .map_err(Error::writer)?;

        tracing::debug!(
            tracks = self.tracks.len(),
            cues = self.cues.len(),
            duration_ms,
            bytes = self.writer.written_len(),
            "webm finalized"
        );
        self.finalized = true;
        Ok(())
    }

    /// Consume the muxer and hand back its writer.
    pub fn into_writer(self) -> W {
        self.writer
    }

    // -- Header -------------------------------------------------------------

    fn write_header(&mut self) -> Result<()> {
        self.started = true;

        // EBML header: webm DocType, version 2.
        let mut header_children = Vec::new();
        ebml::write_uint_element(&mut header_children, id::EBML_VERSION, 1);
        ebml::write_uint_element(&mut header_children, id::EBML_READ_VERSION, 1);
        ebml::write_string_element(&mut header_children, id::DOC_TYPE, "webm");
        ebml::write_uint_element(&mut header_children, id::DOC_TYPE_VERSION, 2);
        ebml::write_uint_element(&mut header_children, id::DOC_TYPE_READ_VERSION, 2);

        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::EBML_HEADER, &header_children);

        // Segment with unknown size; clusters run to end of output.
        ebml::write_element_id(&mut out, id::SEGMENT);
        ebml::write_unknown_size(&mut out);
        let segment_payload_start = out.len();

        // Info and Tracks, serialized first so SeekHead can reference them.
        let mut info = Vec::new();
        ebml::write_uint_element(&mut info, id::TIMESTAMP_SCALE, TIMESTAMP_SCALE_NS);
        ebml::write_string_element(&mut info, id::MUXING_APP, MUXING_APP);
        ebml::write_string_element(&mut info, id::WRITING_APP, MUXING_APP);
        let duration_rel = ebml::write_float_element(&mut info, id::DURATION, 0.0);
        let mut info_element = Vec::new();
        ebml::write_master_element(&mut info_element, id::INFO, &info);
        // Offset of the Duration payload within the full Info element.
        let duration_in_info = (info_element.len() - info.len()) + duration_rel;

        let mut tracks_children = Vec::new();
        for (descriptor, track) in &self.tracks {
            tracks_children.extend_from_slice(&serialize_track_entry(descriptor, track));
        }
        let mut tracks_element = Vec::new();
        ebml::write_master_element(&mut tracks_element, id::TRACKS, &tracks_children);

        // SeekHead with fixed-width positions: Info, Tracks, Cues (patched).
        let (seek_head, cues_pos_rel) = build_seek_head(info_element.len());

        let seek_head_start = out.len();
        out.extend_from_slice(&seek_head);
        let info_start = out.len();
        out.extend_from_slice(&info_element);
        out.extend_from_slice(&tracks_element);

        let base = self.writer.written_len();
        self.segment_payload_start = base + segment_payload_start as u64;
        self.duration_payload_pos = base + (info_start + duration_in_info) as u64;
        self.cues_seek_pos = base + (seek_head_start + cues_pos_rel) as u64;

        self.writer.write(&out).map_err(Error::writer)?;
        Ok(())
    }

    // -- Clusters -----------------------------------------------------------

    fn flush_cluster(&mut self) -> Result<()> {
        let Some(mut cluster) = self.cluster.take() else {
            return Ok(());
        };
        if cluster.blocks.is_empty() {
            return Ok(());
        }

        // Blocks within a cluster must be in non-decreasing timestamp order.
        cluster.blocks.sort_by_key(|b| b.ts_ms);

        let cluster_position = self.writer.written_len() - self.segment_payload_start;
        let has_video_keyframe = cluster
            .blocks
            .iter()
            .any(|b| b.is_video && b.is_keyframe);

        let mut content = Vec::with_capacity(cluster.byte_size + 16);
        ebml::write_uint_element(&mut content, id::TIMESTAMP, cluster.start_ms.max(0) as u64);

        for block in &cluster.blocks {
            let relative = (block.ts_ms - cluster.start_ms) as i16;
            let Some((_, track)) = self.tracks.get_mut(block.track_number as usize - 1) else {
                continue;
            };

            if block.is_keyframe || !block.is_video {
                // SimpleBlock with the keyframe flag.
                let payload = serialize_block_payload(
                    block.track_number,
                    relative,
                    0x80,
                    &block.data,
                );
                ebml::write_binary_element(&mut content, id::SIMPLE_BLOCK, &payload);
            } else {
                // Non-key video: Block + ReferenceBlock inside a BlockGroup.
                let reference_delta = track
                    .last_written_ms
                    .map(|last| last - block.ts_ms)
                    .unwrap_or(-1);
                let payload =
                    serialize_block_payload(block.track_number, relative, 0, &block.data);
                let mut group = Vec::new();
                ebml::write_binary_element(&mut group, id::BLOCK, &payload);
                write_int_element(&mut group, id::REFERENCE_BLOCK, reference_delta);
                ebml::write_master_element(&mut content, id::BLOCK_GROUP, &group);
            }
            track.last_written_ms = Some(block.ts_ms);
        }

        let mut out = Vec::new();
        ebml::write_master_element(&mut out, id::CLUSTER, &content);
        self.writer.write(&out).map_err(Error::writer)?;

        if has_video_keyframe {
            self.cues.push(CuePoint {
                time_ms: cluster.start_ms.max(0) as u64,
                cluster_position,
            });
        }
        Ok(())
    }
}

/// Block payload: track VINT + signed 16-bit relative timestamp + flags,
/// followed by the frame data (no lacing).
fn serialize_block_payload(track_number: u64, relative: i16, flags: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    ebml::write_vint(&mut out, track_number);
    out.extend_from_slice(&relative.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(data);
    out
}

/// Signed-integer element in minimal two's-complement bytes.
fn write_int_element(out: &mut Vec<u8>, id: u32, value: i64) {
    let bytes = value.to_be_bytes();
    let mut skip = 0;
    while skip < 7 {
        let b = bytes[skip];
        let next_msb = bytes[skip + 1] & 0x80;
        let redundant = (b == 0x00 && next_msb == 0) || (b == 0xFF && next_msb != 0);
        if !redundant {
            break;
        }
        skip += 1;
    }
    ebml::write_element_id(out, id);
    ebml::write_vint(out, (8 - skip) as u64);
    out.extend_from_slice(&bytes[skip..]);
}

fn serialize_track_entry(descriptor: &TrackDescriptor, track: &WebmTrack) -> Vec<u8> {
    let mut entry = Vec::new();
    ebml::write_uint_element(&mut entry, id::TRACK_NUMBER, track.number);
    ebml::write_uint_element(&mut entry, id::TRACK_UID, track.number);
    ebml::write_uint_element(
        &mut entry,
        id::TRACK_TYPE,
        if track.is_video {
            id::TRACK_TYPE_VIDEO
        } else {
            id::TRACK_TYPE_AUDIO
        },
    );
    ebml::write_uint_element(&mut entry, id::FLAG_LACING, 0);

    match &descriptor.properties {
        TrackProperties::Video(v) => {
            let codec_id = match v.codec {
                VideoCodec::Vp9 => "V_VP9",
                _ => "V_VP8",
            };
            ebml::write_string_element(&mut entry, id::CODEC_ID, codec_id);
            if let Some(private) = &v.codec_private {
                ebml::write_binary_element(&mut entry, id::CODEC_PRIVATE, private);
            }
            let mut video = Vec::new();
            ebml::write_uint_element(&mut video, id::PIXEL_WIDTH, u64::from(v.coded_width));
            ebml::write_uint_element(&mut video, id::PIXEL_HEIGHT, u64::from(v.coded_height));
            if v.display_width != v.coded_width || v.display_height != v.coded_height {
                ebml::write_uint_element(&mut video, id::DISPLAY_WIDTH, u64::from(v.display_width));
                ebml::write_uint_element(
                    &mut video,
                    id::DISPLAY_HEIGHT,
                    u64::from(v.display_height),
                );
            }
            ebml::write_master_element(&mut entry, id::VIDEO, &video);
        }
        TrackProperties::Audio(a) => {
            ebml::write_string_element(&mut entry, id::CODEC_ID, "A_OPUS");
            if let Some(private) = &a.codec_private {
                ebml::write_binary_element(&mut entry, id::CODEC_PRIVATE, private);
            }
            let mut audio = Vec::new();
            let mut freq = Vec::new();
            ebml::write_element_id(&mut freq, id::SAMPLING_FREQUENCY);
            ebml::write_vint(&mut freq, 8);
            freq.extend_from_slice(&(a.sample_rate as f64).to_be_bytes());
            audio.extend_from_slice(&freq);
            ebml::write_uint_element(&mut audio, id::CHANNELS, u64::from(a.channels));
            ebml::write_master_element(&mut entry, id::AUDIO, &audio);
        }
    }

    let mut out = Vec::new();
    ebml::write_master_element(&mut out, id::TRACK_ENTRY, &entry);
    out
}

/// SeekHead with three fixed-width entries (Info, Tracks, Cues). Returns the
/// serialized bytes and the offset of the Cues SeekPosition payload within
/// them.
fn build_seek_head(info_len: usize) -> (Vec<u8>, usize) {
    // One entry: Seek { SeekID (4-byte id), SeekPosition (8-byte uint) }.
    fn entry(out: &mut Vec<u8>, target_id: u32, position: u64) -> usize {
        let mut seek = Vec::new();
        let mut id_bytes = Vec::new();
        ebml::write_element_id(&mut id_bytes, target_id);
        ebml::write_binary_element(&mut seek, id::SEEK_ID, &id_bytes);
        ebml::write_element_id(&mut seek, id::SEEK_POSITION);
        ebml::write_vint(&mut seek, 8);
        let pos_in_seek = seek.len();
        seek.extend_from_slice(&position.to_be_bytes());

        let before = out.len();
        ebml::write_master_element(out, id::SEEK, &seek);
        // Offset of the position payload inside the serialized entry:
        // SEEK id (2 bytes) + size vint (1 byte) + pos_in_seek.
        before + 2 + 1 + pos_in_seek
    }

    // The SeekHead's own size is fixed: 3 entries of fixed width.
    let mut body = Vec::new();
    let _ = entry(&mut body, id::INFO, 0);
    let one_entry_len = body.len();
    body.clear();

    let seek_head_len = 4 + 1 + 3 * one_entry_len; // id (4) + size vint (1)
    let info_pos = seek_head_len as u64;
    let tracks_pos = info_pos + info_len as u64;

    let _ = entry(&mut body, id::INFO, info_pos);
    let _ = entry(&mut body, id::TRACKS, tracks_pos);
    let cues_entry_pos = entry(&mut body, id::CUES, 0);

    let mut out = Vec::new();
    ebml::write_master_element(&mut out, id::SEEK_HEAD, &body);
    debug_assert_eq!(out.len(), seek_head_len);

    // Account for the SeekHead id + size prefix in front of the body.
    (out, 4 + 1 + cues_entry_pos)
}
