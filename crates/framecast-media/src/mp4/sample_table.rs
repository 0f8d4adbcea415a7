//! Sample-table resolution for non-fragmented MP4 tracks.
//!
//! Composes stts (DTS deltas), ctts (CTS offsets), stsz/stz2 (sizes),
//! stsc + stco/co64 (chunk mapping), and stss (sync samples) into a flat
//! list of [`SamplePosition`]s in decode order.

use framecast_core::media::SamplePosition;
use std::collections::HashSet;

use crate::error::{ParseError, ParseResult};

/// `(count, delta)` run from stts.
#[derive(Debug, Clone, Copy)]
pub struct SttsEntry {
    pub count: u32,
    pub delta: u32,
}

/// `(count, offset)` run from ctts; offsets are signed in version 1.
#[derive(Debug, Clone, Copy)]
pub struct CttsEntry {
    pub count: u32,
    pub offset: i32,
}

/// `(first_chunk, samples_per_chunk)` run from stsc.
#[derive(Debug, Clone, Copy)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

/// Parsed sample tables for one track, prior to resolution.
#[derive(Debug, Clone, Default)]
pub struct SampleTables {
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stsc: Vec<StscEntry>,
    /// Uniform size when nonzero; otherwise `sizes` carries per-sample sizes.
    pub uniform_size: u32,
    pub sizes: Vec<u32>,
    pub sample_count: u32,
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers; `None` means no stss box was present,
    /// in which case every sample is a sync sample.
    pub sync_samples: Option<Vec<u32>>,
}

impl SampleTables {
    /// Whether the track carries any table-addressed samples at all.
    /// Fragmented files ship empty tables and deliver samples via moof.
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    fn size_of(&self, index: usize) -> Option<u32> {
        if self.uniform_size != 0 {
            Some(self.uniform_size)
        } else {
            self.sizes.get(index).copied()
        }
    }
}

/// Resolve the parsed tables into per-sample positions, decode order.
///
/// `track_offset` is the absolute offset of the enclosing trak box, used for
/// error reporting only.
pub fn resolve_positions(
    tables: &SampleTables,
    track_offset: u64,
) -> ParseResult<Vec<SamplePosition>> {
    let sample_count = tables.sample_count as usize;
    if sample_count == 0 {
        return Ok(Vec::new());
    }
    if tables.stts.is_empty() {
        return Err(ParseError::malformed(
            "stbl",
            track_offset,
            "stts missing for a track with samples",
        ));
    }
    if tables.stsc.is_empty() || tables.chunk_offsets.is_empty() {
        return Err(ParseError::malformed(
            "stbl",
            track_offset,
            "stsc/stco missing for a track with samples",
        ));
    }

    // --- DTS and duration from stts runs ---
    let mut dts_values = Vec::with_capacity(sample_count);
    let mut dts: i64 = 0;
    for entry in &tables.stts {
        if entry.delta == 0 {
            return Err(ParseError::malformed(
                "stts",
                track_offset,
                "zero sample delta",
            ));
        }
        for _ in 0..entry.count {
            if dts_values.len() == sample_count {
                break;
            }
            dts_values.push((dts, entry.delta));
            dts += i64::from(entry.delta);
        }
    }
    if dts_values.len() < sample_count {
        return Err(ParseError::malformed(
            "stts",
            track_offset,
            format!(
                "stts covers {} samples, stsz declares {}",
                dts_values.len(),
                sample_count
            ),
        ));
    }

    // --- CTS offsets from ctts runs (absent => all zero) ---
    let mut cts_offsets = vec![0i32; sample_count];
    let mut i = 0usize;
    for entry in &tables.ctts {
        for _ in 0..entry.count {
            if i >= sample_count {
                break;
            }
            cts_offsets[i] = entry.offset;
            i += 1;
        }
    }

    // --- Sync set; stss absent means every sample is a keyframe ---
    let sync_set: Option<HashSet<u32>> = tables
        .sync_samples
        .as_ref()
        .map(|v| v.iter().copied().collect());

    // --- Walk chunks, assigning file offsets ---
    let mut positions = Vec::with_capacity(sample_count);
    let total_chunks = tables.chunk_offsets.len() as u32;
    let mut sample_idx = 0usize;

    'chunks: for chunk_idx in 0..total_chunks {
        let chunk_number = chunk_idx + 1; // stsc chunk indices are 1-based
        let mut samples_per_chunk = tables.stsc[0].samples_per_chunk;
        for e in &tables.stsc {
            if e.first_chunk <= chunk_number {
                samples_per_chunk = e.samples_per_chunk;
            } else {
                break;
            }
        }

        let mut offset = tables.chunk_offsets[chunk_idx as usize];
        for _ in 0..samples_per_chunk {
            if sample_idx >= sample_count {
                break 'chunks;
            }
            let size = tables.size_of(sample_idx).ok_or_else(|| {
                ParseError::malformed("stsz", track_offset, "size table shorter than sample count")
            })?;
            if size == 0 {
                return Err(ParseError::malformed(
                    "stsz",
                    track_offset,
                    format!("zero-size sample {sample_idx}"),
                ));
            }

            let (dts, duration) = dts_values[sample_idx];
            let cts = dts + i64::from(cts_offsets[sample_idx]);
            let is_keyframe = match &sync_set {
                // stss sample numbers are 1-based.
                Some(set) => set.contains(&(sample_idx as u32 + 1)),
                None => true,
            };

            positions.push(SamplePosition {
                file_offset: offset,
                size,
                dts,
                cts,
                duration,
                is_keyframe,
            });
            offset += u64::from(size);
            sample_idx += 1;
        }
    }

    if sample_idx < sample_count {
        return Err(ParseError::malformed(
            "stsc",
            track_offset,
            format!("chunk map covers {sample_idx} of {sample_count} samples"),
        ));
    }

    Ok(positions)
}
