//! Movie-fragment (moof) sample resolution.
//!
//! Each traf seeds its decode time from tfdt and walks its truns, resolving
//! per-sample duration/size/flags through the fallback chain: explicit trun
//! value, then trun first-sample-flags (first sample only), then tfhd
//! defaults, then trex defaults. A sample with no resolvable value is a
//! malformed container, not a guess.

use framecast_core::media::SamplePosition;
use std::collections::HashMap;

use crate::error::{ParseError, ParseResult};

// tfhd flag bits.
pub(crate) const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
pub(crate) const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
pub(crate) const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
pub(crate) const TFHD_DEFAULT_SAMPLE_SIZE: u32 = 0x000010;
pub(crate) const TFHD_DEFAULT_SAMPLE_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

// trun flag bits.
pub(crate) const TRUN_DATA_OFFSET: u32 = 0x000001;
pub(crate) const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
pub(crate) const TRUN_SAMPLE_DURATION: u32 = 0x000100;
pub(crate) const TRUN_SAMPLE_SIZE: u32 = 0x000200;
pub(crate) const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
pub(crate) const TRUN_SAMPLE_CTS_OFFSET: u32 = 0x000800;

/// Parsed tfhd box.
#[derive(Debug, Clone, Copy)]
pub struct Tfhd {
    pub track_id: u32,
    pub flags: u32,
    pub base_data_offset: Option<u64>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

impl Tfhd {
    pub fn default_base_is_moof(&self) -> bool {
        self.flags & TFHD_DEFAULT_BASE_IS_MOOF != 0
    }
}

/// Parsed trex defaults from the moov's mvex box.
#[derive(Debug, Clone, Copy)]
pub struct Trex {
    pub track_id: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

/// One sample row from a trun, with only the fields the run carried.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub cts_offset: i32,
}

/// Parsed trun box.
#[derive(Debug, Clone)]
pub struct Trun {
    pub flags: u32,
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

/// One traf: header, optional decode-time anchor, and its runs.
#[derive(Debug, Clone)]
pub struct TrackFragment {
    pub tfhd: Tfhd,
    pub base_media_decode_time: Option<u64>,
    pub truns: Vec<Trun>,
    /// Absolute offset of the traf box, for error reporting.
    pub offset: u64,
}

/// Keyframe bit: bit 16 of the sample flags is "sample is non-sync".
pub fn sample_flags_keyframe(flags: u32) -> bool {
    (flags >> 16) & 0x1 == 0
}

/// Resolve one moof's fragments into per-track sample positions.
///
/// `decode_times` carries each track's running decode time across fragments;
/// a traf with a tfdt resets it, one without continues from the last
/// fragment. Returns `(track_id, positions)` per traf in file order.
pub fn resolve_fragments(
    moof_offset: u64,
    fragments: &[TrackFragment],
    trex: &HashMap<u32, Trex>,
    decode_times: &mut HashMap<u32, u64>,
) -> ParseResult<Vec<(u32, Vec<SamplePosition>)>> {
    let mut out = Vec::with_capacity(fragments.len());

    for traf in fragments {
        let track_id = traf.tfhd.track_id;
        let trex = trex.get(&track_id);

        let mut time = traf
            .base_media_decode_time
            .or_else(|| decode_times.get(&track_id).copied())
            .unwrap_or(0);

        // Base for data offsets: explicit tfhd base, else the moof start
        // (default-base-is-moof and the historical default coincide here
        // since we never carry a previous fragment's end offset).
        let base = traf.tfhd.base_data_offset.unwrap_or(moof_offset);

        let mut positions = Vec::new();
        let mut run_offset = 0u64;

        for trun in &traf.truns {
            let mut offset = base.wrapping_add(run_offset);
            if let Some(data_offset) = trun.data_offset {
                offset = add_signed(base, data_offset).ok_or_else(|| {
                    ParseError::malformed("trun", traf.offset, "data offset before file start")
                })?;
            }

            for (i, sample) in trun.samples.iter().enumerate() {
                let duration = sample
                    .duration
                    .or(traf.tfhd.default_sample_duration)
                    .or(trex.map(|t| t.default_sample_duration))
                    .ok_or_else(|| {
                        ParseError::malformed("trun", traf.offset, "sample duration unavailable")
                    })?;
                let size = sample
                    .size
                    .or(traf.tfhd.default_sample_size)
                    .or(trex.map(|t| t.default_sample_size))
                    .ok_or_else(|| {
                        ParseError::malformed("trun", traf.offset, "sample size unavailable")
                    })?;
                let flags = sample
                    .flags
                    .or(if i == 0 { trun.first_sample_flags } else { None })
                    .or(traf.tfhd.default_sample_flags)
                    .or(trex.map(|t| t.default_sample_flags))
                    .ok_or_else(|| {
                        ParseError::malformed("trun", traf.offset, "sample flags unavailable")
                    })?;

                if duration == 0 {
                    return Err(ParseError::malformed(
                        "trun",
                        traf.offset,
                        "zero sample duration",
                    ));
                }
                if size == 0 {
                    return Err(ParseError::malformed(
                        "trun",
                        traf.offset,
                        "zero sample size",
                    ));
                }

                let dts = time as i64;
                positions.push(SamplePosition {
                    file_offset: offset,
                    size,
                    dts,
                    cts: dts + i64::from(sample.cts_offset),
                    duration,
                    is_keyframe: sample_flags_keyframe(flags),
                });

                offset += u64::from(size);
                time += u64::from(duration);
            }

            run_offset = offset - base;
        }

        decode_times.insert(track_id, time);
        out.push((track_id, positions));
    }

    Ok(out)
}

fn add_signed(base: u64, delta: i32) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs() as u64)
    }
}
