//! MP4 muxer: buffers encoded samples per track and emits
//! `ftyp` + `moov` + `mdat` on finalize.
//!
//! Only H.264 video and AAC audio are writable. Default output order is
//! moov-first (streamable): chunk offsets are written as placeholders and
//! patched through the writer once the mdat position is known. The
//! `moov_last` option emits mdat before moov for writers that cannot patch.

use bytes::Bytes;
use framecast_core::{
    media::{micros_to_ticks, AudioCodec, EncodedChunk, TrackDescriptor, TrackProperties, VideoCodec},
    Error, OutputWriter, Result,
};

use super::boxes;

/// Movie-level timescale: milliseconds.
const MOVIE_TIMESCALE: u32 = 1000;

/// Output ordering options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mp4MuxerOptions {
    /// Emit `moov` after `mdat` (non-streamable, no patching required).
    pub moov_last: bool,
}

#[derive(Debug)]
struct PendingSample {
    data: Bytes,
    dts_ticks: i64,
    duration_ticks: u32,
    is_keyframe: bool,
}

#[derive(Debug)]
struct MuxTrack {
    descriptor: TrackDescriptor,
    samples: Vec<PendingSample>,
}

impl MuxTrack {
    fn total_duration_ticks(&self) -> u64 {
        self.samples.iter().map(|s| u64::from(s.duration_ticks)).sum()
    }

    fn payload_len(&self) -> u64 {
        self.samples.iter().map(|s| s.data.len() as u64).sum()
    }
}

/// Buffering MP4 muxer over an [`OutputWriter`].
pub struct Mp4Muxer<W: OutputWriter> {
    writer: W,
    options: Mp4MuxerOptions,
    tracks: Vec<MuxTrack>,
    finalized: bool,
}

impl<W: OutputWriter> Mp4Muxer<W> {
    pub fn new(writer: W) -> Self {
        Self::with_options(writer, Mp4MuxerOptions::default())
    }

    pub fn with_options(writer: W, options: Mp4MuxerOptions) -> Self {
        Self {
            writer,
            options,
            tracks: Vec::new(),
            finalized: false,
        }
    }

    /// Register a track. Returns the muxer-assigned track id (1-based).
    ///
    /// Fails with [`Error::UnsupportedCodec`] for anything but H.264 video
    /// or AAC audio.
    pub fn add_track(&mut self, descriptor: &TrackDescriptor) -> Result<u32> {
        match &descriptor.properties {
            TrackProperties::Video(v) => {
                if v.codec != VideoCodec::H264 {
                    return Err(Error::unsupported_codec(v.codec.to_string(), "mp4 muxer"));
                }
                if v.codec_private.is_none() {
                    return Err(Error::unsupported_codec(
                        "h264 without avcC record",
                        "mp4 muxer",
                    ));
                }
            }
            TrackProperties::Audio(a) => {
                if a.codec != AudioCodec::Aac {
                    return Err(Error::unsupported_codec(a.codec.to_string(), "mp4 muxer"));
                }
            }
        }

        self.tracks.push(MuxTrack {
            descriptor: descriptor.clone(),
            samples: Vec::new(),
        });
        Ok(self.tracks.len() as u32)
    }

    /// Append one encoded sample to a registered track.
    ///
    /// Per track, chunks must arrive in strictly increasing timestamp order.
    pub fn add_sample(&mut self, track_id: u32, chunk: &EncodedChunk) -> Result<()> {
        if self.finalized {
            return Err(Error::writer("add_sample after finalize"));
        }
        let track = self
            .tracks
            .get_mut(track_id.saturating_sub(1) as usize)
            .ok_or_else(|| Error::writer(format!("unknown track {track_id}")))?;

        let timescale = track.descriptor.timescale;
        let dts_ticks = micros_to_ticks(chunk.timestamp_micros, timescale);
        let duration_ticks =
            micros_to_ticks(i64::from(chunk.duration_micros), timescale).max(1) as u32;

        if let Some(last) = track.samples.last() {
            if dts_ticks <= last.dts_ticks {
                return Err(Error::writer(format!(
                    "track {track_id} sample at {dts_ticks} not after {}",
                    last.dts_ticks
                )));
            }
        }

        track.samples.push(PendingSample {
            data: chunk.data.clone(),
            dts_ticks,
            duration_ticks,
            is_keyframe: chunk.is_keyframe,
        });
        Ok(())
    }

    /// Serialize the container into the writer.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let ftyp = boxes::write_ftyp();

        // Movie duration: the longest track, in movie timescale.
        let duration_ms = self
            .tracks
            .iter()
            .map(|t| {
                t.total_duration_ticks() * u64::from(MOVIE_TIMESCALE)
                    / u64::from(t.descriptor.timescale.max(1))
            })
            .max()
            .unwrap_or(0);

        // Each track's samples form one contiguous chunk in mdat, in
        // registration order.
        let mdat_payload: u64 = self.tracks.iter().map(|t| t.payload_len()).sum();
        let mdat_header = boxes::write_mdat_header(mdat_payload);

        // Build traks with placeholder chunk offsets, recording where each
        // stco offset field lands.
        let mut traks: Vec<(Vec<u8>, usize)> = Vec::with_capacity(self.tracks.len());
        for track in &self.tracks {
            traks.push(build_trak(track, duration_ms)?);
        }

        let mvhd = boxes::write_mvhd(
            MOVIE_TIMESCALE,
            duration_ms,
            self.tracks.len() as u32 + 1,
        );
        let trak_refs: Vec<&[u8]> = traks.iter().map(|(bytes, _)| bytes.as_slice()).collect();
        let moov = {
            let mut children: Vec<&[u8]> = Vec::with_capacity(1 + trak_refs.len());
            children.push(&mvhd);
            children.extend(trak_refs.iter().copied());
            boxes::write_container_box(b"moov", &children)
        };

        // Absolute positions of the stco offset fields inside moov.
        let mut stco_positions = Vec::with_capacity(traks.len());
        {
            let mut cursor = 8 + mvhd.len(); // moov header + mvhd
            for (trak_bytes, rel) in &traks {
                stco_positions.push(cursor + *rel);
                cursor += trak_bytes.len();
            }
        }

        let write = |w: &mut W, data: &[u8]| w.write(data).map_err(Error::writer);

        if self.options.moov_last {
            let mdat_data_start = self.writer.written_len() + ftyp.len() as u64 + mdat_header.len() as u64;
            write(&mut self.writer, &ftyp)?;
            write(&mut self.writer, &mdat_header)?;
            for track in &self.tracks {
                for sample in &track.samples {
                    write(&mut self.writer, &sample.data)?;
                }
            }
            let moov = patch_moov_offsets(moov, &stco_positions, mdat_data_start, &self.tracks)?;
            write(&mut self.writer, &moov)?;
        } else {
            let base = self.writer.written_len();
            let moov_start = base + ftyp.len() as u64;
            let mdat_data_start = moov_start + moov.len() as u64 + mdat_header.len() as u64;

            write(&mut self.writer, &ftyp)?;
            write(&mut self.writer, &moov)?;
            write(&mut self.writer, &mdat_header)?;
            for track in &self.tracks {
                for sample in &track.samples {
                    write(&mut self.writer, &sample.data)?;
                }
            }

            // Patch the chunk offsets now that the mdat position is known.
            let mut chunk_offset = mdat_data_start;
            for (i, track) in self.tracks.iter().enumerate() {
                let field_pos = moov_start + stco_positions[i] as u64;
                let value = u32::try_from(chunk_offset)
                    .map_err(|_| Error::writer("chunk offset exceeds 32 bits"))?;
                self.writer
                    .update_data_at(field_pos, &value.to_be_bytes())
                    .map_err(Error::writer)?;
                chunk_offset += track.payload_len();
            }
        }

        tracing::debug!(
            tracks = self.tracks.len(),
            duration_ms,
            bytes = self.writer.written_len(),
            "mp4 finalized"
        );
        Ok(())
    }

    /// Consume the muxer and hand back its writer.
    pub fn into_writer(self) -> W {
        self.writer
    }
}

/// Build one trak with a zero chunk offset. Returns the bytes and the
/// relative position of the stco offset field within them.
fn build_trak(track: &MuxTrack, movie_duration_ms: u64) -> Result<(Vec<u8>, usize)> {
    let descriptor = &track.descriptor;
    let timescale = descriptor.timescale;
    let duration_ticks = track.total_duration_ticks();

    // Run-length encode sample durations for stts.
    let mut stts_entries: Vec<(u32, u32)> = Vec::new();
    for sample in &track.samples {
        match stts_entries.last_mut() {
            Some((count, delta)) if *delta == sample.duration_ticks => *count += 1,
            _ => stts_entries.push((1, sample.duration_ticks)),
        }
    }

    let sizes: Vec<u32> = track.samples.iter().map(|s| s.data.len() as u32).collect();
    let sync_samples: Vec<u32> = track
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_keyframe)
        .map(|(i, _)| i as u32 + 1)
        .collect();

    let stts = boxes::write_stts(&stts_entries);
    let stsc = boxes::write_stsc(track.samples.len() as u32);
    let stsz = boxes::write_stsz(&sizes);
    let stco = boxes::write_stco(0);

    let (stsd, is_video, width, height) = match &descriptor.properties {
        TrackProperties::Video(v) => {
            let avcc = v.codec_private.as_ref().ok_or_else(|| {
                Error::unsupported_codec("h264 without avcC record", "mp4 muxer")
            })?;
            let stsd = boxes::write_avc1_stsd(
                v.coded_width,
                v.coded_height,
                avcc,
                Some((v.sample_aspect.num, v.sample_aspect.den)),
            );
            (stsd, true, v.coded_width, v.coded_height)
        }
        TrackProperties::Audio(a) => {
            let asc = match &a.codec_private {
                Some(private) => private.clone(),
                None => Bytes::from(default_audio_specific_config(a.sample_rate, a.channels)?),
            };
            let stsd = boxes::write_mp4a_stsd(a.sample_rate, a.channels as u16, &asc);
            (stsd, false, 0, 0)
        }
    };

    // stss is emitted only when some sample is not a sync sample; an absent
    // stss means "all keyframes", which audio always satisfies.
    let all_sync = sync_samples.len() == track.samples.len();
    let stss = if is_video && !all_sync {
        boxes::write_stss(&sync_samples)
    } else {
        Vec::new()
    };

    let stbl = {
        let mut children: Vec<&[u8]> = vec![&stsd, &stts, &stsc, &stsz, &stco];
        if !stss.is_empty() {
            children.push(&stss);
        }
        boxes::write_container_box(b"stbl", &children)
    };

    let media_header = if is_video {
        boxes::write_vmhd()
    } else {
        boxes::write_smhd()
    };
    let dinf = boxes::write_dinf();
    let minf = boxes::write_container_box(b"minf", &[&media_header, &dinf, &stbl]);

    let mdhd = boxes::write_mdhd(timescale, duration_ticks);
    let hdlr = if is_video {
        boxes::write_hdlr(b"vide", b"VideoHandler")
    } else {
        boxes::write_hdlr(b"soun", b"SoundHandler")
    };
    let mdia = boxes::write_container_box(b"mdia", &[&mdhd, &hdlr, &minf]);

    let tkhd = boxes::write_tkhd(descriptor.id, movie_duration_ms, is_video, width, height);
    let edts = boxes::write_edts(movie_duration_ms);
    let trak = boxes::write_container_box(b"trak", &[&tkhd, &edts, &mdia]);

    // The stco offset field sits a fixed distance from the end of the trak:
    // only the (optional) stss follows it inside stbl, and stbl closes the
    // minf/mdia/trak nesting.
    let stco_field_rel = trak.len() - stss.len() - 4;

    Ok((trak, stco_field_rel))
}

/// Rewrite the stco offset fields in an already-built moov (moov-last mode).
fn patch_moov_offsets(
    mut moov: Vec<u8>,
    stco_positions: &[usize],
    mdat_data_start: u64,
    tracks: &[MuxTrack],
) -> Result<Vec<u8>> {
    let mut chunk_offset = mdat_data_start;
    for (i, track) in tracks.iter().enumerate() {
        let pos = stco_positions[i];
        let value = u32::try_from(chunk_offset)
            .map_err(|_| Error::writer("chunk offset exceeds 32 bits"))?;
        moov[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
        chunk_offset += track.payload_len();
    }
    Ok(moov)
}

/// Sampling-frequency index table from ISO/IEC 14496-3.
const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Synthesize a two-byte AAC-LC AudioSpecificConfig when the source did not
/// carry one.
fn default_audio_specific_config(sample_rate: u32, channels: u32) -> Result<Vec<u8>> {
    let freq_index = AAC_SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .ok_or_else(|| {
            Error::unsupported_codec(format!("aac at {sample_rate} Hz"), "mp4 muxer")
        })? as u8;
    let channel_config = match channels {
        1..=7 => channels as u8,
        other => {
            return Err(Error::unsupported_codec(
                format!("aac with {other} channels"),
                "mp4 muxer",
            ));
        }
    };
    // 5 bits object type (2 = LC), 4 bits frequency index, 4 bits channels.
    let bits: u16 = (2u16 << 11) | (u16::from(freq_index) << 7) | (u16::from(channel_config) << 3);
    Ok(bits.to_be_bytes().to_vec())
}
