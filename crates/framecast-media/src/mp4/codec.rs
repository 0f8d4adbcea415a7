//! RFC 6381 codec strings and decoder-config extraction from sample-entry
//! child boxes (avcC, hvcC, vpcC, av1C, esds, dOps).

use bytes::Bytes;
use framecast_core::media::{AudioCodec, VideoCodec};

use crate::cursor::ByteCursor;
use crate::error::{ParseError, ParseResult};

/// Codec identity extracted from a video sample entry.
#[derive(Debug, Clone)]
pub struct VideoCodecInfo {
    pub codec: VideoCodec,
    pub codec_string: String,
    pub codec_private: Option<Bytes>,
}

/// Codec identity extracted from an audio sample entry.
#[derive(Debug, Clone)]
pub struct AudioCodecInfo {
    pub codec: AudioCodec,
    pub codec_string: String,
    pub codec_private: Option<Bytes>,
}

/// `avc1.PPCCLL` from the first three profile bytes of an avcC record.
pub fn avc_codec_string(avcc: &[u8]) -> ParseResult<String> {
    if avcc.len() < 4 {
        return Err(ParseError::malformed("avcC", 0, "record shorter than 4 bytes"));
    }
    // avcc[0] is configurationVersion; profile, constraints, level follow.
    Ok(format!(
        "avc1.{:02X}{:02X}{:02X}",
        avcc[1], avcc[2], avcc[3]
    ))
}

/// `hvc1.<profile>.<compat>.L<level>.B0` from an hvcC record.
pub fn hevc_codec_string(hvcc: &[u8]) -> ParseResult<String> {
    if hvcc.len() < 13 {
        return Err(ParseError::malformed("hvcC", 0, "record shorter than 13 bytes"));
    }
    let byte1 = hvcc[1];
    let profile_space = (byte1 >> 6) & 0x3;
    let tier = (byte1 >> 5) & 0x1;
    let profile_idc = byte1 & 0x1F;
    let compat = u32::from_be_bytes([hvcc[2], hvcc[3], hvcc[4], hvcc[5]]);
    let level_idc = hvcc[12];

    let space = match profile_space {
        1 => "A",
        2 => "B",
        3 => "C",
        _ => "",
    };
    let tier = if tier == 0 { 'L' } else { 'H' };
    // Compatibility flags are serialized bit-reversed.
    let compat = compat.reverse_bits();
    Ok(format!(
        "hvc1.{space}{profile_idc}.{compat:X}.{tier}{level_idc}.B0"
    ))
}

/// `vp08.PP.LL.DD` / `vp09.PP.LL.DD` from a vpcC payload (after the FullBox
/// header).
pub fn vp_codec_string(codec: VideoCodec, vpcc: &[u8]) -> ParseResult<String> {
    let prefix = match codec {
        VideoCodec::Vp8 => "vp08",
        VideoCodec::Vp9 => "vp09",
        other => {
            return Err(ParseError::unsupported("codec", other.to_string()));
        }
    };
    if vpcc.len() < 7 {
        return Err(ParseError::malformed("vpcC", 0, "payload shorter than 7 bytes"));
    }
    // FullBox header (4 bytes), then profile, level, bitDepth<<4 | chroma.
    let profile = vpcc[4];
    let level = vpcc[5];
    let bit_depth = vpcc[6] >> 4;
    Ok(format!("{prefix}.{profile:02}.{level:02}.{bit_depth:02}"))
}

/// `av01.P.LLT.DD` from an av1C record.
pub fn av1_codec_string(av1c: &[u8]) -> ParseResult<String> {
    if av1c.len() < 4 {
        return Err(ParseError::malformed("av1C", 0, "record shorter than 4 bytes"));
    }
    let profile = (av1c[1] >> 5) & 0x7;
    let level = av1c[1] & 0x1F;
    let tier = if (av1c[2] >> 7) & 0x1 == 1 { 'H' } else { 'M' };
    let high_bitdepth = (av1c[2] >> 6) & 0x1;
    let twelve_bit = (av1c[2] >> 5) & 0x1;
    let bit_depth = match (high_bitdepth, twelve_bit) {
        (0, _) => 8,
        (1, 0) => 10,
        (1, 1) => 12,
        _ => 8,
    };
    Ok(format!("av01.{profile}.{level:02}{tier}.{bit_depth:02}"))
}

/// Walk an esds payload (after the FullBox header) and extract the MPEG-4
/// object type plus the AudioSpecificConfig.
///
/// The descriptor layout is tag, varint length, payload: tag 3 (ES), tag 4
/// (DecoderConfig, first byte is the object type), tag 5 (DecoderSpecificInfo,
/// the AudioSpecificConfig itself).
pub fn parse_esds(esds: &[u8]) -> ParseResult<(u8, Option<Bytes>)> {
    let mut cursor = ByteCursor::new(esds, 0);
    let mut object_type = 0x40u8;
    let mut asc: Option<Bytes> = None;

    fn read_descriptor_len(cursor: &mut ByteCursor<'_>) -> ParseResult<usize> {
        let mut len = 0usize;
        for _ in 0..4 {
            let b = cursor.read_u8()?;
            len = (len << 7) | usize::from(b & 0x7F);
            if b & 0x80 == 0 {
                break;
            }
        }
        Ok(len)
    }

    while cursor.remaining() > 1 {
        let tag = cursor.read_u8()?;
        let len = read_descriptor_len(&mut cursor)?;
        match tag {
            // ES descriptor: id (2) + flags (1), then nested descriptors.
            0x03 => {
                cursor.skip(3.min(cursor.remaining()))?;
            }
            // DecoderConfig descriptor: objectTypeIndication leads.
            0x04 => {
                object_type = cursor.read_u8()?;
                // streamType/bufferSize/bitrates: 12 bytes before children.
                cursor.skip(12.min(cursor.remaining()))?;
            }
            // DecoderSpecificInfo: the raw AudioSpecificConfig.
            0x05 => {
                let take = len.min(cursor.remaining());
                let bytes = cursor.read_exact(take)?;
                asc = Some(Bytes::copy_from_slice(bytes));
                break;
            }
            _ => {
                let take = len.min(cursor.remaining());
                cursor.skip(take)?;
            }
        }
    }

    Ok((object_type, asc))
}

/// `mp4a.40.X` where X is the AAC object type from the AudioSpecificConfig
/// (first 5 bits), falling back to the esds object-type indication.
pub fn aac_codec_string(esds: &[u8]) -> ParseResult<(String, Option<Bytes>)> {
    let (object_type, asc) = parse_esds(esds)?;
    let aot = asc
        .as_ref()
        .filter(|a| !a.is_empty())
        .map(|a| a[0] >> 3)
        .filter(|&aot| aot != 0)
        .unwrap_or(2);
    Ok((format!("mp4a.{object_type:02X}.{aot}"), asc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avc_string_from_record() {
        // version 1, profile 0x64 (High), constraints 0x00, level 0x1F.
        let avcc = [0x01, 0x64, 0x00, 0x1F, 0xFF];
        assert_eq!(avc_codec_string(&avcc).unwrap(), "avc1.64001F");
    }

    #[test]
    fn avc_string_baseline() {
        let avcc = [0x01, 0x42, 0xC0, 0x1E];
        assert_eq!(avc_codec_string(&avcc).unwrap(), "avc1.42C01E");
    }

    #[test]
    fn avc_record_too_short() {
        assert!(avc_codec_string(&[0x01, 0x64]).is_err());
    }

    #[test]
    fn hevc_string_main_profile() {
        let mut hvcc = vec![0u8; 23];
        hvcc[0] = 1;
        hvcc[1] = 0x01; // space 0, tier L, profile 1
        hvcc[2] = 0x60; // compat flags
        hvcc[12] = 93; // level 3.1
        assert_eq!(hevc_codec_string(&hvcc).unwrap(), "hvc1.1.6.L93.B0");
    }

    #[test]
    fn vp9_string_from_vpcc() {
        // FullBox header, profile 0, level 10, bitDepth 8 chroma 1.
        let vpcc = [0x01, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x81, 0x00];
        assert_eq!(
            vp_codec_string(VideoCodec::Vp9, &vpcc).unwrap(),
            "vp09.00.10.08"
        );
    }

    #[test]
    fn av1_string_from_av1c() {
        // marker+version, profile 0 level 8, tier M 8-bit.
        let av1c = [0x81, 0x08, 0x00, 0x00];
        assert_eq!(av1_codec_string(&av1c).unwrap(), "av01.0.08M.08");
    }

    #[test]
    fn esds_extracts_audio_specific_config() {
        // Minimal esds: ES(3) { DecoderConfig(4) { DecoderSpecificInfo(5) } }.
        let asc = [0x12, 0x10]; // AAC-LC (aot 2), 44.1 kHz, stereo
        let mut dsi = vec![0x05, asc.len() as u8];
        dsi.extend_from_slice(&asc);

        let mut dcd = vec![0x04, (13 + dsi.len()) as u8, 0x40];
        dcd.extend_from_slice(&[0u8; 12]);
        dcd.extend_from_slice(&dsi);

        let mut esds = vec![0x03, (3 + dcd.len()) as u8, 0x00, 0x02, 0x00];
        esds.extend_from_slice(&dcd);

        let (codec_string, private) = aac_codec_string(&esds).unwrap();
        assert_eq!(codec_string, "mp4a.40.2");
        assert_eq!(&private.unwrap()[..], &asc);
    }

    #[test]
    fn esds_without_dsi_defaults_to_lc() {
        let esds = [0x03, 0x03, 0x00, 0x02, 0x00];
        let (codec_string, private) = aac_codec_string(&esds).unwrap();
        assert_eq!(codec_string, "mp4a.40.2");
        assert!(private.is_none());
    }
}
