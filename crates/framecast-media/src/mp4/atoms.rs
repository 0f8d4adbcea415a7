//! ISO-BMFF box (atom) identification and header parsing.

use crate::cursor::ByteCursor;
use crate::error::{ParseError, ParseResult};

/// Four-character box type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MOOF: Self = Self(*b"moof");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const EDTS: Self = Self(*b"edts");
    pub const ELST: Self = Self(*b"elst");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const DINF: Self = Self(*b"dinf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const CTTS: Self = Self(*b"ctts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STZ2: Self = Self(*b"stz2");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const MVEX: Self = Self(*b"mvex");
    pub const TREX: Self = Self(*b"trex");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");
    pub const TRUN: Self = Self(*b"trun");
    pub const MFRA: Self = Self(*b"mfra");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const PASP: Self = Self(*b"pasp");
    pub const BTRT: Self = Self(*b"btrt");
    pub const COLR: Self = Self(*b"colr");
    pub const AVC1: Self = Self(*b"avc1");
    pub const HEV1: Self = Self(*b"hev1");
    pub const HVC1: Self = Self(*b"hvc1");
    pub const VP08: Self = Self(*b"vp08");
    pub const VP09: Self = Self(*b"vp09");
    pub const AV01: Self = Self(*b"av01");
    pub const MP4A: Self = Self(*b"mp4a");
    pub const OPUS: Self = Self(*b"Opus");
    pub const AVCC: Self = Self(*b"avcC");
    pub const HVCC: Self = Self(*b"hvcC");
    pub const VPCC: Self = Self(*b"vpcC");
    pub const AV1C: Self = Self(*b"av1C");
    pub const ESDS: Self = Self(*b"esds");
    pub const DOPS: Self = Self(*b"dOps");

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Whether this box contains child boxes that the demuxer recurses into.
    pub fn is_container(&self) -> bool {
        matches!(
            *self,
            Self::MOOV
                | Self::TRAK
                | Self::EDTS
                | Self::MDIA
                | Self::MINF
                | Self::DINF
                | Self::STBL
                | Self::MVEX
                | Self::MOOF
                | Self::TRAF
                | Self::MFRA
        )
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed box header: type, total size, and where its payload starts.
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
    pub four_cc: FourCc,
    /// Absolute offset of the box (the size field).
    pub offset: u64,
    /// Total box size including the header. `None` means "to end of file"
    /// (wire size 0).
    pub size: Option<u64>,
    /// Header length: 8, or 16 with a 64-bit largesize.
    pub header_len: u8,
}

impl BoxHeader {
    /// Payload size, when the total size is known.
    pub fn data_size(&self) -> Option<u64> {
        self.size.map(|s| s.saturating_sub(u64::from(self.header_len)))
    }

    /// Parse a box header from the cursor.
    ///
    /// On [`ParseError::Incomplete`] the cursor is left where it started.
    pub fn parse(cursor: &mut ByteCursor<'_>) -> ParseResult<Self> {
        let start = cursor.relative_position();
        let offset = cursor.position();

        let result = (|| {
            let size32 = cursor.read_u32()?;
            let raw = cursor.read_exact(4)?;
            let four_cc = FourCc([raw[0], raw[1], raw[2], raw[3]]);

            let (size, header_len) = match size32 {
                0 => (None, 8u8),
                1 => {
                    let large = cursor.read_u64()?;
                    if large < 16 {
                        return Err(ParseError::malformed(
                            "box header",
                            offset,
                            format!("largesize {large} smaller than header"),
                        ));
                    }
                    (Some(large), 16u8)
                }
                s if s < 8 => {
                    return Err(ParseError::malformed(
                        "box header",
                        offset,
                        format!("size {s} smaller than header"),
                    ));
                }
                s => (Some(u64::from(s)), 8u8),
            };

            Ok(BoxHeader {
                four_cc,
                offset,
                size,
                header_len,
            })
        })();

        if matches!(result, Err(ParseError::Incomplete)) {
            cursor.seek_to(start);
        }
        result
    }
}

/// A box the demuxer does not interpret, preserved for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct OpaqueBox {
    pub four_cc: FourCc,
    pub offset: u64,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_cc_display() {
        assert_eq!(FourCc::MOOV.to_string(), "moov");
        assert_eq!(FourCc(*b"x\xFFyz").as_str(), "????");
    }

    #[test]
    fn container_classification() {
        assert!(FourCc::MOOV.is_container());
        assert!(FourCc::TRAF.is_container());
        assert!(!FourCc::MDAT.is_container());
        assert!(!FourCc::TKHD.is_container());
    }

    #[test]
    fn parse_plain_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&24u32.to_be_bytes());
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(&[0u8; 16]);

        let mut cur = ByteCursor::new(&data, 0);
        let header = BoxHeader::parse(&mut cur).unwrap();
        assert_eq!(header.four_cc, FourCc::FTYP);
        assert_eq!(header.size, Some(24));
        assert_eq!(header.header_len, 8);
        assert_eq!(header.data_size(), Some(16));
    }

    #[test]
    fn parse_largesize_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&40u64.to_be_bytes());

        let mut cur = ByteCursor::new(&data, 512);
        let header = BoxHeader::parse(&mut cur).unwrap();
        assert_eq!(header.four_cc, FourCc::MDAT);
        assert_eq!(header.offset, 512);
        assert_eq!(header.size, Some(40));
        assert_eq!(header.header_len, 16);
        assert_eq!(header.data_size(), Some(24));
    }

    #[test]
    fn parse_size_zero_runs_to_eof() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"mdat");

        let mut cur = ByteCursor::new(&data, 0);
        let header = BoxHeader::parse(&mut cur).unwrap();
        assert_eq!(header.size, None);
        assert_eq!(header.data_size(), None);
    }

    #[test]
    fn incomplete_header_rewinds() {
        let data = [0u8, 0, 0, 24, b'f', b't'];
        let mut cur = ByteCursor::new(&data, 0);
        assert!(matches!(
            BoxHeader::parse(&mut cur),
            Err(ParseError::Incomplete)
        ));
        assert_eq!(cur.relative_position(), 0);
    }

    #[test]
    fn undersized_box_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(b"free");

        let mut cur = ByteCursor::new(&data, 0);
        assert!(matches!(
            BoxHeader::parse(&mut cur),
            Err(ParseError::Malformed { .. })
        ));
    }
}
