//! Framed-socket record header
//!
//! Every record on a helper socket starts with this 48-byte little-endian
//! header, followed by `size` body bytes. The `reserved` words carry
//! out-of-band fields that each adapter interprets for itself (the HDMI
//! monitor packs connection state and resolution there; the encoder leaves
//! them zero).

/// Encoded header length in bytes.
pub const FRAME_HEADER_LEN: usize = 48;

/// Upper bound for a record body. Larger sizes are logged and skipped
/// without dropping the connection.
pub const MAX_FRAME_BODY: u32 = 1024 * 1024;

/// Record header preceding every framed-socket body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Per-connection record counter
    pub id: u32,
    /// Body length in bytes; 0 means the record has no body
    pub size: u32,
    /// Sender wall clock in microseconds
    pub timestamp: u64,
    /// Adapter-specific out-of-band fields
    pub reserved: [u32; 8],
}

impl FrameHeader {
    /// Parse a header from exactly [`FRAME_HEADER_LEN`] bytes.
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        let mut reserved = [0u32; 8];
        for (i, slot) in reserved.iter_mut().enumerate() {
            let offset = 16 + i * 4;
            *slot = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        }

        Self {
            id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            reserved,
        }
    }

    /// Encode the header to its wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];

        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        for (i, word) in self.reserved.iter().enumerate() {
            let offset = 16 + i * 4;
            buf[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let header = FrameHeader {
            id: 7,
            size: 0x0001_0000,
            timestamp: 1_700_000_000_123_456,
            reserved: [2, 1920, 1080, 0, 0, 0, 0, u32::MAX],
        };

        assert_eq!(FrameHeader::parse(&header.encode()), header);
    }

    #[test]
    fn test_zero_header() {
        let parsed = FrameHeader::parse(&[0u8; FRAME_HEADER_LEN]);
        assert_eq!(parsed, FrameHeader::default());
    }

    #[test]
    fn test_field_offsets() {
        let header = FrameHeader {
            id: 0x04030201,
            size: 0x08070605,
            timestamp: 0x100f_0e0d_0c0b_0a09,
            reserved: [0x14131211, 0, 0, 0, 0, 0, 0, 0],
        };

        let buf = header.encode();
        assert_eq!(&buf[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&buf[8..16], &[0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10]);
        assert_eq!(&buf[16..20], &[0x11, 0x12, 0x13, 0x14]);
    }
}
