use crate::{Buffer, CodecError};

pub const SNAC_HEADER_LEN: usize = 10;

/// "More replies follow": preserved on write, only logged on read.
pub const FLAG_MORE_REPLIES: u16 = 0x8000;

/// The 10-byte command header: family, subtype, flags, request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnacHeader {
    pub family: u16,
    pub subtype: u16,
    pub flags: u16,
    pub request_id: u32,
}

/// One command unit carried inside a channel-2 FLAP.
///
/// Direct replies echo the request id; server-initiated commands carry a
/// freshly minted one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snac {
    pub header: SnacHeader,
    pub payload: Vec<u8>,
}

impl Snac {
    pub fn new(family: u16, subtype: u16, request_id: u32, payload: Vec<u8>) -> Self {
        Snac {
            header: SnacHeader {
                family,
                subtype,
                flags: 0,
                request_id,
            },
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Buffer::new();
        buffer.write_u16(self.header.family);
        buffer.write_u16(self.header.subtype);
        buffer.write_u16(self.header.flags);
        buffer.write_u32(self.header.request_id);
        buffer.write_bytes(&self.payload);
        buffer.into_vec()
    }

    /// Decodes a whole FLAP payload as one SNAC; everything after the
    /// header belongs to the command.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut buffer = Buffer::from_slice(raw);
        let header = SnacHeader {
            family: buffer.read_u16()?,
            subtype: buffer.read_u16()?,
            flags: buffer.read_u16()?,
            request_id: buffer.read_u32()?,
        };
        Ok(Snac {
            header,
            payload: buffer.read_remaining(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip() {
        let snac = Snac::new(0x0004, 0x0006, 0xcafe, vec![1, 2, 3, 4]);
        let encoded = snac.encode();
        assert_eq!(encoded.len(), SNAC_HEADER_LEN + 4);
        assert_eq!(Snac::decode(&encoded).unwrap(), snac);
    }

    #[test]
    fn zero_length_payload_parses() {
        let snac = Snac::new(0x0018, 0x0007, 1, Vec::new());
        let decoded = Snac::decode(&snac.encode()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.header.family, 0x0018);
    }

    #[test]
    fn more_replies_flag_roundtrips() {
        let mut snac = Snac::new(0x0001, 0x0003, 9, Vec::new());
        snac.header.flags = FLAG_MORE_REPLIES;
        let decoded = Snac::decode(&snac.encode()).unwrap();
        assert_eq!(decoded.header.flags & FLAG_MORE_REPLIES, FLAG_MORE_REPLIES);
    }

    #[test]
    fn truncated_header_rejected() {
        assert_eq!(
            Snac::decode(&[0x00, 0x17, 0x00, 0x06]),
            Err(CodecError::ShortRead)
        );
    }

    #[test]
    fn header_layout_matches_wire() {
        let snac = Snac::new(0x0017, 0x0007, 0x01020304, vec![0xff]);
        assert_eq!(
            snac.encode(),
            vec![0x00, 0x17, 0x00, 0x07, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0xff]
        );
    }
}
