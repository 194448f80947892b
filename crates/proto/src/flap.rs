use crate::{Buffer, CodecError};

pub const FLAP_START_BYTE: u8 = 0x2a;
pub const FLAP_HEADER_LEN: usize = 6;

/// The channels AIM 3.x-5.x clients actually speak.
///
/// The wire field is kept as a raw u8 on [`Flap`] so frames on channels
/// outside this set survive decode and can be logged instead of dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    SignOn = 1,
    Data = 2,
    Error = 3,
    SignOff = 4,
    KeepAlive = 5,
}

impl Channel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::SignOn),
            2 => Some(Self::Data),
            3 => Some(Self::Error),
            4 => Some(Self::SignOff),
            5 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The fixed 6-byte frame header: start byte, channel, sequence, length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlapHeader {
    pub channel: u8,
    pub sequence: u16,
    pub length: u16,
}

impl FlapHeader {
    /// Parses the header alone; the payload is read separately by callers
    /// that frame straight off a socket.
    pub fn decode(raw: &[u8; FLAP_HEADER_LEN]) -> Result<Self, CodecError> {
        if raw[0] != FLAP_START_BYTE {
            return Err(CodecError::BadFraming);
        }
        Ok(FlapHeader {
            channel: raw[1],
            sequence: u16::from_be_bytes([raw[2], raw[3]]),
            length: u16::from_be_bytes([raw[4], raw[5]]),
        })
    }
}

/// One outer frame. The sequence is assigned by the sender at write time;
/// receivers do not reject non-monotonic input (some clients reset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flap {
    pub channel: u8,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Flap {
    /// A frame awaiting its sequence number; the session writer stamps it.
    pub fn new(channel: Channel, payload: Vec<u8>) -> Self {
        Flap {
            channel: channel.as_u8(),
            sequence: 0,
            payload,
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::from_u8(self.channel)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Buffer::new();
        buffer.write_u8(FLAP_START_BYTE);
        buffer.write_u8(self.channel);
        buffer.write_u16(self.sequence);
        buffer.write_b16(&self.payload);
        buffer.into_vec()
    }

    /// Decodes one frame from the front of `raw`, returning the bytes
    /// consumed. An incomplete header or payload is a short read; a wrong
    /// start byte is a framing error.
    pub fn decode(raw: &[u8]) -> Result<(Self, usize), CodecError> {
        if raw.len() < FLAP_HEADER_LEN {
            return Err(CodecError::ShortRead);
        }
        let mut header = [0u8; FLAP_HEADER_LEN];
        header.copy_from_slice(&raw[..FLAP_HEADER_LEN]);
        let header = FlapHeader::decode(&header)?;
        let total = FLAP_HEADER_LEN + header.length as usize;
        if raw.len() < total {
            return Err(CodecError::ShortRead);
        }
        Ok((
            Flap {
                channel: header.channel,
                sequence: header.sequence,
                payload: raw[FLAP_HEADER_LEN..total].to_vec(),
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip() {
        let mut flap = Flap::new(Channel::Data, vec![1, 2, 3]);
        flap.sequence = 0x1234;
        let encoded = flap.encode();
        assert_eq!(&encoded[..6], &[0x2a, 0x02, 0x12, 0x34, 0x00, 0x03]);
        let (decoded, consumed) = Flap::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, flap);
    }

    #[test]
    fn zero_length_payload_parses() {
        let (decoded, consumed) =
            Flap::decode(&[0x2a, 0x05, 0x00, 0x07, 0x00, 0x00]).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(decoded.channel(), Some(Channel::KeepAlive));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn client_greeting_frame_parses() {
        let raw = [0x2a, 0x01, 0x00, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01];
        let (decoded, consumed) = Flap::decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(decoded.channel(), Some(Channel::SignOn));
        assert_eq!(decoded.payload, vec![0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn wrong_start_byte_is_framing_error() {
        let raw = [0x2b, 0x02, 0x00, 0x01, 0x00, 0x00];
        assert_eq!(Flap::decode(&raw), Err(CodecError::BadFraming));
    }

    #[test]
    fn truncated_header_and_payload_are_short_reads() {
        assert_eq!(Flap::decode(&[0x2a, 0x02]), Err(CodecError::ShortRead));
        assert_eq!(
            Flap::decode(&[0x2a, 0x02, 0x00, 0x01, 0x00, 0x05, 0xaa]),
            Err(CodecError::ShortRead)
        );
    }

    #[test]
    fn decode_consumes_one_frame_of_many() {
        let mut first = Flap::new(Channel::Data, vec![9]);
        first.sequence = 1;
        let mut second = Flap::new(Channel::SignOff, Vec::new());
        second.sequence = 2;
        let mut raw = first.encode();
        raw.extend_from_slice(&second.encode());
        let (decoded_first, used) = Flap::decode(&raw).unwrap();
        assert_eq!(decoded_first, first);
        let (decoded_second, _) = Flap::decode(&raw[used..]).unwrap();
        assert_eq!(decoded_second, second);
    }

    #[test]
    fn unknown_channel_survives_decode() {
        let raw = [0x2a, 0x09, 0x00, 0x01, 0x00, 0x00];
        let (decoded, _) = Flap::decode(&raw).unwrap();
        assert_eq!(decoded.channel, 9);
        assert_eq!(decoded.channel(), None);
    }
}
