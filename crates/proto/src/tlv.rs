use crate::{Buffer, CodecError};

/// One tag-length-value attribute: (type u16, length u16, value bytes).
///
/// TLV lists are the attribute encoding of both the authentication
/// handshake and in-band commands. Unknown tags are carried through
/// untouched; decoding never drops an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tag: u16, value: Vec<u8>) -> Self {
        Tlv { tag, value }
    }

    pub fn from_str(tag: u16, value: &str) -> Self {
        Tlv::new(tag, value.as_bytes().to_vec())
    }

    pub fn from_u16(tag: u16, value: u16) -> Self {
        Tlv::new(tag, value.to_be_bytes().to_vec())
    }

    /// The value interpreted as a big-endian u16.
    pub fn value_u16(&self) -> Result<u16, CodecError> {
        if self.value.len() < 2 {
            return Err(CodecError::ShortRead);
        }
        Ok(u16::from_be_bytes([self.value[0], self.value[1]]))
    }

    /// The value interpreted as text.
    pub fn value_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    pub fn encode_into(&self, buffer: &mut Buffer) {
        buffer.write_u16(self.tag);
        buffer.write_b16(&self.value);
    }

    pub fn decode_from(buffer: &mut Buffer) -> Result<Self, CodecError> {
        let tag = buffer.read_u16()?;
        let value = buffer.read_b16()?;
        Ok(Tlv { tag, value })
    }
}

/// Encodes a list in the given order.
pub fn encode_tlvs(tlvs: &[Tlv]) -> Vec<u8> {
    let mut buffer = Buffer::new();
    for tlv in tlvs {
        tlv.encode_into(&mut buffer);
    }
    buffer.into_vec()
}

/// Decodes attributes until the buffer is exhausted.
///
/// A truncated trailing TLV fails the whole decode.
pub fn decode_tlvs(buffer: &mut Buffer) -> Result<Vec<Tlv>, CodecError> {
    let mut tlvs = Vec::new();
    while !buffer.is_empty() {
        tlvs.push(Tlv::decode_from(buffer)?);
    }
    Ok(tlvs)
}

/// First attribute carrying `tag`, ties broken by list order.
pub fn find_tlv(tlvs: &[Tlv], tag: u16) -> Option<&Tlv> {
    tlvs.iter().find(|tlv| tlv.tag == tag)
}
