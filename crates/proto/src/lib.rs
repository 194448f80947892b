use std::error::Error;
use std::fmt::{Display, Formatter};

mod buffer;
mod flap;
mod snac;
mod tlv;

pub use buffer::Buffer;
pub use flap::{Channel, Flap, FlapHeader, FLAP_HEADER_LEN, FLAP_START_BYTE};
pub use snac::{Snac, SnacHeader, FLAG_MORE_REPLIES, SNAC_HEADER_LEN};
pub use tlv::{decode_tlvs, encode_tlvs, find_tlv, Tlv};

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    ShortRead,
    BadFraming,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortRead => write!(f, "read past end of buffer"),
            Self::BadFraming => write!(f, "bad frame start byte"),
        }
    }
}

impl Error for CodecError {}

/// Canonical form of a screen name: lowercased, spaces stripped.
///
/// All identity matching (session registry, repository keys, buddy edges)
/// goes through this form; the formatted name the user typed is preserved
/// separately for display.
pub fn canonical_screen_name(screen_name: &str) -> String {
    screen_name
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_strips_spaces_and_case() {
        assert_eq!(canonical_screen_name("Running Man 83"), "runningman83");
        assert_eq!(canonical_screen_name("alice"), "alice");
        assert_eq!(canonical_screen_name(" A  B "), "ab");
    }

    #[test]
    fn canonical_form_of_empty_is_empty() {
        assert_eq!(canonical_screen_name(""), "");
        assert_eq!(canonical_screen_name("   "), "");
    }
}
