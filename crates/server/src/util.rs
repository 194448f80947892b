/// Decodes a hexadecimal string into raw bytes.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, &'static str> {
    if input.len() % 2 != 0 {
        return Err("invalid hex length");
    }
    let mut output = Vec::with_capacity(input.len() / 2);
    let bytes = input.as_bytes();
    for chunk in bytes.chunks(2) {
        let high = decode_hex_digit(chunk[0])?;
        let low = decode_hex_digit(chunk[1])?;
        output.push((high << 4) | low);
    }
    Ok(output)
}

/// Decodes a hexadecimal string into a 32-byte array.
pub fn decode_hex32(input: &str) -> Result<[u8; 32], &'static str> {
    let bytes = decode_hex(input)?;
    if bytes.len() != 32 {
        return Err("invalid hex length");
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    Ok(array)
}

fn decode_hex_digit(digit: u8) -> Result<u8, &'static str> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(10 + digit - b'a'),
        b'A'..=b'F' => Ok(10 + digit - b'A'),
        _ => Err("invalid hex digit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_hex("2a0102").unwrap(), vec![0x2a, 0x01, 0x02]);
        assert_eq!(decode_hex("FF").unwrap(), vec![0xff]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn hex32_requires_exact_width() {
        let hex = "00".repeat(32);
        assert_eq!(decode_hex32(&hex).unwrap(), [0u8; 32]);
        assert!(decode_hex32("0011").is_err());
    }
}
