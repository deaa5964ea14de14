use blake3::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Encodes raw bytes into lowercase hexadecimal.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        output.push(char::from(HEX_DIGITS[usize::from(byte >> 4)]));
        output.push(char::from(HEX_DIGITS[usize::from(byte & 0x0f)]));
    }
    output
}

/// Decodes a 64-character hexadecimal string into a 32-byte array.
pub fn decode_hex32(input: &str) -> Result<[u8; 32], &'static str> {
    let bytes = input.as_bytes();
    if bytes.len() != 64 {
        return Err("invalid hex length");
    }
    let mut output = [0u8; 32];
    for (slot, chunk) in output.iter_mut().zip(bytes.chunks_exact(2)) {
        let high = decode_hex_digit(chunk[0])?;
        let low = decode_hex_digit(chunk[1])?;
        *slot = (high << 4) | low;
    }
    Ok(output)
}

/// Generates an opaque identifier from entropy and context.
pub fn generate_id(context: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes();
    hasher.update(&now);
    encode_hex(hasher.finalize().as_bytes())
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
    fn hex32_roundtrip() {
        let mut data = [0u8; 32];
        for (index, slot) in data.iter_mut().enumerate() {
            *slot = index as u8;
        }
        let hex = encode_hex(&data);
        assert_eq!(hex.len(), 64);
        assert_eq!(decode_hex32(&hex).unwrap(), data);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert!(decode_hex32("abcd").is_err());
        let mut invalid = "zz".repeat(32);
        assert!(decode_hex32(&invalid).is_err());
        invalid = "0".repeat(65);
        assert!(decode_hex32(&invalid).is_err());
    }

    #[test]
    fn id_generation_differs() {
        let first = generate_id("context");
        let second = generate_id("context");
        assert_ne!(first, second);
    }
}
