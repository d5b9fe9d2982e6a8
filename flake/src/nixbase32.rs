//! The "base32" flavour used by Nix for store path digests.
//!
//! It uses its own alphabet (no `e`, `o`, `u`, `t`), never pads, and
//! emits characters starting from the most significant end of the
//! input, so [data_encoding] can not be used for it.

use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("character {0:?} is not part of the nixbase32 alphabet")]
    InvalidCharacter(char),
    #[error("encoded data has a non-zero carry")]
    NonzeroCarry,
}

/// Number of characters needed to encode `len` bytes.
pub const fn encode_len(len: usize) -> usize {
    (len * 8 + 4) / 5
}

/// Number of bytes encoded by `len` characters.
pub const fn decode_len(len: usize) -> usize {
    (len * 5) / 8
}

pub fn encode(input: &[u8]) -> String {
    let len = encode_len(input.len());
    let mut out = String::with_capacity(len);

    for n in (0..len).rev() {
        let bit = n * 5;
        let (byte, shift) = (bit / 8, bit % 8);

        let mut c = (input[byte] as u16) >> shift;
        if let Some(next) = input.get(byte + 1) {
            c |= (*next as u16) << (8 - shift);
        }

        out.push(ALPHABET[(c & 0x1f) as usize] as char);
    }

    out
}

fn decode_char(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|a| *a == c).map(|p| p as u8)
}

pub fn decode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = vec![0u8; decode_len(input.len())];

    for (n, c) in input.iter().rev().enumerate() {
        let digit = decode_char(*c).ok_or(DecodeError::InvalidCharacter(*c as char))? as u16;
        let bit = n * 5;
        let (byte, shift) = (bit / 8, bit % 8);
        let value = digit << shift;

        match out.get_mut(byte) {
            Some(b) => *b |= value as u8,
            None if value != 0 => return Err(DecodeError::NonzeroCarry),
            None => {}
        }

        let carry = (value >> 8) as u8;
        match out.get_mut(byte + 1) {
            Some(b) => *b |= carry,
            None if carry != 0 => return Err(DecodeError::NonzeroCarry),
            None => {}
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case::empty(&[], "")]
    #[case::one_byte(&[0x1f], "0z")]
    #[case::store_digest(
        &[0x8a, 0x12, 0x32, 0x15, 0x22, 0xfd, 0x91, 0xef, 0xbd, 0x60, 0xeb, 0xb2, 0x48, 0x1a, 0xf8, 0x85, 0x80, 0xf6, 0x16, 0x00],
        "00bgd045z0d4icpbc2yyz4gx48ak44la"
    )]
    fn encode_decode(#[case] raw: &[u8], #[case] encoded: &str) {
        assert_eq!(encoded, super::encode(raw));
        assert_eq!(raw, super::decode(encoded.as_bytes()).expect("must decode"));
    }

    #[test]
    fn rejects_foreign_characters() {
        assert_eq!(
            Err(super::DecodeError::InvalidCharacter('e')),
            super::decode(b"0e")
        );
    }

    #[test]
    fn rejects_carry() {
        assert_eq!(Err(super::DecodeError::NonzeroCarry), super::decode(b"zz"));
    }
}
