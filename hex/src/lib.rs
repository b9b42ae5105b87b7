//! Encoding, decoding and displaying of lowercase hex/base16 data.
//!
//! Exists so that leaf crates don't each grow their own ad-hoc hex
//! helpers. Decoding is strict: only lowercase or uppercase `[0-9a-fA-F]`
//! pairs are accepted and outputs are always lowercase.

use std::{
    borrow::Cow,
    fmt::{self, Write},
};

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Errors which can be produced while decoding a hex string.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The output buffer is not exactly half the input length.
    BadOutputLength,
    /// The input contained a character outside of `[0-9a-fA-F]`.
    InvalidCharacter,
    /// The input length was odd.
    OddInputLength,
}

impl std::error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadOutputLength => "output length != half input length",
            Self::InvalidCharacter => "input contains a non-hex character",
            Self::OddInputLength => "input string length must be even",
        };
        write!(f, "hex decode error: {s}")
    }
}

// --- Public functions --- //

/// Convert a byte slice to an owned lowercase hex string. If the value only
/// needs to be displayed, prefer [`display`], which avoids the allocation.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX_CHARS[usize::from(byte >> 4)] as char);
        out.push(HEX_CHARS[usize::from(byte & 0x0f)] as char);
    }
    out
}

/// Try to decode a hex string to owned bytes (`Vec<u8>`).
pub fn decode(hex: &str) -> Result<Vec<u8>, DecodeError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    let mut out = vec![0u8; hex.len() / 2];
    decode_into(hex, &mut out).map(|()| out)
}

/// Decode a hex string into a caller-provided output buffer, which must be
/// exactly half the input length.
pub fn decode_to_slice(hex: &str, out: &mut [u8]) -> Result<(), DecodeError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    decode_into(hex, out)
}

/// Get a [`HexDisplay`] which provides `Debug` and `Display` impls for the
/// given byte slice without allocating.
#[inline]
pub fn display(bytes: &[u8]) -> HexDisplay<'_> {
    HexDisplay(bytes)
}

// --- FromHex trait --- //

/// Deserialize a value from a hex-encoded string slice.
///
/// ```
/// use hex::FromHex;
/// let s = "8ba9b4a825e2c6e11feb6ca80b5a1ee256bdc9601e9bb2d9a13f20ba9b4a825e";
/// <Vec<u8>>::from_hex(s).unwrap();
/// <[u8; 32]>::from_hex(s).unwrap();
/// ```
pub trait FromHex: Sized {
    fn from_hex(s: &str) -> Result<Self, DecodeError>;
}

impl FromHex for Vec<u8> {
    fn from_hex(s: &str) -> Result<Self, DecodeError> {
        decode(s)
    }
}

impl FromHex for Cow<'_, [u8]> {
    fn from_hex(s: &str) -> Result<Self, DecodeError> {
        decode(s).map(Cow::Owned)
    }
}

impl<const N: usize> FromHex for [u8; N] {
    fn from_hex(s: &str) -> Result<Self, DecodeError> {
        let mut out = [0u8; N];
        decode_to_slice(s, out.as_mut_slice())?;
        Ok(out)
    }
}

// --- HexDisplay --- //

/// `Debug` and `Display` impls for a byte slice, rendering lowercase hex.
pub struct HexDisplay<'a>(&'a [u8]);

impl fmt::Display for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            f.write_char(HEX_CHARS[usize::from(byte >> 4)] as char)?;
            f.write_char(HEX_CHARS[usize::from(byte & 0x0f)] as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexDisplay<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

// --- Internal helpers --- //

fn decode_into(hex: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
    if hex.len() != out.len() * 2 {
        return Err(DecodeError::BadOutputLength);
    }

    for (chunk, out_i) in hex.chunks_exact(2).zip(out) {
        let hi = decode_nibble(chunk[0])?;
        let lo = decode_nibble(chunk[1])?;
        *out_i = (hi << 4) | lo;
    }
    Ok(())
}

#[inline]
fn decode_nibble(c: u8) -> Result<u8, DecodeError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(DecodeError::InvalidCharacter),
    }
}
