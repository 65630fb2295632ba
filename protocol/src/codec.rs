//! Encoders for the primitive payloads exchanged with the tag.
//!
//! All functions are pure. Field-level failures are reported through
//! [`Error`] so that the [plan builder](crate::plan) can omit the offending
//! field instead of aborting the session.

use core::fmt::{Display, Formatter};

/// Size of a single keyfile chunk written to the device.
pub const KEYFILE_CHUNK_LEN: usize = 14;

/// Size of one key record inside a keyfile (two chunks).
pub const KEYFILE_RECORD_LEN: usize = 2 * KEYFILE_CHUNK_LEN;

/// Maximum number of key records a keyfile may carry.
pub const KEYFILE_MAX_RECORDS: usize = 39;

/// Length of a device password in bytes.
pub const PASSWORD_LEN: usize = 8;

/// Error type for field encoding.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Error {
    /// The hex string has an odd number of digits.
    OddLength,
    /// A character is not a hex digit.
    InvalidDigit(char),
    /// A MAC address does not consist of exactly 12 hex digits.
    InvalidMacLength(usize),
    /// A password is not exactly 8 bytes long.
    InvalidPasswordLength(usize),
    /// A password contains a non-printable or non-ASCII character.
    InvalidPasswordChar(char),
    /// A keyfile size is not `28 * n + 1` with `n` in `1..=39`.
    InvalidKeyfileSize(usize),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OddLength => write!(f, "odd number of hex digits"),
            Self::InvalidDigit(c) => write!(f, "invalid hex digit: {c:?}"),
            Self::InvalidMacLength(len) => {
                write!(f, "MAC address must have 12 hex digits, got {len}")
            }
            Self::InvalidPasswordLength(len) => {
                write!(f, "password must be exactly 8 ASCII characters, got {len} bytes")
            }
            Self::InvalidPasswordChar(c) => write!(f, "password contains invalid character {c:?}"),
            Self::InvalidKeyfileSize(size) => write!(f, "invalid keyfile size: {size} bytes"),
        }
    }
}

impl std::error::Error for Error {}

/// Encodes an integer attribute value as 4 little-endian bytes.
#[must_use]
pub fn encode_i32_le(val: i32) -> [u8; 4] {
    val.to_le_bytes()
}

/// Decodes 4 little-endian bytes into an integer attribute value.
#[must_use]
pub fn decode_i32_le(bytes: [u8; 4]) -> i32 {
    i32::from_le_bytes(bytes)
}

/// Parses an integer that may be written in hex or decimal.
///
/// An optional `0x`/`0X` prefix is stripped. If the remaining text consists
/// entirely of hex digits it is read as base 16, otherwise as base 10.
/// Anything unparsable yields `0`.
///
/// Note that bare digit strings such as `"458000"` are therefore hex.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn parse_flexible_int(s: &str) -> i32 {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    if digits.chars().all(|c| c.is_ascii_hexdigit()) {
        // Wide values are truncated to 32 bits
        i64::from_str_radix(digits, 16).map_or(0, |val| val as i32)
    } else {
        digits.parse().unwrap_or(0)
    }
}

/// Decodes a hex string into bytes.
///
/// Spaces are ignored. An empty string decodes to an empty byte sequence.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, Error> {
    let digits: Vec<u8> = s
        .chars()
        .filter(|&c| c != ' ')
        .map(hex_digit)
        .collect::<Result<_, _>>()?;

    if digits.len() % 2 != 0 {
        return Err(Error::OddLength);
    }

    Ok(digits.chunks(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}

/// Encodes a MAC address for the config-MAC attribute.
///
/// Accepts `AA:BB:CC:DD:EE:FF` or `AABBCCDDEEFF` in any case.
/// The device expects the least significant byte first, so the result
/// is reversed relative to the textual order.
pub fn encode_mac_bytes(text: &str) -> Result<[u8; 6], Error> {
    let mut bytes = parse_mac(text)?;

    bytes.reverse();

    Ok(bytes)
}

/// Parses a MAC address in textual (most significant byte first) order.
pub(crate) fn parse_mac(text: &str) -> Result<[u8; 6], Error> {
    let digits: Vec<u8> = text
        .trim()
        .chars()
        .filter(|&c| c != ':' && c != ' ')
        .map(hex_digit)
        .collect::<Result<_, _>>()?;

    if digits.len() != 12 {
        return Err(Error::InvalidMacLength(digits.len()));
    }

    let mut bytes = [0x00; 6];

    for (byte, pair) in bytes.iter_mut().zip(digits.chunks(2)) {
        *byte = pair[0] << 4 | pair[1];
    }

    Ok(bytes)
}

/// Normalizes user input into the `AA:BB:CC:DD:EE:FF` display form.
///
/// Non-hex characters are dropped and the result is capped at 6 bytes.
/// Incomplete input is formatted as far as it goes.
#[must_use]
pub fn format_mac(input: &str) -> String {
    let digits: Vec<char> = input
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .take(12)
        .collect();

    digits
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

/// Encodes a device password.
///
/// The password must be exactly 8 printable ASCII characters.
pub fn encode_password(password: &str) -> Result<[u8; PASSWORD_LEN], Error> {
    if let Some(c) = password.chars().find(|c| !matches!(c, ' '..='~')) {
        return Err(Error::InvalidPasswordChar(c));
    }

    password
        .as_bytes()
        .try_into()
        .map_err(|_| Error::InvalidPasswordLength(password.len()))
}

/// Checks that a keyfile has the size `28 * n + 1` for `n` in `1..=39`.
///
/// Returns the number of key records on success.
pub fn validate_keyfile_len(len: usize) -> Result<usize, Error> {
    let records = len.saturating_sub(1) / KEYFILE_RECORD_LEN;

    if len > 0
        && (len - 1) % KEYFILE_RECORD_LEN == 0
        && (1..=KEYFILE_MAX_RECORDS).contains(&records)
    {
        Ok(records)
    } else {
        Err(Error::InvalidKeyfileSize(len))
    }
}

/// Splits a keyfile into the chunks written to the keyfile attribute.
///
/// The leading marker byte is not transmitted. The remainder is split into
/// 14-byte chunks, followed by two all-zero chunks marking the end of file.
/// The last data chunk is only shorter than 14 bytes if the keyfile size
/// is invalid (see [`validate_keyfile_len`]).
#[must_use]
pub fn chunk_keyfile(raw: &[u8]) -> Vec<Vec<u8>> {
    let body = raw.get(1..).unwrap_or_default();
    let mut chunks: Vec<Vec<u8>> = body.chunks(KEYFILE_CHUNK_LEN).map(<[u8]>::to_vec).collect();

    chunks.push(vec![0x00; KEYFILE_CHUNK_LEN]);
    chunks.push(vec![0x00; KEYFILE_CHUNK_LEN]);

    chunks
}

// Digit values are below 16, so the cast never truncates
#[allow(clippy::cast_possible_truncation)]
fn hex_digit(c: char) -> Result<u8, Error> {
    c.to_digit(16)
        .map(|d| d as u8)
        .ok_or(Error::InvalidDigit(c))
}
