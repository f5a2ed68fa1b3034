//! RFC1341 base64 codec for header blobs.
//!
//! The header embeds binary payloads (block header table, ICC profile,
//! label/macro JPEGs, barcode) as base64 text. Decoding follows RFC1341:
//! characters outside the alphabet (line breaks, stray spaces) are skipped,
//! four symbols yield three bytes, and `=` padding in the final quantum
//! drops one or two output bytes.
//!
//! Some writers append a stray `/` after the last quantum. [`trim_encoded`]
//! removes it along with trailing whitespace before decoding.

use crate::error::Base64Error;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const INVALID: u8 = 0x80;

const fn build_decode_table() -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < 64 {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table[b'=' as usize] = 0;
    table
}

static DECODE_TABLE: [u8; 256] = build_decode_table();

#[inline]
fn is_symbol(byte: u8) -> bool {
    DECODE_TABLE[byte as usize] != INVALID
}

#[inline]
fn is_trailing_space(byte: u8) -> bool {
    matches!(byte, b'\n' | b'\r' | b' ' | b'\t')
}

fn trim_trailing_space(mut src: &[u8]) -> &[u8] {
    while let Some((&last, rest)) = src.split_last() {
        if !is_trailing_space(last) {
            break;
        }
        src = rest;
    }
    src
}

/// Strip trailing whitespace and a stray trailing `/`.
///
/// The `/` is only removed when it leaves the symbol count one past a whole
/// quantum; a `/` that completes a valid quantum is real data.
pub fn trim_encoded(src: &[u8]) -> &[u8] {
    let trimmed = trim_trailing_space(src);
    if trimmed.last() == Some(&b'/') {
        let symbols = trimmed.iter().filter(|&&b| is_symbol(b)).count();
        if symbols % 4 == 1 {
            return trim_trailing_space(&trimmed[..trimmed.len() - 1]);
        }
    }
    trimmed
}

/// Decode base64 text into bytes.
///
/// # Errors
/// - `Empty` if no alphabet symbols are present
/// - `InvalidLength` if the symbol count is not a multiple of four
/// - `InvalidPadding` if the final quantum carries more than two `=`
pub fn decode(src: &[u8]) -> Result<Vec<u8>, Base64Error> {
    let count = src.iter().filter(|&&b| is_symbol(b)).count();
    if count == 0 {
        return Err(Base64Error::Empty);
    }
    if count % 4 != 0 {
        return Err(Base64Error::InvalidLength(count));
    }

    let mut out = Vec::with_capacity(count / 4 * 3);
    let mut block = [0u8; 4];
    let mut filled = 0;
    let mut pad = 0;

    for &byte in src {
        let value = DECODE_TABLE[byte as usize];
        if value == INVALID {
            continue;
        }
        if byte == b'=' {
            pad += 1;
        }
        block[filled] = value;
        filled += 1;

        if filled == 4 {
            out.push((block[0] << 2) | (block[1] >> 4));
            out.push((block[1] << 4) | (block[2] >> 2));
            out.push((block[2] << 6) | block[3]);
            filled = 0;

            if pad > 0 {
                match pad {
                    1 => out.truncate(out.len() - 1),
                    2 => out.truncate(out.len() - 2),
                    n => return Err(Base64Error::InvalidPadding(n)),
                }
                break;
            }
        }
    }

    Ok(out)
}

/// Encode bytes as padded base64 text (no line breaks).
pub fn encode(src: &[u8]) -> String {
    let mut out = String::with_capacity((src.len() + 2) / 3 * 4);
    for group in src.chunks(3) {
        let b0 = group[0];
        let b1 = group.get(1).copied().unwrap_or(0);
        let b2 = group.get(2).copied().unwrap_or(0);

        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        if group.len() > 1 {
            out.push(ALPHABET[(((b1 & 0x0F) << 2) | (b2 >> 6)) as usize] as char);
        } else {
            out.push('=');
        }
        if group.len() > 2 {
            out.push(ALPHABET[(b2 & 0x3F) as usize] as char);
        } else {
            out.push('=');
        }
    }
    out
}
