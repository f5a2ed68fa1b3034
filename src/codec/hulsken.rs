//! Hulsken entropy coding of coefficient bitplanes.
//!
//! A codeblock is a header, a Huffman tree and a Huffman-coded byte message.
//! The message is the block's coefficient bitplanes, with runs of zero bytes
//! replaced by an escape symbol followed by a run length.
//!
//! ```text
//! v1: u32 serialized length │ u8 escape │ u8 counter bits │ tree │ message
//! v2: u16 mask × sets       │ u8 escape │ u8 counter bits │ plane seek table │ tree │ message
//! ```
//!
//! In v2 the serialized length is implied by the bitplane masks, and every
//! stored run length is one less than the run.

use tracing::debug;

use super::bitstream::{BitReader, BitWriter};
use super::huffman::{HuffmanEncoder, HuffmanTable};
use crate::error::DecodeError;

/// Bits per coefficient.
pub const COEFFICIENT_BITS: u32 = 16;

/// Largest run-length field accepted.
const MAX_COUNTER_BITS: u8 = 24;

/// Default run-length field width for the encoder.
pub const DEFAULT_COUNTER_BITS: u8 = 6;

// =============================================================================
// Header
// =============================================================================

/// Parsed codeblock header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub serialized_length: usize,
    pub escape: u8,
    pub counter_bits: u8,
    /// Bitplane presence per coefficient set
    pub masks: [u16; 3],
}

impl BlockHeader {
    fn read(
        reader: &mut BitReader<'_>,
        sets: usize,
        version: u8,
        plane_bytes: usize,
    ) -> Result<Self, DecodeError> {
        let mut masks = [0xFFFF; 3];
        let serialized_length = if version == 1 {
            reader.read_bits_checked(32)? as usize
        } else {
            let mut planes = 0;
            for mask in masks.iter_mut().take(sets) {
                *mask = reader.read_bits_checked(16)? as u16;
                planes += mask.count_ones() as usize;
            }
            planes * plane_bytes
        };
        let escape = reader.read_bits_checked(8)? as u8;
        let counter_bits = reader.read_bits_checked(8)? as u8;
        if counter_bits > MAX_COUNTER_BITS {
            return Err(DecodeError::InvalidHeader(format!(
                "run-length field of {} bits",
                counter_bits
            )));
        }
        Ok(Self {
            serialized_length,
            escape,
            counter_bits,
            masks,
        })
    }

    fn stored_planes(&self, sets: usize) -> usize {
        self.masks.iter().take(sets).map(|m| m.count_ones() as usize).sum()
    }
}

/// Width of one v2 plane seek table entry.
fn plane_pointer_bits(serialized_length: usize) -> usize {
    (usize::BITS - 1 - serialized_length.leading_zeros()) as usize + 5
}

// =============================================================================
// Decoding
// =============================================================================

/// Entropy-decode a codeblock into its serialized bitplanes.
///
/// Returns the header and the serialized bytes.
pub fn decompress(
    data: &[u8],
    sets: usize,
    version: u8,
    block_width: usize,
    block_height: usize,
) -> Result<(BlockHeader, Vec<u8>), DecodeError> {
    if sets != 1 && sets != 3 {
        return Err(DecodeError::InvalidHeader(format!("{} coefficient sets", sets)));
    }
    if version != 1 && version != 2 {
        return Err(DecodeError::InvalidHeader(format!("compressor version {}", version)));
    }
    let plane_bytes = block_width * block_height / 8;

    let mut reader = BitReader::new(data);
    let header = BlockHeader::read(&mut reader, sets, version, plane_bytes)?;
    let length = header.serialized_length;
    if length == 0 {
        return Ok((header, Vec::new()));
    }

    if version == 2 {
        let planes = header.stored_planes(sets);
        reader.skip(planes * plane_pointer_bits(length))?;
    }

    let table = HuffmanTable::read(&mut reader)?;
    let escape_code = table.code(header.escape);
    let counter_bits = u32::from(header.counter_bits);
    let bias = u64::from(version == 2);

    let mut out = vec![0u8; length];
    let mut produced = 0usize;

    while produced < length && reader.has_remaining() {
        let symbol = table.decode_symbol(&mut reader)?;
        if symbol != header.escape {
            out[produced] = symbol;
            produced += 1;
            continue;
        }

        let mut run = u64::from(reader.read_bits(counter_bits));
        if run == 0 {
            // An escaped escape symbol
            out[produced] = symbol;
            produced += 1;
            continue;
        }
        run += bias;

        // Each adjacent escape widens the run-length field
        if (produced as u64 + run) < length as u64 {
            if let Some((code, size)) = escape_code {
                while reader.peek_bits(size) == code {
                    reader.consume(size);
                    let extra = u64::from(reader.read_bits(counter_bits)) + bias;
                    run = (run << counter_bits) | extra;
                    if produced as u64 + run >= length as u64 {
                        break;
                    }
                }
            }
        }

        // The buffer is zero-initialized
        produced = produced.saturating_add(run.min(usize::MAX as u64) as usize);
    }

    if produced != length {
        debug!(
            "hulsken: size mismatch, expected {} observed {}",
            length, produced
        );
        return Err(DecodeError::SizeMismatch {
            expected: length,
            actual: produced,
        });
    }
    Ok((header, out))
}

/// Decode a codeblock into `out` as signed coefficients.
///
/// `out` holds `sets` blocks of `block_width × block_height` coefficients
/// (HL, LH, HH for an H codeblock).
pub fn decode_codeblock(
    data: &[u8],
    sets: usize,
    version: u8,
    block_width: usize,
    block_height: usize,
    out: &mut [i16],
) -> Result<(), DecodeError> {
    let block_len = block_width * block_height;
    if out.len() < sets * block_len {
        return Err(DecodeError::InvalidHeader(format!(
            "output holds {} coefficients, need {}",
            out.len(),
            sets * block_len
        )));
    }
    if block_len == 0 || block_len % 8 != 0 {
        return Err(DecodeError::InvalidHeader(format!(
            "block of {}x{} coefficients does not pack into bitplanes",
            block_width, block_height
        )));
    }
    let (header, serialized) = decompress(data, sets, version, block_width, block_height)?;
    let plane_bytes = block_len / 8;

    let mut magnitudes = vec![0u16; block_len];
    let mut planes = serialized.chunks_exact(plane_bytes);
    for (set, mask) in header.masks.iter().take(sets).enumerate() {
        magnitudes.fill(0);
        for bit in 0..COEFFICIENT_BITS {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let plane = planes.next().ok_or(DecodeError::Truncated)?;
            for (i, magnitude) in magnitudes.iter_mut().enumerate() {
                *magnitude |= u16::from((plane[i / 8] >> (i % 8)) & 1) << bit;
            }
        }
        let target = &mut out[set * block_len..(set + 1) * block_len];
        for (coefficient, &raw) in target.iter_mut().zip(&magnitudes) {
            *coefficient = from_sign_magnitude(raw);
        }
    }
    Ok(())
}

#[inline]
fn from_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[inline]
fn to_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs().min(0x7FFF);
    if value < 0 {
        magnitude | 0x8000
    } else {
        magnitude
    }
}

// =============================================================================
// Encoding
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Token {
    Literal(u8),
    /// Escape symbol followed by a run-length field
    Escape(u32),
}

/// Split a run of `run` zeros into leading and chained run-length fields.
///
/// Returns `None` when the run has no representation. v1 fields are plain
/// base-2^b digits; v2 stores each digit minus one, which leaves the leading
/// digit in `2..=2^b` and chained digits in `1..2^b`.
fn run_fields(run: u64, counter_bits: u32, version: u8) -> Option<Vec<u32>> {
    if counter_bits == 0 || run < 2 {
        return None;
    }
    let base = 1u64 << counter_bits;
    let mut digits = Vec::new();
    let mut rest = run;
    loop {
        let leading_ok = if version == 1 {
            rest >= 1 && rest < base
        } else {
            rest >= 2 && rest <= base
        };
        if leading_ok {
            digits.push(rest);
            break;
        }
        let digit = rest % base;
        if version == 2 && digit == 0 {
            return None;
        }
        digits.push(digit);
        rest /= base;
        if rest == 0 || digits.len() > 8 {
            return None;
        }
    }
    digits.reverse();
    let bias = u64::from(version == 2);
    Some(digits.into_iter().map(|d| (d - bias) as u32).collect())
}

fn tokenize(bytes: &[u8], escape: u8, counter_bits: u32, version: u8, use_runs: bool) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if byte != 0 || !use_runs {
            tokens.push(if byte == escape {
                Token::Escape(0)
            } else {
                Token::Literal(byte)
            });
            i += 1;
            continue;
        }

        let run = bytes[i..].iter().take_while(|&&b| b == 0).count();
        // Longest representable prefix of the run, then literal zeros
        let mut encoded = run;
        let mut fields = None;
        while encoded >= 2 {
            fields = run_fields(encoded as u64, counter_bits, version);
            if fields.is_some() {
                break;
            }
            encoded -= 1;
        }
        match fields {
            Some(fields) => {
                tokens.extend(fields.into_iter().map(Token::Escape));
                tokens.extend(std::iter::repeat(Token::Literal(0)).take(run - encoded));
            }
            None => tokens.extend(std::iter::repeat(Token::Literal(0)).take(run)),
        }
        i += run;
    }
    tokens
}

/// Entropy-code `coefficients` (`sets` blocks) as a codeblock.
pub fn encode_codeblock(
    coefficients: &[i16],
    sets: usize,
    version: u8,
    block_width: usize,
    block_height: usize,
    counter_bits: u8,
) -> Vec<u8> {
    let block_len = block_width * block_height;
    let plane_bytes = block_len / 8;

    let mut masks = [0xFFFFu16; 3];
    let mut serialized = Vec::new();
    for set in 0..sets {
        let raw: Vec<u16> = coefficients[set * block_len..(set + 1) * block_len]
            .iter()
            .map(|&c| to_sign_magnitude(c))
            .collect();
        if version == 2 {
            masks[set] = raw.iter().fold(0, |acc, &r| acc | r);
        }
        for bit in 0..COEFFICIENT_BITS {
            if masks[set] & (1 << bit) == 0 {
                continue;
            }
            let mut plane = vec![0u8; plane_bytes];
            for (i, &r) in raw.iter().enumerate() {
                if r & (1 << bit) != 0 {
                    plane[i / 8] |= 1 << (i % 8);
                }
            }
            serialized.extend_from_slice(&plane);
        }
    }

    // An escape value absent from the message keeps literals and runs apart
    let mut used = [false; 256];
    for &b in &serialized {
        used[b as usize] = true;
    }
    let free = (1..=255u8).find(|&b| !used[b as usize]);
    let escape = free.unwrap_or(0xFF);
    let tokens = tokenize(&serialized, escape, u32::from(counter_bits), version, free.is_some());

    let mut writer = BitWriter::new();
    if version == 1 {
        writer.write_bits(serialized.len() as u32, 32);
    } else {
        for mask in masks.iter().take(sets) {
            writer.write_bits(u32::from(*mask), 16);
        }
    }
    writer.write_bits(u32::from(escape), 8);
    writer.write_bits(u32::from(counter_bits), 8);
    if serialized.is_empty() {
        return writer.into_bytes();
    }

    if version == 2 {
        let planes: usize = masks.iter().take(sets).map(|m| m.count_ones() as usize).sum();
        let pointer_bits = plane_pointer_bits(serialized.len()) as u32;
        for plane in 0..planes {
            writer.write_bits((plane * plane_bytes) as u32, pointer_bits);
        }
    }

    let mut frequencies = [0u64; 256];
    for token in &tokens {
        match token {
            Token::Literal(b) => frequencies[*b as usize] += 1,
            Token::Escape(_) => frequencies[escape as usize] += 1,
        }
    }
    let encoder = HuffmanEncoder::from_frequencies(&frequencies);
    encoder.write_tree(&mut writer);
    for token in &tokens {
        match *token {
            Token::Literal(b) => encoder.write_symbol(b, &mut writer),
            Token::Escape(field) => {
                encoder.write_symbol(escape, &mut writer);
                writer.write_bits(field, u32::from(counter_bits));
            }
        }
    }
    writer.into_bytes()
}
