//! LSB-first bit streams.
//!
//! Codeblock payloads are read as one giant little-endian integer: the next
//! bit is always the lowest unread bit of the lowest unread byte.

use crate::error::DecodeError;

/// Reader over an LSB-first bitstream.
///
/// Peeks past the end of the data return zero bits; callers that must not
/// run off the end check [`BitReader::require`] first.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bits consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Total bits in the stream.
    pub fn len_bits(&self) -> usize {
        self.data.len() * 8
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.len_bits()
    }

    /// Fail with [`DecodeError::Truncated`] unless `bits` more bits exist.
    pub fn require(&self, bits: usize) -> Result<(), DecodeError> {
        if self.pos + bits > self.len_bits() {
            Err(DecodeError::Truncated)
        } else {
            Ok(())
        }
    }

    /// The next 57 to 64 bits, without consuming them.
    #[inline]
    pub fn peek_u64(&self) -> u64 {
        let byte = self.pos / 8;
        let mut raw = [0u8; 8];
        if byte < self.data.len() {
            let available = (self.data.len() - byte).min(8);
            raw[..available].copy_from_slice(&self.data[byte..byte + available]);
        }
        u64::from_le_bytes(raw) >> (self.pos % 8)
    }

    /// Peek `count` bits (at most 32).
    #[inline]
    pub fn peek_bits(&self, count: u32) -> u32 {
        debug_assert!(count <= 32);
        (self.peek_u64() & low_mask(count)) as u32
    }

    #[inline]
    pub fn consume(&mut self, count: u32) {
        self.pos += count as usize;
    }

    /// Read `count` bits (at most 32), zero-filled past the end.
    #[inline]
    pub fn read_bits(&mut self, count: u32) -> u32 {
        let value = self.peek_bits(count);
        self.consume(count);
        value
    }

    /// Read `count` bits, failing if the stream ends first.
    pub fn read_bits_checked(&mut self, count: u32) -> Result<u32, DecodeError> {
        self.require(count as usize)?;
        Ok(self.read_bits(count))
    }

    pub fn read_bit(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_bits_checked(1)? == 1)
    }

    /// Skip `count` bits, failing if the stream ends first.
    pub fn skip(&mut self, count: usize) -> Result<(), DecodeError> {
        self.require(count)?;
        self.pos += count;
        Ok(())
    }
}

/// Mask of the `count` lowest bits.
#[inline]
pub fn low_mask(count: u32) -> u64 {
    if count >= 64 {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

/// Writer producing an LSB-first bitstream.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the `count` lowest bits of `value`; bits above 32 are zero.
    pub fn write_bits(&mut self, value: u32, count: u32) {
        for i in 0..count {
            let bit = value.checked_shr(i).unwrap_or(0) & 1;
            if self.bit_len % 8 == 0 {
                self.bytes.push(0);
            }
            if bit != 0 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 1 << (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Finish, padding the last byte with zero bits.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
