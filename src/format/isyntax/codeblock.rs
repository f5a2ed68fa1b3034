//! Block header table decoding.
//!
//! The WSI image's block header table is a base64 blob holding a u32 table
//! length followed by one fixed-size record per codeblock. Each record is a
//! sequence item whose declared size selects the layout:
//!
//! ```text
//! partial (item size 40, 48 bytes total)     full (item size 72, 80 bytes total)
//! ┌──────────────────────────────┐           ┌──────────────────────────────┐
//! │ item header          (8)     │           │ item header          (8)     │
//! │ coordinates header   (8)     │           │ coordinates header   (8)     │
//! │ x, y, color, scale, coef     │           │ x, y, color, scale, coef     │
//! │                      (5×u32) │           │                      (5×u32) │
//! │ template id header   (8)     │           │ data offset header   (8)     │
//! │ template id          (u32)   │           │ data offset          (u64)   │
//! └──────────────────────────────┘           │ data size header     (8)     │
//!                                            │ data size            (u64)   │
//!                                            │ template id header   (8)     │
//!                                            │ template id          (u32)   │
//!                                            └──────────────────────────────┘
//! ```
//!
//! Partial records leave offset and size to the seektable.

use super::base64;
use super::tags::{Tag, TagHeader};
use crate::error::CodeblockTableError;
use crate::io::{read_u32_le, read_u64_le};

/// Item size announced by a partial record.
pub const PARTIAL_ITEM_SIZE: u32 = 40;

/// Item size announced by a full record.
pub const FULL_ITEM_SIZE: u32 = 72;

/// Codeblock coefficient value for a low-pass (LL) block.
pub const COEFFICIENT_LL: u32 = 0;

/// Codeblock coefficient value for a high-pass (HL, LH, HH) block.
pub const COEFFICIENT_H: u32 = 1;

/// One codeblock descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Codeblock {
    /// Base-level pixel x of the owning tile, plus the image origin offset
    pub x: u32,
    /// Base-level pixel y of the owning tile, plus the image origin offset
    pub y: u32,
    /// Color channel (0 = Y, 1 = Co, 2 = Cg)
    pub color: u32,
    /// Wavelet scale (0 = finest)
    pub scale: u32,
    /// 0 for an LL block, 1 for an H block
    pub coefficient: u32,
    /// Absolute file offset of the compressed data
    pub offset: u64,
    /// Compressed size in bytes
    pub size: u64,
    /// Index into the image's block header templates
    pub template_id: u32,
    /// Entropy coder version (1 or 2)
    pub compressor_version: u8,
}

impl Codeblock {
    /// Number of coefficient sets stored in the block (1 for LL, 3 for H).
    pub fn coefficient_sets(&self) -> usize {
        if self.coefficient == COEFFICIENT_LL {
            1
        } else {
            3
        }
    }

    /// Byte range end (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// The decoded block header table of one image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeblockTable {
    /// Offsets and sizes must come from the seektable
    pub partial: bool,
    pub codeblocks: Vec<Codeblock>,
}

impl CodeblockTable {
    /// Decode the base64 blob found in the header.
    pub fn decode(text: &[u8]) -> Result<Self, CodeblockTableError> {
        let binary = base64::decode(base64::trim_encoded(text))?;
        Self::parse(&binary)
    }

    /// Parse the binary table (after base64 decoding).
    pub fn parse(binary: &[u8]) -> Result<Self, CodeblockTableError> {
        if binary.len() < 4 + TagHeader::SIZE {
            return Err(CodeblockTableError::TooShort(binary.len()));
        }
        let length = read_u32_le(binary);
        let records = &binary[4..];

        let first = TagHeader::parse(records).ok_or(CodeblockTableError::TooShort(binary.len()))?;
        let item_size = first.size as u32;
        let partial = match item_size {
            PARTIAL_ITEM_SIZE => true,
            FULL_ITEM_SIZE => false,
            other => return Err(CodeblockTableError::UnknownRecordSize(other)),
        };

        let record_size = item_size + TagHeader::SIZE as u32;
        if length % record_size != 0 {
            return Err(CodeblockTableError::SizeNotMultiple {
                length,
                record_size,
            });
        }
        let count = (length / record_size) as usize;
        let record_size = record_size as usize;
        if records.len() < count * record_size {
            return Err(CodeblockTableError::TooShort(binary.len()));
        }

        let codeblocks = records
            .chunks_exact(record_size)
            .take(count)
            .map(|record| {
                let mut codeblock = Codeblock {
                    x: read_u32_le(&record[16..]),
                    y: read_u32_le(&record[20..]),
                    color: read_u32_le(&record[24..]),
                    scale: read_u32_le(&record[28..]),
                    coefficient: read_u32_le(&record[32..]),
                    compressor_version: 1,
                    ..Default::default()
                };
                if partial {
                    codeblock.template_id = read_u32_le(&record[44..]);
                } else {
                    codeblock.offset = read_u64_le(&record[44..]);
                    codeblock.size = read_u64_le(&record[60..]);
                    codeblock.template_id = read_u32_le(&record[76..]);
                }
                codeblock
            })
            .collect();

        Ok(Self {
            partial,
            codeblocks,
        })
    }

    /// Serialize to the binary table layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let item_size = if self.partial {
            PARTIAL_ITEM_SIZE
        } else {
            FULL_ITEM_SIZE
        };
        let record_size = item_size as usize + TagHeader::SIZE;
        let mut out = Vec::with_capacity(4 + record_size * self.codeblocks.len());
        out.extend_from_slice(&((record_size * self.codeblocks.len()) as u32).to_le_bytes());

        for cb in &self.codeblocks {
            TagHeader { tag: Tag::SEQUENCE_ITEM, size: item_size as i32 }.write(&mut out);
            TagHeader { tag: Tag::BLOCK_COORDINATES, size: 20 }.write(&mut out);
            for value in [cb.x, cb.y, cb.color, cb.scale, cb.coefficient] {
                out.extend_from_slice(&value.to_le_bytes());
            }
            if !self.partial {
                TagHeader { tag: Tag::BLOCK_DATA_OFFSET, size: 8 }.write(&mut out);
                out.extend_from_slice(&cb.offset.to_le_bytes());
                TagHeader { tag: Tag::BLOCK_SIZE, size: 8 }.write(&mut out);
                out.extend_from_slice(&cb.size.to_le_bytes());
            }
            TagHeader { tag: Tag::BLOCK_HEADER_TEMPLATE_ID, size: 4 }.write(&mut out);
            out.extend_from_slice(&cb.template_id.to_le_bytes());
        }
        out
    }
}
