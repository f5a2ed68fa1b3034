//! Seektable resolution for partial block header tables.
//!
//! When the block header table omits offsets and sizes, the seektable that
//! follows the header's EOT marker supplies them. It is padded to a regular
//! grid, so it holds more entries than there are codeblocks; padding entries
//! have a data offset of zero. Real entries are assigned to codeblocks in
//! order of appearance.

use tracing::warn;

use super::codeblock::Codeblock;
use super::tags::{Tag, TagHeader};
use crate::error::FormatError;
use crate::io::read_u64_le;

/// Size of one seektable entry: item header, offset field, size field.
pub const SEEKTABLE_ENTRY_SIZE: usize = TagHeader::SIZE + (TagHeader::SIZE + 8) * 2;

/// Size in bytes of the seektable body announced by `header`.
///
/// A negative declared size means the writer did not know it; the body is
/// then assumed to hold exactly one entry per codeblock.
pub fn seektable_body_size(header: &TagHeader, codeblock_count: usize) -> Result<usize, FormatError> {
    if header.tag != Tag::SEEKTABLE {
        warn!(
            "seektable: expected tag {}, found {}",
            Tag::SEEKTABLE,
            header.tag
        );
    }
    if header.size < 0 {
        if codeblock_count == 0 {
            return Err(FormatError::Seektable(
                "seektable size unknown and no codeblocks to infer it from".to_string(),
            ));
        }
        Ok(SEEKTABLE_ENTRY_SIZE * codeblock_count)
    } else {
        Ok(header.size as usize)
    }
}

/// Fill offsets and sizes of `codeblocks` from a seektable body.
///
/// Returns the number of seektable entries examined.
pub fn resolve_seektable(body: &[u8], codeblocks: &mut [Codeblock]) -> Result<usize, FormatError> {
    let mut assigned = 0;
    let mut examined = 0;
    let mut warned = false;

    for entry in body.chunks_exact(SEEKTABLE_ENTRY_SIZE) {
        if assigned == codeblocks.len() {
            break;
        }
        examined += 1;

        let offset_header = TagHeader::parse(&entry[TagHeader::SIZE..]);
        if !warned && offset_header.map(|h| h.tag) != Some(Tag::BLOCK_DATA_OFFSET) {
            warn!(
                "seektable: entry {} does not carry a block data offset tag",
                examined - 1
            );
            warned = true;
        }

        let offset = read_u64_le(&entry[2 * TagHeader::SIZE..]);
        if offset == 0 {
            continue;
        }
        let size = read_u64_le(&entry[3 * TagHeader::SIZE + 8..]);

        let codeblock = &mut codeblocks[assigned];
        codeblock.offset = offset;
        codeblock.size = size;
        assigned += 1;
    }

    if assigned < codeblocks.len() {
        return Err(FormatError::Seektable(format!(
            "seektable resolved {} of {} codeblocks",
            assigned,
            codeblocks.len()
        )));
    }
    Ok(examined)
}

/// Serialize a seektable (header plus body) from `(offset, size)` entries.
///
/// Padding entries are written as `(0, 0)`.
pub fn encode_seektable(entries: &[(u64, u64)], declared_size: Option<i32>) -> Vec<u8> {
    let body_size = entries.len() * SEEKTABLE_ENTRY_SIZE;
    let mut out = Vec::with_capacity(TagHeader::SIZE + body_size);
    TagHeader {
        tag: Tag::SEEKTABLE,
        size: declared_size.unwrap_or(body_size as i32),
    }
    .write(&mut out);

    for &(offset, size) in entries {
        TagHeader { tag: Tag::SEQUENCE_ITEM, size: (SEEKTABLE_ENTRY_SIZE - TagHeader::SIZE) as i32 }
            .write(&mut out);
        TagHeader { tag: Tag::BLOCK_DATA_OFFSET, size: 8 }.write(&mut out);
        out.extend_from_slice(&offset.to_le_bytes());
        TagHeader { tag: Tag::BLOCK_SIZE, size: 8 }.write(&mut out);
        out.extend_from_slice(&size.to_le_bytes());
    }
    out
}
