//! Opening an iSyntax container.
//!
//! ```text
//! ┌──────────────────────┬──────────┬─────────────┬──────────────────────┐
//! │ header tree (text)   │ CR LF 04 │ [seektable] │ codeblock data ...   │
//! └──────────────────────┴──────────┴─────────────┴──────────────────────┘
//!                                   ^ data offset
//! ```
//!
//! The header is streamed through [`HeaderParser`] in fixed-size reads until
//! the EOT byte shows up, so a multi-megabyte header never has to be held in
//! one buffer. When the WSI block header table is partial, the seektable at
//! the data offset supplies codeblock offsets and sizes.

use tracing::{debug, info, warn};

use super::codeblock::Codeblock;
use super::header::HeaderParser;
use super::layout::CodeblockStore;
use super::metadata::{ImageKind, IsyntaxHeader, MetadataBuilder};
use super::seektable::{resolve_seektable, seektable_body_size};
use super::tags::TagHeader;
use crate::error::FormatError;
use crate::format::detect::ensure_isyntax;
use crate::io::RangeReader;

/// Size of each header read.
pub const HEADER_READ_SIZE: usize = 1 << 20;

/// Byte terminating the header tree.
pub const EOT_MARKER: u8 = 0x04;

/// A parsed container: metadata plus the WSI codeblock store.
#[derive(Debug, Clone)]
pub struct IsyntaxContainer {
    pub header: IsyntaxHeader,
    /// Length of the header text, excluding the EOT byte
    pub header_length: u64,
    /// First byte after the EOT marker
    pub data_offset: u64,
    /// Index of the WSI image in `header.images`
    pub wsi_index: usize,
    pub store: CodeblockStore,
}

/// Parse the container behind `reader`.
pub async fn open_container(reader: &dyn RangeReader) -> Result<IsyntaxContainer, FormatError> {
    ensure_isyntax(reader).await?;

    let (mut header, header_length) = parse_header(reader).await?;
    let data_offset = header_length + 1;

    let wsi_index = header
        .images
        .iter()
        .position(|image| image.kind == ImageKind::Wsi)
        .ok_or(FormatError::NoWsiImage)?;
    let image = &mut header.images[wsi_index];
    let table = image
        .codeblock_table
        .take()
        .ok_or(FormatError::MissingBlockHeaderTable)?;

    let mut codeblocks = table.codeblocks;
    if table.partial {
        let examined = read_seektable(reader, data_offset, &mut codeblocks).await?;
        debug!(
            "container: seektable resolved {} codeblocks from {} entries",
            codeblocks.len(),
            examined
        );
    }

    let compressor_version = image.compressor_version();
    for codeblock in &mut codeblocks {
        codeblock.compressor_version = compressor_version;
    }

    let codeblock_count = codeblocks.len();
    let store = CodeblockStore::build(image, codeblocks)?;
    if let Some(chunk) = store.chunks.iter().find(|c| c.end() > reader.size()) {
        return Err(FormatError::InvalidGeometry(format!(
            "chunk at offset {} ends past the end of the file",
            chunk.offset
        )));
    }

    info!(
        "Opened {}: header {} bytes, {} codeblocks, {} chunks, {} levels",
        reader.identifier(),
        header_length,
        codeblock_count,
        store.chunks.len(),
        store.level_count()
    );

    Ok(IsyntaxContainer {
        header,
        header_length,
        data_offset,
        wsi_index,
        store,
    })
}

/// Stream the header tree through the parser until the EOT marker.
async fn parse_header(reader: &dyn RangeReader) -> Result<(IsyntaxHeader, u64), FormatError> {
    let size = reader.size();
    let mut parser = HeaderParser::new();
    let mut builder = MetadataBuilder::new();
    let mut offset = 0u64;
    let mut tail = [0u8; 2];

    while offset < size {
        let len = (size - offset).min(HEADER_READ_SIZE as u64) as usize;
        let chunk = reader.read_exact_at(offset, len).await?;

        if let Some(pos) = chunk.iter().position(|&b| b == EOT_MARKER) {
            let preceding = match pos {
                0 => tail,
                1 => [tail[1], chunk[0]],
                _ => [chunk[pos - 2], chunk[pos - 1]],
            };
            if &preceding != b"\r\n" {
                warn!("container: header end marker is not preceded by CR LF");
            }
            parser.feed(&chunk[..pos], true, &mut builder)?;
            let header_length = offset + pos as u64;
            debug!(
                "container: header parsed ({} bytes, {}% of file)",
                header_length,
                header_length * 100 / size.max(1)
            );
            return Ok((builder.finish(), header_length));
        }

        parser.feed(&chunk, false, &mut builder)?;
        if len >= 2 {
            tail = [chunk[len - 2], chunk[len - 1]];
        } else {
            tail = [tail[1], chunk[0]];
        }
        offset += len as u64;
    }

    Err(FormatError::MissingEotMarker)
}

/// Read the seektable at `data_offset` and fill in codeblock offsets and sizes.
async fn read_seektable(
    reader: &dyn RangeReader,
    data_offset: u64,
    codeblocks: &mut [Codeblock],
) -> Result<usize, FormatError> {
    let header_bytes = reader
        .read_exact_at(data_offset, TagHeader::SIZE)
        .await
        .map_err(|e| FormatError::Seektable(format!("cannot read seektable header: {}", e)))?;
    let tag_header = TagHeader::parse(&header_bytes)
        .ok_or_else(|| FormatError::Seektable("short seektable header".to_string()))?;

    let body_size = seektable_body_size(&tag_header, codeblocks.len())?;
    let body = reader
        .read_exact_at(data_offset + TagHeader::SIZE as u64, body_size)
        .await
        .map_err(|e| FormatError::Seektable(format!("cannot read seektable body: {}", e)))?;

    resolve_seektable(&body, codeblocks)
}
