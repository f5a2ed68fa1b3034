//! Container detection for iSyntax files.
//!
//! An iSyntax file starts with its XML header tree, optionally preceded by a
//! UTF-8 byte order mark. Anything else is rejected before the header parser
//! gets to see it.

use crate::error::FormatError;
use crate::io::RangeReader;

/// Bytes read for detection.
const DETECT_BYTES: usize = 256;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Check whether `bytes` look like the start of an iSyntax header.
pub fn is_isyntax_header(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let bytes = &bytes[start..];
    bytes.starts_with(b"<?xml") || bytes.starts_with(b"<DataObject")
}

/// Verify that `reader` holds an iSyntax container.
///
/// # Returns
/// * `Ok(())` - The file starts with an iSyntax header tree
/// * `Err(FormatError::UnsupportedFormat)` - Anything else
pub async fn ensure_isyntax(reader: &dyn RangeReader) -> Result<(), FormatError> {
    let len = (reader.size() as usize).min(DETECT_BYTES);
    if len == 0 {
        return Err(FormatError::UnsupportedFormat {
            reason: "file is empty".to_string(),
        });
    }
    let head = reader.read_exact_at(0, len).await?;
    if is_isyntax_header(&head) {
        Ok(())
    } else {
        Err(FormatError::UnsupportedFormat {
            reason: "file does not start with an iSyntax header".to_string(),
        })
    }
}
