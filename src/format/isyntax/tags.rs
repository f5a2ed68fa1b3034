//! DICOM-style tag vocabulary used by the iSyntax header.
//!
//! Every leaf in the header tree and every binary record in the block header
//! table and seektable is identified by a (group, element) pair. This module
//! names the pairs the decoder acts on.

use crate::io::{read_i32_le, read_u16_le};

// =============================================================================
// Tag
// =============================================================================

/// A (group, element) tag pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag {
    pub group: u16,
    pub element: u16,
}

impl Tag {
    pub const fn new(group: u16, element: u16) -> Self {
        Self { group, element }
    }

    // Import-level (scanner) attributes
    pub const ACQUISITION_DATETIME: Tag = Tag::new(0x0008, 0x002A);
    pub const MANUFACTURER: Tag = Tag::new(0x0008, 0x0070);
    pub const MANUFACTURERS_MODEL_NAME: Tag = Tag::new(0x0008, 0x1090);
    pub const DEVICE_SERIAL_NUMBER: Tag = Tag::new(0x0018, 0x1000);
    pub const SOFTWARE_VERSIONS: Tag = Tag::new(0x0018, 0x1020);
    pub const DATE_OF_LAST_CALIBRATION: Tag = Tag::new(0x0018, 0x1200);
    pub const TIME_OF_LAST_CALIBRATION: Tag = Tag::new(0x0018, 0x1201);
    pub const SCANNER_RACK_NUMBER: Tag = Tag::new(0x101D, 0x1007);
    pub const SCANNER_SLOT_NUMBER: Tag = Tag::new(0x101D, 0x1008);
    pub const SCANNER_OPERATOR_ID: Tag = Tag::new(0x101D, 0x1009);
    pub const SCANNER_CALIBRATION_STATUS: Tag = Tag::new(0x101D, 0x100A);
    pub const UFS_INTERFACE_VERSION: Tag = Tag::new(0x301D, 0x1001);
    pub const UFS_BARCODE: Tag = Tag::new(0x301D, 0x1002);
    pub const SCANNED_IMAGES: Tag = Tag::new(0x301D, 0x1003);

    // Per-image attributes
    pub const DERIVATION_DESCRIPTION: Tag = Tag::new(0x0008, 0x2111);
    pub const SAMPLES_PER_PIXEL: Tag = Tag::new(0x0028, 0x0002);
    pub const BITS_ALLOCATED: Tag = Tag::new(0x0028, 0x0100);
    pub const BITS_STORED: Tag = Tag::new(0x0028, 0x0101);
    pub const HIGH_BIT: Tag = Tag::new(0x0028, 0x0102);
    pub const PIXEL_REPRESENTATION: Tag = Tag::new(0x0028, 0x0103);
    pub const ICC_PROFILE: Tag = Tag::new(0x0028, 0x2000);
    pub const LOSSY_IMAGE_COMPRESSION: Tag = Tag::new(0x0028, 0x2110);
    pub const LOSSY_IMAGE_COMPRESSION_RATIO: Tag = Tag::new(0x0028, 0x2112);
    pub const LOSSY_IMAGE_COMPRESSION_METHOD: Tag = Tag::new(0x0028, 0x2114);
    pub const IMAGE_TYPE: Tag = Tag::new(0x301D, 0x1004);
    pub const IMAGE_DATA: Tag = Tag::new(0x301D, 0x1005);
    pub const GENERAL_HEADERS: Tag = Tag::new(0x301D, 0x2000);
    pub const DIMENSION_SCALE_FACTOR: Tag = Tag::new(0x301D, 0x2007);
    pub const BLOCK_HEADER_TEMPLATES: Tag = Tag::new(0x301D, 0x2009);
    pub const DIMENSION_RANGES: Tag = Tag::new(0x301D, 0x200A);
    pub const DIMENSION_RANGE: Tag = Tag::new(0x301D, 0x200B);
    pub const BLOCK_HEADER_TABLE: Tag = Tag::new(0x301D, 0x2014);

    // Binary record tags
    pub const SEQUENCE_ITEM: Tag = Tag::new(0xFFFE, 0xE000);
    pub const BLOCK_COORDINATES: Tag = Tag::new(0x301D, 0x200D);
    pub const BLOCK_DATA_OFFSET: Tag = Tag::new(0x301D, 0x2010);
    pub const BLOCK_SIZE: Tag = Tag::new(0x301D, 0x2011);
    pub const BLOCK_HEADER_TEMPLATE_ID: Tag = Tag::new(0x301D, 0x2012);
    pub const SEEKTABLE: Tag = Tag::new(0x301D, 0x2015);

    /// Leaves whose content is a large base64 blob and is bulk-copied by the
    /// header parser instead of going through the character state machine.
    pub fn is_bulk_blob(self) -> bool {
        self == Tag::BLOCK_HEADER_TABLE || self == Tag::IMAGE_DATA || self == Tag::ICC_PROFILE
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:04X},{:04X})", self.group, self.element)
    }
}

// =============================================================================
// Binary Tag Header
// =============================================================================

/// The 8-byte header preceding every field in binary records:
/// group (u16), element (u16), size (i32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    pub tag: Tag,
    pub size: i32,
}

impl TagHeader {
    /// Size of the encoded header in bytes.
    pub const SIZE: usize = 8;

    /// Parse a header from the first 8 bytes of `bytes`.
    ///
    /// Returns `None` if fewer than 8 bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            tag: Tag::new(read_u16_le(bytes), read_u16_le(&bytes[2..])),
            size: read_i32_le(&bytes[4..]),
        })
    }

    /// Append the encoded header to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.group.to_le_bytes());
        out.extend_from_slice(&self.tag.element.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }
}
