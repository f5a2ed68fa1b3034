//! Semantic handling of header leaves.
//!
//! [`MetadataBuilder`] is the [`HeaderVisitor`] that turns the header tree
//! into an [`IsyntaxHeader`]: scanner-level attributes at depth 2 and
//! per-image attributes deeper down, including the block header table,
//! dimension ranges and block header templates.

use serde::Serialize;
use tracing::{debug, warn};

use super::base64;
use super::codeblock::CodeblockTable;
use super::header::HeaderVisitor;
use super::tags::Tag;
use crate::error::HeaderError;

/// Depth of leaves directly below the root `UFSImport` object.
const IMPORT_LEVEL_DEPTH: usize = 2;

// =============================================================================
// Metadata Types
// =============================================================================

/// Kind of a scanned image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ImageKind {
    #[default]
    Unknown,
    Wsi,
    Label,
    Macro,
}

impl ImageKind {
    fn from_value(value: &str) -> Self {
        match value {
            "WSI" => ImageKind::Wsi,
            "LABELIMAGE" => ImageKind::Label,
            "MACROIMAGE" => ImageKind::Macro,
            _ => ImageKind::Unknown,
        }
    }
}

/// A `start step end` dimension range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DimensionRange {
    pub start: i64,
    pub step: i64,
    pub end: i64,
}

impl DimensionRange {
    /// Extent covered by the range, `end + step - start`.
    pub fn range(&self) -> i64 {
        self.end + self.step - self.start
    }

    /// Number of discrete steps in the range.
    pub fn step_count(&self) -> i64 {
        if self.step == 0 {
            0
        } else {
            self.range() / self.step
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace().map(|p| p.parse::<i64>());
        let start = parts.next()?.ok()?;
        let step = parts.next()?.ok()?;
        let end = parts.next()?.ok()?;
        Some(Self { start, step, end })
    }
}

/// Parsed `PHILIPS UFS V<ver> | Quality=<q> | DWT=<d> | Compressor=<c>`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DerivationDescription {
    pub version: Option<String>,
    pub quality: Option<u32>,
    pub dwt: Option<u32>,
    pub compressor: Option<u32>,
}

impl DerivationDescription {
    pub fn parse(value: &str) -> Self {
        let mut description = Self::default();
        for part in value.split('|').map(str::trim) {
            if let Some((key, val)) = part.split_once('=') {
                let number = val.trim().parse().ok();
                match key.trim() {
                    "Quality" => description.quality = number,
                    "DWT" => description.dwt = number,
                    "Compressor" => description.compressor = number,
                    _ => {}
                }
            } else if let Some(idx) = part.rfind(" V") {
                description.version = Some(part[idx + 2..].to_string());
            }
        }
        description
    }
}

/// One block header template: the dimension ranges of a codeblock.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BlockTemplate {
    pub dimension_ranges: Vec<DimensionRange>,
}

/// Scanner-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ImportMetadata {
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub acquisition_datetime: Option<String>,
    pub device_serial_number: Option<String>,
    pub software_versions: Option<String>,
    pub calibration_date: Option<String>,
    pub calibration_time: Option<String>,
    pub interface_version: Option<String>,
    pub barcode: Option<String>,
    pub scanner_rack_number: Option<String>,
    pub scanner_slot_number: Option<String>,
    pub scanner_operator_id: Option<String>,
    pub scanner_calibration_status: Option<String>,
}

/// Per-image metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ImageHeader {
    pub kind: ImageKind,
    pub derivation: Option<DerivationDescription>,
    pub samples_per_pixel: Option<u16>,
    pub bits_allocated: Option<u16>,
    pub bits_stored: Option<u16>,
    pub high_bit: Option<u16>,
    pub pixel_representation: Option<u16>,
    pub lossy_compression: Option<String>,
    pub compression_ratio: Option<String>,
    pub compression_method: Option<String>,
    /// General-header ranges in order x, y, color, scale, coefficient
    pub dimension_ranges: Vec<DimensionRange>,
    /// Physical size of one step along each dimension (microns for x and y)
    pub dimension_scale_factors: Vec<f64>,
    pub block_templates: Vec<BlockTemplate>,
    #[serde(skip)]
    pub icc_profile: Option<Vec<u8>>,
    /// Embedded JPEG (label and macro images)
    #[serde(skip)]
    pub image_data: Option<Vec<u8>>,
    #[serde(skip)]
    pub codeblock_table: Option<CodeblockTable>,
}

impl ImageHeader {
    /// Entropy coder version announced by the derivation description.
    pub fn compressor_version(&self) -> u8 {
        self.derivation
            .as_ref()
            .and_then(|d| d.compressor)
            .map(|c| c.clamp(1, 2) as u8)
            .unwrap_or(1)
    }
}

/// Everything extracted from the header tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct IsyntaxHeader {
    pub import: ImportMetadata,
    pub images: Vec<ImageHeader>,
}

impl IsyntaxHeader {
    /// Find the first image of the given kind.
    pub fn image(&self, kind: ImageKind) -> Option<&ImageHeader> {
        self.images.iter().find(|image| image.kind == kind)
    }
}

// =============================================================================
// Builder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderMode {
    None,
    GeneralHeaders,
    BlockHeaderTemplates,
}

/// Header visitor that accumulates an [`IsyntaxHeader`].
pub struct MetadataBuilder {
    header: IsyntaxHeader,
    current_image: Option<usize>,
    mode: HeaderMode,
}

impl Default for MetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}

fn number<T: std::str::FromStr>(tag: Tag, value: &[u8]) -> Option<T> {
    let parsed = text(value).parse().ok();
    if parsed.is_none() {
        debug!("header: unparseable numeric value for {}", tag);
    }
    parsed
}

fn decode_blob(tag: Tag, value: &[u8]) -> Option<Vec<u8>> {
    match base64::decode(base64::trim_encoded(value)) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("header: could not decode blob {}: {}", tag, e);
            None
        }
    }
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self {
            header: IsyntaxHeader::default(),
            current_image: None,
            mode: HeaderMode::None,
        }
    }

    /// Finish building and return the metadata.
    pub fn finish(self) -> IsyntaxHeader {
        self.header
    }

    fn current_image(&mut self) -> &mut ImageHeader {
        let index = match self.current_image {
            Some(index) => index,
            None => {
                // Per-image leaves before any DPScannedImage object go to a first image
                self.header.images.push(ImageHeader::default());
                let index = self.header.images.len() - 1;
                self.current_image = Some(index);
                index
            }
        };
        &mut self.header.images[index]
    }

    fn import_leaf(&mut self, tag: Tag, value: &[u8]) {
        let import = &mut self.header.import;
        let slot = match tag {
            Tag::ACQUISITION_DATETIME => &mut import.acquisition_datetime,
            Tag::MANUFACTURER => &mut import.manufacturer,
            Tag::MANUFACTURERS_MODEL_NAME => &mut import.model_name,
            Tag::DEVICE_SERIAL_NUMBER => &mut import.device_serial_number,
            Tag::SOFTWARE_VERSIONS => &mut import.software_versions,
            Tag::DATE_OF_LAST_CALIBRATION => &mut import.calibration_date,
            Tag::TIME_OF_LAST_CALIBRATION => &mut import.calibration_time,
            Tag::SCANNER_RACK_NUMBER => &mut import.scanner_rack_number,
            Tag::SCANNER_SLOT_NUMBER => &mut import.scanner_slot_number,
            Tag::SCANNER_OPERATOR_ID => &mut import.scanner_operator_id,
            Tag::SCANNER_CALIBRATION_STATUS => &mut import.scanner_calibration_status,
            Tag::UFS_INTERFACE_VERSION => &mut import.interface_version,
            Tag::UFS_BARCODE => {
                let barcode = match base64::decode(base64::trim_encoded(value)) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(_) => text(value),
                };
                import.barcode = Some(barcode);
                return;
            }
            _ => {
                debug!("header: unknown import-level attribute {}", tag);
                return;
            }
        };
        *slot = Some(text(value));
    }

    fn image_leaf(&mut self, tag: Tag, value: &[u8]) -> Result<(), HeaderError> {
        let mode = self.mode;
        let image = self.current_image();
        match tag {
            Tag::DERIVATION_DESCRIPTION => {
                image.derivation = Some(DerivationDescription::parse(&text(value)));
            }
            Tag::SAMPLES_PER_PIXEL => image.samples_per_pixel = number(tag, value),
            Tag::BITS_ALLOCATED => image.bits_allocated = number(tag, value),
            Tag::BITS_STORED => image.bits_stored = number(tag, value),
            Tag::HIGH_BIT => image.high_bit = number(tag, value),
            Tag::PIXEL_REPRESENTATION => image.pixel_representation = number(tag, value),
            Tag::LOSSY_IMAGE_COMPRESSION => image.lossy_compression = Some(text(value)),
            Tag::LOSSY_IMAGE_COMPRESSION_RATIO => image.compression_ratio = Some(text(value)),
            Tag::LOSSY_IMAGE_COMPRESSION_METHOD => image.compression_method = Some(text(value)),
            Tag::ICC_PROFILE => image.icc_profile = decode_blob(tag, value),
            Tag::IMAGE_DATA => image.image_data = decode_blob(tag, value),
            Tag::IMAGE_TYPE => image.kind = ImageKind::from_value(&text(value)),
            Tag::BLOCK_HEADER_TABLE => {
                image.codeblock_table = Some(CodeblockTable::decode(value)?);
            }
            Tag::DIMENSION_RANGE => {
                let Some(range) = DimensionRange::parse(&text(value)) else {
                    warn!("header: malformed dimension range '{}'", text(value));
                    return Ok(());
                };
                match mode {
                    HeaderMode::GeneralHeaders => image.dimension_ranges.push(range),
                    HeaderMode::BlockHeaderTemplates => match image.block_templates.last_mut() {
                        Some(template) => template.dimension_ranges.push(range),
                        None => image.block_templates.push(BlockTemplate {
                            dimension_ranges: vec![range],
                        }),
                    },
                    HeaderMode::None => debug!("header: dimension range outside a header block"),
                }
            }
            Tag::DIMENSION_SCALE_FACTOR => {
                if mode == HeaderMode::GeneralHeaders {
                    if let Some(factor) = number::<f64>(tag, value) {
                        image.dimension_scale_factors.push(factor);
                    }
                }
            }
            _ => debug!("header: unhandled image attribute {}", tag),
        }
        Ok(())
    }
}

impl HeaderVisitor for MetadataBuilder {
    fn begin_object(&mut self, _depth: usize, object_type: &str) -> Result<(), HeaderError> {
        match object_type {
            "DPScannedImage" => {
                self.header.images.push(ImageHeader::default());
                self.current_image = Some(self.header.images.len() - 1);
            }
            "UFSImageBlockHeaderTemplate" if self.mode == HeaderMode::BlockHeaderTemplates => {
                self.current_image().block_templates.push(BlockTemplate::default());
            }
            _ => {}
        }
        Ok(())
    }

    fn end_object(&mut self, _depth: usize) {}

    fn begin_array(&mut self, _depth: usize, tag: Tag) {
        match tag {
            Tag::GENERAL_HEADERS => self.mode = HeaderMode::GeneralHeaders,
            Tag::BLOCK_HEADER_TEMPLATES => self.mode = HeaderMode::BlockHeaderTemplates,
            _ => {}
        }
    }

    fn end_array(&mut self, _depth: usize, tag: Tag) {
        if tag == Tag::GENERAL_HEADERS || tag == Tag::BLOCK_HEADER_TEMPLATES {
            self.mode = HeaderMode::None;
        }
    }

    fn leaf(
        &mut self,
        depth: usize,
        tag: Tag,
        _name: &str,
        value: &[u8],
    ) -> Result<(), HeaderError> {
        if depth == IMPORT_LEVEL_DEPTH {
            self.import_leaf(tag, value);
            Ok(())
        } else {
            self.image_leaf(tag, value)
        }
    }
}
