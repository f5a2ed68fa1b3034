use thiserror::Error;

/// I/O errors that can occur when reading slide bytes
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Read failed at the operating system level
    #[error("Read error: {0}")]
    Read(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File not found
    #[error("File not found: {0}")]
    NotFound(String),
}

/// Errors from the RFC1341 base64 decoder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Base64Error {
    /// No base64 symbols in the input
    #[error("Empty base64 input")]
    Empty,

    /// Symbol count is not a multiple of four
    #[error("Invalid base64 length: {0} symbols is not a multiple of 4")]
    InvalidLength(usize),

    /// More than two padding characters in the final quantum
    #[error("Invalid base64 padding: {0} padding characters")]
    InvalidPadding(usize),
}

/// Errors decoding the binary block header table embedded in the header
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeblockTableError {
    /// The base64 text could not be decoded
    #[error("Base64 error: {0}")]
    Base64(#[from] Base64Error),

    /// Decoded table is too short to hold a length and one record header
    #[error("Block header table is too short ({0} bytes)")]
    TooShort(usize),

    /// The first record does not announce a known layout
    #[error("Unknown codeblock record size: {0} (expected 40 or 72)")]
    UnknownRecordSize(u32),

    /// Declared length is not a whole number of records
    #[error("Block header table length {length} is not a multiple of record size {record_size}")]
    SizeNotMultiple { length: u32, record_size: u32 },
}

/// Fatal errors while parsing the XML-like header tree
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Closing tag with no open element
    #[error("Element end without matching start")]
    UnmatchedEnd,

    /// Closing tag name differs from the open element
    #[error("Mismatched element end: expected </{expected}>, found </{found}>")]
    MismatchedEnd { expected: String, found: String },

    /// Nesting exceeds the node stack
    #[error("Header tree nesting exceeds maximum depth of {0}")]
    DepthExceeded(usize),

    /// Input ended inside an element
    #[error("Unexpected end of header (still {0} element(s) open)")]
    UnexpectedEof(usize),

    /// Byte not allowed in the current tokenizer state
    #[error("Syntax error: unexpected byte 0x{byte:02X} while {state}")]
    Syntax { byte: u8, state: &'static str },

    /// The block header table blob is malformed
    #[error("Block header table: {0}")]
    BlockHeaderTable(#[from] CodeblockTableError),
}

/// Errors confined to a single codeblock (the affected tile becomes unavailable)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Codeblock ended before its header or tree was complete
    #[error("Codeblock data truncated")]
    Truncated,

    /// The serialized Huffman tree is malformed
    #[error("Invalid Huffman tree: {0}")]
    InvalidHuffmanTree(String),

    /// Decompressed length differs from the declared serialized length
    #[error("Decompressed size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Codeblock header fields are inconsistent
    #[error("Invalid codeblock header: {0}")]
    InvalidHeader(String),

    /// A coefficient pool has no free blocks left
    #[error("Coefficient pool '{0}' exhausted")]
    PoolExhausted(&'static str),
}

/// Errors that abort opening a file
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Header tree parsing error
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// File is not an iSyntax container
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// The header never terminated with the EOT marker
    #[error("End of header marker (0x04) not found before end of file")]
    MissingEotMarker,

    /// No image in the header is tagged as WSI
    #[error("No WSI image found in header")]
    NoWsiImage,

    /// The WSI image carries no block header table
    #[error("WSI image has no block header table")]
    MissingBlockHeaderTable,

    /// Seektable absent or inconsistent with the block header table
    #[error("Seektable error: {0}")]
    Seektable(String),

    /// Dimension ranges or codeblock coordinates are unusable
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// Errors for tile requests
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Error opening or reading the slide
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// I/O error while reading a chunk
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Requested level does not exist
    #[error("Invalid level {level}: slide has {max_levels} levels")]
    InvalidLevel { level: u32, max_levels: u32 },

    /// Tile coordinates are outside the level grid
    #[error("Tile ({x}, {y}) out of bounds for level {level} (max: {max_x}, {max_y})")]
    TileOutOfBounds {
        level: u32,
        x: u32,
        y: u32,
        max_x: u32,
        max_y: u32,
    },

    /// Pixel export failed
    #[error("Encode error: {0}")]
    Encode(String),
}
