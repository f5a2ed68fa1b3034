//! Codeblock codecs.
//!
//! Entropy decoding turns a codeblock into signed wavelet coefficients; the
//! inverse wavelet transform and color conversion turn a tile's coefficients
//! into BGRA pixels. The forward transforms and encoders are used to author
//! files.

pub mod bitstream;
pub mod color;
pub mod huffman;
pub mod hulsken;
pub mod wavelet;

pub use bitstream::{BitReader, BitWriter};
pub use color::{bgra_to_rgba, rgb_to_ycocg, ycocg_to_bgra, ycocg_to_rgb};
pub use huffman::{HuffmanEncoder, HuffmanTable};
pub use hulsken::{decode_codeblock, decompress, encode_codeblock, BlockHeader, DEFAULT_COUNTER_BITS};
pub use wavelet::{
    deinterleave, extract_quadrant, forward_2d, inverse_2d, reconstruct, Neighborhood,
    TileCoefficients,
};
