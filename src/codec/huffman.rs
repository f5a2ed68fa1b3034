//! Canonical Huffman codes stored as a tree walk.
//!
//! A codeblock serializes its Huffman tree in pre-order: a `0` bit descends
//! to the left child of an internal node, a `1` bit marks a leaf and is
//! followed by its 8-bit symbol. After each leaf the walk climbs to the
//! deepest ancestor whose right branch is still unvisited. Codes are stored
//! in stream order (bit 0 is the first branch taken), so a code matches the
//! low bits of a peeked LSB-first blob directly.
//!
//! A tree whose root is a leaf is degenerate: its single symbol is coded as
//! one bit.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::bitstream::{low_mask, BitReader, BitWriter};
use crate::error::DecodeError;

/// Codes up to this length resolve through the direct lookup table.
pub const FAST_BITS: u32 = 12;

/// Longest code accepted.
pub const MAX_CODE_BITS: u32 = 32;

const FAST_EMPTY: u16 = u16::MAX;
const ALPHABET: usize = 256;

// =============================================================================
// Decoding
// =============================================================================

/// Decoding table built from a serialized tree.
pub struct HuffmanTable {
    /// Direct lookup: `symbol | size << 8`, or `FAST_EMPTY`
    fast: Vec<u16>,
    codes: [u32; ALPHABET],
    sizes: [u8; ALPHABET],
    present: [bool; ALPHABET],
    /// Codes longer than `FAST_BITS`: (code, size, symbol)
    long_codes: Vec<(u32, u8, u8)>,
    /// The root is a leaf
    degenerate: Option<u8>,
}

impl HuffmanTable {
    /// Read a serialized tree.
    ///
    /// The walk is bounded by the alphabet size: a tree with more than 256
    /// leaves is rejected.
    pub fn read(reader: &mut BitReader<'_>) -> Result<Self, DecodeError> {
        let mut table = Self {
            fast: vec![FAST_EMPTY; 1 << FAST_BITS],
            codes: [0; ALPHABET],
            sizes: [0; ALPHABET],
            present: [false; ALPHABET],
            long_codes: Vec::new(),
            degenerate: None,
        };

        let mut code: u32 = 0;
        let mut size: u32 = 0;

        for _ in 0..ALPHABET {
            while !reader.read_bit()? {
                size += 1;
                if size > MAX_CODE_BITS {
                    return Err(DecodeError::InvalidHuffmanTree(format!(
                        "code longer than {} bits",
                        MAX_CODE_BITS
                    )));
                }
            }
            let symbol = reader.read_bits_checked(8)? as u8;
            if table.present[symbol as usize] {
                return Err(DecodeError::InvalidHuffmanTree(format!(
                    "symbol {} appears twice",
                    symbol
                )));
            }

            if size == 0 {
                table.present[symbol as usize] = true;
                table.degenerate = Some(symbol);
                return Ok(table);
            }
            table.insert(symbol, code, size);

            // Climb to the next unvisited right branch
            let mut high = 1u32 << (size - 1);
            while code & high != 0 {
                size -= 1;
                if size == 0 {
                    return Ok(table);
                }
                code &= high - 1;
                high >>= 1;
            }
            code |= high;
        }

        Err(DecodeError::InvalidHuffmanTree(
            "tree has more leaves than symbols".to_string(),
        ))
    }

    fn insert(&mut self, symbol: u8, code: u32, size: u32) {
        self.codes[symbol as usize] = code;
        self.sizes[symbol as usize] = size as u8;
        self.present[symbol as usize] = true;

        if size <= FAST_BITS {
            let entry = u16::from(symbol) | ((size as u16) << 8);
            for i in 0..(1u32 << (FAST_BITS - size)) {
                self.fast[((i << size) | code) as usize] = entry;
            }
        } else {
            self.long_codes.push((code, size as u8, symbol));
        }
    }

    /// Code and length for `symbol`, if it is in the tree.
    pub fn code(&self, symbol: u8) -> Option<(u32, u32)> {
        if self.degenerate == Some(symbol) {
            return Some((0, 1));
        }
        self.present[symbol as usize]
            .then(|| (self.codes[symbol as usize], u32::from(self.sizes[symbol as usize])))
    }

    /// Decode one symbol.
    #[inline]
    pub fn decode_symbol(&self, reader: &mut BitReader<'_>) -> Result<u8, DecodeError> {
        if let Some(symbol) = self.degenerate {
            reader.consume(1);
            return Ok(symbol);
        }

        let blob = reader.peek_u64();
        let entry = self.fast[(blob & low_mask(FAST_BITS)) as usize];
        if entry != FAST_EMPTY {
            reader.consume(u32::from(entry >> 8));
            return Ok(entry as u8);
        }

        for &(code, size, symbol) in &self.long_codes {
            if blob & low_mask(u32::from(size)) == u64::from(code) {
                reader.consume(u32::from(size));
                return Ok(symbol);
            }
        }
        Err(DecodeError::InvalidHuffmanTree(
            "bit pattern matches no code".to_string(),
        ))
    }
}

// =============================================================================
// Encoding
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Node {
    Leaf(u8),
    Branch(usize, usize),
}

/// Huffman code built from symbol frequencies.
pub struct HuffmanEncoder {
    nodes: Vec<Node>,
    root: usize,
    codes: [u32; ALPHABET],
    sizes: [u8; ALPHABET],
}

impl HuffmanEncoder {
    /// Build a code for the symbols with non-zero frequency.
    ///
    /// With no or one used symbol the tree is a single leaf.
    pub fn from_frequencies(frequencies: &[u64; ALPHABET]) -> Self {
        let mut weights = *frequencies;
        loop {
            let encoder = Self::build(&weights);
            if encoder.sizes.iter().all(|&s| u32::from(s) <= MAX_CODE_BITS) {
                return encoder;
            }
            // Flatten the distribution until the tree fits
            for w in weights.iter_mut().filter(|w| **w > 0) {
                *w = (*w >> 1) | 1;
            }
        }
    }

    fn build(weights: &[u64; ALPHABET]) -> Self {
        let mut nodes = Vec::with_capacity(2 * ALPHABET);
        let mut heap = BinaryHeap::new();
        for (symbol, &weight) in weights.iter().enumerate() {
            if weight > 0 {
                heap.push(Reverse((weight, nodes.len())));
                nodes.push(Node::Leaf(symbol as u8));
            }
        }
        if nodes.is_empty() {
            nodes.push(Node::Leaf(0));
        }

        while heap.len() > 1 {
            let (Some(Reverse((wa, a))), Some(Reverse((wb, b)))) = (heap.pop(), heap.pop()) else {
                break;
            };
            heap.push(Reverse((wa + wb, nodes.len())));
            nodes.push(Node::Branch(a, b));
        }
        let root = nodes.len() - 1;

        let mut encoder = Self {
            nodes,
            root,
            codes: [0; ALPHABET],
            sizes: [0; ALPHABET],
        };
        encoder.assign(root, 0, 0);
        encoder
    }

    fn assign(&mut self, node: usize, code: u32, depth: u32) {
        match self.nodes[node] {
            Node::Leaf(symbol) => {
                self.codes[symbol as usize] = code;
                self.sizes[symbol as usize] = depth.min(u32::from(u8::MAX)) as u8;
            }
            Node::Branch(left, right) => {
                if depth >= MAX_CODE_BITS {
                    // Deeper than any accepted code; marks the tree as too deep
                    self.mark_too_deep(left);
                    self.mark_too_deep(right);
                    return;
                }
                self.assign(left, code, depth + 1);
                self.assign(right, code | (1 << depth), depth + 1);
            }
        }
    }

    fn mark_too_deep(&mut self, node: usize) {
        match self.nodes[node] {
            Node::Leaf(symbol) => self.sizes[symbol as usize] = u8::MAX,
            Node::Branch(left, right) => {
                self.mark_too_deep(left);
                self.mark_too_deep(right);
            }
        }
    }

    /// Whether the tree is a single leaf.
    pub fn is_degenerate(&self) -> bool {
        matches!(self.nodes[self.root], Node::Leaf(_))
    }

    /// Serialize the tree.
    pub fn write_tree(&self, writer: &mut BitWriter) {
        self.write_node(self.root, writer);
    }

    fn write_node(&self, node: usize, writer: &mut BitWriter) {
        match self.nodes[node] {
            Node::Leaf(symbol) => {
                writer.write_bits(1, 1);
                writer.write_bits(u32::from(symbol), 8);
            }
            Node::Branch(left, right) => {
                writer.write_bits(0, 1);
                self.write_node(left, writer);
                self.write_node(right, writer);
            }
        }
    }

    /// Append the code for `symbol`.
    pub fn write_symbol(&self, symbol: u8, writer: &mut BitWriter) {
        if self.is_degenerate() {
            writer.write_bits(0, 1);
        } else {
            writer.write_bits(self.codes[symbol as usize], u32::from(self.sizes[symbol as usize]));
        }
    }
}
