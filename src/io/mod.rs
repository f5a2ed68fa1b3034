//! I/O layer: positional reads and chunk caching.

mod chunk_cache;
mod file_reader;
mod range_reader;

pub use chunk_cache::{ChunkCache, DEFAULT_CHUNK_CACHE_CAPACITY};
pub use file_reader::LocalFileReader;
pub use range_reader::{read_i32_le, read_u16_le, read_u32_le, read_u64_le, RangeReader};
