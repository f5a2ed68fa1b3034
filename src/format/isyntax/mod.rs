//! The iSyntax container format.
//!
//! Open path, leaves first:
//!
//! ```text
//! header text ──► HeaderParser ──► MetadataBuilder ──► IsyntaxHeader
//!                                        │
//!                                        ▼
//!                         CodeblockTable (base64 blob)
//!                                        │  partial records
//!                                        ▼
//!                         seektable after the EOT marker
//!                                        │
//!                                        ▼
//!                         CodeblockStore (levels, tiles, chunks)
//! ```

pub mod base64;
pub mod codeblock;
pub mod container;
pub mod header;
pub mod layout;
pub mod metadata;
pub mod seektable;
pub mod tags;

pub use codeblock::{Codeblock, CodeblockTable};
pub use container::{open_container, IsyntaxContainer};
pub use header::{HeaderParser, HeaderVisitor};
pub use layout::{Bounds, CodeblockStore, DataChunk, LevelLayout, TileInfo, TileRect};
pub use metadata::{ImageHeader, ImageKind, ImportMetadata, IsyntaxHeader, MetadataBuilder};
pub use tags::{Tag, TagHeader};
