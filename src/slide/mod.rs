//! Slide handle layer.
//!
//! # Architecture
//!
//! The slide sits between the container parser and the tile runtime:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        CLI / renderer                   │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │            IsyntaxSlide                 │
//! │  (metadata, levels, associated images)  │
//! └──────────┬─────────────────┬────────────┘
//!            │                 │
//!            ▼                 ▼
//! ┌───────────────────┐ ┌───────────────────┐
//! │ open_container    │ │ TileLoader /      │
//! │ (format::isyntax) │ │ TileStreamer      │
//! └───────────────────┘ └───────────────────┘
//! ```

mod reader;

pub use reader::{IsyntaxSlide, LevelInfo};
