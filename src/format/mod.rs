//! Format parsing for iSyntax whole slide images.
//!
//! [`detect::ensure_isyntax`] rejects foreign files up front; everything
//! specific to the container lives in [`isyntax`].

pub mod detect;
pub mod isyntax;

pub use detect::{ensure_isyntax, is_isyntax_header};
