//! # Tribranch-Core
//!
//! Core types and utilities for the triple-branch ROI heads: boxes and
//! geometry, per-image proposal/target/prediction containers, binary masks
//! and the shared error type.

pub mod error;
pub mod geometry;
pub mod masks;
pub mod types;

pub use error::{Error, Result};
pub use geometry::*;
pub use masks::*;
pub use types::*;
