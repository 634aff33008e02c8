//! # Tribranch-Heads
//!
//! Second-stage ROI heads of an instance-segmentation detector with three
//! mask branches.
//!
//! ## Architecture Overview
//!
//! Each forward pass runs:
//!
//! 1. **Proposal Labeling**: append ground truth, match by IoU, resolve
//!    classes, sample a fixed foreground/background budget
//! 2. **Box Branch**: Fast R-CNN classification and box regression
//! 3. **Whole-Mask Branch**: the complete object mask, optionally run twice
//!    (guidance pass and refinement pass)
//! 4. **Overlapping / Non-Overlapping Branches**: the part of each object
//!    covered by a neighbour and the part nobody else covers
//! 5. **Consistency**: whole mask vs overlapping XOR non-overlapping
//!
//! Which edges between the branches are active is decided once from the
//! configuration flags ([`Wiring`]) and followed by [`TripleBranchRoiHeads`].

pub mod box_head;
pub mod config;
pub mod consistency;
pub mod heads;
pub mod labeler;
pub mod losses;
pub mod matcher;
pub mod roi;
pub mod router;
pub mod sampler;
pub mod wiring;

pub use box_head::*;
pub use config::*;
pub use consistency::*;
pub use heads::*;
pub use labeler::*;
pub use losses::*;
pub use matcher::*;
pub use roi::*;
pub use router::*;
pub use sampler::*;
pub use wiring::*;
