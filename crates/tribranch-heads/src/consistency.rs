//! Agreement terms between mask branches.

use candle_core::{DType, Tensor};
use candle_nn::ops::sigmoid;
use tribranch_core::Result;

use crate::losses::{binary_cross_entropy, ensure_same_shape};
use crate::wiring::ConsistencyMode;

/// Scores how well the partition branches agree with the whole-mask branch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsistencyEvaluator {
    mode: ConsistencyMode,
    weight: f64,
}

impl ConsistencyEvaluator {
    pub fn new(mode: ConsistencyMode, weight: f64) -> Self {
        Self { mode, weight }
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    /// Weighted consistency loss
    pub fn evaluate(&self, whole: &Tensor, overlapping: &Tensor, non_overlapping: &Tensor) -> Result<Tensor> {
        Ok((self.unweighted(whole, overlapping, non_overlapping)? * self.weight)?)
    }

    /// Consistency loss before weighting.
    ///
    /// A pixel is whole exactly when one of the two partition branches
    /// claims it, so the reference is the binarised whole mask and the
    /// comparison is the XOR of the binarised partitions.
    pub fn unweighted(&self, whole: &Tensor, overlapping: &Tensor, non_overlapping: &Tensor) -> Result<Tensor> {
        ensure_same_shape("overlapping vs whole logits", whole, overlapping)?;
        ensure_same_shape("non-overlapping vs whole logits", whole, non_overlapping)?;

        match self.mode {
            ConsistencyMode::MaskXor => {
                let target = binarize(whole)?.to_dtype(DType::F32)?;
                let input = binarize(non_overlapping)?
                    .ne(&binarize(overlapping)?)?
                    .to_dtype(DType::F32)?;
                binary_cross_entropy(&input, &target)
            }
        }
    }
}

/// `sigmoid(x) > 0.5` as a u8 mask
fn binarize(logits: &Tensor) -> Result<Tensor> {
    Ok(sigmoid(logits)?.gt(0.5)?)
}

/// Unsupervised agreement between the guidance pass and the final whole
/// pass: `BCE(sigmoid(sigmoid(guide)), sigmoid(sigmoid(whole)))`, weighted.
pub fn guidance_consistency(guide_logits: &Tensor, whole_logits: &Tensor, weight: f64) -> Result<Tensor> {
    let input = sigmoid(&sigmoid(guide_logits)?)?.to_dtype(DType::F32)?;
    let target = sigmoid(&sigmoid(whole_logits)?)?.to_dtype(DType::F32)?;

    Ok((binary_cross_entropy(&input, &target)? * weight)?)
}
