//! Mask branches of the triple-branch head.
//!
//! Three branches share one architecture and differ only in what they
//! predict ([`MaskBranchKind`]) and where their inputs come from:
//! 1. Whole: the complete object mask, optionally fused with the partition
//!    branches' inner features through its guiding layer
//! 2. Overlapping: the part of the object covered by another object
//! 3. Non-overlapping: the part nobody else covers

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, VarBuilder};
use tribranch_core::{Error, LabeledProposals, MaskBranchKind, Result};

use crate::config::MaskHeadConfig;
use crate::losses::{mask_rcnn_inference, mask_rcnn_loss};

/// Everything a branch produces for one batch of regions
#[derive(Debug, Clone)]
pub struct MaskBranchFeatures {
    /// `[R, K, 2S, 2S]` mask logits
    pub logits: Tensor,
    /// `[R, conv_dim, S, S]` output of the conv stack
    pub inner: Tensor,
}

/// What the branch output is evaluated against
#[derive(Debug, Clone, Copy)]
pub enum BranchMode<'a> {
    /// Foreground proposals carrying the `gt_*` mask fields
    Train(&'a [LabeledProposals]),
    /// Predicted class of every region
    Inference(&'a [i64]),
}

/// Result of a branch once the mode is applied
#[derive(Debug, Clone)]
pub enum BranchOutcome {
    /// Training: scalar mask loss
    Loss(Tensor),
    /// Inference: per-region probabilities of the predicted class
    Masks(Tensor),
}

impl BranchOutcome {
    pub fn into_tensor(self) -> Tensor {
        match self {
            BranchOutcome::Loss(t) | BranchOutcome::Masks(t) => t,
        }
    }
}

impl MaskBranchFeatures {
    /// Loss against the branch's ground-truth field, or mask probabilities
    pub fn outcome(&self, kind: MaskBranchKind, mode: BranchMode<'_>) -> Result<BranchOutcome> {
        match mode {
            BranchMode::Train(foreground) => Ok(BranchOutcome::Loss(mask_rcnn_loss(
                &self.logits,
                foreground,
                &kind.gt_field(),
            )?)),
            BranchMode::Inference(classes) => {
                Ok(BranchOutcome::Masks(mask_rcnn_inference(&self.logits, classes)?))
            }
        }
    }
}

/// A mask-predicting branch
pub trait MaskBranch {
    fn kind(&self) -> MaskBranchKind;

    /// Run the branch on pooled features.
    ///
    /// With `guiding_layers` the input is first reduced by the branch's
    /// guiding conv; branches without one reject the call.
    fn forward(&self, features: &Tensor, guiding_layers: bool) -> Result<MaskBranchFeatures>;
}

/// Construction parameters of one branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskBranchSpec {
    /// Channels entering the conv stack (after the guiding conv, if any)
    pub in_channels: usize,
    /// Channels of the fused input the guiding conv reduces
    pub guide_channels: Option<usize>,
    /// Output mask channels (classes, or 1 when class-agnostic)
    pub num_masks: usize,
}

fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    Ok(conv2d(
        in_channels,
        out_channels,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb,
    )?)
}

/// Conv stack, 2x transposed-conv upsampling and a 1x1 predictor
pub struct MaskBranchHead {
    kind: MaskBranchKind,
    guide: Option<Conv2d>,
    convs: Vec<Conv2d>,
    deconv: ConvTranspose2d,
    predictor: Conv2d,
    spec: MaskBranchSpec,
}

impl MaskBranchHead {
    pub fn new(kind: MaskBranchKind, spec: MaskBranchSpec, config: &MaskHeadConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.conv_dim;

        if spec.guide_channels.is_some() && spec.in_channels != dim {
            return Err(Error::Config(format!(
                "guided {kind:?} branch needs {dim} stack input channels, got {}",
                spec.in_channels
            )));
        }

        let guide = spec
            .guide_channels
            .map(|channels| conv3x3(channels, dim, vb.pp("guide")))
            .transpose()?;

        let mut convs = Vec::with_capacity(config.num_conv);
        let mut channels = spec.in_channels;
        for i in 0..config.num_conv {
            convs.push(conv3x3(channels, dim, vb.pp(format!("mask_fcn{}", i + 1)))?);
            channels = dim;
        }

        let deconv = conv_transpose2d(
            dim,
            dim,
            2,
            ConvTranspose2dConfig {
                stride: 2,
                ..Default::default()
            },
            vb.pp("deconv"),
        )?;

        let predictor = conv2d(dim, spec.num_masks, 1, Conv2dConfig::default(), vb.pp("predictor"))?;

        Ok(Self {
            kind,
            guide,
            convs,
            deconv,
            predictor,
            spec,
        })
    }

    pub fn spec(&self) -> &MaskBranchSpec {
        &self.spec
    }

    pub fn has_guiding_layers(&self) -> bool {
        self.guide.is_some()
    }
}

impl MaskBranch for MaskBranchHead {
    fn kind(&self) -> MaskBranchKind {
        self.kind
    }

    fn forward(&self, features: &Tensor, guiding_layers: bool) -> Result<MaskBranchFeatures> {
        let mut x = if guiding_layers {
            let guide = self.guide.as_ref().ok_or_else(|| {
                Error::InvalidInput(format!("{:?} branch has no guiding layers", self.kind))
            })?;
            guide.forward(features)?.relu()?
        } else {
            features.clone()
        };

        for conv in &self.convs {
            x = conv.forward(&x)?.relu()?;
        }
        let inner = x;

        let x = self.deconv.forward(&inner)?.relu()?;
        let logits = self.predictor.forward(&x)?;

        Ok(MaskBranchFeatures { logits, inner })
    }
}

/// Two independent conv stacks turning `[F0, G]` into the inputs of the
/// overlapping and non-overlapping branches
pub struct GuidanceFusion {
    overlapping: Vec<Conv2d>,
    non_overlapping: Vec<Conv2d>,
}

impl GuidanceFusion {
    /// Stacks of three 3x3 conv+ReLU layers, `fused_channels` wide, the last
    /// reducing to `out_channels`
    pub fn new(fused_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let stack = |prefix: &str| -> Result<Vec<Conv2d>> {
            Ok(vec![
                conv3x3(fused_channels, fused_channels, vb.pp(format!("{prefix}_layer0")))?,
                conv3x3(fused_channels, fused_channels, vb.pp(format!("{prefix}_layer1")))?,
                conv3x3(fused_channels, out_channels, vb.pp(format!("{prefix}_layer2")))?,
            ])
        };

        Ok(Self {
            overlapping: stack("guidance_overlap")?,
            non_overlapping: stack("guidance_non_overlap")?,
        })
    }

    /// # Returns
    /// `(overlapping_input, non_overlapping_input)`
    pub fn forward(&self, fused: &Tensor) -> Result<(Tensor, Tensor)> {
        let run = |layers: &[Conv2d]| -> Result<Tensor> {
            let mut x = fused.clone();
            for layer in layers {
                x = layer.forward(&x)?.relu()?;
            }
            Ok(x)
        };

        Ok((run(&self.overlapping)?, run(&self.non_overlapping)?))
    }
}
