//! ROI heads configuration.

use serde::{Deserialize, Serialize};
use tribranch_core::{Error, Result};

/// Complete ROI heads configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiHeadsConfig {
    /// Proposal labeling and test-time settings
    pub roi_heads: RoiHeadsSection,

    /// Box branch
    pub box_head: BoxHeadConfig,

    /// Shared settings of the three mask branches
    pub mask_head: MaskHeadConfig,

    /// Branch wiring flags
    pub branches: BranchFlags,

    /// Auxiliary loss weights
    pub loss_weights: LossWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiHeadsSection {
    /// Number of foreground classes; `num_classes` itself is background
    pub num_classes: usize,

    /// Sampled proposals per image
    pub batch_size_per_image: usize,

    /// Upper bound on the foreground share of each sample
    pub positive_fraction: f32,

    /// Matcher IoU thresholds (ascending)
    pub iou_thresholds: Vec<f32>,

    /// Matcher labels, one per threshold interval (-1 ignore, 0 bg, 1 fg)
    pub iou_labels: Vec<i8>,

    /// Append ground-truth boxes to the proposals before matching
    pub proposal_append_gt: bool,

    /// Backbone feature maps consumed by the poolers
    pub in_features: Vec<String>,

    /// Minimum class score kept at test time
    pub score_thresh_test: f32,

    /// Per-class NMS IoU threshold at test time
    pub nms_thresh_test: f32,

    /// Maximum detections per image at test time
    pub detections_per_image: usize,

    /// Class assigned to proposals matched to the filtered-out class
    pub filter_remap_class: i64,
}

impl Default for RoiHeadsSection {
    fn default() -> Self {
        Self {
            num_classes: 80,
            batch_size_per_image: 512,
            positive_fraction: 0.25,
            iou_thresholds: vec![0.5],
            iou_labels: vec![0, 1],
            proposal_append_gt: true,
            in_features: vec!["p2".into(), "p3".into(), "p4".into(), "p5".into()],
            score_thresh_test: 0.05,
            nms_thresh_test: 0.5,
            detections_per_image: 100,
            filter_remap_class: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxHeadConfig {
    /// Pooled region side length
    pub pooler_resolution: usize,

    /// ROI Align samples per bin (0 = adaptive)
    pub pooler_sampling_ratio: usize,

    /// Number of fully connected layers
    pub num_fc: usize,

    /// Width of each fully connected layer
    pub fc_dim: usize,

    /// Predict one box per region instead of one per class
    pub cls_agnostic_bbox_reg: bool,

    /// Smooth-L1 transition point (0 = plain L1)
    pub smooth_l1_beta: f32,

    /// Box delta weights (wx, wy, ww, wh)
    pub bbox_reg_weights: [f32; 4],
}

impl Default for BoxHeadConfig {
    fn default() -> Self {
        Self {
            pooler_resolution: 7,
            pooler_sampling_ratio: 0,
            num_fc: 2,
            fc_dim: 1024,
            cls_agnostic_bbox_reg: false,
            smooth_l1_beta: 0.0,
            bbox_reg_weights: [10.0, 10.0, 5.0, 5.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskHeadConfig {
    /// Pooled region side length; predicted masks are twice this
    pub pooler_resolution: usize,

    /// ROI Align samples per bin (0 = adaptive)
    pub pooler_sampling_ratio: usize,

    /// 3x3 conv layers per branch
    pub num_conv: usize,

    /// Channels of every branch conv layer
    pub conv_dim: usize,

    /// Predict a single mask per region instead of one per class
    pub cls_agnostic_mask: bool,
}

impl Default for MaskHeadConfig {
    fn default() -> Self {
        Self {
            pooler_resolution: 14,
            pooler_sampling_ratio: 0,
            num_conv: 4,
            conv_dim: 256,
            cls_agnostic_mask: false,
        }
    }
}

/// Flags selecting which edges of the branch graph are active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchFlags {
    /// Label with class 0 filtered out
    pub for_nuclei: bool,
    /// Semi-supervised training run; recorded only, since a batch whose
    /// first image has no targets is always treated as unlabeled
    pub semi_supervised: bool,
    /// Fuse a first whole-mask pass into the partition branches
    pub branch_guidance: bool,
    /// Gate the partition branches with the first whole-mask pass
    pub heads_attention: bool,
    /// Final whole-mask branch sees only the pooled features
    pub pure_branch: bool,
    /// Run the final whole-mask branch
    pub refinement: bool,
    /// Label with class 1 filtered out
    pub rpn_attention: bool,
    /// Enable the partition consistency loss
    pub consistency_loss: bool,
    /// Partition consistency mode ("MX")
    pub consistency_mode: String,
}

impl Default for BranchFlags {
    fn default() -> Self {
        Self {
            for_nuclei: false,
            semi_supervised: false,
            branch_guidance: false,
            heads_attention: false,
            pure_branch: false,
            refinement: true,
            rpn_attention: false,
            consistency_loss: false,
            consistency_mode: "MX".to_string(),
        }
    }
}

/// Weights of the auxiliary loss terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    /// First whole-mask pass (guidance or attention)
    pub whole_guidance: f64,
    /// Unlabeled guidance/refinement consistency
    pub guidance_consistency: f64,
    /// Whole vs overlap-xor-non-overlap consistency
    pub triple_branch_consistency: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            whole_guidance: 0.75,
            guidance_consistency: 0.1,
            triple_branch_consistency: 0.00125,
        }
    }
}

/// Channel count and stride of one backbone feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub channels: usize,
    pub stride: usize,
}

impl RoiHeadsConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TRIBRANCH").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Load from environment variables
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("TRIBRANCH").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Check the numeric settings; flag combinations are checked by
    /// [`crate::wiring::Wiring::from_flags`].
    pub fn validate(&self) -> Result<()> {
        let rh = &self.roi_heads;

        if rh.num_classes == 0 {
            return Err(Error::Config("num_classes must be positive".into()));
        }
        if rh.batch_size_per_image == 0 {
            return Err(Error::Config("batch_size_per_image must be positive".into()));
        }
        if !(0.0..=1.0).contains(&rh.positive_fraction) {
            return Err(Error::Config(format!(
                "positive_fraction must be in [0, 1], got {}",
                rh.positive_fraction
            )));
        }
        if rh.iou_labels.len() != rh.iou_thresholds.len() + 1 {
            return Err(Error::Config(format!(
                "expected {} iou_labels for {} thresholds, got {}",
                rh.iou_thresholds.len() + 1,
                rh.iou_thresholds.len(),
                rh.iou_labels.len()
            )));
        }
        if rh.in_features.is_empty() {
            return Err(Error::Config("in_features must name at least one map".into()));
        }
        if rh.filter_remap_class < 0 || rh.filter_remap_class > rh.num_classes as i64 {
            return Err(Error::Config(format!(
                "filter_remap_class {} outside [0, {}]",
                rh.filter_remap_class, rh.num_classes
            )));
        }
        if self.box_head.pooler_resolution == 0 || self.mask_head.pooler_resolution == 0 {
            return Err(Error::Config("pooler resolutions must be positive".into()));
        }
        if self.mask_head.num_conv == 0 {
            return Err(Error::Config("mask branches need at least one conv layer".into()));
        }

        Ok(())
    }
}
