//! Triple-branch ROI heads.
//!
//! One forward pass walks the stages of the compiled [`Wiring`]:
//!
//! 1. **Box**: Fast R-CNN losses (training) or detections (inference)
//! 2. **Whole pre-pass**: first whole-mask pass feeding attention or
//!    branch guidance
//! 3. **Overlapping / non-overlapping**: the partition branches
//! 4. **Whole final**: refinement on the pooled features, optionally fused
//!    with both partition branches' inner features
//! 5. **Consistency**: agreement between the whole mask and the partitions
//!
//! Training runs the mask stages on the sampled foreground proposals,
//! inference on the detected boxes. A training batch whose first image has
//! no targets is *unlabeled*: no supervised loss is produced and, under
//! branch guidance, the guidance pass is pulled towards the final whole pass
//! instead.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::Rng;
use tribranch_core::{
    BoundingBox, Error, GtField, GtFields, Instances, LabeledProposals, MaskBranchKind, Proposals, Result,
    Targets,
};

use crate::box_head::{BoxInferenceParams, FastRcnnBoxHead};
use crate::config::{RoiHeadsConfig, ShapeSpec};
use crate::consistency::{guidance_consistency, ConsistencyEvaluator};
use crate::heads::{BranchMode, GuidanceFusion, MaskBranch, MaskBranchFeatures, MaskBranchHead, MaskBranchSpec};
use crate::labeler::{select_foreground_proposals, ProposalLabeler, SamplingStats};
use crate::losses::{mask_rcnn_loss, zero_loss};
use crate::roi::{MultiLevelRoiAlign, RoiPooler};
use crate::wiring::{GuidanceMode, RefinementMode, Stage, Wiring};

pub const LOSS_CLS: &str = "loss_cls";
pub const LOSS_BOX_REG: &str = "loss_box_reg";
pub const LOSS_WHOLE_MASK_GUIDANCE: &str = "loss_whole_mask_guidance";
pub const BRANCH_GUIDANCE_CONSISTENCY_LOSS: &str = "branch_guidance_consistency_loss";
pub const LOSS_TRIPLE_BRANCH_CONSISTENCY: &str = "loss_triple_branch_consistency";

/// Result of a training pass
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// Sampled proposals with their labels (all proposals when unlabeled)
    pub proposals: Vec<LabeledProposals>,
    /// Loss name to scalar
    pub losses: BTreeMap<String, Tensor>,
    /// Final whole-mask logits `[R, K, M, M]` over `foreground`
    pub whole_mask_logits: Tensor,
    /// Proposals the mask branches ran on
    pub foreground: Vec<LabeledProposals>,
    pub stats: SamplingStats,
}

/// Result of an inference pass
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// Detections with one mask per active branch
    pub instances: Vec<Instances>,
    /// Final whole-mask logits `[R, K, M, M]` over all detections
    pub whole_mask_logits: Tensor,
}

/// Branch outputs of one mask pass
struct MaskPass {
    whole_pre: Option<MaskBranchFeatures>,
    overlapping: MaskBranchFeatures,
    non_overlapping: MaskBranchFeatures,
    whole_final: Option<MaskBranchFeatures>,
}

impl MaskPass {
    /// Final whole-mask output: the refinement pass, else the guidance pass
    fn whole(&self) -> Result<&MaskBranchFeatures> {
        self.whole_final
            .as_ref()
            .or(self.whole_pre.as_ref())
            .ok_or_else(|| Error::Config("wiring produced no whole-mask output".into()))
    }
}

/// ROI heads with a box branch and whole, overlapping and non-overlapping
/// mask branches
pub struct TripleBranchRoiHeads {
    config: RoiHeadsConfig,
    wiring: Wiring,
    labeler: ProposalLabeler,
    box_pooler: MultiLevelRoiAlign,
    mask_pooler: MultiLevelRoiAlign,
    box_head: FastRcnnBoxHead,
    whole: MaskBranchHead,
    overlapping: MaskBranchHead,
    non_overlapping: MaskBranchHead,
    guidance: Option<GuidanceFusion>,
    consistency: Option<ConsistencyEvaluator>,
}

impl TripleBranchRoiHeads {
    /// Build the heads for a backbone whose maps are described by `input_shape`.
    ///
    /// Fails with [`Error::Config`] for illegal flag combinations, unequal
    /// channel counts across `in_features`, or pooled features that cannot
    /// feed a branch reused with and without its guiding layer.
    pub fn new(config: RoiHeadsConfig, input_shape: &BTreeMap<String, ShapeSpec>, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let wiring = Wiring::from_flags(&config.branches)?;
        let rh = &config.roi_heads;

        let mut shapes = Vec::with_capacity(rh.in_features.len());
        for name in &rh.in_features {
            let shape = input_shape
                .get(name)
                .ok_or_else(|| Error::MissingFeature(name.clone()))?;
            if shape.stride == 0 {
                return Err(Error::Config(format!("feature `{name}` has stride 0")));
            }
            shapes.push(*shape);
        }

        let channels = shapes[0].channels;
        if let Some(other) = shapes.iter().find(|s| s.channels != channels) {
            return Err(Error::Config(format!(
                "in_features must share a channel count, got {channels} and {}",
                other.channels
            )));
        }
        let scales: Vec<f32> = shapes.iter().map(|s| 1.0 / s.stride as f32).collect();

        let bh = &config.box_head;
        let mh = &config.mask_head;
        let dim = mh.conv_dim;

        if wiring.guidance == GuidanceMode::Attention && channels != dim {
            return Err(Error::Config(format!(
                "heads_attention gates {channels}-channel features with {dim}-channel attention"
            )));
        }
        if wiring.whole_is_guided() && wiring.whole_is_unguided() && channels != dim {
            return Err(Error::Config(format!(
                "whole branch runs with and without guiding layers, so in_features channels ({channels}) must equal conv_dim ({dim})"
            )));
        }

        let box_pooler = MultiLevelRoiAlign::new(bh.pooler_resolution, &scales, bh.pooler_sampling_ratio)?;
        let mask_pooler = MultiLevelRoiAlign::new(mh.pooler_resolution, &scales, mh.pooler_sampling_ratio)?;

        let box_head = FastRcnnBoxHead::new(
            channels * bh.pooler_resolution * bh.pooler_resolution,
            rh.num_classes,
            bh,
            vb.pp("box_head"),
        )?;

        let num_masks = if mh.cls_agnostic_mask { 1 } else { rh.num_classes };
        let whole_spec = if wiring.whole_is_guided() {
            MaskBranchSpec {
                in_channels: dim,
                guide_channels: Some(channels + 2 * dim),
                num_masks,
            }
        } else {
            MaskBranchSpec {
                in_channels: channels,
                guide_channels: None,
                num_masks,
            }
        };
        let partition_spec = MaskBranchSpec {
            in_channels: channels,
            guide_channels: None,
            num_masks,
        };

        let whole = MaskBranchHead::new(MaskBranchKind::Whole, whole_spec, mh, vb.pp("whole_mask_head"))?;
        let overlapping = MaskBranchHead::new(
            MaskBranchKind::Overlapping,
            partition_spec,
            mh,
            vb.pp("overlapping_mask_head"),
        )?;
        let non_overlapping = MaskBranchHead::new(
            MaskBranchKind::NonOverlapping,
            partition_spec,
            mh,
            vb.pp("non_overlapping_mask_head"),
        )?;

        let guidance = if wiring.guidance == GuidanceMode::BranchGuidance {
            Some(GuidanceFusion::new(channels + dim, channels, vb.pp("branch_guidance"))?)
        } else {
            None
        };

        let consistency = wiring
            .consistency
            .map(|mode| ConsistencyEvaluator::new(mode, config.loss_weights.triple_branch_consistency));

        let labeler = ProposalLabeler::from_config(&config)?;

        tracing::info!(
            wiring = %wiring,
            in_features = ?rh.in_features,
            num_classes = rh.num_classes,
            "triple-branch ROI heads ready"
        );

        Ok(Self {
            config,
            wiring,
            labeler,
            box_pooler,
            mask_pooler,
            box_head,
            whole,
            overlapping,
            non_overlapping,
            guidance,
            consistency,
        })
    }

    pub fn config(&self) -> &RoiHeadsConfig {
        &self.config
    }

    pub fn wiring(&self) -> &Wiring {
        &self.wiring
    }

    pub fn plan(&self) -> Vec<Stage> {
        self.wiring.plan()
    }

    /// Loss keys a training pass produces
    pub fn loss_keys(&self, unlabeled: bool) -> BTreeSet<&'static str> {
        let mut keys = BTreeSet::new();
        if unlabeled {
            if self.wiring.guidance == GuidanceMode::BranchGuidance {
                keys.insert(BRANCH_GUIDANCE_CONSISTENCY_LOSS);
            }
        } else {
            keys.insert(LOSS_CLS);
            keys.insert(LOSS_BOX_REG);
            if self.wiring.has_whole_pre() {
                keys.insert(LOSS_WHOLE_MASK_GUIDANCE);
            }
            keys.insert(MaskBranchKind::Overlapping.loss_key());
            keys.insert(MaskBranchKind::NonOverlapping.loss_key());
            if self.wiring.refinement != RefinementMode::Off {
                keys.insert(MaskBranchKind::Whole.loss_key());
            }
        }
        if self.consistency.is_some() {
            keys.insert(LOSS_TRIPLE_BRANCH_CONSISTENCY);
        }
        keys
    }

    /// Whether a training batch is treated as unlabeled: its first image
    /// carries no targets
    pub fn is_unlabeled(&self, targets: &[Targets]) -> bool {
        targets.first().is_some_and(Targets::is_empty)
    }

    /// Training pass.
    ///
    /// # Arguments
    /// * `features` - Backbone maps by name
    /// * `proposals` - Region proposals per image
    /// * `targets` - Ground truth per image, same order as `proposals`
    /// * `rng` - Source of the proposal sampling draws
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        features: &BTreeMap<String, Tensor>,
        proposals: Vec<Proposals>,
        targets: &[Targets],
        rng: &mut R,
    ) -> Result<TrainOutput> {
        if proposals.len() != targets.len() {
            return Err(Error::shape_mismatch(
                "proposals vs targets (images)",
                targets.len(),
                proposals.len(),
            ));
        }

        let feature_list = self.select_features(features)?;
        self.check_finite(&feature_list)?;
        let device = feature_list[0].device().clone();

        let unlabeled = self.is_unlabeled(targets);
        let background = self.labeler.background_class();

        let (labeled, stats) = if unlabeled {
            let passthrough = proposals
                .iter()
                .map(|p| unlabeled_proposals(p, background))
                .collect();
            (passthrough, SamplingStats::default())
        } else {
            self.labeler
                .label_and_sample(proposals, targets, self.wiring.filter_out_class, rng)?
        };

        let mut losses = BTreeMap::new();
        if !unlabeled {
            let (loss_cls, loss_box_reg) = self.box_losses(&feature_list, &labeled)?;
            losses.insert(LOSS_CLS.to_string(), loss_cls);
            losses.insert(LOSS_BOX_REG.to_string(), loss_box_reg);
        }

        let foreground = if unlabeled {
            labeled.clone()
        } else {
            select_foreground_proposals(&labeled, background).0
        };
        let boxes: Vec<Vec<BoundingBox>> = foreground.iter().map(|p| p.proposal_boxes.clone()).collect();
        let pooled = self.mask_pooler.pool(&feature_list, &boxes)?;

        if pooled.dim(0)? == 0 {
            for key in self.loss_keys(unlabeled) {
                losses.entry(key.to_string()).or_insert(zero_loss(&device)?);
            }
            return Ok(TrainOutput {
                proposals: labeled,
                losses,
                whole_mask_logits: self.empty_mask_logits(&device)?,
                foreground,
                stats,
            });
        }

        let pass = self.run_mask_branches(&pooled)?;
        let whole = pass.whole()?;

        if !unlabeled {
            let mode = BranchMode::Train(&foreground);

            if let Some(pre) = &pass.whole_pre {
                let loss = mask_rcnn_loss(&pre.logits, &foreground, &GtField::masks())?;
                losses.insert(
                    LOSS_WHOLE_MASK_GUIDANCE.to_string(),
                    (loss * self.config.loss_weights.whole_guidance)?,
                );
            }
            for (kind, output) in [
                (MaskBranchKind::Overlapping, &pass.overlapping),
                (MaskBranchKind::NonOverlapping, &pass.non_overlapping),
            ] {
                losses.insert(kind.loss_key().to_string(), output.outcome(kind, mode)?.into_tensor());
            }
            if let Some(refined) = &pass.whole_final {
                losses.insert(
                    MaskBranchKind::Whole.loss_key().to_string(),
                    refined.outcome(MaskBranchKind::Whole, mode)?.into_tensor(),
                );
            }
        } else if let (GuidanceMode::BranchGuidance, Some(pre)) = (self.wiring.guidance, &pass.whole_pre) {
            losses.insert(
                BRANCH_GUIDANCE_CONSISTENCY_LOSS.to_string(),
                guidance_consistency(&pre.logits, &whole.logits, self.config.loss_weights.guidance_consistency)?,
            );
        }

        if let Some(evaluator) = &self.consistency {
            losses.insert(
                LOSS_TRIPLE_BRANCH_CONSISTENCY.to_string(),
                evaluator.evaluate(&whole.logits, &pass.overlapping.logits, &pass.non_overlapping.logits)?,
            );
        }

        Ok(TrainOutput {
            proposals: labeled,
            losses,
            whole_mask_logits: whole.logits.clone(),
            foreground,
            stats,
        })
    }

    /// Inference pass: detect boxes, then predict every active mask branch
    /// on the detections.
    pub fn forward_inference(
        &self,
        features: &BTreeMap<String, Tensor>,
        proposals: &[Proposals],
    ) -> Result<InferenceOutput> {
        let feature_list = self.select_features(features)?;
        self.check_finite(&feature_list)?;

        let boxes: Vec<Vec<BoundingBox>> = proposals.iter().map(|p| p.proposal_boxes.clone()).collect();
        let pooled = self.box_pooler.pool(&feature_list, &boxes)?;

        let detections = if pooled.dim(0)? == 0 {
            proposals
                .iter()
                .map(|p| Instances::new(p.image_size, Vec::new(), Vec::new(), Vec::new()))
                .collect::<Result<Vec<_>>>()?
        } else {
            let predictions = self.box_head.forward(&pooled)?;
            self.box_head
                .inference(&predictions, proposals, &self.box_inference_params())?
        };

        let (instances, whole_mask_logits) = self.predict_masks(&feature_list, detections)?;
        Ok(InferenceOutput {
            instances,
            whole_mask_logits,
        })
    }

    /// Run the mask branches on externally supplied detections.
    ///
    /// # Returns
    /// The instances with `pred_masks` filled for every active branch, and
    /// the final whole-mask logits
    pub fn forward_with_given_boxes(
        &self,
        features: &BTreeMap<String, Tensor>,
        instances: Vec<Instances>,
    ) -> Result<(Vec<Instances>, Tensor)> {
        let feature_list = self.select_features(features)?;
        self.check_finite(&feature_list)?;
        self.predict_masks(&feature_list, instances)
    }

    /// Warn about non-finite values in any input map.
    ///
    /// # Returns
    /// Whether every map is finite; the pass continues either way
    pub fn check_finite(&self, features: &[Tensor]) -> Result<bool> {
        let mut all_finite = true;
        for (name, map) in self.config.roi_heads.in_features.iter().zip(features) {
            // x - x is zero exactly where x is finite
            let residue: f32 = (map - map)?.sum_all()?.to_dtype(DType::F32)?.to_scalar()?;
            if !residue.is_finite() {
                tracing::warn!(feature = %name, "non-finite values in feature map");
                all_finite = false;
            }
        }
        Ok(all_finite)
    }

    fn select_features(&self, features: &BTreeMap<String, Tensor>) -> Result<Vec<Tensor>> {
        self.config
            .roi_heads
            .in_features
            .iter()
            .map(|name| {
                features
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::MissingFeature(name.clone()))
            })
            .collect()
    }

    fn box_inference_params(&self) -> BoxInferenceParams {
        let rh = &self.config.roi_heads;
        BoxInferenceParams {
            score_thresh: rh.score_thresh_test,
            nms_thresh: rh.nms_thresh_test,
            detections_per_image: rh.detections_per_image,
        }
    }

    fn box_losses(&self, features: &[Tensor], labeled: &[LabeledProposals]) -> Result<(Tensor, Tensor)> {
        let boxes: Vec<Vec<BoundingBox>> = labeled.iter().map(|p| p.proposal_boxes.clone()).collect();
        let pooled = self.box_pooler.pool(features, &boxes)?;

        if pooled.dim(0)? == 0 {
            let device = pooled.device();
            return Ok((zero_loss(device)?, zero_loss(device)?));
        }

        let predictions = self.box_head.forward(&pooled)?;
        self.box_head.losses(&predictions, labeled)
    }

    fn mask_side(&self) -> usize {
        2 * self.config.mask_head.pooler_resolution
    }

    fn num_masks(&self) -> usize {
        if self.config.mask_head.cls_agnostic_mask {
            1
        } else {
            self.config.roi_heads.num_classes
        }
    }

    fn empty_mask_logits(&self, device: &Device) -> Result<Tensor> {
        let side = self.mask_side();
        Ok(Tensor::zeros((0, self.num_masks(), side, side), DType::F32, device)?)
    }

    fn run_mask_branches(&self, pooled: &Tensor) -> Result<MaskPass> {
        let (whole_pre, overlap_input, non_overlap_input) = match self.wiring.guidance {
            GuidanceMode::Direct => (None, pooled.clone(), pooled.clone()),
            GuidanceMode::Attention => {
                let pre = self.whole.forward(pooled, false)?;
                let gated = (pooled * &pre.inner)?;
                (Some(pre), gated.clone(), gated)
            }
            GuidanceMode::BranchGuidance => {
                let pre = self.whole.forward(pooled, false)?;
                let fusion = self
                    .guidance
                    .as_ref()
                    .ok_or_else(|| Error::Config("branch guidance layers missing".into()))?;
                let fused = Tensor::cat(&[pooled, &pre.inner], 1)?;
                let (overlap_input, non_overlap_input) = fusion.forward(&fused)?;
                (Some(pre), overlap_input, non_overlap_input)
            }
        };

        let overlapping = self.overlapping.forward(&overlap_input, false)?;
        let non_overlapping = self.non_overlapping.forward(&non_overlap_input, false)?;

        let whole_final = match self.wiring.refinement {
            RefinementMode::Off => None,
            RefinementMode::Pure => Some(self.whole.forward(pooled, false)?),
            RefinementMode::Fused => {
                let fused = Tensor::cat(&[pooled, &overlapping.inner, &non_overlapping.inner], 1)?;
                Some(self.whole.forward(&fused, true)?)
            }
        };

        Ok(MaskPass {
            whole_pre,
            overlapping,
            non_overlapping,
            whole_final,
        })
    }

    fn predict_masks(&self, features: &[Tensor], mut instances: Vec<Instances>) -> Result<(Vec<Instances>, Tensor)> {
        let boxes: Vec<Vec<BoundingBox>> = instances.iter().map(|i| i.pred_boxes.clone()).collect();
        let pooled = self.mask_pooler.pool(features, &boxes)?;
        let device = pooled.device().clone();

        if pooled.dim(0)? == 0 {
            let side = self.mask_side();
            for image in &mut instances {
                for kind in MaskBranchKind::ALL {
                    image
                        .pred_masks
                        .insert(kind, Tensor::zeros((0, 1, side, side), DType::F32, &device)?);
                }
            }
            return Ok((instances, self.empty_mask_logits(&device)?));
        }

        let pass = self.run_mask_branches(&pooled)?;
        let whole = pass.whole()?;
        let classes: Vec<i64> = instances
            .iter()
            .flat_map(|i| i.pred_classes.iter().copied())
            .collect();
        let mode = BranchMode::Inference(&classes);

        for (kind, output) in [
            (MaskBranchKind::Whole, whole),
            (MaskBranchKind::Overlapping, &pass.overlapping),
            (MaskBranchKind::NonOverlapping, &pass.non_overlapping),
        ] {
            let masks = output.outcome(kind, mode)?.into_tensor();
            let mut offset = 0;
            for image in &mut instances {
                let n = image.len();
                image.pred_masks.insert(kind, masks.narrow(0, offset, n)?);
                offset += n;
            }
        }

        Ok((instances, whole.logits.clone()))
    }
}

/// Unsampled proposals of an unlabeled image, all background
fn unlabeled_proposals(proposals: &Proposals, background: i64) -> LabeledProposals {
    let n = proposals.len();
    LabeledProposals {
        image_size: proposals.image_size,
        proposal_boxes: proposals.proposal_boxes.clone(),
        objectness_logits: proposals.objectness_logits.clone(),
        gt_classes: vec![background; n],
        gt_boxes: vec![BoundingBox::zero(); n],
        gt_fields: GtFields::new(),
    }
}
