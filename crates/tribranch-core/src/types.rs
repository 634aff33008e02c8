//! Per-image proposal, target and prediction containers.
//!
//! Ground-truth attributes beyond boxes and classes live in a [`GtFields`]
//! bag keyed by [`GtField`], a name that is checked to sit in the reserved
//! `gt_` namespace. Copying matched attributes onto sampled proposals is an
//! explicit [`GtFields::merge_matched`] over the registered fields.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, ImageSize};
use crate::masks::BitMasks;

/// Name of a ground-truth field in the `gt_` namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GtField(String);

impl GtField {
    pub const PREFIX: &'static str = "gt_";
    /// Typed on [`Targets`] and [`LabeledProposals`] directly
    pub const RESERVED: [&'static str; 2] = ["gt_boxes", "gt_classes"];

    /// Whole-object mask
    pub fn masks() -> Self {
        Self("gt_masks".to_string())
    }

    /// Region of the object covered by another object
    pub fn overlapping_masks() -> Self {
        Self("gt_overlapping_masks".to_string())
    }

    /// Region of the object not covered by any other object
    pub fn non_overlapping_masks() -> Self {
        Self("gt_non_overlapping_masks".to_string())
    }

    /// Register a custom field. The name must start with `gt_` and must not be
    /// one of the reserved typed fields.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !name.starts_with(Self::PREFIX) || name.len() == Self::PREFIX.len() {
            return Err(Error::InvalidInput(format!(
                "ground-truth field `{name}` must be named `gt_<something>`"
            )));
        }
        if Self::RESERVED.contains(&name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "ground-truth field `{name}` is reserved"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GtField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value of a ground-truth field, one entry per object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GtValue {
    Masks(BitMasks),
    Boxes(Vec<BoundingBox>),
    Labels(Vec<i64>),
    Scalars(Vec<f32>),
}

impl GtValue {
    pub fn len(&self) -> usize {
        match self {
            GtValue::Masks(m) => m.len(),
            GtValue::Boxes(b) => b.len(),
            GtValue::Labels(l) => l.len(),
            GtValue::Scalars(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather entries by index (indices may repeat)
    pub fn select(&self, indices: &[usize]) -> Self {
        match self {
            GtValue::Masks(m) => GtValue::Masks(m.select(indices)),
            GtValue::Boxes(b) => GtValue::Boxes(indices.iter().map(|&i| b[i]).collect()),
            GtValue::Labels(l) => GtValue::Labels(indices.iter().map(|&i| l[i]).collect()),
            GtValue::Scalars(s) => GtValue::Scalars(indices.iter().map(|&i| s[i]).collect()),
        }
    }

    pub fn as_masks(&self) -> Option<&BitMasks> {
        match self {
            GtValue::Masks(m) => Some(m),
            _ => None,
        }
    }
}

/// Registered ground-truth fields of one image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GtFields {
    fields: BTreeMap<GtField, GtValue>,
}

impl GtFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, requiring `expected_len` entries
    pub fn insert(&mut self, field: GtField, value: GtValue, expected_len: usize) -> Result<()> {
        if value.len() != expected_len {
            return Err(Error::shape_mismatch(
                format!("length of `{field}`"),
                expected_len,
                value.len(),
            ));
        }
        self.fields.insert(field, value);
        Ok(())
    }

    pub fn get(&self, field: &GtField) -> Option<&GtValue> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &GtField) -> bool {
        self.fields.contains_key(field)
    }

    pub fn names(&self) -> impl Iterator<Item = &GtField> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy every registered field, indexed by the matched target index of
    /// each sampled proposal.
    pub fn merge_matched(&self, matched_targets: &[usize]) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.select(matched_targets)))
                .collect(),
        }
    }

    /// Keep only the entries at `indices`
    pub fn select(&self, indices: &[usize]) -> Self {
        self.merge_matched(indices)
    }
}

/// Region proposals for one image
#[derive(Debug, Clone, PartialEq)]
pub struct Proposals {
    pub image_size: ImageSize,
    pub proposal_boxes: Vec<BoundingBox>,
    pub objectness_logits: Vec<f32>,
}

impl Proposals {
    pub fn new(
        image_size: ImageSize,
        proposal_boxes: Vec<BoundingBox>,
        objectness_logits: Vec<f32>,
    ) -> Result<Self> {
        if proposal_boxes.len() != objectness_logits.len() {
            return Err(Error::shape_mismatch(
                "objectness logits vs proposal boxes",
                proposal_boxes.len(),
                objectness_logits.len(),
            ));
        }
        Ok(Self {
            image_size,
            proposal_boxes,
            objectness_logits,
        })
    }

    pub fn len(&self) -> usize {
        self.proposal_boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposal_boxes.is_empty()
    }

    /// Append boxes with a fixed objectness logit
    pub fn append_boxes(&mut self, boxes: &[BoundingBox], logit: f32) {
        self.proposal_boxes.extend_from_slice(boxes);
        self.objectness_logits
            .extend(std::iter::repeat(logit).take(boxes.len()));
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            image_size: self.image_size,
            proposal_boxes: indices.iter().map(|&i| self.proposal_boxes[i]).collect(),
            objectness_logits: indices.iter().map(|&i| self.objectness_logits[i]).collect(),
        }
    }
}

/// Ground-truth annotations for one image
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    pub image_size: ImageSize,
    pub gt_boxes: Vec<BoundingBox>,
    pub gt_classes: Vec<i64>,
    pub fields: GtFields,
}

impl Targets {
    pub fn new(image_size: ImageSize, gt_boxes: Vec<BoundingBox>, gt_classes: Vec<i64>) -> Result<Self> {
        if gt_boxes.len() != gt_classes.len() {
            return Err(Error::shape_mismatch(
                "gt_classes vs gt_boxes",
                gt_boxes.len(),
                gt_classes.len(),
            ));
        }
        Ok(Self {
            image_size,
            gt_boxes,
            gt_classes,
            fields: GtFields::new(),
        })
    }

    /// An image without annotated objects
    pub fn empty(image_size: ImageSize) -> Self {
        Self {
            image_size,
            gt_boxes: Vec::new(),
            gt_classes: Vec::new(),
            fields: GtFields::new(),
        }
    }

    /// Attach an extra `gt_*` field with one entry per object
    pub fn with_field(mut self, field: GtField, value: GtValue) -> Result<Self> {
        let n = self.len();
        self.fields.insert(field, value, n)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.gt_boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gt_boxes.is_empty()
    }
}

/// Sampled proposals carrying their training labels
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledProposals {
    pub image_size: ImageSize,
    pub proposal_boxes: Vec<BoundingBox>,
    pub objectness_logits: Vec<f32>,
    /// Class in `[0, num_classes)`, or `num_classes` for background
    pub gt_classes: Vec<i64>,
    /// Matched ground-truth box (all zero for images without targets)
    pub gt_boxes: Vec<BoundingBox>,
    /// Matched extra fields (absent for images without targets)
    pub gt_fields: GtFields,
}

impl LabeledProposals {
    pub fn len(&self) -> usize {
        self.proposal_boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposal_boxes.is_empty()
    }

    /// Check that every per-proposal field has the same length
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        for (what, len) in [
            ("objectness_logits", self.objectness_logits.len()),
            ("gt_classes", self.gt_classes.len()),
            ("gt_boxes", self.gt_boxes.len()),
        ] {
            if len != n {
                return Err(Error::shape_mismatch(format!("labeled proposals {what}"), n, len));
            }
        }
        for name in self.gt_fields.names() {
            if let Some(value) = self.gt_fields.get(name) {
                if value.len() != n {
                    return Err(Error::shape_mismatch(
                        format!("labeled proposals {name}"),
                        n,
                        value.len(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            image_size: self.image_size,
            proposal_boxes: indices.iter().map(|&i| self.proposal_boxes[i]).collect(),
            objectness_logits: indices.iter().map(|&i| self.objectness_logits[i]).collect(),
            gt_classes: indices.iter().map(|&i| self.gt_classes[i]).collect(),
            gt_boxes: indices.iter().map(|&i| self.gt_boxes[i]).collect(),
            gt_fields: self.gt_fields.select(indices),
        }
    }
}

/// Mask prediction branch of the triple-branch head
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MaskBranchKind {
    /// Whole object
    Whole,
    /// Part of the object overlapped by neighbours
    Overlapping,
    /// Part of the object nobody else covers
    NonOverlapping,
}

impl MaskBranchKind {
    pub const ALL: [MaskBranchKind; 3] = [
        MaskBranchKind::Whole,
        MaskBranchKind::Overlapping,
        MaskBranchKind::NonOverlapping,
    ];

    /// Ground-truth field supervising this branch
    pub fn gt_field(&self) -> GtField {
        match self {
            MaskBranchKind::Whole => GtField::masks(),
            MaskBranchKind::Overlapping => GtField::overlapping_masks(),
            MaskBranchKind::NonOverlapping => GtField::non_overlapping_masks(),
        }
    }

    /// Loss key reported in training
    pub fn loss_key(&self) -> &'static str {
        match self {
            MaskBranchKind::Whole => "loss_whole_mask",
            MaskBranchKind::Overlapping => "loss_overlapping_mask",
            MaskBranchKind::NonOverlapping => "loss_non_overlapping_mask",
        }
    }
}

/// Detected instances for one image
#[derive(Debug, Clone)]
pub struct Instances {
    pub image_size: ImageSize,
    pub pred_boxes: Vec<BoundingBox>,
    pub scores: Vec<f32>,
    pub pred_classes: Vec<i64>,
    /// Per-branch mask probabilities `[R, 1, M, M]`
    pub pred_masks: BTreeMap<MaskBranchKind, Tensor>,
}

impl Instances {
    pub fn new(
        image_size: ImageSize,
        pred_boxes: Vec<BoundingBox>,
        scores: Vec<f32>,
        pred_classes: Vec<i64>,
    ) -> Result<Self> {
        let n = pred_boxes.len();
        if scores.len() != n {
            return Err(Error::shape_mismatch("scores vs pred_boxes", n, scores.len()));
        }
        if pred_classes.len() != n {
            return Err(Error::shape_mismatch("pred_classes vs pred_boxes", n, pred_classes.len()));
        }
        Ok(Self {
            image_size,
            pred_boxes,
            scores,
            pred_classes,
            pred_masks: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.pred_boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pred_boxes.is_empty()
    }

    pub fn pred_mask(&self, kind: MaskBranchKind) -> Option<&Tensor> {
        self.pred_masks.get(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxes(n: usize) -> Vec<BoundingBox> {
        (0..n)
            .map(|i| BoundingBox::new(i as f32, 0.0, i as f32 + 1.0, 1.0))
            .collect()
    }

    #[test]
    fn test_gt_field_namespace() {
        assert!(GtField::new("gt_keypoints").is_ok());
        assert!(GtField::new("keypoints").is_err());
        assert!(GtField::new("gt_").is_err());
        assert!(GtField::new("gt_classes").is_err());
        assert!(GtField::new("gt_boxes").is_err());
        assert_eq!(GtField::masks().as_str(), "gt_masks");
    }

    #[test]
    fn test_targets_field_length_checked() {
        let size = ImageSize::new(4, 4);
        let targets = Targets::new(size, boxes(2), vec![0, 1]).unwrap();

        let err = targets
            .clone()
            .with_field(GtField::masks(), GtValue::Masks(BitMasks::from_boxes(&boxes(1), 4, 4)))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let ok = targets
            .with_field(GtField::masks(), GtValue::Masks(BitMasks::from_boxes(&boxes(2), 4, 4)))
            .unwrap();
        assert!(ok.fields.contains(&GtField::masks()));
    }

    #[test]
    fn test_merge_matched_gathers_every_field() {
        let mut fields = GtFields::new();
        fields
            .insert(GtField::new("gt_score").unwrap(), GtValue::Scalars(vec![0.1, 0.2]), 2)
            .unwrap();
        fields
            .insert(GtField::new("gt_group").unwrap(), GtValue::Labels(vec![7, 9]), 2)
            .unwrap();

        let merged = fields.merge_matched(&[1, 1, 0]);

        assert_eq!(
            merged.get(&GtField::new("gt_score").unwrap()),
            Some(&GtValue::Scalars(vec![0.2, 0.2, 0.1]))
        );
        assert_eq!(
            merged.get(&GtField::new("gt_group").unwrap()),
            Some(&GtValue::Labels(vec![9, 9, 7]))
        );
    }

    #[test]
    fn test_proposals_length_mismatch() {
        let err = Proposals::new(ImageSize::new(4, 4), boxes(3), vec![0.0; 2]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn test_labeled_proposals_validate() {
        let mut labeled = LabeledProposals {
            image_size: ImageSize::new(4, 4),
            proposal_boxes: boxes(2),
            objectness_logits: vec![0.0; 2],
            gt_classes: vec![0, 3],
            gt_boxes: vec![BoundingBox::zero(); 2],
            gt_fields: GtFields::new(),
        };
        assert!(labeled.validate().is_ok());

        labeled.gt_classes.pop();
        assert!(labeled.validate().is_err());
    }
}
