//! Proposal labeling: ground-truth augmentation, matching, class resolution,
//! sampling and propagation of matched ground-truth fields.

use rand::Rng;
use tribranch_core::{
    pairwise_iou, BoundingBox, Error, GtFields, LabeledProposals, Proposals, Result, Targets,
};

use crate::config::RoiHeadsConfig;
use crate::matcher::{MatchLabel, MatchResult, Matcher};
use crate::sampler::ProposalSampler;

/// Objectness logit given to ground-truth boxes appended as proposals
pub const GT_PROPOSAL_LOGIT: f32 = 0.0;

/// Mean per-image sample counts of one labeling call
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingStats {
    pub mean_fg: f32,
    pub mean_bg: f32,
}

/// Turns raw proposals and targets into training-ready labeled proposals
#[derive(Debug, Clone)]
pub struct ProposalLabeler {
    matcher: Matcher,
    sampler: ProposalSampler,
    num_classes: usize,
    proposal_append_gt: bool,
    filter_remap_class: i64,
}

impl ProposalLabeler {
    pub fn new(
        matcher: Matcher,
        sampler: ProposalSampler,
        num_classes: usize,
        proposal_append_gt: bool,
        filter_remap_class: i64,
    ) -> Self {
        Self {
            matcher,
            sampler,
            num_classes,
            proposal_append_gt,
            filter_remap_class,
        }
    }

    pub fn from_config(config: &RoiHeadsConfig) -> Result<Self> {
        let rh = &config.roi_heads;
        let matcher = Matcher::new(&rh.iou_thresholds, &rh.iou_labels, false)?;
        let sampler = ProposalSampler::new(rh.batch_size_per_image, rh.positive_fraction);
        Ok(Self::new(
            matcher,
            sampler,
            rh.num_classes,
            rh.proposal_append_gt,
            rh.filter_remap_class,
        ))
    }

    /// Background class id
    pub fn background_class(&self) -> i64 {
        self.num_classes as i64
    }

    /// Label and subsample the proposals of every image.
    ///
    /// # Arguments
    /// * `proposals` - One proposal set per image
    /// * `targets` - One target set per image, in the same order
    /// * `filter_out_class` - Matches to this class are relabeled to the
    ///   configured remap class
    /// * `rng` - Source of the sampling draws
    ///
    /// # Returns
    /// Labeled proposals per image (fg samples first) and the mean sample counts
    pub fn label_and_sample<R: Rng + ?Sized>(
        &self,
        proposals: Vec<Proposals>,
        targets: &[Targets],
        filter_out_class: Option<i64>,
        rng: &mut R,
    ) -> Result<(Vec<LabeledProposals>, SamplingStats)> {
        if proposals.len() != targets.len() {
            return Err(Error::shape_mismatch(
                "proposals vs targets (images)",
                targets.len(),
                proposals.len(),
            ));
        }

        let mut labeled = Vec::with_capacity(proposals.len());
        let mut num_fg = Vec::with_capacity(proposals.len());
        let mut num_bg = Vec::with_capacity(proposals.len());

        for (mut proposals_per_image, targets_per_image) in proposals.into_iter().zip(targets) {
            if self.proposal_append_gt {
                proposals_per_image.append_boxes(&targets_per_image.gt_boxes, GT_PROPOSAL_LOGIT);
            }

            let quality = pairwise_iou(&targets_per_image.gt_boxes, &proposals_per_image.proposal_boxes);
            let matches = self.matcher.matches(&quality, proposals_per_image.len())?;
            let gt_classes = self.resolve_classes(&matches, &targets_per_image.gt_classes, filter_out_class);

            let (fg, bg) = self
                .sampler
                .sample(&gt_classes, self.background_class(), rng);
            num_fg.push(fg.len());
            num_bg.push(bg.len());

            let sampled: Vec<usize> = fg.into_iter().chain(bg).collect();
            labeled.push(self.attach_targets(
                &proposals_per_image,
                targets_per_image,
                &matches,
                &gt_classes,
                &sampled,
            ));
        }

        let stats = SamplingStats {
            mean_fg: mean(&num_fg),
            mean_bg: mean(&num_bg),
        };
        tracing::debug!(
            num_fg_samples = stats.mean_fg,
            num_bg_samples = stats.mean_bg,
            "roi_head sampling"
        );

        Ok((labeled, stats))
    }

    /// Class of every proposal: the matched target's class, background for
    /// unmatched proposals and `-1` for ignored ones.
    pub fn resolve_classes(
        &self,
        matches: &MatchResult,
        target_classes: &[i64],
        filter_out_class: Option<i64>,
    ) -> Vec<i64> {
        let background = self.background_class();

        if target_classes.is_empty() {
            return vec![background; matches.len()];
        }

        matches
            .matched_idxs
            .iter()
            .zip(&matches.matched_labels)
            .map(|(&idx, label)| match label {
                MatchLabel::Background => background,
                MatchLabel::Ignore => -1,
                MatchLabel::Foreground => {
                    let class = target_classes[idx];
                    match filter_out_class {
                        Some(filtered) if class == filtered => self.filter_remap_class,
                        _ => class,
                    }
                }
            })
            .collect()
    }

    fn attach_targets(
        &self,
        proposals: &Proposals,
        targets: &Targets,
        matches: &MatchResult,
        gt_classes: &[i64],
        sampled: &[usize],
    ) -> LabeledProposals {
        let picked = proposals.select(sampled);
        let classes = sampled.iter().map(|&i| gt_classes[i]).collect();

        let (gt_boxes, gt_fields) = if targets.is_empty() {
            (vec![BoundingBox::zero(); sampled.len()], GtFields::new())
        } else {
            let matched: Vec<usize> = sampled.iter().map(|&i| matches.matched_idxs[i]).collect();
            (
                matched.iter().map(|&t| targets.gt_boxes[t]).collect(),
                targets.fields.merge_matched(&matched),
            )
        };

        LabeledProposals {
            image_size: picked.image_size,
            proposal_boxes: picked.proposal_boxes,
            objectness_logits: picked.objectness_logits,
            gt_classes: classes,
            gt_boxes,
            gt_fields,
        }
    }
}

/// Foreground subset of each image: proposals whose class is neither
/// ignored (`-1`) nor background.
///
/// # Returns
/// The per-image foreground proposals and the selection mask over the input
pub fn select_foreground_proposals(
    proposals: &[LabeledProposals],
    bg_label: i64,
) -> (Vec<LabeledProposals>, Vec<Vec<bool>>) {
    proposals
        .iter()
        .map(|p| {
            let mask: Vec<bool> = p
                .gt_classes
                .iter()
                .map(|&c| c != -1 && c != bg_label)
                .collect();
            let idxs: Vec<usize> = mask
                .iter()
                .enumerate()
                .filter(|(_, &keep)| keep)
                .map(|(i, _)| i)
                .collect();
            (p.select(&idxs), mask)
        })
        .unzip()
}

fn mean(counts: &[usize]) -> f32 {
    if counts.is_empty() {
        0.0
    } else {
        counts.iter().sum::<usize>() as f32 / counts.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tribranch_core::{BitMasks, GtField, GtValue, ImageSize};

    const SIZE: ImageSize = ImageSize { height: 64, width: 64 };

    fn labeler(batch: usize, fraction: f32, num_classes: usize, append_gt: bool) -> ProposalLabeler {
        ProposalLabeler::new(
            Matcher::two_threshold(0.3, 0.5).unwrap(),
            ProposalSampler::new(batch, fraction),
            num_classes,
            append_gt,
            2,
        )
    }

    /// Three targets; ten proposals at IoU 0.9 with target 0 and ten far away
    fn scenario() -> (Proposals, Targets) {
        let gt = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(30.0, 30.0, 40.0, 40.0),
            BoundingBox::new(30.0, 0.0, 40.0, 10.0),
        ];
        let masks = BitMasks::from_boxes(&gt, SIZE.height, SIZE.width);
        let targets = Targets::new(SIZE, gt, vec![0, 1, 2])
            .unwrap()
            .with_field(GtField::masks(), GtValue::Masks(masks))
            .unwrap();

        // 10x9 box inside the 10x10 target: IoU 0.9
        let mut boxes = vec![BoundingBox::new(0.0, 0.0, 10.0, 9.0); 10];
        boxes.extend((0..10).map(|i| {
            let x = 45.0 + i as f32;
            BoundingBox::new(x, 50.0, x + 4.0, 54.0)
        }));
        let proposals = Proposals::new(SIZE, boxes, vec![1.0; 20]).unwrap();

        (proposals, targets)
    }

    #[test]
    fn test_end_to_end_scenario() -> Result<()> {
        let (proposals, targets) = scenario();
        let labeler = labeler(8, 0.25, 3, false);
        let mut rng = StdRng::seed_from_u64(3);

        let (labeled, stats) =
            labeler.label_and_sample(vec![proposals], &[targets], None, &mut rng)?;
        let image = &labeled[0];

        assert_eq!(image.len(), 8);
        assert_eq!(&image.gt_classes[..2], &[0, 0]);
        assert!(image.gt_classes[2..].iter().all(|&c| c == 3));
        assert_eq!(stats, SamplingStats { mean_fg: 2.0, mean_bg: 6.0 });
        image.validate()?;
        Ok(())
    }

    #[test]
    fn test_matched_fields_follow_matched_target() -> Result<()> {
        let (proposals, targets) = scenario();
        let labeler = labeler(8, 0.25, 3, false);

        let (labeled, _) = labeler.label_and_sample(
            vec![proposals],
            &[targets.clone()],
            None,
            &mut StdRng::seed_from_u64(11),
        )?;
        let image = &labeled[0];

        assert_eq!(image.gt_boxes[0], targets.gt_boxes[0]);
        let masks = image
            .gt_fields
            .get(&GtField::masks())
            .and_then(GtValue::as_masks)
            .expect("gt_masks propagated");
        assert_eq!(masks.len(), image.len());
        assert_eq!(masks.mask(0), targets.fields.get(&GtField::masks()).unwrap().as_masks().unwrap().mask(0));
        Ok(())
    }

    #[test]
    fn test_empty_targets_all_background() -> Result<()> {
        let (proposals, _) = scenario();
        let labeler = labeler(8, 0.25, 3, true);

        let (labeled, stats) = labeler.label_and_sample(
            vec![proposals],
            &[Targets::empty(SIZE)],
            None,
            &mut StdRng::seed_from_u64(5),
        )?;
        let image = &labeled[0];

        assert_eq!(image.len(), 8);
        assert!(image.gt_classes.iter().all(|&c| c == 3));
        assert_eq!(image.gt_boxes, vec![BoundingBox::zero(); 8]);
        assert!(image.gt_fields.is_empty());
        assert_eq!(stats.mean_fg, 0.0);
        Ok(())
    }

    #[test]
    fn test_filter_out_class_remapped() -> Result<()> {
        let size = ImageSize::new(64, 64);
        let gt = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(20.0, 20.0, 30.0, 30.0),
        ];
        let targets = Targets::new(size, gt.clone(), vec![0, 1])?;
        let proposals = Proposals::new(size, gt, vec![0.0; 2])?;
        let labeler = labeler(16, 1.0, 4, true);

        let (labeled, _) = labeler.label_and_sample(
            vec![proposals],
            &[targets],
            Some(0),
            &mut StdRng::seed_from_u64(9),
        )?;

        let classes = &labeled[0].gt_classes;
        assert!(!classes.contains(&0));
        assert_eq!(classes.iter().filter(|&&c| c == 2).count(), 2);
        assert_eq!(classes.iter().filter(|&&c| c == 1).count(), 2);
        Ok(())
    }

    #[test]
    fn test_appended_ground_truth_gives_positives() -> Result<()> {
        let size = ImageSize::new(64, 64);
        let targets = Targets::new(size, vec![BoundingBox::new(5.0, 5.0, 20.0, 20.0)], vec![1])?;
        let far = Proposals::new(size, vec![BoundingBox::new(40.0, 40.0, 60.0, 60.0)], vec![0.5])?;

        let without = labeler(8, 0.5, 2, false).label_and_sample(
            vec![far.clone()],
            &[targets.clone()],
            None,
            &mut StdRng::seed_from_u64(0),
        )?;
        let with = labeler(8, 0.5, 2, true).label_and_sample(
            vec![far],
            &[targets],
            None,
            &mut StdRng::seed_from_u64(0),
        )?;

        assert_eq!(without.1.mean_fg, 0.0);
        assert_eq!(with.1.mean_fg, 1.0);
        assert_eq!(with.0[0].objectness_logits[0], GT_PROPOSAL_LOGIT);
        Ok(())
    }

    #[test]
    fn test_ignored_never_sampled() -> Result<()> {
        let size = ImageSize::new(64, 64);
        let targets = Targets::new(size, vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)], vec![0])?;
        // IoU 0.4 -> ignore
        let proposals = Proposals::new(size, vec![BoundingBox::new(0.0, 0.0, 10.0, 4.0)], vec![0.0])?;

        let (labeled, _) = labeler(8, 0.25, 1, false).label_and_sample(
            vec![proposals],
            &[targets],
            None,
            &mut StdRng::seed_from_u64(0),
        )?;

        assert!(labeled[0].is_empty());
        Ok(())
    }

    #[test]
    fn test_image_count_mismatch() {
        let (proposals, targets) = scenario();
        let err = labeler(8, 0.25, 3, false)
            .label_and_sample(
                vec![proposals.clone(), proposals],
                &[targets],
                None,
                &mut StdRng::seed_from_u64(0),
            )
            .unwrap_err();

        assert!(matches!(err, Error::ShapeMismatch { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn test_select_foreground() -> Result<()> {
        let (proposals, targets) = scenario();
        let (labeled, _) = labeler(8, 0.25, 3, false).label_and_sample(
            vec![proposals],
            &[targets],
            None,
            &mut StdRng::seed_from_u64(4),
        )?;

        let (fg, masks) = select_foreground_proposals(&labeled, 3);

        assert_eq!(fg[0].len(), 2);
        assert_eq!(masks[0].iter().filter(|&&m| m).count(), 2);
        assert!(fg[0].gt_classes.iter().all(|&c| c == 0));
        Ok(())
    }
}
