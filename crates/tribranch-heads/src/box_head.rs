//! Fast R-CNN box branch: class scores and per-class box refinement.

use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, ops::softmax, Linear, VarBuilder};
use tribranch_core::{nms, BoundingBox, Error, ImageSize, Instances, LabeledProposals, Proposals, Result};

use crate::config::BoxHeadConfig;
use crate::losses::{smooth_l1, zero_loss};

/// Largest `dw`/`dh` applied when decoding, `ln(1000 / 16)`
pub fn default_scale_clamp() -> f32 {
    (1000.0f32 / 16.0).ln()
}

/// Box-to-box transform parameterised by center offsets and log-scale
/// changes, each multiplied by a weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxTransform {
    pub weights: [f32; 4],
    pub scale_clamp: f32,
}

impl BoxTransform {
    pub fn new(weights: [f32; 4]) -> Self {
        Self {
            weights,
            scale_clamp: default_scale_clamp(),
        }
    }

    /// Deltas `(dx, dy, dw, dh)` taking `src` to `target`
    pub fn encode(&self, src: &BoundingBox, target: &BoundingBox) -> [f32; 4] {
        let [wx, wy, ww, wh] = self.weights;
        let (sw, sh) = (src.width(), src.height());
        let (scx, scy) = src.center();
        let (tw, th) = (target.width(), target.height());
        let (tcx, tcy) = target.center();

        [
            wx * (tcx - scx) / sw,
            wy * (tcy - scy) / sh,
            ww * (tw / sw).ln(),
            wh * (th / sh).ln(),
        ]
    }

    /// Apply deltas to `src`
    pub fn decode(&self, deltas: &[f32; 4], src: &BoundingBox) -> BoundingBox {
        let [wx, wy, ww, wh] = self.weights;
        let (w, h) = (src.width(), src.height());
        let (cx, cy) = src.center();

        let dx = deltas[0] / wx;
        let dy = deltas[1] / wy;
        let dw = (deltas[2] / ww).min(self.scale_clamp);
        let dh = (deltas[3] / wh).min(self.scale_clamp);

        let pcx = dx * w + cx;
        let pcy = dy * h + cy;
        let pw = dw.exp() * w;
        let ph = dh.exp() * h;

        BoundingBox::new(pcx - 0.5 * pw, pcy - 0.5 * ph, pcx + 0.5 * pw, pcy + 0.5 * ph)
    }
}

/// Raw predictions for a batch of regions
#[derive(Debug, Clone)]
pub struct BoxPredictions {
    /// `[R, K + 1]`, last column is background
    pub scores: Tensor,
    /// `[R, 4 * K]`, or `[R, 4]` when class-agnostic
    pub deltas: Tensor,
}

/// Test-time filtering of box predictions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxInferenceParams {
    pub score_thresh: f32,
    pub nms_thresh: f32,
    pub detections_per_image: usize,
}

/// Fully connected box head with class and box predictors
pub struct FastRcnnBoxHead {
    fcs: Vec<Linear>,
    cls_score: Linear,
    bbox_pred: Linear,
    num_classes: usize,
    cls_agnostic: bool,
    smooth_l1_beta: f64,
    transform: BoxTransform,
}

impl FastRcnnBoxHead {
    /// # Arguments
    /// * `input_dim` - Flattened pooled feature size, `C * S * S`
    /// * `num_classes` - Foreground classes
    pub fn new(input_dim: usize, num_classes: usize, config: &BoxHeadConfig, vb: VarBuilder) -> Result<Self> {
        let mut fcs = Vec::with_capacity(config.num_fc);
        let mut dim = input_dim;
        for i in 0..config.num_fc {
            fcs.push(linear(dim, config.fc_dim, vb.pp(format!("fc{}", i + 1)))?);
            dim = config.fc_dim;
        }

        let box_outputs = if config.cls_agnostic_bbox_reg { 1 } else { num_classes };
        let cls_score = linear(dim, num_classes + 1, vb.pp("cls_score"))?;
        let bbox_pred = linear(dim, box_outputs * 4, vb.pp("bbox_pred"))?;

        Ok(Self {
            fcs,
            cls_score,
            bbox_pred,
            num_classes,
            cls_agnostic: config.cls_agnostic_bbox_reg,
            smooth_l1_beta: config.smooth_l1_beta as f64,
            transform: BoxTransform::new(config.bbox_reg_weights),
        })
    }

    pub fn transform(&self) -> &BoxTransform {
        &self.transform
    }

    /// Forward pass over pooled region features
    ///
    /// # Arguments
    /// * `features` - Pooled features [R, C, S, S]
    pub fn forward(&self, features: &Tensor) -> Result<BoxPredictions> {
        let mut x = features.flatten_from(1)?;
        for fc in &self.fcs {
            x = fc.forward(&x)?.relu()?;
        }

        Ok(BoxPredictions {
            scores: self.cls_score.forward(&x)?,
            deltas: self.bbox_pred.forward(&x)?,
        })
    }

    /// Classification and box regression losses over sampled proposals.
    ///
    /// The regression loss is summed over foreground proposals and divided by
    /// the total number of samples.
    ///
    /// # Returns
    /// `(loss_cls, loss_box_reg)`
    pub fn losses(&self, predictions: &BoxPredictions, proposals: &[LabeledProposals]) -> Result<(Tensor, Tensor)> {
        let device = predictions.scores.device();
        let total: usize = proposals.iter().map(LabeledProposals::len).sum();
        let rows = predictions.scores.dim(0)?;
        if total != rows {
            return Err(Error::shape_mismatch("box predictions vs sampled proposals", total, rows));
        }
        if total == 0 {
            return Ok((zero_loss(device)?, zero_loss(device)?));
        }

        let classes: Vec<i64> = proposals.iter().flat_map(|p| p.gt_classes.iter().copied()).collect();
        if let Some(bad) = classes.iter().find(|&&c| c < 0 || c as usize > self.num_classes) {
            return Err(Error::InvalidInput(format!("box loss got class {bad}")));
        }
        let class_ids: Vec<u32> = classes.iter().map(|&c| c as u32).collect();
        let targets = Tensor::from_vec(class_ids, total, device)?;
        let loss_cls = candle_nn::loss::cross_entropy(&predictions.scores.to_dtype(DType::F32)?, &targets)?;

        let mut fg_rows = Vec::new();
        let mut fg_cols = Vec::new();
        let mut fg_targets = Vec::new();
        let mut row = 0u32;
        for image in proposals {
            for i in 0..image.len() {
                let class = image.gt_classes[i];
                if (class as usize) < self.num_classes {
                    let base = if self.cls_agnostic { 0 } else { 4 * class as u32 };
                    fg_rows.push(row);
                    fg_cols.extend((0..4).map(|j| base + j));
                    fg_targets.extend(self.transform.encode(&image.proposal_boxes[i], &image.gt_boxes[i]));
                }
                row += 1;
            }
        }

        if fg_rows.is_empty() {
            return Ok((loss_cls, zero_loss(device)?));
        }

        let num_fg = fg_rows.len();
        let fg_rows = Tensor::from_vec(fg_rows, num_fg, device)?;
        let fg_cols = Tensor::from_vec(fg_cols, (num_fg, 4), device)?;
        let fg_deltas = predictions
            .deltas
            .to_dtype(DType::F32)?
            .index_select(&fg_rows, 0)?
            .gather(&fg_cols, 1)?;
        let fg_targets = Tensor::from_vec(fg_targets, (num_fg, 4), device)?;

        let loss_box_reg = (smooth_l1(&fg_deltas, &fg_targets, self.smooth_l1_beta)?.sum_all()? / total as f64)?;

        Ok((loss_cls, loss_box_reg))
    }

    /// Turn predictions into per-image detections.
    ///
    /// Every (proposal, class) pair scoring above the threshold becomes a
    /// candidate; candidates go through per-class NMS and the best
    /// `detections_per_image` survive.
    pub fn inference(
        &self,
        predictions: &BoxPredictions,
        proposals: &[Proposals],
        params: &BoxInferenceParams,
    ) -> Result<Vec<Instances>> {
        let total: usize = proposals.iter().map(Proposals::len).sum();
        if total == 0 {
            return proposals
                .iter()
                .map(|p| Instances::new(p.image_size, Vec::new(), Vec::new(), Vec::new()))
                .collect();
        }

        let scores = softmax(&predictions.scores.to_dtype(DType::F32)?, 1)?.to_vec2::<f32>()?;
        let deltas = predictions.deltas.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        if scores.len() != total {
            return Err(Error::shape_mismatch("box predictions vs proposals", total, scores.len()));
        }

        let mut offset = 0;
        let mut results = Vec::with_capacity(proposals.len());
        for image in proposals {
            let n = image.len();
            results.push(self.inference_single_image(
                &scores[offset..offset + n],
                &deltas[offset..offset + n],
                image,
                params,
            )?);
            offset += n;
        }

        Ok(results)
    }

    fn inference_single_image(
        &self,
        scores: &[Vec<f32>],
        deltas: &[Vec<f32>],
        proposals: &Proposals,
        params: &BoxInferenceParams,
    ) -> Result<Instances> {
        let size: ImageSize = proposals.image_size;

        // Candidates grouped by class for per-class NMS
        let mut per_class: Vec<(Vec<BoundingBox>, Vec<f32>)> = vec![(Vec::new(), Vec::new()); self.num_classes];
        for (i, bbox) in proposals.proposal_boxes.iter().enumerate() {
            for class in 0..self.num_classes {
                let score = scores[i][class];
                if score <= params.score_thresh {
                    continue;
                }
                let base = if self.cls_agnostic { 0 } else { 4 * class };
                let d = [deltas[i][base], deltas[i][base + 1], deltas[i][base + 2], deltas[i][base + 3]];
                let decoded = self.transform.decode(&d, bbox).clip(size);
                if !decoded.is_empty() && decoded.to_array().iter().all(|v| v.is_finite()) {
                    per_class[class].0.push(decoded);
                    per_class[class].1.push(score);
                }
            }
        }

        let mut detections: Vec<(BoundingBox, f32, i64)> = Vec::new();
        for (class, (boxes, class_scores)) in per_class.iter().enumerate() {
            for keep in nms(boxes, class_scores, params.nms_thresh) {
                detections.push((boxes[keep], class_scores[keep], class as i64));
            }
        }
        detections.sort_by(|a, b| b.1.total_cmp(&a.1));
        detections.truncate(params.detections_per_image);

        let (pred_boxes, rest): (Vec<_>, Vec<_>) = detections.into_iter().map(|(b, s, c)| (b, (s, c))).unzip();
        let (scores, pred_classes) = rest.into_iter().unzip();

        Instances::new(size, pred_boxes, scores, pred_classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use tribranch_core::GtFields;

    fn head(num_classes: usize, vb: VarBuilder) -> Result<FastRcnnBoxHead> {
        let config = BoxHeadConfig {
            fc_dim: 16,
            ..Default::default()
        };
        FastRcnnBoxHead::new(8 * 2 * 2, num_classes, &config, vb)
    }

    #[test]
    fn test_encode_decode_inverse() {
        let transform = BoxTransform::new([10.0, 10.0, 5.0, 5.0]);
        let src = BoundingBox::new(10.0, 20.0, 50.0, 60.0);
        let target = BoundingBox::new(12.0, 18.0, 70.0, 55.0);

        let deltas = transform.encode(&src, &target);
        let decoded = transform.decode(&deltas, &src);

        for (a, b) in decoded.to_array().iter().zip(target.to_array()) {
            assert!((a - b).abs() < 1e-3);
        }
        assert_eq!(transform.encode(&src, &src), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_decode_clamps_scale() {
        let transform = BoxTransform::new([1.0, 1.0, 1.0, 1.0]);
        let src = BoundingBox::new(0.0, 0.0, 1.0, 1.0);

        let decoded = transform.decode(&[0.0, 0.0, 100.0, 100.0], &src);

        assert!((decoded.width() - 1000.0 / 16.0).abs() < 1e-2);
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let head = head(3, vb)?;
        let features = Tensor::randn(0f32, 1.0, (5, 8, 2, 2), &device)?;
        let out = head.forward(&features)?;

        assert_eq!(out.scores.dims(), &[5, 4]);
        assert_eq!(out.deltas.dims(), &[5, 12]);
        Ok(())
    }

    #[test]
    fn test_losses_are_finite() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = head(3, vb)?;

        let gt = BoundingBox::new(4.0, 4.0, 20.0, 20.0);
        let proposals = vec![LabeledProposals {
            image_size: ImageSize::new(32, 32),
            proposal_boxes: vec![BoundingBox::new(5.0, 5.0, 21.0, 19.0), BoundingBox::new(0.0, 0.0, 8.0, 8.0)],
            objectness_logits: vec![0.0; 2],
            gt_classes: vec![1, 3],
            gt_boxes: vec![gt, BoundingBox::zero()],
            gt_fields: GtFields::new(),
        }];

        let features = Tensor::randn(0f32, 1.0, (2, 8, 2, 2), &device)?;
        let predictions = head.forward(&features)?;
        let (loss_cls, loss_box_reg) = head.losses(&predictions, &proposals)?;

        let cls: f32 = loss_cls.to_scalar()?;
        let reg: f32 = loss_box_reg.to_scalar()?;
        assert!(cls.is_finite() && cls > 0.0);
        assert!(reg.is_finite() && reg >= 0.0);
        Ok(())
    }

    #[test]
    fn test_inference_per_class_nms() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = head(2, vb)?;

        // Three proposals; the first two overlap heavily. Zero deltas keep the
        // proposal boxes.
        let proposals = vec![Proposals::new(
            ImageSize::new(64, 64),
            vec![
                BoundingBox::new(0.0, 0.0, 20.0, 20.0),
                BoundingBox::new(1.0, 1.0, 21.0, 21.0),
                BoundingBox::new(40.0, 40.0, 60.0, 60.0),
            ],
            vec![0.0; 3],
        )?];
        let scores = Tensor::new(&[[4.0f32, 0.0, 0.0], [3.0, 0.0, 0.0], [0.0, 5.0, 0.0]], &device)?;
        let deltas = Tensor::zeros((3, 8), DType::F32, &device)?;
        let predictions = BoxPredictions { scores, deltas };
        let params = BoxInferenceParams {
            score_thresh: 0.5,
            nms_thresh: 0.5,
            detections_per_image: 10,
        };

        let instances = head.inference(&predictions, &proposals, &params)?;

        let image = &instances[0];
        assert_eq!(image.len(), 2);
        assert_eq!(image.pred_classes, vec![1, 0]);
        assert_eq!(image.pred_boxes[1], BoundingBox::new(0.0, 0.0, 20.0, 20.0));
        assert!(image.scores.windows(2).all(|w| w[0] >= w[1]));
        Ok(())
    }

    #[test]
    fn test_inference_without_proposals() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = head(2, vb)?;

        let predictions = BoxPredictions {
            scores: Tensor::zeros((0, 3), DType::F32, &device)?,
            deltas: Tensor::zeros((0, 8), DType::F32, &device)?,
        };
        let proposals = vec![Proposals::new(ImageSize::new(8, 8), vec![], vec![])?];
        let params = BoxInferenceParams {
            score_thresh: 0.05,
            nms_thresh: 0.5,
            detections_per_image: 100,
        };

        let instances = head.inference(&predictions, &proposals, &params)?;
        assert!(instances[0].is_empty());
        Ok(())
    }
}
