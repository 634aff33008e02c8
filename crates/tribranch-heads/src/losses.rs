//! Mask and box losses shared by the branches.
//!
//! Binary cross-entropy on probabilities clamps its logarithms at -100 so a
//! hard 0/1 disagreement costs exactly 100 per element.

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::sigmoid;
use tribranch_core::{Error, GtField, LabeledProposals, Result};

/// Lower bound applied to `log(p)` and `log(1 - p)`
pub const LOG_CLAMP: f64 = -100.0;

/// Fail with [`Error::ShapeMismatch`] on the first axis where two paired
/// tensors disagree
pub fn ensure_same_shape(what: &str, expected: &Tensor, actual: &Tensor) -> Result<()> {
    let (expected, actual) = (expected.dims(), actual.dims());
    if expected.len() != actual.len() {
        return Err(Error::shape_mismatch(format!("{what} (rank)"), expected.len(), actual.len()));
    }
    match expected.iter().zip(actual).position(|(e, a)| e != a) {
        Some(axis) => Err(Error::shape_mismatch(
            format!("{what} (dim {axis})"),
            expected[axis],
            actual[axis],
        )),
        None => Ok(()),
    }
}

/// Scalar zero on `device`, used for losses over empty region sets
pub fn zero_loss(device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((), DType::F32, device)?)
}

/// Mean binary cross-entropy with logits, numerically stable form
/// `max(x, 0) - x * y + log(1 + exp(-|x|))`
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let positive = logits.relu()?;
    let cross = (logits * targets)?;
    let soft = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;

    Ok(((positive - cross)? + soft)?.mean_all()?)
}

/// Mean binary cross-entropy between probabilities and targets
pub fn binary_cross_entropy(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    ensure_same_shape("binary cross-entropy input vs target", target, input)?;

    let log_p = input.log()?.clamp(LOG_CLAMP, 0.0)?;
    let log_not_p = (1.0 - input)?.log()?.clamp(LOG_CLAMP, 0.0)?;

    let loss = ((target * log_p)? + ((1.0 - target)? * log_not_p)?)?.neg()?;
    Ok(loss.mean_all()?)
}

/// Element-wise smooth-L1; plain L1 when `beta` is (near) zero
pub fn smooth_l1(pred: &Tensor, target: &Tensor, beta: f64) -> Result<Tensor> {
    let diff = (pred - target)?;
    let abs_diff = diff.abs()?;

    if beta < 1e-5 {
        return Ok(abs_diff);
    }

    // 0.5 * x² / beta if |x| < beta, else |x| - 0.5 * beta
    let squared = ((&diff * &diff)? * (0.5 / beta))?;
    let linear = (&abs_diff - 0.5 * beta)?;

    let mask = abs_diff.lt(beta)?;
    Ok(mask.where_cond(&squared, &linear)?)
}

/// Pick the logit channel of each region's class.
///
/// # Arguments
/// * `logits` - `[R, K, M, M]`
/// * `classes` - One class per region; ignored when `K == 1`
///
/// # Returns
/// `[R, 1, M, M]`
pub fn select_class_channel(logits: &Tensor, classes: &[i64]) -> Result<Tensor> {
    let (r, k, h, w) = logits.dims4()?;
    if k == 1 {
        return Ok(logits.clone());
    }
    if classes.len() != r {
        return Err(Error::shape_mismatch("classes vs mask logits", r, classes.len()));
    }

    let mut rows = Vec::with_capacity(r);
    for (i, &c) in classes.iter().enumerate() {
        if c < 0 || c as usize >= k {
            return Err(Error::InvalidInput(format!(
                "class {c} outside the {k} mask channels"
            )));
        }
        rows.push((i * k) as u32 + c as u32);
    }
    let rows = Tensor::from_vec(rows, r, logits.device())?;

    Ok(logits
        .reshape((r * k, h * w))?
        .index_select(&rows, 0)?
        .reshape((r, 1, h, w))?)
}

/// Mask R-CNN loss of one branch: BCE with logits between the class channel
/// of each region and its ground-truth mask cropped to the region box.
///
/// # Arguments
/// * `pred_mask_logits` - `[R, K, M, M]` for the concatenated foreground regions
/// * `instances` - Foreground proposals of every image, in pooling order
/// * `field` - Ground-truth mask field supervising the branch
pub fn mask_rcnn_loss(
    pred_mask_logits: &Tensor,
    instances: &[LabeledProposals],
    field: &GtField,
) -> Result<Tensor> {
    let (r, _, side, side_w) = pred_mask_logits.dims4()?;
    if side != side_w {
        return Err(Error::InvalidInput(format!(
            "mask predictions must be square, got {side}x{side_w}"
        )));
    }

    let total: usize = instances.iter().map(LabeledProposals::len).sum();
    if total != r {
        return Err(Error::shape_mismatch("mask logits vs foreground proposals", total, r));
    }
    if r == 0 {
        return zero_loss(pred_mask_logits.device());
    }

    let mut gt = Vec::with_capacity(r * side * side);
    let mut classes = Vec::with_capacity(r);
    for image in instances.iter().filter(|p| !p.is_empty()) {
        let masks = image
            .gt_fields
            .get(field)
            .and_then(|v| v.as_masks())
            .ok_or_else(|| Error::MissingField(field.to_string()))?;
        gt.extend(masks.crop_and_resize(&image.proposal_boxes, side)?);
        classes.extend_from_slice(&image.gt_classes);
    }

    let logits = select_class_channel(pred_mask_logits, &classes)?;
    let gt = Tensor::from_vec(gt, (r, 1, side, side), pred_mask_logits.device())?
        .to_dtype(logits.dtype())?;

    bce_with_logits(&logits, &gt)
}

/// Mask probabilities of each region's predicted class, `[R, 1, M, M]`
pub fn mask_rcnn_inference(pred_mask_logits: &Tensor, classes: &[i64]) -> Result<Tensor> {
    let logits = select_class_channel(pred_mask_logits, classes)?;
    Ok(sigmoid(&logits)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribranch_core::{BitMasks, BoundingBox, GtFields, GtValue, ImageSize};

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_bce_with_logits_matches_definition() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0.0f32, 2.0, -3.0], &device)?;
        let targets = Tensor::new(&[1.0f32, 0.0, 0.0], &device)?;

        let loss = scalar(&bce_with_logits(&logits, &targets)?);

        let expected = [
            (1.0f32 + (-0.0f32).exp()).ln(),
            (1.0f32 + 2.0f32.exp()).ln(),
            (1.0f32 + (-3.0f32).exp()).ln(),
        ];
        let expected = expected.iter().sum::<f32>() / 3.0;
        assert!((loss - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_bce_hard_disagreement_is_clamped() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::new(&[0.0f32, 1.0, 1.0, 0.0], &device)?;
        let target = Tensor::new(&[1.0f32, 0.0, 1.0, 0.0], &device)?;

        let loss = scalar(&binary_cross_entropy(&input, &target)?);

        assert!((loss - 50.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_bce_shape_mismatch_names_axis() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::zeros((3, 1, 4, 4), DType::F32, &device)?;
        let target = Tensor::zeros((3, 1, 8, 8), DType::F32, &device)?;

        let err = binary_cross_entropy(&input, &target).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch { ref what, expected: 8, actual: 4 } if what.contains("dim 2")
        ));
        Ok(())
    }

    #[test]
    fn test_smooth_l1() -> Result<()> {
        let device = Device::Cpu;

        let pred = Tensor::new(&[[0.0f32, 0.5, 2.0]], &device)?;
        let target = Tensor::new(&[[0.0f32, 0.0, 0.0]], &device)?;

        let loss = smooth_l1(&pred, &target, 1.0)?;
        let values: Vec<f32> = loss.flatten_all()?.to_vec1()?;

        // Quadratic below beta, linear above
        assert!(values[0].abs() < 1e-6);
        assert!((values[1] - 0.125).abs() < 1e-6);
        assert!((values[2] - 1.5).abs() < 1e-6);

        let l1: Vec<f32> = smooth_l1(&pred, &target, 0.0)?.flatten_all()?.to_vec1()?;
        assert_eq!(l1, vec![0.0, 0.5, 2.0]);
        Ok(())
    }

    #[test]
    fn test_select_class_channel() -> Result<()> {
        let device = Device::Cpu;
        // Two regions, three classes, 1x1 masks; value = 10 * region + class
        let logits = Tensor::new(&[0.0f32, 1.0, 2.0, 10.0, 11.0, 12.0], &device)?.reshape((2, 3, 1, 1))?;

        let picked = select_class_channel(&logits, &[2, 0])?;

        assert_eq!(picked.dims(), &[2, 1, 1, 1]);
        assert_eq!(picked.flatten_all()?.to_vec1::<f32>()?, vec![2.0, 10.0]);
        assert!(select_class_channel(&logits, &[3, 0]).is_err());
        Ok(())
    }

    fn foreground(boxes: Vec<BoundingBox>, classes: Vec<i64>, masks: BitMasks) -> LabeledProposals {
        let n = boxes.len();
        let mut fields = GtFields::new();
        fields.insert(GtField::masks(), GtValue::Masks(masks), n).unwrap();
        LabeledProposals {
            image_size: ImageSize::new(8, 8),
            proposal_boxes: boxes.clone(),
            objectness_logits: vec![0.0; n],
            gt_classes: classes,
            gt_boxes: boxes,
            gt_fields: fields,
        }
    }

    #[test]
    fn test_mask_loss_confident_match_is_small() -> Result<()> {
        let device = Device::Cpu;
        let b = BoundingBox::new(2.0, 2.0, 6.0, 6.0);
        let image = foreground(vec![b], vec![1], BitMasks::from_boxes(&[b], 8, 8));

        // Class 1 is confidently foreground everywhere, class 0 confidently background
        let class0 = Tensor::full(-20f32, (1, 1, 4, 4), &device)?;
        let class1 = Tensor::full(20f32, (1, 1, 4, 4), &device)?;
        let logits = Tensor::cat(&[&class0, &class1], 1)?;

        let loss = scalar(&mask_rcnn_loss(&logits, &[image.clone()], &GtField::masks())?);
        assert!(loss < 1e-6);

        let wrong = Tensor::cat(&[&class1, &class0], 1)?;
        let loss = scalar(&mask_rcnn_loss(&wrong, &[image], &GtField::masks())?);
        assert!((loss - 20.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_mask_loss_missing_field() {
        let device = Device::Cpu;
        let b = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
        let image = foreground(vec![b], vec![0], BitMasks::from_boxes(&[b], 8, 8));
        let logits = Tensor::zeros((1, 1, 4, 4), DType::F32, &device).unwrap();

        let err = mask_rcnn_loss(&logits, &[image], &GtField::overlapping_masks()).unwrap_err();
        assert!(matches!(err, Error::MissingField(name) if name == "gt_overlapping_masks"));
    }

    #[test]
    fn test_mask_loss_no_regions() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((0, 3, 4, 4), DType::F32, &device)?;

        let loss = mask_rcnn_loss(&logits, &[], &GtField::masks())?;

        assert_eq!(scalar(&loss), 0.0);
        Ok(())
    }

    #[test]
    fn test_mask_inference_probabilities() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 4, 4), DType::F32, &device)?;

        let probs = mask_rcnn_inference(&logits, &[0, 2])?;

        assert_eq!(probs.dims(), &[2, 1, 4, 4]);
        let values: Vec<f32> = probs.flatten_all()?.to_vec1()?;
        assert!(values.iter().all(|v| (v - 0.5).abs() < 1e-6));
        Ok(())
    }
}
