//! Multi-level ROI Align pooling.
//!
//! Each box is pooled from the single pyramid level matching its scale,
//! `floor(canonical_level + log2(sqrt(area) / canonical_box_size))`, clamped
//! to the levels available.

use candle_core::{DType, Tensor};
use tribranch_core::{roi_align_plane, BoundingBox, Error, Result, RoiAlignParams};

/// Canonical box size assigned to `CANONICAL_LEVEL`
pub const CANONICAL_BOX_SIZE: f64 = 224.0;
/// Pyramid level of a canonical box
pub const CANONICAL_LEVEL: i32 = 4;

/// Pools fixed-size region features from a feature pyramid
pub trait RoiPooler {
    /// Side length of the pooled features
    fn output_size(&self) -> usize;

    /// Pool every box of every image.
    ///
    /// # Arguments
    /// * `features` - One `[N, C, H, W]` tensor per level, finest first
    /// * `boxes` - Boxes per image in image coordinates
    ///
    /// # Returns
    /// `[R, C, S, S]` where `R` is the total box count, images concatenated in order
    fn pool(&self, features: &[Tensor], boxes: &[Vec<BoundingBox>]) -> Result<Tensor>;
}

/// ROI Align over a pyramid with power-of-two strides
#[derive(Debug, Clone)]
pub struct MultiLevelRoiAlign {
    output_size: usize,
    scales: Vec<f32>,
    sampling_ratio: usize,
    min_level: i32,
    max_level: i32,
}

impl MultiLevelRoiAlign {
    /// # Arguments
    /// * `output_size` - Pooled side length
    /// * `scales` - `1 / stride` of each level, finest first
    /// * `sampling_ratio` - Samples per bin along each axis (0 = adaptive)
    pub fn new(output_size: usize, scales: &[f32], sampling_ratio: usize) -> Result<Self> {
        if output_size == 0 {
            return Err(Error::Config("pooler output size must be positive".into()));
        }
        let (first, last) = match (scales.first(), scales.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return Err(Error::Config("pooler needs at least one level".into())),
        };

        let level_of = |scale: f32| -> Result<i32> {
            let level = -(scale as f64).log2();
            if scale <= 0.0 || (level - level.round()).abs() > 1e-6 {
                return Err(Error::Config(format!(
                    "pooler scale {scale} is not a power of two"
                )));
            }
            Ok(level.round() as i32)
        };
        let min_level = level_of(first)?;
        let max_level = level_of(last)?;

        if (max_level - min_level + 1) as usize != scales.len() {
            return Err(Error::Config(format!(
                "pooler scales {scales:?} do not form a contiguous pyramid"
            )));
        }

        Ok(Self {
            output_size,
            scales: scales.to_vec(),
            sampling_ratio,
            min_level,
            max_level,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.scales.len()
    }

    /// Index into the pyramid of the level a box is pooled from
    pub fn assign_level(&self, bbox: &BoundingBox) -> usize {
        let size = (bbox.area() as f64).sqrt();
        let level = (CANONICAL_LEVEL as f64 + (size / CANONICAL_BOX_SIZE + 1e-8).log2()).floor();
        let level = (level as i32).clamp(self.min_level, self.max_level);
        (level - self.min_level) as usize
    }
}

impl RoiPooler for MultiLevelRoiAlign {
    fn output_size(&self) -> usize {
        self.output_size
    }

    fn pool(&self, features: &[Tensor], boxes: &[Vec<BoundingBox>]) -> Result<Tensor> {
        if features.len() != self.scales.len() {
            return Err(Error::shape_mismatch(
                "pooler feature levels",
                self.scales.len(),
                features.len(),
            ));
        }

        let (batch, channels, _, _) = features[0].dims4()?;
        if boxes.len() != batch {
            return Err(Error::shape_mismatch("pooler images", batch, boxes.len()));
        }

        let out = self.output_size;
        let dtype = features[0].dtype();
        let device = features[0].device();
        let total: usize = boxes.iter().map(Vec::len).sum();

        if total == 0 {
            return Ok(Tensor::zeros((0, channels, out, out), dtype, device)?);
        }

        let mut levels = Vec::with_capacity(features.len());
        for (i, level) in features.iter().enumerate() {
            let (n, c, h, w) = level.dims4()?;
            if n != batch || c != channels {
                return Err(Error::shape_mismatch(
                    format!("pyramid level {i} [N, C]"),
                    batch * channels,
                    n * c,
                ));
            }
            let data = level.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            levels.push((data, h, w));
        }

        let mut pooled = Vec::with_capacity(total * channels * out * out);

        for (image, image_boxes) in boxes.iter().enumerate() {
            for bbox in image_boxes {
                let level = self.assign_level(bbox);
                let (data, h, w) = &levels[level];
                let params = RoiAlignParams {
                    output_size: out,
                    spatial_scale: self.scales[level],
                    sampling_ratio: self.sampling_ratio,
                    aligned: true,
                };

                let hw = h * w;
                for c in 0..channels {
                    let offset = (image * channels + c) * hw;
                    let plane = &data[offset..offset + hw];
                    pooled.extend(roi_align_plane(plane, *h, *w, bbox, &params));
                }
            }
        }

        let pooled = Tensor::from_vec(pooled, (total, channels, out, out), device)?;
        Ok(pooled.to_dtype(dtype)?)
    }
}
