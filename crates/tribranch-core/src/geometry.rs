//! Geometric utilities for axis-aligned boxes.

use serde::{Deserialize, Serialize};

/// Image extent in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
}

impl ImageSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

/// Axis-aligned box in absolute XYXY pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// The all-zero box used as a placeholder target for unmatched images.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// A box with no positive extent on either axis
    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    /// Clip the box to lie within the image
    pub fn clip(&self, size: ImageSize) -> Self {
        let w = size.width as f32;
        let h = size.height as f32;
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn from_array(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// Intersection over union of two boxes
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = iw * ih;

    if intersection <= 0.0 {
        return 0.0;
    }

    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Pairwise IoU between two box sets.
///
/// # Returns
/// Row-major `M × N` matrix where `out[i][j]` is the IoU of `boxes1[i]` and
/// `boxes2[j]`. Either side may be empty.
pub fn pairwise_iou(boxes1: &[BoundingBox], boxes2: &[BoundingBox]) -> Vec<Vec<f32>> {
    boxes1
        .iter()
        .map(|a| boxes2.iter().map(|b| iou(a, b)).collect())
        .collect()
}

/// Non-Maximum Suppression over scored boxes.
///
/// Returns the indices of kept boxes ordered by decreasing score.
pub fn nms(boxes: &[BoundingBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; order.len()];

    for i in 0..order.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(order[i]);

        for j in (i + 1)..order.len() {
            if suppressed[j] {
                continue;
            }

            if iou(&boxes[order[i]], &boxes[order[j]]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Bilinear lookup into a single `height × width` plane, zero outside the
/// one-pixel border.
pub fn bilinear_sample(plane: &[f32], height: usize, width: usize, y: f32, x: f32) -> f32 {
    if height == 0 || width == 0 {
        return 0.0;
    }
    if y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
        return 0.0;
    }

    let y = y.max(0.0);
    let x = x.max(0.0);

    let mut y_low = y as usize;
    let mut x_low = x as usize;
    let (y_high, y) = if y_low >= height - 1 {
        y_low = height - 1;
        (y_low, y_low as f32)
    } else {
        (y_low + 1, y)
    };
    let (x_high, x) = if x_low >= width - 1 {
        x_low = width - 1;
        (x_low, x_low as f32)
    } else {
        (x_low + 1, x)
    };

    let ly = y - y_low as f32;
    let lx = x - x_low as f32;
    let hy = 1.0 - ly;
    let hx = 1.0 - lx;

    hy * hx * plane[y_low * width + x_low]
        + hy * lx * plane[y_low * width + x_high]
        + ly * hx * plane[y_high * width + x_low]
        + ly * lx * plane[y_high * width + x_high]
}

/// Parameters for ROI Align over a single plane
#[derive(Debug, Clone, Copy)]
pub struct RoiAlignParams {
    /// Output side length
    pub output_size: usize,
    /// Feature size / image size
    pub spatial_scale: f32,
    /// Samples per bin along each axis (0 = adaptive)
    pub sampling_ratio: usize,
    /// Half-pixel aligned coordinates
    pub aligned: bool,
}

/// ROI Align of one box over one `height × width` plane.
///
/// # Returns
/// Row-major `output_size × output_size` bin averages.
pub fn roi_align_plane(
    plane: &[f32],
    height: usize,
    width: usize,
    bbox: &BoundingBox,
    params: &RoiAlignParams,
) -> Vec<f32> {
    let out = params.output_size;
    let offset = if params.aligned { 0.5 } else { 0.0 };

    let start_x = bbox.x1 * params.spatial_scale - offset;
    let start_y = bbox.y1 * params.spatial_scale - offset;
    let mut roi_w = bbox.x2 * params.spatial_scale - offset - start_x;
    let mut roi_h = bbox.y2 * params.spatial_scale - offset - start_y;
    if !params.aligned {
        roi_w = roi_w.max(1.0);
        roi_h = roi_h.max(1.0);
    }

    let bin_w = roi_w / out as f32;
    let bin_h = roi_h / out as f32;

    let grid_h = if params.sampling_ratio > 0 {
        params.sampling_ratio
    } else {
        (roi_h / out as f32).ceil().max(0.0) as usize
    };
    let grid_w = if params.sampling_ratio > 0 {
        params.sampling_ratio
    } else {
        (roi_w / out as f32).ceil().max(0.0) as usize
    };
    let count = (grid_h * grid_w).max(1) as f32;

    let mut output = Vec::with_capacity(out * out);
    for ph in 0..out {
        for pw in 0..out {
            let mut sum = 0.0f32;
            for iy in 0..grid_h {
                let y = start_y + ph as f32 * bin_h + (iy as f32 + 0.5) * bin_h / grid_h as f32;
                for ix in 0..grid_w {
                    let x =
                        start_x + pw as f32 * bin_w + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                    sum += bilinear_sample(plane, height, width, y, x);
                }
            }
            output.push(sum / count);
        }
    }

    output
}
