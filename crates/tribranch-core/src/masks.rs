//! Per-object binary masks at source resolution.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{roi_align_plane, BoundingBox, RoiAlignParams};

/// `n` binary masks of `height × width`, stored row-major and contiguous
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitMasks {
    height: usize,
    width: usize,
    data: Vec<u8>,
}

impl BitMasks {
    /// Build from a flat `n × height × width` buffer of 0/1 values.
    pub fn new(height: usize, width: usize, data: Vec<u8>) -> Result<Self> {
        let plane = height * width;
        if plane == 0 {
            if !data.is_empty() {
                return Err(Error::InvalidInput(
                    "mask data supplied for a zero-sized mask plane".to_string(),
                ));
            }
        } else if data.len() % plane != 0 {
            return Err(Error::shape_mismatch(
                "mask buffer length (multiple of height*width)",
                (data.len() / plane + 1) * plane,
                data.len(),
            ));
        }

        Ok(Self {
            height,
            width,
            data: data.into_iter().map(|v| u8::from(v != 0)).collect(),
        })
    }

    pub fn empty(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: Vec::new(),
        }
    }

    /// Rasterise axis-aligned boxes into filled masks.
    pub fn from_boxes(boxes: &[BoundingBox], height: usize, width: usize) -> Self {
        let mut data = vec![0u8; boxes.len() * height * width];
        for (i, b) in boxes.iter().enumerate() {
            let plane = &mut data[i * height * width..(i + 1) * height * width];
            let y0 = b.y1.max(0.0).floor() as usize;
            let x0 = b.x1.max(0.0).floor() as usize;
            let y1 = (b.y2.ceil().max(0.0) as usize).min(height);
            let x1 = (b.x2.ceil().max(0.0) as usize).min(width);
            for y in y0..y1 {
                for x in x0..x1 {
                    plane[y * width + x] = 1;
                }
            }
        }

        Self {
            height,
            width,
            data,
        }
    }

    pub fn len(&self) -> usize {
        let plane = self.height * self.width;
        if plane == 0 {
            0
        } else {
            self.data.len() / plane
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Borrow mask `i` as a flat plane
    pub fn mask(&self, i: usize) -> &[u8] {
        let plane = self.height * self.width;
        &self.data[i * plane..(i + 1) * plane]
    }

    /// Gather masks by index (indices may repeat)
    pub fn select(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.height * self.width);
        for &i in indices {
            data.extend_from_slice(self.mask(i));
        }

        Self {
            height: self.height,
            width: self.width,
            data,
        }
    }

    /// Crop each mask to its box and resample to `side × side`.
    ///
    /// Mask `i` is cropped with `boxes[i]`; the aligned ROI Align result is
    /// binarised at 0.5.
    ///
    /// # Returns
    /// Flat `n × side × side` buffer of 0.0/1.0 values.
    pub fn crop_and_resize(&self, boxes: &[BoundingBox], side: usize) -> Result<Vec<f32>> {
        if boxes.len() != self.len() {
            return Err(Error::shape_mismatch(
                "boxes vs masks in crop_and_resize",
                self.len(),
                boxes.len(),
            ));
        }

        let params = RoiAlignParams {
            output_size: side,
            spatial_scale: 1.0,
            sampling_ratio: 0,
            aligned: true,
        };

        let mut out = Vec::with_capacity(boxes.len() * side * side);
        for (i, bbox) in boxes.iter().enumerate() {
            let plane: Vec<f32> = self.mask(i).iter().map(|&v| v as f32).collect();
            let resized = roi_align_plane(&plane, self.height, self.width, bbox, &params);
            out.extend(resized.into_iter().map(|v| if v >= 0.5 { 1.0 } else { 0.0 }));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_ragged_buffer() {
        assert!(BitMasks::new(2, 2, vec![1; 5]).is_err());
        assert_eq!(BitMasks::new(2, 2, vec![1; 8]).unwrap().len(), 2);
    }

    #[test]
    fn test_select_repeats() {
        let masks = BitMasks::new(1, 2, vec![1, 0, 0, 1]).unwrap();
        let picked = masks.select(&[1, 1, 0]);

        assert_eq!(picked.len(), 3);
        assert_eq!(picked.mask(0), &[0, 1]);
        assert_eq!(picked.mask(2), &[1, 0]);
    }

    #[test]
    fn test_crop_and_resize_full_box() {
        let b = BoundingBox::new(2.0, 2.0, 6.0, 6.0);
        let masks = BitMasks::from_boxes(&[b], 8, 8);

        let crop = masks.crop_and_resize(&[b], 4).unwrap();
        assert_eq!(crop.len(), 16);
        assert!(crop.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_crop_and_resize_half_box() {
        // Object covers the left half of the crop window
        let object = BoundingBox::new(0.0, 0.0, 4.0, 8.0);
        let masks = BitMasks::from_boxes(&[object], 8, 8);

        let window = BoundingBox::new(0.0, 0.0, 8.0, 8.0);
        let crop = masks.crop_and_resize(&[window], 2).unwrap();

        assert_eq!(crop, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_crop_and_resize_length_mismatch() {
        let masks = BitMasks::empty(4, 4);
        let err = masks
            .crop_and_resize(&[BoundingBox::new(0.0, 0.0, 1.0, 1.0)], 2)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
