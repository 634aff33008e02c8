//! IoU-based assignment of proposals to ground-truth objects.

use tribranch_core::{Error, Result};

/// Outcome of matching one proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchLabel {
    /// Below the low threshold
    Background,
    /// Between the thresholds; excluded from sampling
    Ignore,
    /// At or above the high threshold
    Foreground,
}

impl MatchLabel {
    pub fn from_code(code: i8) -> Result<Self> {
        match code {
            0 => Ok(MatchLabel::Background),
            -1 => Ok(MatchLabel::Ignore),
            1 => Ok(MatchLabel::Foreground),
            other => Err(Error::Config(format!(
                "matcher labels must be -1, 0 or 1, got {other}"
            ))),
        }
    }

    pub fn code(&self) -> i8 {
        match self {
            MatchLabel::Background => 0,
            MatchLabel::Ignore => -1,
            MatchLabel::Foreground => 1,
        }
    }
}

/// Per-proposal match of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Best ground-truth index for each proposal (0 when there is none)
    pub matched_idxs: Vec<usize>,
    pub matched_labels: Vec<MatchLabel>,
}

impl MatchResult {
    pub fn len(&self) -> usize {
        self.matched_idxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matched_idxs.is_empty()
    }
}

/// Assigns each proposal its best ground truth and a label from the interval
/// its IoU falls in.
///
/// With thresholds `[t1, ..., tk]` the intervals are `[-inf, t1)`,
/// `[t1, t2)`, ..., `[tk, +inf)` and `labels[i]` is the label of interval `i`.
#[derive(Debug, Clone)]
pub struct Matcher {
    thresholds: Vec<f32>,
    labels: Vec<MatchLabel>,
    allow_low_quality_matches: bool,
}

impl Matcher {
    pub fn new(thresholds: &[f32], labels: &[i8], allow_low_quality_matches: bool) -> Result<Self> {
        if thresholds.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Config(format!(
                "matcher thresholds must be ascending, got {thresholds:?}"
            )));
        }
        if thresholds.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(Error::Config(format!(
                "matcher thresholds must be finite and non-negative, got {thresholds:?}"
            )));
        }
        if labels.len() != thresholds.len() + 1 {
            return Err(Error::Config(format!(
                "matcher needs {} labels for {} thresholds, got {}",
                thresholds.len() + 1,
                thresholds.len(),
                labels.len()
            )));
        }

        let labels = labels
            .iter()
            .map(|&c| MatchLabel::from_code(c))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            thresholds: thresholds.to_vec(),
            labels,
            allow_low_quality_matches,
        })
    }

    /// The two-threshold matcher used by the ROI heads: background below
    /// `low`, ignore in `[low, high)`, foreground from `high`.
    pub fn two_threshold(low: f32, high: f32) -> Result<Self> {
        Self::new(&[low, high], &[0, -1, 1], false)
    }

    fn label_for(&self, iou: f32) -> MatchLabel {
        let interval = self.thresholds.iter().take_while(|&&t| iou >= t).count();
        self.labels[interval]
    }

    /// Match an `M × N` IoU matrix (ground truth × proposals).
    ///
    /// # Arguments
    /// * `quality` - Row `i` holds the IoU of ground truth `i` with every proposal
    /// * `num_proposals` - `N`, needed when `M = 0`
    pub fn matches(&self, quality: &[Vec<f32>], num_proposals: usize) -> Result<MatchResult> {
        if let Some((row, bad)) = quality
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != num_proposals)
        {
            return Err(Error::shape_mismatch(
                format!("IoU matrix row {row}"),
                num_proposals,
                bad.len(),
            ));
        }

        if quality.is_empty() {
            return Ok(MatchResult {
                matched_idxs: vec![0; num_proposals],
                matched_labels: vec![MatchLabel::Background; num_proposals],
            });
        }

        let mut matched_idxs = Vec::with_capacity(num_proposals);
        let mut matched_vals = Vec::with_capacity(num_proposals);
        for j in 0..num_proposals {
            let mut best = 0;
            let mut best_val = quality[0][j];
            for (i, row) in quality.iter().enumerate().skip(1) {
                if row[j] > best_val {
                    best = i;
                    best_val = row[j];
                }
            }
            matched_idxs.push(best);
            matched_vals.push(best_val);
        }

        let mut matched_labels: Vec<MatchLabel> =
            matched_vals.iter().map(|&v| self.label_for(v)).collect();

        if self.allow_low_quality_matches {
            self.set_low_quality_matches(quality, &mut matched_labels);
        }

        Ok(MatchResult {
            matched_idxs,
            matched_labels,
        })
    }

    /// Promote every proposal that ties for a ground truth's best IoU.
    fn set_low_quality_matches(&self, quality: &[Vec<f32>], labels: &mut [MatchLabel]) {
        for row in quality {
            let best = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            for (j, &v) in row.iter().enumerate() {
                if v == best {
                    labels[j] = MatchLabel::Foreground;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_threshold_boundaries() -> Result<()> {
        let matcher = Matcher::two_threshold(0.3, 0.5)?;
        let quality = vec![vec![0.29, 0.3, 0.49, 0.5, 0.9]];

        let result = matcher.matches(&quality, 5)?;

        assert_eq!(
            result.matched_labels,
            vec![
                MatchLabel::Background,
                MatchLabel::Ignore,
                MatchLabel::Ignore,
                MatchLabel::Foreground,
                MatchLabel::Foreground,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_best_ground_truth_wins() -> Result<()> {
        let matcher = Matcher::two_threshold(0.3, 0.5)?;
        let quality = vec![vec![0.2, 0.7], vec![0.6, 0.7]];

        let result = matcher.matches(&quality, 2)?;

        assert_eq!(result.matched_idxs, vec![1, 0]);
        assert_eq!(result.matched_labels, vec![MatchLabel::Foreground; 2]);
        Ok(())
    }

    #[test]
    fn test_no_ground_truth_is_background() -> Result<()> {
        let matcher = Matcher::two_threshold(0.3, 0.5)?;

        let result = matcher.matches(&[], 4)?;

        assert_eq!(result.matched_idxs, vec![0; 4]);
        assert_eq!(result.matched_labels, vec![MatchLabel::Background; 4]);
        Ok(())
    }

    #[test]
    fn test_low_quality_matches() -> Result<()> {
        let matcher = Matcher::new(&[0.3, 0.7], &[0, -1, 1], true)?;
        let quality = vec![vec![0.1, 0.4, 0.4]];

        let result = matcher.matches(&quality, 3)?;

        assert_eq!(
            result.matched_labels,
            vec![MatchLabel::Background, MatchLabel::Foreground, MatchLabel::Foreground]
        );
        Ok(())
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(Matcher::new(&[0.5, 0.3], &[0, -1, 1], false).is_err());
        assert!(Matcher::new(&[0.5], &[0, -1, 1], false).is_err());
        assert!(Matcher::new(&[0.5], &[0, 2], false).is_err());
    }

    #[test]
    fn test_ragged_matrix_rejected() {
        let matcher = Matcher::two_threshold(0.3, 0.5).unwrap();
        let err = matcher.matches(&[vec![0.1, 0.2]], 3).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 3, actual: 2, .. }));
    }
}
