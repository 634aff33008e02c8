//! Class-balanced subsampling of labeled proposals.

use rand::seq::index;
use rand::Rng;

/// Foreground/background sampler.
///
/// Draws uniformly without replacement inside each pool rather than taking
/// the top-k, so the batch is not biased towards the highest-IoU proposals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposalSampler {
    /// Total samples per image
    pub batch_size: usize,
    /// Upper bound on the foreground share
    pub positive_fraction: f32,
}

impl ProposalSampler {
    pub fn new(batch_size: usize, positive_fraction: f32) -> Self {
        Self {
            batch_size,
            positive_fraction,
        }
    }

    /// Largest number of foreground samples the budget allows
    pub fn positive_budget(&self) -> usize {
        (self.batch_size as f32 * self.positive_fraction).round() as usize
    }

    /// Sample indices of foreground and background proposals.
    ///
    /// # Arguments
    /// * `labels` - Resolved class per proposal; `-1` is ignored
    /// * `bg_label` - Background class; labels in `[0, bg_label)` are foreground
    /// * `rng` - Source of the without-replacement draws
    ///
    /// # Returns
    /// `(fg_indices, bg_indices)` into `labels`
    pub fn sample<R: Rng + ?Sized>(
        &self,
        labels: &[i64],
        bg_label: i64,
        rng: &mut R,
    ) -> (Vec<usize>, Vec<usize>) {
        let positives: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l >= 0 && l < bg_label)
            .map(|(i, _)| i)
            .collect();
        let negatives: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == bg_label)
            .map(|(i, _)| i)
            .collect();

        let num_pos = self.positive_budget().min(positives.len());
        let num_neg = (self.batch_size - num_pos.min(self.batch_size)).min(negatives.len());

        (
            draw(&positives, num_pos, rng),
            draw(&negatives, num_neg, rng),
        )
    }
}

fn draw<R: Rng + ?Sized>(pool: &[usize], amount: usize, rng: &mut R) -> Vec<usize> {
    index::sample(rng, pool.len(), amount)
        .into_iter()
        .map(|i| pool[i])
        .collect()
}
