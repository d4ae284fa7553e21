/// Sample-weighted running mean of per-batch mean losses.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningLoss {
    sum: f64,
    samples: usize,
    batches: usize,
}

impl RunningLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch whose mean loss was `batch_mean` over `n` samples.
    pub fn push(&mut self, batch_mean: f32, n: usize) {
        self.sum += batch_mean as f64 * n as f64;
        self.samples += n;
        self.batches += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Exact mean over every sample seen; `None` before the first batch.
    pub fn mean(&self) -> Option<f32> {
        (self.samples > 0).then(|| (self.sum / self.samples as f64) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_batches_by_size() {
        let mut m = RunningLoss::new();
        m.push(1.0, 2);
        m.push(4.0, 1);
        assert_eq!(m.samples(), 3);
        assert_eq!(m.batches(), 2);
        assert!((m.mean().unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn batching_order_does_not_change_mean() {
        let per_sample = [0.5f32, 1.5, 2.0, 3.0, 7.0];
        let mut a = RunningLoss::new();
        a.push((0.5 + 1.5) / 2.0, 2);
        a.push((2.0 + 3.0) / 2.0, 2);
        a.push(7.0, 1);
        let mut b = RunningLoss::new();
        b.push(7.0, 1);
        b.push((0.5 + 1.5 + 2.0) / 3.0, 3);
        b.push(3.0, 1);
        let expected = per_sample.iter().sum::<f32>() / per_sample.len() as f32;
        assert!((a.mean().unwrap() - expected).abs() < 1e-6);
        assert!((b.mean().unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn empty_has_no_mean() {
        assert!(RunningLoss::new().mean().is_none());
    }
}
