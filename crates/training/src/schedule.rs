use burn::lr_scheduler::step::{StepLrScheduler, StepLrSchedulerConfig};

/// Step decay scheduler: `initial` is multiplied by `gamma` every `step_size` calls
/// to `step()`. The trainer steps it once per epoch.
pub fn step_lr_scheduler(
    initial: f64,
    gamma: f64,
    step_size: usize,
) -> anyhow::Result<StepLrScheduler> {
    StepLrSchedulerConfig::new(initial, step_size)
        .with_gamma(gamma)
        .init()
        .map_err(|e| {
            anyhow::anyhow!("invalid learning-rate schedule (step size {step_size}): {e}")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::lr_scheduler::LrScheduler;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn decays_every_step_size_epochs() {
        let mut sched = step_lr_scheduler(0.01, 0.3, 10).unwrap();
        let lrs: Vec<f64> = (0..21).map(|_| sched.step()).collect();
        for lr in &lrs[..10] {
            assert!(close(*lr, 0.01));
        }
        for lr in &lrs[10..20] {
            assert!(close(*lr, 0.003));
        }
        assert!(close(lrs[20], 0.0009));
    }

    #[test]
    fn zero_step_size_is_rejected() {
        let err = step_lr_scheduler(1.0, 0.5, 0).unwrap_err();
        assert!(err.to_string().contains("step size 0"), "{err}");
    }
}
