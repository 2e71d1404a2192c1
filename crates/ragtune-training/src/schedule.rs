use crate::job::LrSchedulerKind;
use std::f64::consts::PI;

/// Learning rate as a function of the optimizer step.
///
/// Linear warmup from zero over `warmup_steps`, then constant, linear decay to
/// zero, or cosine decay to zero at `total_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub kind: LrSchedulerKind,
    pub base_lr: f64,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

impl LrSchedule {
    #[must_use]
    pub fn new(kind: LrSchedulerKind, base_lr: f64, warmup_steps: u64, total_steps: u64) -> Self {
        Self { kind, base_lr, warmup_steps, total_steps }
    }

    /// Learning rate for the zero-based optimizer step `step`.
    #[must_use]
    pub fn lr_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base_lr;
        }
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);

        match self.kind {
            LrSchedulerKind::Constant => self.base_lr,
            LrSchedulerKind::Linear => self.base_lr * (1.0 - progress),
            LrSchedulerKind::Cosine => self.base_lr * 0.5 * (1.0 + (PI * progress).cos()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_warmup_ramps_linearly() {
        let s = LrSchedule::new(LrSchedulerKind::Constant, 1e-3, 10, 100);
        assert!(close(s.lr_at(0), 0.0));
        assert!(close(s.lr_at(5), 5e-4));
        assert!(close(s.lr_at(10), 1e-3));
        assert!(close(s.lr_at(99), 1e-3));
    }

    #[test]
    fn test_linear_decays_to_zero() {
        let s = LrSchedule::new(LrSchedulerKind::Linear, 1.0, 0, 100);
        assert!(close(s.lr_at(0), 1.0));
        assert!(close(s.lr_at(50), 0.5));
        assert!(close(s.lr_at(100), 0.0));
        assert!(close(s.lr_at(150), 0.0));
    }

    #[test]
    fn test_cosine_shape() {
        let s = LrSchedule::new(LrSchedulerKind::Cosine, 2.0, 10, 110);
        assert!(close(s.lr_at(10), 2.0));
        assert!(close(s.lr_at(60), 1.0));
        assert!(close(s.lr_at(110), 0.0));
        assert!(s.lr_at(30) > s.lr_at(40));
    }

    #[test]
    fn test_no_decay_window_keeps_base() {
        let s = LrSchedule::new(LrSchedulerKind::Cosine, 1.0, 5, 5);
        assert!(close(s.lr_at(5), 1.0));
    }
}
