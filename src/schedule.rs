//! Inner learning-rate schedule
//!
//! Linear warmup to the peak rate, then cosine decay to zero at
//! `total_steps`. The scheduler is a step counter over that curve: the
//! optimizer uses `current_lr()` and `step()` advances it afterwards, so the
//! `n`-th optimizer step runs at `lr_at(n - 1)`.

use std::f64::consts::PI;

/// Cosine decay with linear warmup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineWithWarmup {
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineWithWarmup {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate after `step` scheduler steps
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        // Clamped: the rate stays at zero past total_steps
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        self.base_lr * (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
    }
}

/// Counts optimizer steps along a [`CosineWithWarmup`] curve
#[derive(Debug, Clone)]
pub struct LrScheduler {
    schedule: CosineWithWarmup,
    step_count: usize,
}

impl LrScheduler {
    pub fn new(schedule: CosineWithWarmup) -> Self {
        Self { schedule, step_count: 0 }
    }

    /// Rate for the next optimizer step
    pub fn current_lr(&self) -> f64 {
        self.schedule.lr_at(self.step_count)
    }

    /// Advance one step and return the new rate
    pub fn step(&mut self) -> f64 {
        self.step_count += 1;
        self.current_lr()
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_is_linear_from_zero() {
        let sched = CosineWithWarmup::new(0.01, 100, 1100);
        assert_eq!(sched.lr_at(0), 0.0);
        assert!((sched.lr_at(50) - 0.005).abs() < 1e-12);
        assert!((sched.lr_at(100) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_decay_to_zero() {
        let sched = CosineWithWarmup::new(0.01, 100, 1100);
        // Midpoint of decay: half the peak
        assert!((sched.lr_at(600) - 0.005).abs() < 1e-9);
        assert!(sched.lr_at(1100).abs() < 1e-12);
        assert!(sched.lr_at(5000).abs() < 1e-12);

        // Monotone after warmup
        let mut prev = sched.lr_at(100);
        for step in 101..=1100 {
            let lr = sched.lr_at(step);
            assert!(lr <= prev + 1e-15);
            prev = lr;
        }
    }

    #[test]
    fn test_no_warmup_starts_at_peak() {
        let sched = CosineWithWarmup::new(4e-4, 0, 1000);
        assert!((sched.lr_at(0) - 4e-4).abs() < 1e-15);
    }

    #[test]
    fn test_scheduler_counts_steps() {
        let mut scheduler = LrScheduler::new(CosineWithWarmup::new(1.0, 4, 8));
        assert_eq!(scheduler.current_lr(), 0.0);
        assert!((scheduler.step() - 0.25).abs() < 1e-12);
        assert!((scheduler.step() - 0.5).abs() < 1e-12);
        assert_eq!(scheduler.step_count(), 2);
        assert!((scheduler.current_lr() - 0.5).abs() < 1e-12);
    }
}
