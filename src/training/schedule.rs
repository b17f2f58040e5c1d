use anyhow::{anyhow, Result};
use burn::lr_scheduler::step::{StepLrScheduler, StepLrSchedulerConfig};
use burn::lr_scheduler::LrScheduler as BurnLrScheduler;
use std::f64::consts::PI;

use crate::config::{ScheduleKind, TrainingConfig};

/// Learning-rate scheduler advanced by the training loop.
///
/// `get_lr` is the rate for the next optimizer step; `step` moves the
/// schedule forward by one unit (an optimizer step or an epoch, depending on
/// the schedule).
pub trait LrScheduler: Send {
    fn get_lr(&self) -> f64;

    fn step(&mut self);
}

/// `base_lr * gamma^epoch`, advanced once per epoch.
///
/// Wraps burn's step scheduler with a step size of one epoch. burn's `step`
/// both advances and returns the rate, so `get_lr` peeks on a copy.
#[derive(Debug, Clone)]
pub struct StepDecayLr {
    inner: StepLrScheduler,
}

impl StepDecayLr {
    pub fn new(base_lr: f64, gamma: f64) -> Result<Self> {
        let inner = StepLrSchedulerConfig::new(base_lr, 1)
            .with_gamma(gamma)
            .init()
            .map_err(|e| anyhow!("Invalid step schedule: {}", e))?;
        Ok(Self { inner })
    }

    pub fn at_epoch(mut self, epoch: usize) -> Self {
        for _ in 0..epoch {
            BurnLrScheduler::step(&mut self.inner);
        }
        self
    }
}

impl LrScheduler for StepDecayLr {
    fn get_lr(&self) -> f64 {
        BurnLrScheduler::step(&mut self.inner.clone())
    }

    fn step(&mut self) {
        BurnLrScheduler::step(&mut self.inner);
    }
}

/// Triangular cycle: `step_size_up` steps rising from `base_lr` to `max_lr`,
/// then as many falling back.
#[derive(Debug, Clone)]
pub struct CyclicLr {
    base_lr: f64,
    max_lr: f64,
    step_size_up: usize,
    position: usize,
}

impl CyclicLr {
    pub fn new(base_lr: f64, max_lr: f64, step_size_up: usize) -> Self {
        Self {
            base_lr,
            max_lr,
            step_size_up: step_size_up.max(1),
            position: 0,
        }
    }

    pub fn at_step(mut self, position: usize) -> Self {
        self.position = position;
        self
    }
}

impl LrScheduler for CyclicLr {
    fn get_lr(&self) -> f64 {
        let half = self.step_size_up as f64;
        let step = self.position as f64;
        let cycle = (1.0 + step / (2.0 * half)).floor();
        let x = (step / half - 2.0 * cycle + 1.0).abs();
        self.base_lr + (self.max_lr - self.base_lr) * (1.0 - x).max(0.0)
    }

    fn step(&mut self) {
        self.position += 1;
    }
}

/// Cosine one-cycle over `total_steps`: warm up from `initial_lr` to `max_lr`
/// during the first `pct_start` of the run, then anneal to `final_lr`.
///
/// Past the end of the run the rate stays at `final_lr`.
#[derive(Debug, Clone)]
pub struct OneCycleLr {
    initial_lr: f64,
    max_lr: f64,
    final_lr: f64,
    total_steps: usize,
    pct_start: f64,
    position: usize,
}

impl OneCycleLr {
    pub const PCT_START: f64 = 0.3;
    /// `final_lr = initial_lr / FINAL_DIV_FACTOR`
    pub const FINAL_DIV_FACTOR: f64 = 1e4;

    pub fn new(initial_lr: f64, max_lr: f64, total_steps: usize) -> Self {
        Self {
            initial_lr,
            max_lr,
            final_lr: initial_lr / Self::FINAL_DIV_FACTOR,
            total_steps: total_steps.max(1),
            pct_start: Self::PCT_START,
            position: 0,
        }
    }

    pub fn at_step(mut self, position: usize) -> Self {
        self.position = position;
        self
    }
}

fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * (1.0 + (PI * pct).cos())
}

impl LrScheduler for OneCycleLr {
    fn get_lr(&self) -> f64 {
        let last = (self.total_steps - 1) as f64;
        let warmup_end = self.pct_start * self.total_steps as f64 - 1.0;
        let step = (self.position as f64).min(last);

        if step <= warmup_end {
            let pct = if warmup_end > 0.0 { step / warmup_end } else { 1.0 };
            cosine_anneal(self.initial_lr, self.max_lr, pct)
        } else {
            let span = last - warmup_end;
            let pct = if span > 0.0 { (step - warmup_end) / span } else { 1.0 };
            cosine_anneal(self.max_lr, self.final_lr, pct)
        }
    }

    fn step(&mut self) {
        self.position += 1;
    }
}

/// Build the configured schedule positioned at `(current_epoch, global_step)`.
///
/// Step decay is positioned by epoch; the per-step schedules by the number
/// of optimizer steps already taken.
pub fn build_scheduler(
    config: &TrainingConfig,
    steps_per_epoch: usize,
    current_epoch: usize,
    global_step: usize,
) -> Result<Box<dyn LrScheduler>> {
    let scheduler: Box<dyn LrScheduler> = match config.schedule {
        ScheduleKind::Step => Box::new(StepDecayLr::new(config.base_lr, config.gamma)?.at_epoch(current_epoch)),
        ScheduleKind::Cyclic => Box::new(
            CyclicLr::new(config.base_lr, config.max_lr, steps_per_epoch / 2).at_step(global_step),
        ),
        ScheduleKind::Onecycle => Box::new(
            OneCycleLr::new(config.base_lr, config.max_lr, config.epoch * steps_per_epoch).at_step(global_step),
        ),
    };
    Ok(scheduler)
}
