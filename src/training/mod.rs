pub mod metrics;
pub mod optim;
pub mod run;
pub mod schedule;
pub mod summary;
pub mod trainer;

use thiserror::Error;

pub use metrics::{accuracy, AverageMeter, StepMetrics, TrainMeters};
pub use optim::{build_optimizer, AttentionOptimizer, ParamGroups, BIAS_LR_SCALE};
pub use run::{train, RunSummary};
pub use schedule::{build_scheduler, CyclicLr, LrScheduler, OneCycleLr, StepDecayLr};
pub use summary::{read_events, ScalarEvent, SummaryWriter, EVENTS_FILE};
pub use trainer::SaliencyTrainer;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("non-finite {component} ({value}) at global step {step}")]
    NonFinite {
        component: &'static str,
        value: f32,
        step: usize,
    },
    #[error("data loader produced no batches")]
    EmptyEpoch,
}
