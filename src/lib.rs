// Library exports for the training binary and integration tests

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod model;
pub mod training;

// Re-export commonly used types
pub use checkpoint::{CheckpointError, CheckpointState, TrainingProgress};
pub use config::{ConfigError, RunConfig, RunPaths};
pub use model::{GenericModel, LossWeighting, LossWeights};
pub use training::{train, RunSummary, SaliencyTrainer, TrainError};
