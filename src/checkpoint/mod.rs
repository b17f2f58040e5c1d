pub mod record;

pub use record::{
    checkpoint_name, checkpoint_path, latest_checkpoint, list_checkpoints, load_checkpoint, read_checkpoint,
    save_checkpoint, CheckpointData, CheckpointError, CheckpointState, TrainingProgress,
};
