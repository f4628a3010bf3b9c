// rl_core - orchestration of concurrently learning behaviors: trainer
// creation, experience queues, curriculum and self-play resets, checkpoint
// cadence and shutdown.

pub mod cli;
pub mod env;
pub mod error;
pub mod trainers;
pub mod utils;

pub use error::{EnvironmentError, TrainerConfigError, TrainerError, TrainingError};
pub use trainers::{run_training, RunOptions, TrainerController, TrainingSummary};

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_string() {
        let version = crate::trainers::learn::get_version_string();
        assert!(version.contains("rl_core"));
    }
}
