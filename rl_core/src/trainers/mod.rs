// Trainers: the training loop controller and everything it drives

pub mod agent_processor;
pub mod behavior_id_utils;
pub mod buffer;
pub mod checkpoint;
pub mod curriculum;
pub mod environment_parameter_manager;
pub mod ghost;
pub mod learn;
pub mod notifier;
pub mod policy;
pub mod ppo;
pub mod sac;
pub mod settings;
pub mod stats;
pub mod trainer;
pub mod trainer_controller;
pub mod trainer_util;

pub use learn::{run_training, run_training_with_env};
pub use settings::RunOptions;
pub use trainer::{SharedTrainer, Trainer};
pub use trainer_controller::{TrainerController, TrainingSummary};
pub use trainer_util::TrainerFactory;
