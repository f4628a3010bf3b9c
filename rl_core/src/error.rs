// Error types shared across the trainers and the controller
use std::path::PathBuf;

use thiserror::Error;

/// Trainer configuration errors. Fatal at construction, never retried.
#[derive(Debug, Error)]
pub enum TrainerConfigError {
    #[error(
        "trainer config must have either a \"default\" section or a section for the brain name ({0})"
    )]
    MissingSection(String),

    #[error("the \"trainer_type\" key must be set in the trainer config for brain {0} (or the default section)")]
    MissingTrainerType(String),

    #[error(
        "the offline_bc trainer has been removed; use a ppo or sac trainer with demonstrations instead"
    )]
    RemovedTrainer,

    #[error("the trainer config contains an unknown trainer type \"{kind}\" for brain {brain}")]
    UnknownTrainer { brain: String, kind: String },

    #[error("brain {brain} has an invalid trainer section: {reason}")]
    InvalidSection { brain: String, reason: String },

    #[error("invalid trainer settings for brain {brain}: {source}")]
    InvalidSettings {
        brain: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("curriculum for brain {brain} is invalid: {reason}")]
    InvalidCurriculum { brain: String, reason: String },

    #[error("sampler for parameter {name} is invalid: {reason}")]
    InvalidSampler { name: String, reason: String },

    #[error("config file could not be read at {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing yaml file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Failures reported by the environment side.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvironmentError {
    /// The communicator was shut down on purpose, e.g. the simulator closed.
    #[error("communicator has stopped")]
    CommunicatorStopped,

    #[error("communication with the environment failed: {0}")]
    Communication(String),

    #[error("environment error: {0}")]
    Environment(String),
}

impl EnvironmentError {
    /// Whether this failure ends the run without surfacing an error.
    pub fn is_graceful_shutdown(&self) -> bool {
        matches!(self, EnvironmentError::CommunicatorStopped)
    }
}

/// Runtime failures raised while a trainer advances or persists its model.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("checkpoint io error at {path}: {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialization error: {0}")]
    CheckpointFormat(#[from] serde_json::Error),
    #[error("invalid checkpoint name pattern: {0}")]
    CheckpointPattern(#[from] regex::Error),

    #[error("trainer {brain} has no policy for behavior {behavior_id}")]
    UnknownBehavior { brain: String, behavior_id: String },

    #[error("trainer {brain} received an invalid trajectory from {behavior_id}: {reason}")]
    InvalidTrajectory {
        brain: String,
        behavior_id: String,
        reason: String,
    },

    #[error("trainer worker for {brain} failed: {reason}")]
    Worker { brain: String, reason: String },
}

/// Top level error returned by a training run.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(
        "the folder {0} containing the generated model could not be accessed; check its permissions"
    )]
    ModelPath(PathBuf),

    #[error(transparent)]
    Config(#[from] TrainerConfigError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Trainer(#[from] TrainerError),

    #[error("{0}")]
    ExistingRun(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not write run metadata: {0}")]
    Metadata(String),
}
