// Command-Line Interface for mlagents-learn
use clap::Parser;
use std::path::PathBuf;

use crate::error::TrainerConfigError;
use crate::trainers::settings::RunOptions;

#[derive(Parser, Debug, Clone)]
#[command(name = "mlagents-learn")]
#[command(version)]
#[command(about = "Trains behaviors against a scripted environment", long_about = None)]
pub struct Cli {
    /// Path to the trainer configuration YAML file
    #[arg(value_name = "CONFIG")]
    pub config_path: Option<PathBuf>,

    /// The identifier for the training run
    #[arg(long = "run-id")]
    pub run_id: Option<String>,

    /// Whether to resume training from a checkpoint
    #[arg(long, default_value_t = false)]
    pub resume: bool,

    /// Whether to force-overwrite this run-id's existing data
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Whether to run in inference mode (no training, no saving)
    #[arg(long, default_value_t = false)]
    pub inference: bool,

    /// Initialize model from a previously saved run ID
    #[arg(long = "initialize-from", value_name = "RUN_ID")]
    pub initialize_from: Option<String>,

    /// Seed for random number generator, -1 picks one
    #[arg(long, allow_negative_numbers = true)]
    pub seed: Option<i64>,

    /// Global steps between checkpoints
    #[arg(long = "save-freq")]
    pub save_freq: Option<u64>,

    /// Checkpoints kept per behavior
    #[arg(long = "keep-checkpoints")]
    pub keep_checkpoints: Option<usize>,

    /// Global steps between environment parameter resamples
    #[arg(long = "resampling-interval")]
    pub resampling_interval: Option<u64>,

    /// Results base directory
    #[arg(long = "results-dir")]
    pub results_dir: Option<PathBuf>,

    /// Demonstration file used by behavioral cloning and GAIL sections
    #[arg(long = "demo-path", value_name = "PATH")]
    pub demo_path: Option<PathBuf>,

    /// URL notified when training stops
    #[arg(long = "notify-url")]
    pub notify_url: Option<String>,

    /// Agent steps the environment produces per global step
    #[arg(long = "steps-per-advance")]
    pub steps_per_advance: Option<usize>,

    /// Agents simulated for every behavior
    #[arg(long = "agents-per-behavior")]
    pub agents_per_behavior: Option<usize>,

    /// Enable debug-level logging
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.resume && self.force {
            return Err("--resume and --force cannot be used together".to_string());
        }

        if self.resume && self.initialize_from.is_some() {
            return Err("--initialize-from has no effect with --resume".to_string());
        }

        if self.save_freq == Some(0) {
            return Err("--save-freq must be at least 1".to_string());
        }

        if self.steps_per_advance == Some(0) {
            return Err("--steps-per-advance must be at least 1".to_string());
        }

        if self.resampling_interval == Some(0) {
            return Err("--resampling-interval must be at least 1".to_string());
        }

        Ok(())
    }

    /// Loads the configuration file, if any, and applies the flags on top.
    pub fn into_run_options(self) -> Result<RunOptions, TrainerConfigError> {
        let mut options = match &self.config_path {
            Some(path) => RunOptions::from_yaml(path)?,
            None => RunOptions::default(),
        };

        let checkpoint = &mut options.checkpoint_settings;
        if let Some(run_id) = self.run_id {
            checkpoint.run_id = run_id;
        }
        checkpoint.resume |= self.resume;
        checkpoint.force |= self.force;
        checkpoint.inference |= self.inference;
        if self.initialize_from.is_some() {
            checkpoint.initialize_from = self.initialize_from;
        }
        if let Some(save_freq) = self.save_freq {
            checkpoint.save_freq = save_freq;
        }
        if let Some(keep) = self.keep_checkpoints {
            checkpoint.keep_checkpoints = keep;
        }
        if let Some(results_dir) = self.results_dir {
            checkpoint.results_dir = results_dir;
        }
        if self.notify_url.is_some() {
            checkpoint.notify_url = self.notify_url;
        }

        let env = &mut options.env_settings;
        if let Some(seed) = self.seed {
            env.seed = seed;
        }
        if let Some(steps) = self.steps_per_advance {
            env.steps_per_advance = steps;
        }
        if let Some(agents) = self.agents_per_behavior {
            env.agents_per_behavior = agents;
        }

        if self.resampling_interval.is_some() {
            options.resampling_interval = self.resampling_interval;
        }
        if self.demo_path.is_some() {
            options.demo_path = self.demo_path;
        }
        options.debug |= self.debug;
        Ok(options)
    }
}
