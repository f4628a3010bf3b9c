// Settings module - run options and per-trainer settings
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TrainerConfigError;
use crate::trainers::curriculum::CurriculumSettings;
use crate::trainers::environment_parameter_manager::SamplerSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Raw trainer sections keyed by brain name. Kept untyped so the factory
    /// can merge `default` into each brain and resolve aliases.
    #[serde(default)]
    pub behaviors: serde_yaml::Mapping,
    #[serde(default)]
    pub environment_parameters: BTreeMap<String, SamplerSettings>,
    #[serde(default)]
    pub resampling_interval: Option<u64>,
    #[serde(default)]
    pub curriculum: BTreeMap<String, CurriculumSettings>,
    #[serde(default)]
    pub env_settings: EnvironmentSettings,
    #[serde(default)]
    pub checkpoint_settings: CheckpointSettings,
    /// Demonstration file for the behavioral cloning and GAIL sections.
    #[serde(default)]
    pub demo_path: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    pub seed: i64,
    pub steps_per_advance: usize,
    pub agents_per_behavior: usize,
    pub episode_length: usize,
    pub reward_per_step: f32,
    /// Behavior ids exposed by the scripted environment. Empty means one
    /// behavior per configured brain.
    pub behaviors: Vec<String>,
    pub observation_size: usize,
    pub action_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub run_id: String,
    pub results_dir: PathBuf,
    pub resume: bool,
    pub force: bool,
    pub inference: bool,
    pub initialize_from: Option<String>,
    pub save_freq: u64,
    pub keep_checkpoints: usize,
    pub notify_url: Option<String>,
}

impl CheckpointSettings {
    pub fn model_path(&self) -> PathBuf {
        self.results_dir.join(&self.run_id)
    }

    pub fn run_logs_dir(&self) -> PathBuf {
        self.model_path().join("run_logs")
    }

    pub fn init_path(&self) -> Option<PathBuf> {
        self.initialize_from
            .as_ref()
            .map(|run_id| self.results_dir.join(run_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSettings {
    pub trainer_type: String,
    #[serde(default)]
    pub hyperparameters: HyperparameterSettings,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_time_horizon")]
    pub time_horizon: usize,
    #[serde(default = "default_summary_freq")]
    pub summary_freq: u64,
    #[serde(default = "default_threaded")]
    pub threaded: bool,
    #[serde(default)]
    pub self_play: Option<SelfPlaySettings>,
    #[serde(default)]
    pub behavioral_cloning: Option<BehavioralCloningSettings>,
    #[serde(default)]
    pub reward_signals: BTreeMap<String, RewardSignalSettings>,
}

fn default_max_steps() -> u64 { 500_000 }
fn default_time_horizon() -> usize { 64 }
fn default_summary_freq() -> u64 { 50_000 }
fn default_threaded() -> bool {
    false
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparameterSettings {
    pub batch_size: usize,
    pub buffer_size: usize,
    /// Off-policy only: experiences collected before the first update.
    pub buffer_init_steps: u64,
    /// Off-policy only: environment steps between updates.
    pub steps_per_update: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralCloningSettings {
    pub demo_path: Option<PathBuf>,
    pub strength: f32,
    pub steps: u64,
}

impl Default for BehavioralCloningSettings {
    fn default() -> Self {
        Self {
            demo_path: None,
            strength: 1.0,
            steps: 0,
        }
    }
}

/// One entry of `reward_signals` (extrinsic, gail, curiosity, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardSignalSettings {
    pub strength: f32,
    pub gamma: f32,
    pub demo_path: Option<PathBuf>,
}

impl Default for RewardSignalSettings {
    fn default() -> Self {
        Self {
            strength: 1.0,
            gamma: 0.99,
            demo_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfPlaySettings {
    pub save_steps: u64,
    pub team_change: u64,
    pub swap_steps: u64,
    pub window: usize,
    pub play_against_latest_model_ratio: f32,
    pub initial_elo: f32,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            seed: -1,
            steps_per_advance: 1,
            agents_per_behavior: 1,
            episode_length: 100,
            reward_per_step: 0.01,
            behaviors: Vec::new(),
            observation_size: 8,
            action_size: 2,
        }
    }
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            run_id: "ppo".to_string(),
            results_dir: PathBuf::from("results"),
            resume: false,
            force: false,
            inference: false,
            initialize_from: None,
            save_freq: 50_000,
            keep_checkpoints: 5,
            notify_url: None,
        }
    }
}

impl Default for HyperparameterSettings {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            buffer_size: 10240,
            buffer_init_steps: 0,
            steps_per_update: 1,
        }
    }
}

impl Default for SelfPlaySettings {
    fn default() -> Self {
        Self {
            save_steps: 20_000,
            team_change: 100_000,
            swap_steps: 2_000,
            window: 10,
            play_against_latest_model_ratio: 0.5,
            initial_elo: 1200.0,
        }
    }
}

impl RunOptions {
    pub fn from_yaml(path: &Path) -> Result<Self, TrainerConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| TrainerConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| TrainerConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn as_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Brain names with a trainer section, excluding `default`.
    pub fn brain_names(&self) -> Vec<String> {
        self.behaviors
            .keys()
            .filter_map(|k| k.as_str())
            .filter(|k| *k != "default")
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_full_run_options() {
        let yaml = r#"
behaviors:
  default:
    trainer_type: ppo
    max_steps: 1000
  Striker:
    trainer_type: sac
    threaded: true
    hyperparameters:
      buffer_size: 500
    self_play:
      window: 3
environment_parameters:
  mass:
    sampler_type: uniform
    min_value: 0.5
    max_value: 10.0
resampling_interval: 5000
curriculum:
  Striker:
    measure: reward
    thresholds: [0.5]
    min_lesson_length: 10
    parameters:
      goal_size: [1.0, 2.0]
checkpoint_settings:
  run_id: soccer
  save_freq: 1000
"#;
        let options: RunOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.brain_names(), vec!["Striker".to_string()]);
        assert_eq!(options.resampling_interval, Some(5000));
        assert_eq!(options.checkpoint_settings.save_freq, 1000);
        assert_eq!(options.checkpoint_settings.keep_checkpoints, 5);
        assert_eq!(options.checkpoint_settings.model_path(), PathBuf::from("results/soccer"));
        assert!(options.environment_parameters.contains_key("mass"));
        assert_eq!(options.curriculum["Striker"].min_lesson_length, 10);
    }

    #[test]
    fn trainer_settings_defaults() {
        let settings: TrainerSettings = serde_yaml::from_str("trainer_type: ppo").unwrap();
        assert_eq!(settings.max_steps, 500_000);
        assert_eq!(settings.time_horizon, 64);
        assert!(!settings.threaded);
        assert!(settings.self_play.is_none());
        assert_eq!(settings.hyperparameters.buffer_size, 10240);
    }
}
