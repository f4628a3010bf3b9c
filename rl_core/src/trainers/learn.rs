// Learn - turns run options into a controller and an environment and runs them
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::{BehaviorSpec, EnvManager, ScriptedEnvironment, ScriptedEnvironmentConfig};
use crate::error::TrainingError;
use crate::trainers::curriculum::MetaCurriculum;
use crate::trainers::environment_parameter_manager::EnvironmentParameterManager;
use crate::trainers::notifier::{CompletionNotifier, HttpCompletionNotifier, NoopNotifier};
use crate::trainers::settings::RunOptions;
use crate::trainers::trainer_controller::{TrainerController, TrainingSummary};
use crate::trainers::trainer_util::TrainerFactory;
use crate::utils::{
    create_directory_if_not_exists, validate_existing_directories, CancellationToken, TimerNode,
};

pub const TRAINING_STATUS_FILE_NAME: &str = "training_status.json";
pub const CONFIGURATION_FILE_NAME: &str = "configuration.yaml";
pub const TIMERS_FILE_NAME: &str = "timers.json";
const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn get_version_string() -> String {
    format!("Version information:\n  rl_core: {VERSION}")
}

/// Persisted between runs so `--resume` continues at the same lessons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub version: String,
    pub updated_at: DateTime<Utc>,
    pub global_step: u64,
    #[serde(default)]
    pub lessons: BTreeMap<String, usize>,
}

impl TrainingStatus {
    pub fn load(path: &Path) -> Result<Option<Self>, TrainingError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| TrainingError::Metadata(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TrainingError::Metadata(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// The configured seed, or a random one when it is -1.
pub fn run_seed(options: &RunOptions) -> u64 {
    if options.env_settings.seed < 0 {
        rand::thread_rng().gen_range(0..10_000)
    } else {
        options.env_settings.seed as u64
    }
}

/// Scripted environment exposing the configured behaviors, or one behavior
/// per configured brain when none are listed.
pub fn create_environment(options: &RunOptions, seed: u64) -> ScriptedEnvironment {
    let env_settings = &options.env_settings;
    let behaviors = if env_settings.behaviors.is_empty() {
        options.brain_names()
    } else {
        env_settings.behaviors.clone()
    };
    let spec = BehaviorSpec::new(env_settings.observation_size, env_settings.action_size);
    let config = behaviors.iter().fold(
        ScriptedEnvironmentConfig {
            agents_per_behavior: env_settings.agents_per_behavior,
            steps_per_advance: env_settings.steps_per_advance,
            episode_length: env_settings.episode_length,
            reward_per_step: env_settings.reward_per_step,
            seed,
            ..Default::default()
        },
        |config, behavior_id| config.with_behavior(behavior_id, spec.clone()),
    );
    ScriptedEnvironment::new(config)
}

fn notifier(options: &RunOptions) -> Box<dyn CompletionNotifier> {
    let Some(url) = &options.checkpoint_settings.notify_url else {
        return Box::new(NoopNotifier);
    };
    match HttpCompletionNotifier::new(url) {
        Ok(notifier) => Box::new(notifier),
        Err(err) => {
            warn!(url = %url, error = %err, "completion notifier disabled");
            Box::new(NoopNotifier)
        }
    }
}

fn write_run_options(run_logs_dir: &Path, options: &RunOptions) -> Result<(), TrainingError> {
    let yaml = serde_yaml::to_string(options).map_err(|e| TrainingError::Metadata(e.to_string()))?;
    fs::write(run_logs_dir.join(CONFIGURATION_FILE_NAME), yaml)?;
    Ok(())
}

fn write_timing_tree(run_logs_dir: &Path, timers: &TimerNode) -> Result<(), TrainingError> {
    let json =
        serde_json::to_string_pretty(timers).map_err(|e| TrainingError::Metadata(e.to_string()))?;
    fs::write(run_logs_dir.join(TIMERS_FILE_NAME), json)?;
    Ok(())
}

/// Runs one training session against `env` with every artifact written
/// under `<results_dir>/<run_id>`.
pub fn run_training_with_env(
    seed: u64,
    options: &RunOptions,
    env: &mut dyn EnvManager,
    interrupt: &CancellationToken,
) -> Result<TrainingSummary, TrainingError> {
    let checkpoint_settings = &options.checkpoint_settings;
    let model_path = checkpoint_settings.model_path();
    let run_logs_dir = checkpoint_settings.run_logs_dir();
    let init_path = checkpoint_settings.init_path();

    validate_existing_directories(
        &model_path,
        checkpoint_settings.resume,
        checkpoint_settings.force,
        init_path.as_ref(),
    )?;
    create_directory_if_not_exists(&run_logs_dir)?;
    write_run_options(&run_logs_dir, options)?;

    let status_path = run_logs_dir.join(TRAINING_STATUS_FILE_NAME);
    let meta_curriculum = if options.curriculum.is_empty() {
        None
    } else {
        let mut meta = MetaCurriculum::new(&options.curriculum)?;
        if checkpoint_settings.resume {
            if let Some(status) = TrainingStatus::load(&status_path)? {
                info!(lessons = ?status.lessons, "restoring curriculum lessons");
                meta.set_lesson_nums(&status.lessons);
            }
        }
        Some(meta)
    };
    let sampler_manager =
        EnvironmentParameterManager::new(options.environment_parameters.clone(), seed)?;

    if let Some(demo_path) = options.demo_path.as_ref().filter(|path| !path.exists()) {
        warn!(path = %demo_path.display(), "demonstration file does not exist");
    }

    let train_model = !checkpoint_settings.inference;
    let factory = TrainerFactory::new(
        options.behaviors.clone(),
        &checkpoint_settings.run_id,
        model_path.clone(),
        checkpoint_settings.keep_checkpoints,
        train_model,
        checkpoint_settings.resume,
        seed,
    )
    .with_init_path(init_path)
    .with_demo_path(options.demo_path.clone())
    .with_stats_dir(run_logs_dir.clone())
    .with_meta_curriculum(meta_curriculum.as_ref());

    let mut controller = TrainerController::new(
        factory,
        model_path,
        checkpoint_settings.save_freq,
        meta_curriculum,
        train_model,
        sampler_manager,
        options.resampling_interval,
    )
    .with_notifier(notifier(options));

    let result = controller.start_learning(env, interrupt);

    let status = TrainingStatus {
        version: VERSION.to_string(),
        updated_at: Utc::now(),
        global_step: controller.global_step(),
        lessons: controller
            .meta_curriculum()
            .map(MetaCurriculum::lesson_nums)
            .unwrap_or_default(),
    };
    let metadata = status
        .save(&status_path)
        .and_then(|()| write_timing_tree(&run_logs_dir, controller.timers()));
    match (result, metadata) {
        (Ok(summary), Ok(())) => Ok(summary),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(metadata_err)) => {
            warn!(error = %metadata_err, "could not write run metadata");
            Err(err)
        }
    }
}

/// Builds the scripted environment from the options and runs training.
pub fn run_training(
    options: &RunOptions,
    interrupt: &CancellationToken,
) -> Result<TrainingSummary, TrainingError> {
    let seed = run_seed(options);
    info!(seed, run_id = %options.checkpoint_settings.run_id, "starting training run");
    let mut env = create_environment(options, seed);
    run_training_with_env(seed, options, &mut env, interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ResetParameters;
    use crate::error::EnvironmentError;
    use crate::trainers::agent_processor::AgentManager;
    use crate::trainers::policy::Policy;

    fn options(dir: &Path, yaml: &str) -> RunOptions {
        let mut options: RunOptions = serde_yaml::from_str(yaml).unwrap();
        options.checkpoint_settings.results_dir = dir.to_path_buf();
        options.checkpoint_settings.run_id = "smoke".to_string();
        options.env_settings.seed = 1;
        options
    }

    const CONFIG: &str = r#"
behaviors:
  Ball:
    trainer_type: ppo
    max_steps: 12
    time_horizon: 4
checkpoint_settings:
  save_freq: 5
curriculum:
  Ball:
    measure: progress
    thresholds: [0.2]
    signal_smoothing: false
    parameters:
      reward_scale: [1.0, 2.0]
"#;

    #[test]
    fn writes_run_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path(), CONFIG);
        let summary = run_training(&options, &CancellationToken::new()).unwrap();
        assert_eq!(summary.checkpoint_steps, vec![5, 10, 12]);
        assert!(summary.exported);

        let run_logs = dir.path().join("smoke").join("run_logs");
        assert!(run_logs.join(CONFIGURATION_FILE_NAME).exists());
        assert!(run_logs.join(TIMERS_FILE_NAME).exists());
        let status = TrainingStatus::load(&run_logs.join(TRAINING_STATUS_FILE_NAME))
            .unwrap()
            .unwrap();
        assert_eq!(status.lessons["Ball"], 1);
        assert_eq!(status.global_step, 12);
        assert!(dir.path().join("smoke").join("Ball").join("Ball.json").exists());
    }

    #[test]
    fn existing_run_needs_resume_and_resume_restores_lessons() {
        let dir = tempfile::tempdir().unwrap();
        let first = options(dir.path(), CONFIG);
        run_training(&first, &CancellationToken::new()).unwrap();

        assert!(matches!(
            run_training(&first, &CancellationToken::new()),
            Err(TrainingError::ExistingRun(_))
        ));

        let mut resumed = first.clone();
        resumed.checkpoint_settings.resume = true;
        let interrupt = CancellationToken::new();
        interrupt.cancel();
        run_training(&resumed, &interrupt).unwrap();
        let status_path = dir
            .path()
            .join("smoke")
            .join("run_logs")
            .join(TRAINING_STATUS_FILE_NAME);
        let status = TrainingStatus::load(&status_path).unwrap().unwrap();
        assert_eq!(status.lessons["Ball"], 1);
    }

    #[test]
    fn environment_defaults_to_one_behavior_per_brain() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(
            dir.path(),
            "behaviors:\n  default:\n    trainer_type: ppo\n  Ball:\n    max_steps: 5\n  Walker: Ball\n",
        );
        let env = create_environment(&options, 0);
        let brains: Vec<String> = env.external_brains().into_keys().collect();
        assert_eq!(brains, vec!["Ball".to_string(), "Walker".to_string()]);
    }

    /// Counts advances on top of the scripted environment.
    struct CountingEnv {
        inner: ScriptedEnvironment,
        advances: usize,
    }

    impl EnvManager for CountingEnv {
        fn external_brains(&self) -> BTreeMap<String, BehaviorSpec> {
            self.inner.external_brains()
        }

        fn reset(&mut self, config: &ResetParameters) -> Result<(), EnvironmentError> {
            self.inner.reset(config)
        }

        fn advance(&mut self) -> Result<usize, EnvironmentError> {
            self.advances += 1;
            self.inner.advance()
        }

        fn set_policy(&mut self, behavior_id: &str, policy: Policy) {
            self.inner.set_policy(behavior_id, policy);
        }

        fn set_agent_manager(&mut self, behavior_id: &str, manager: AgentManager) {
            self.inner.set_agent_manager(behavior_id, manager);
        }
    }

    #[test]
    fn runs_against_any_environment_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(
            dir.path(),
            "behaviors:\n  Ball:\n    trainer_type: ppo\n    max_steps: 6\n    time_horizon: 2\n    behavioral_cloning:\n      strength: 0.5\n",
        );
        options.demo_path = Some(dir.path().join("Expert.demo"));
        let mut env = CountingEnv {
            inner: create_environment(&options, 1),
            advances: 0,
        };

        let summary = run_training_with_env(1, &options, &mut env, &CancellationToken::new()).unwrap();

        assert_eq!(summary.global_step, 6);
        assert_eq!(env.advances, 6);
        let written = fs::read_to_string(
            dir.path().join("smoke").join("run_logs").join(CONFIGURATION_FILE_NAME),
        )
        .unwrap();
        assert!(written.contains("Expert.demo"));
    }
}
