// TrainerFactory - builds one trainer per brain from the trainer config
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::TrainerConfigError;
use crate::trainers::curriculum::MetaCurriculum;
use crate::trainers::ghost::{GhostController, GhostTrainer};
use crate::trainers::ppo::PPOTrainer;
use crate::trainers::sac::SACTrainer;
use crate::trainers::settings::TrainerSettings;
use crate::trainers::stats::{ConsoleWriter, FileWriter, StatsReporter};
use crate::trainers::trainer::{Trainer, TrainerParameters};

const DEFAULT_SECTION: &str = "default";
const TRAINER_TYPE_KEY: &str = "trainer_type";
const LEGACY_TRAINER_KEY: &str = "trainer";
const BEHAVIORAL_CLONING_KEY: &str = "behavioral_cloning";
const REWARD_SIGNALS_KEY: &str = "reward_signals";
const GAIL_KEY: &str = "gail";
const DEMO_PATH_KEY: &str = "demo_path";

pub struct TrainerFactory {
    trainer_config: Mapping,
    run_id: String,
    model_path: PathBuf,
    keep_checkpoints: usize,
    train_model: bool,
    load_model: bool,
    seed: u64,
    init_path: Option<PathBuf>,
    demo_path: Option<PathBuf>,
    stats_dir: Option<PathBuf>,
    min_lesson_lengths: Option<BTreeMap<String, usize>>,
    ghost_controller: GhostController,
}

impl TrainerFactory {
    pub fn new(
        trainer_config: Mapping,
        run_id: &str,
        model_path: PathBuf,
        keep_checkpoints: usize,
        train_model: bool,
        load_model: bool,
        seed: u64,
    ) -> Self {
        Self {
            trainer_config,
            run_id: run_id.to_string(),
            model_path,
            keep_checkpoints,
            train_model,
            load_model,
            seed,
            init_path: None,
            demo_path: None,
            stats_dir: None,
            min_lesson_lengths: None,
            ghost_controller: GhostController::default(),
        }
    }

    pub fn with_init_path(mut self, init_path: Option<PathBuf>) -> Self {
        self.init_path = init_path;
        self
    }

    pub fn with_demo_path(mut self, demo_path: Option<PathBuf>) -> Self {
        self.demo_path = demo_path;
        self
    }

    /// Stats of every trainer are also appended to `<dir>/<run_id>_<brain>.jsonl`.
    pub fn with_stats_dir(mut self, stats_dir: PathBuf) -> Self {
        self.stats_dir = Some(stats_dir);
        self
    }

    pub fn with_meta_curriculum(mut self, meta_curriculum: Option<&MetaCurriculum>) -> Self {
        self.min_lesson_lengths = meta_curriculum.map(|meta| {
            meta.brains_to_curricula()
                .iter()
                .map(|(brain, curriculum)| (brain.clone(), curriculum.min_lesson_length()))
                .collect()
        });
        self
    }

    /// Shared by every self-play trainer this factory builds.
    pub fn ghost_controller(&self) -> &GhostController {
        &self.ghost_controller
    }

    pub fn train_model(&self) -> bool {
        self.train_model
    }

    /// The `default` section overlaid with the brain's own section, after
    /// following string aliases to the section they name.
    fn resolve_section(&self, brain_name: &str) -> Result<Mapping, TrainerConfigError> {
        let default = self.trainer_config.get(DEFAULT_SECTION);
        let brain_section = self.trainer_config.get(brain_name);
        if default.is_none() && brain_section.is_none() {
            return Err(TrainerConfigError::MissingSection(brain_name.to_string()));
        }

        let mut config = match default {
            Some(Value::Mapping(section)) => section.clone(),
            Some(Value::Null) | None => Mapping::new(),
            Some(_) => {
                return Err(TrainerConfigError::InvalidSection {
                    brain: DEFAULT_SECTION.to_string(),
                    reason: "the default section must be a mapping".to_string(),
                })
            }
        };

        if let Some(mut section) = brain_section {
            let mut seen = BTreeSet::new();
            while let Value::String(alias) = section {
                if !seen.insert(alias.as_str()) {
                    return Err(TrainerConfigError::InvalidSection {
                        brain: brain_name.to_string(),
                        reason: format!("alias cycle through {alias}"),
                    });
                }
                section = self.trainer_config.get(alias.as_str()).ok_or_else(|| {
                    TrainerConfigError::InvalidSection {
                        brain: brain_name.to_string(),
                        reason: format!("alias {alias} does not name a section"),
                    }
                })?;
            }
            match section {
                Value::Mapping(overrides) => {
                    for (key, value) in overrides {
                        config.insert(key.clone(), value.clone());
                    }
                }
                Value::Null => {}
                _ => {
                    return Err(TrainerConfigError::InvalidSection {
                        brain: brain_name.to_string(),
                        reason: "a trainer section must be a mapping or the name of another section"
                            .to_string(),
                    })
                }
            }
        }

        if !config.contains_key(TRAINER_TYPE_KEY) {
            if let Some(kind) = config.remove(LEGACY_TRAINER_KEY) {
                config.insert(Value::from(TRAINER_TYPE_KEY), kind);
            }
        }
        Ok(config)
    }

    /// Points the configured `behavioral_cloning` and `reward_signals.gail`
    /// sections at the run's demonstration file. Absent sections stay absent.
    fn apply_demo_path(&self, config: &mut Mapping) {
        let Some(demo_path) = &self.demo_path else {
            return;
        };
        let demo = Value::from(demo_path.to_string_lossy().into_owned());
        if let Some(Value::Mapping(cloning)) = config.get_mut(BEHAVIORAL_CLONING_KEY) {
            cloning.insert(Value::from(DEMO_PATH_KEY), demo.clone());
        }
        if let Some(Value::Mapping(signals)) = config.get_mut(REWARD_SIGNALS_KEY) {
            if let Some(Value::Mapping(gail)) = signals.get_mut(GAIL_KEY) {
                gail.insert(Value::from(DEMO_PATH_KEY), demo);
            }
        }
    }

    fn reward_buff_cap(&self, brain_name: &str) -> usize {
        let Some(lengths) = &self.min_lesson_lengths else {
            return 1;
        };
        match lengths.get(brain_name) {
            Some(length) => *length,
            None => {
                warn!(
                    brain = %brain_name,
                    "no curriculum is defined for this brain while a curriculum is in use; \
                     lessons will not advance for it"
                );
                1
            }
        }
    }

    fn stats_reporter(&self, brain_name: &str, summary_path: &str) -> StatsReporter {
        let stats = StatsReporter::new(brain_name);
        stats.add_writer(Box::new(ConsoleWriter));
        if let Some(dir) = &self.stats_dir {
            stats.add_writer(Box::new(FileWriter::new(dir.join(format!("{summary_path}.jsonl")))));
        }
        stats
    }

    pub fn generate(&self, brain_name: &str) -> Result<Trainer, TrainerConfigError> {
        let mut config = self.resolve_section(brain_name)?;
        self.apply_demo_path(&mut config);
        let kind = match config.get(TRAINER_TYPE_KEY) {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => {
                return Err(TrainerConfigError::InvalidSection {
                    brain: brain_name.to_string(),
                    reason: "trainer_type must be a string".to_string(),
                })
            }
            None => return Err(TrainerConfigError::MissingTrainerType(brain_name.to_string())),
        };
        match kind.as_str() {
            "ppo" | "sac" => {}
            "offline_bc" => return Err(TrainerConfigError::RemovedTrainer),
            _ => {
                return Err(TrainerConfigError::UnknownTrainer {
                    brain: brain_name.to_string(),
                    kind,
                })
            }
        }

        let settings: TrainerSettings = serde_yaml::from_value(Value::Mapping(config))
            .map_err(|source| TrainerConfigError::InvalidSettings {
                brain: brain_name.to_string(),
                source,
            })?;
        let summary_path = format!("{}_{}", self.run_id, brain_name);
        let stats = self.stats_reporter(brain_name, &summary_path);
        let self_play = settings.self_play.clone();
        let params = TrainerParameters {
            brain_name: brain_name.to_string(),
            settings,
            train_model: self.train_model,
            load_model: self.load_model,
            seed: self.seed,
            model_path: self.model_path.join(brain_name),
            summary_path,
            keep_checkpoints: self.keep_checkpoints,
            reward_buff_cap: self.reward_buff_cap(brain_name),
            init_path: self.init_path.clone(),
        };

        let trainer = if kind == "ppo" {
            Trainer::OnPolicy(PPOTrainer::new(params, stats))
        } else {
            Trainer::OffPolicy(SACTrainer::new(params, stats))
        };
        Ok(match self_play {
            Some(self_play) => Trainer::SelfPlay(Box::new(GhostTrainer::new(
                trainer,
                self.ghost_controller.clone(),
                self_play,
                self.seed,
            ))),
            None => trainer,
        })
    }
}
