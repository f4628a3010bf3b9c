// Curriculum - staged difficulty progression per brain
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::ResetParameters;
use crate::error::TrainerConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureType {
    /// Trainer step divided by its max steps.
    Progress,
    /// Mean of the trainer's reward history.
    Reward,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumSettings {
    pub measure: MeasureType,
    pub thresholds: Vec<f32>,
    #[serde(default)]
    pub min_lesson_length: usize,
    #[serde(default = "default_signal_smoothing")]
    pub signal_smoothing: bool,
    /// Reset parameter values, one per lesson.
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<f32>>,
}

fn default_signal_smoothing() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct Curriculum {
    brain_name: String,
    settings: CurriculumSettings,
    lesson_num: usize,
    smoothing_value: f32,
}

impl Curriculum {
    pub fn new(brain_name: &str, settings: CurriculumSettings) -> Result<Self, TrainerConfigError> {
        let lessons = settings.thresholds.len() + 1;
        for (key, values) in &settings.parameters {
            if values.len() != lessons {
                return Err(TrainerConfigError::InvalidCurriculum {
                    brain: brain_name.to_string(),
                    reason: format!(
                        "parameter {key} has {} values but {lessons} lessons are defined",
                        values.len()
                    ),
                });
            }
        }
        Ok(Self {
            brain_name: brain_name.to_string(),
            settings,
            lesson_num: 0,
            smoothing_value: 0.0,
        })
    }

    pub fn measure(&self) -> MeasureType {
        self.settings.measure
    }

    pub fn min_lesson_length(&self) -> usize {
        self.settings.min_lesson_length
    }

    pub fn lesson_num(&self) -> usize {
        self.lesson_num
    }

    pub fn max_lesson_num(&self) -> usize {
        self.settings.thresholds.len()
    }

    pub fn set_lesson_num(&mut self, lesson_num: usize) {
        self.lesson_num = lesson_num.min(self.max_lesson_num());
    }

    /// Moves to the next lesson when the (smoothed) measure exceeds the
    /// current threshold. Returns whether the lesson changed.
    pub fn increment_lesson(&mut self, measure_val: f32) -> bool {
        if self.settings.parameters.is_empty() || measure_val == 0.0 || measure_val.is_nan() {
            return false;
        }
        let mut measure_val = measure_val;
        if self.settings.signal_smoothing {
            measure_val = self.smoothing_value * 0.25 + 0.75 * measure_val;
            self.smoothing_value = measure_val;
        }
        if self.lesson_num < self.max_lesson_num()
            && measure_val > self.settings.thresholds[self.lesson_num]
        {
            self.lesson_num += 1;
            info!(
                brain = %self.brain_name,
                lesson = self.lesson_num,
                config = ?self.get_config(),
                "curriculum lesson changed"
            );
            return true;
        }
        false
    }

    pub fn get_config(&self) -> ResetParameters {
        self.settings
            .parameters
            .iter()
            .map(|(key, values)| (key.clone(), values[self.lesson_num]))
            .collect()
    }
}

/// All curricula of a run, keyed by brain name.
#[derive(Debug, Clone, Default)]
pub struct MetaCurriculum {
    brains_to_curricula: BTreeMap<String, Curriculum>,
}

impl MetaCurriculum {
    pub fn new(settings: &BTreeMap<String, CurriculumSettings>) -> Result<Self, TrainerConfigError> {
        let mut brains_to_curricula = BTreeMap::new();
        let mut used_parameters: BTreeMap<&str, &str> = BTreeMap::new();
        for (brain_name, curriculum_settings) in settings {
            for key in curriculum_settings.parameters.keys() {
                if let Some(other) = used_parameters.insert(key, brain_name) {
                    warn!(
                        parameter = %key,
                        brains = %format!("{other}, {brain_name}"),
                        "reset parameter is controlled by more than one curriculum"
                    );
                }
            }
            brains_to_curricula.insert(
                brain_name.clone(),
                Curriculum::new(brain_name, curriculum_settings.clone())?,
            );
        }
        Ok(Self { brains_to_curricula })
    }

    pub fn brains_to_curricula(&self) -> &BTreeMap<String, Curriculum> {
        &self.brains_to_curricula
    }

    pub fn curriculum(&self, brain_name: &str) -> Option<&Curriculum> {
        self.brains_to_curricula.get(brain_name)
    }

    pub fn lesson_nums(&self) -> BTreeMap<String, usize> {
        self.brains_to_curricula
            .iter()
            .map(|(brain, curriculum)| (brain.clone(), curriculum.lesson_num()))
            .collect()
    }

    pub fn set_lesson_nums(&mut self, lesson_nums: &BTreeMap<String, usize>) {
        for (brain, lesson) in lesson_nums {
            if let Some(curriculum) = self.brains_to_curricula.get_mut(brain) {
                curriculum.set_lesson_num(*lesson);
            }
        }
    }

    fn lesson_ready_to_increment(&self, brain_name: &str, reward_buff_size: usize) -> bool {
        self.brains_to_curricula
            .get(brain_name)
            .is_some_and(|c| reward_buff_size >= c.min_lesson_length())
    }

    /// Tries to advance the lesson of every brain whose reward history is long
    /// enough. The result maps each attempted brain to whether it advanced.
    pub fn increment_lessons(
        &mut self,
        measure_vals: &BTreeMap<String, f32>,
        reward_buff_sizes: &BTreeMap<String, usize>,
    ) -> BTreeMap<String, bool> {
        let mut changed = BTreeMap::new();
        for (brain_name, buff_size) in reward_buff_sizes {
            if !self.lesson_ready_to_increment(brain_name, *buff_size) {
                continue;
            }
            let Some(measure_val) = measure_vals.get(brain_name) else {
                continue;
            };
            if let Some(curriculum) = self.brains_to_curricula.get_mut(brain_name) {
                changed.insert(brain_name.clone(), curriculum.increment_lesson(*measure_val));
            }
        }
        changed
    }

    /// Union of every curriculum's current lesson parameters.
    pub fn get_config(&self) -> ResetParameters {
        let mut config = ResetParameters::new();
        for curriculum in self.brains_to_curricula.values() {
            config.extend(curriculum.get_config());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(measure: MeasureType, smoothing: bool) -> CurriculumSettings {
        CurriculumSettings {
            measure,
            thresholds: vec![0.5, 0.8],
            min_lesson_length: 2,
            signal_smoothing: smoothing,
            parameters: BTreeMap::from([("wall_height".to_string(), vec![0.0, 2.0, 4.0])]),
        }
    }

    #[test]
    fn advances_past_thresholds_and_stops_at_last_lesson() {
        let mut curriculum = Curriculum::new("Jumper", settings(MeasureType::Reward, false)).unwrap();
        assert!(!curriculum.increment_lesson(0.4));
        assert!(curriculum.increment_lesson(0.6));
        assert_eq!(curriculum.get_config()["wall_height"], 2.0);
        assert!(curriculum.increment_lesson(0.9));
        assert!(!curriculum.increment_lesson(10.0));
        assert_eq!(curriculum.lesson_num(), 2);
    }

    #[test]
    fn smoothing_delays_progress() {
        let mut curriculum = Curriculum::new("Jumper", settings(MeasureType::Progress, true)).unwrap();
        // 0.75 * 0.6 = 0.45 stays below 0.5
        assert!(!curriculum.increment_lesson(0.6));
        // 0.25 * 0.45 + 0.75 * 0.6 = 0.5625
        assert!(curriculum.increment_lesson(0.6));
    }

    #[test]
    fn parameter_lengths_must_match_lessons() {
        let mut bad = settings(MeasureType::Reward, false);
        bad.parameters.insert("gravity".into(), vec![1.0]);
        assert!(Curriculum::new("Jumper", bad).is_err());
    }

    #[test]
    fn meta_curriculum_respects_min_lesson_length() {
        let all = BTreeMap::from([("Jumper".to_string(), settings(MeasureType::Reward, false))]);
        let mut meta = MetaCurriculum::new(&all).unwrap();
        let measures = BTreeMap::from([("Jumper".to_string(), 0.9)]);

        let short = BTreeMap::from([("Jumper".to_string(), 1)]);
        assert!(meta.increment_lessons(&measures, &short).is_empty());

        let ready = BTreeMap::from([("Jumper".to_string(), 2)]);
        assert_eq!(meta.increment_lessons(&measures, &ready)["Jumper"], true);
        assert_eq!(meta.get_config()["wall_height"], 2.0);
    }

    #[test]
    fn brains_without_curriculum_are_skipped() {
        let all = BTreeMap::from([("Jumper".to_string(), settings(MeasureType::Reward, false))]);
        let mut meta = MetaCurriculum::new(&all).unwrap();
        let measures = BTreeMap::from([("Walker".to_string(), 5.0)]);
        let sizes = BTreeMap::from([("Walker".to_string(), 100)]);
        assert!(meta.increment_lessons(&measures, &sizes).is_empty());
    }
}
