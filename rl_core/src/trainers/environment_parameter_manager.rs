// EnvironmentParameterManager - randomized reset parameters, resampled on
// every environment reset.
use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::env::ResetParameters;
use crate::error::TrainerConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sampler_type", rename_all = "snake_case")]
pub enum SamplerSettings {
    Uniform { min_value: f32, max_value: f32 },
    Gaussian { mean: f32, st_dev: f32 },
    MultirangeUniform { intervals: Vec<[f32; 2]> },
}

impl SamplerSettings {
    fn validate(&self, name: &str) -> Result<(), TrainerConfigError> {
        let invalid = |reason: &str| TrainerConfigError::InvalidSampler {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        match self {
            SamplerSettings::Uniform { min_value, max_value } if min_value > max_value => {
                Err(invalid("min_value is greater than max_value"))
            }
            SamplerSettings::Gaussian { st_dev, .. } if *st_dev < 0.0 => {
                Err(invalid("st_dev must be non-negative"))
            }
            SamplerSettings::MultirangeUniform { intervals } if intervals.is_empty() => {
                Err(invalid("at least one interval is required"))
            }
            SamplerSettings::MultirangeUniform { intervals }
                if intervals.iter().any(|[lo, hi]| lo > hi) =>
            {
                Err(invalid("interval lower bound is greater than its upper bound"))
            }
            _ => Ok(()),
        }
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> f32 {
        match self {
            SamplerSettings::Uniform { min_value, max_value } => {
                uniform(rng, *min_value, *max_value)
            }
            SamplerSettings::Gaussian { mean, st_dev } => {
                // Box-Muller
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
                mean + st_dev * z
            }
            SamplerSettings::MultirangeUniform { intervals } => {
                // Pick an interval proportionally to its width, then sample inside it.
                let total: f32 = intervals.iter().map(|[lo, hi]| hi - lo).sum();
                if total <= 0.0 {
                    return intervals[0][0];
                }
                let mut target = rng.gen_range(0.0..total);
                for [lo, hi] in intervals {
                    let width = hi - lo;
                    if target < width {
                        return lo + target;
                    }
                    target -= width;
                }
                intervals[intervals.len() - 1][1]
            }
        }
    }
}

fn uniform<R: Rng>(rng: &mut R, min: f32, max: f32) -> f32 {
    if min >= max {
        min
    } else {
        rng.gen_range(min..max)
    }
}

pub struct EnvironmentParameterManager {
    samplers: BTreeMap<String, SamplerSettings>,
    rng: StdRng,
}

impl EnvironmentParameterManager {
    pub fn new(
        samplers: BTreeMap<String, SamplerSettings>,
        seed: u64,
    ) -> Result<Self, TrainerConfigError> {
        for (name, sampler) in &samplers {
            sampler.validate(name)?;
        }
        Ok(Self {
            samplers,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn empty() -> Self {
        Self {
            samplers: BTreeMap::new(),
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// One value per configured parameter.
    pub fn sample_all(&mut self) -> ResetParameters {
        self.samplers
            .iter()
            .map(|(name, sampler)| (name.clone(), sampler.sample(&mut self.rng)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(entries: &[(&str, SamplerSettings)]) -> EnvironmentParameterManager {
        let samplers = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        EnvironmentParameterManager::new(samplers, 1337).unwrap()
    }

    #[test]
    fn uniform_samples_stay_in_range() {
        let mut manager = manager(&[(
            "mass",
            SamplerSettings::Uniform { min_value: 1.0, max_value: 2.0 },
        )]);
        for _ in 0..100 {
            let value = manager.sample_all()["mass"];
            assert!((1.0..2.0).contains(&value));
        }
    }

    #[test]
    fn multirange_samples_stay_in_intervals() {
        let mut manager = manager(&[(
            "scale",
            SamplerSettings::MultirangeUniform { intervals: vec![[0.0, 1.0], [5.0, 6.0]] },
        )]);
        for _ in 0..200 {
            let value = manager.sample_all()["scale"];
            assert!((0.0..=1.0).contains(&value) || (5.0..=6.0).contains(&value));
        }
    }

    #[test]
    fn gaussian_with_zero_deviation_is_constant() {
        let mut manager = manager(&[("gravity", SamplerSettings::Gaussian { mean: 9.8, st_dev: 0.0 })]);
        assert_eq!(manager.sample_all()["gravity"], 9.8);
    }

    #[test]
    fn same_seed_same_samples() {
        let settings = ("length", SamplerSettings::Uniform { min_value: 0.0, max_value: 100.0 });
        let mut a = manager(&[settings.clone()]);
        let mut b = manager(&[settings]);
        assert_eq!(a.sample_all(), b.sample_all());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut samplers = BTreeMap::new();
        samplers.insert("mass".to_string(), SamplerSettings::Uniform { min_value: 3.0, max_value: 1.0 });
        assert!(EnvironmentParameterManager::new(samplers, 0).is_err());
    }

    #[test]
    fn empty_manager_samples_nothing() {
        let mut manager = EnvironmentParameterManager::empty();
        assert!(manager.is_empty());
        assert!(manager.sample_all().is_empty());
    }

    #[test]
    fn parses_tagged_yaml() {
        let settings: SamplerSettings =
            serde_yaml::from_str("sampler_type: multirange_uniform\nintervals: [[1, 2], [3, 4]]").unwrap();
        assert_eq!(
            settings,
            SamplerSettings::MultirangeUniform { intervals: vec![[1.0, 2.0], [3.0, 4.0]] }
        );
    }
}
