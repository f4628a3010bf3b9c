// Scripted in-process environment. Agents emit deterministic rewards and
// fixed-length episodes so runs are reproducible without a simulator.
use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::env::{BehaviorSpec, EnvManager, ResetParameters};
use crate::error::EnvironmentError;
use crate::trainers::agent_processor::AgentManager;
use crate::trainers::buffer::Experience;
use crate::trainers::policy::Policy;
use crate::utils::CancellationToken;

/// Reset parameter that scales the per-step reward when present.
pub const REWARD_SCALE_PARAMETER: &str = "reward_scale";

#[derive(Debug, Clone)]
pub struct ScriptedBehavior {
    pub behavior_id: String,
    pub spec: BehaviorSpec,
    /// Environment step from which the behavior is reported as active.
    pub appears_at_step: u64,
}

#[derive(Debug, Clone)]
pub struct ScriptedEnvironmentConfig {
    pub behaviors: Vec<ScriptedBehavior>,
    pub agents_per_behavior: usize,
    pub steps_per_advance: usize,
    pub episode_length: usize,
    pub reward_per_step: f32,
    pub seed: u64,
}

impl Default for ScriptedEnvironmentConfig {
    fn default() -> Self {
        Self {
            behaviors: Vec::new(),
            agents_per_behavior: 1,
            steps_per_advance: 1,
            episode_length: 100,
            reward_per_step: 0.01,
            seed: 0,
        }
    }
}

impl ScriptedEnvironmentConfig {
    pub fn with_behavior(mut self, behavior_id: &str, spec: BehaviorSpec) -> Self {
        self.behaviors.push(ScriptedBehavior {
            behavior_id: behavior_id.to_string(),
            spec,
            appears_at_step: 0,
        });
        self
    }

    pub fn with_late_behavior(mut self, behavior_id: &str, spec: BehaviorSpec, step: u64) -> Self {
        self.behaviors.push(ScriptedBehavior {
            behavior_id: behavior_id.to_string(),
            spec,
            appears_at_step: step,
        });
        self
    }
}

pub struct ScriptedEnvironment {
    config: ScriptedEnvironmentConfig,
    step: u64,
    rng: StdRng,
    managers: BTreeMap<String, AgentManager>,
    policies: HashMap<String, Policy>,
    episode_steps: HashMap<(String, usize), usize>,
    reset_parameters: ResetParameters,
    reset_count: usize,
    failure: Option<(u64, EnvironmentError)>,
    interrupt: Option<(u64, CancellationToken)>,
}

impl ScriptedEnvironment {
    pub fn new(config: ScriptedEnvironmentConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            step: 0,
            rng,
            managers: BTreeMap::new(),
            policies: HashMap::new(),
            episode_steps: HashMap::new(),
            reset_parameters: ResetParameters::new(),
            reset_count: 0,
            failure: None,
            interrupt: None,
        }
    }

    /// Makes every `advance` from environment step `step` onward fail.
    pub fn fail_from_step(mut self, step: u64, error: EnvironmentError) -> Self {
        self.failure = Some((step, error));
        self
    }

    /// Cancels `token` once the environment has taken `step` steps.
    pub fn interrupt_at_step(mut self, step: u64, token: CancellationToken) -> Self {
        self.interrupt = Some((step, token));
        self
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn reset_count(&self) -> usize {
        self.reset_count
    }

    pub fn reset_parameters(&self) -> &ResetParameters {
        &self.reset_parameters
    }

    pub fn bound_behaviors(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    fn reward(&self) -> f32 {
        let scale = self
            .reset_parameters
            .get(REWARD_SCALE_PARAMETER)
            .copied()
            .unwrap_or(1.0);
        self.config.reward_per_step * scale
    }

    fn step_behaviors(&mut self) {
        let reward = self.reward();
        let episode_length = self.config.episode_length.max(1);
        for (behavior_id, manager) in self.managers.iter_mut() {
            let Some(policy) = self.policies.get_mut(behavior_id) else {
                continue;
            };
            let current = manager.current_policy();
            if current.version() != policy.version() {
                policy.load_snapshot(current.snapshot().clone());
            }
            let observation_size = policy.spec().observation_size;
            for agent in 0..self.config.agents_per_behavior {
                let observation: Vec<f32> =
                    (0..observation_size).map(|_| self.rng.gen_range(-1.0..1.0)).collect();
                let action = policy.evaluate(&observation);
                let counter = self
                    .episode_steps
                    .entry((behavior_id.clone(), agent))
                    .or_insert(0);
                *counter += 1;
                let done = *counter >= episode_length;
                if done {
                    *counter = 0;
                }
                manager.add_experience(
                    &agent.to_string(),
                    Experience {
                        observation,
                        action,
                        reward,
                        done,
                    },
                );
            }
        }
    }
}

impl EnvManager for ScriptedEnvironment {
    fn external_brains(&self) -> BTreeMap<String, BehaviorSpec> {
        self.config
            .behaviors
            .iter()
            .filter(|b| b.appears_at_step <= self.step)
            .map(|b| (b.behavior_id.clone(), b.spec.clone()))
            .collect()
    }

    fn reset(&mut self, config: &ResetParameters) -> Result<(), EnvironmentError> {
        self.reset_parameters = config.clone();
        self.reset_count += 1;
        self.episode_steps.clear();
        for manager in self.managers.values_mut() {
            manager.end_episode();
        }
        debug!(resets = self.reset_count, ?config, "scripted environment reset");
        Ok(())
    }

    fn advance(&mut self) -> Result<usize, EnvironmentError> {
        if let Some((at, error)) = &self.failure {
            if self.step >= *at {
                return Err(error.clone());
            }
        }
        for _ in 0..self.config.steps_per_advance {
            self.step_behaviors();
            self.step += 1;
        }
        if let Some((at, token)) = &self.interrupt {
            if self.step >= *at {
                token.cancel();
            }
        }
        Ok(self.config.steps_per_advance)
    }

    fn set_policy(&mut self, behavior_id: &str, policy: Policy) {
        self.policies.insert(behavior_id.to_string(), policy);
    }

    fn set_agent_manager(&mut self, behavior_id: &str, manager: AgentManager) {
        self.managers.insert(behavior_id.to_string(), manager);
    }
}
