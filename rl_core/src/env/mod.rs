// Environment side of the training loop.
//
// The controller only talks to the simulation through `EnvManager`; the
// scripted implementation is an in-process stand-in used for smoke runs.
use std::collections::{BTreeMap, HashMap};

use crate::error::EnvironmentError;
use crate::trainers::agent_processor::AgentManager;
use crate::trainers::policy::Policy;

pub mod scripted;

pub use scripted::{ScriptedEnvironment, ScriptedEnvironmentConfig};

/// Reset parameters handed to the environment on every reset.
pub type ResetParameters = HashMap<String, f32>;

/// Shape of the observations and actions of one behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorSpec {
    pub observation_size: usize,
    pub action_size: usize,
}

impl BehaviorSpec {
    pub fn new(observation_size: usize, action_size: usize) -> Self {
        Self {
            observation_size,
            action_size,
        }
    }
}

pub trait EnvManager {
    /// Behaviors currently active in the simulation, keyed by behavior id.
    fn external_brains(&self) -> BTreeMap<String, BehaviorSpec>;

    fn reset(&mut self, config: &ResetParameters) -> Result<(), EnvironmentError>;

    /// Steps the simulation and returns how many steps were taken.
    fn advance(&mut self) -> Result<usize, EnvironmentError>;

    fn set_policy(&mut self, behavior_id: &str, policy: Policy);

    fn set_agent_manager(&mut self, behavior_id: &str, manager: AgentManager);
}
