// Policy - action-selection state bound to one behavior id
use serde::{Deserialize, Serialize};

use crate::env::BehaviorSpec;
use crate::trainers::behavior_id_utils::BehaviorIdentifiers;

/// The transferable part of a policy. The parameter vector is opaque to the
/// orchestrator; it is produced by the trainer's update step and persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub version: u64,
    pub weights: Vec<f32>,
}

impl PolicySnapshot {
    pub fn initial(spec: &BehaviorSpec) -> Self {
        Self {
            version: 0,
            weights: vec![0.0; spec.observation_size * spec.action_size],
        }
    }
}

/// A policy owned by a trainer. Clones are independent: the environment side
/// receives its own copy and picks up newer snapshots through the policy queue.
#[derive(Debug, Clone)]
pub struct Policy {
    behavior: BehaviorIdentifiers,
    spec: BehaviorSpec,
    snapshot: PolicySnapshot,
}

impl Policy {
    pub fn new(behavior: BehaviorIdentifiers, spec: BehaviorSpec) -> Self {
        let snapshot = PolicySnapshot::initial(&spec);
        Self { behavior, spec, snapshot }
    }

    pub fn with_snapshot(mut self, snapshot: PolicySnapshot) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn behavior_id(&self) -> &str {
        &self.behavior.behavior_id
    }

    pub fn behavior(&self) -> &BehaviorIdentifiers {
        &self.behavior
    }

    pub fn spec(&self) -> &BehaviorSpec {
        &self.spec
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn snapshot(&self) -> &PolicySnapshot {
        &self.snapshot
    }

    pub fn load_snapshot(&mut self, snapshot: PolicySnapshot) {
        self.snapshot = snapshot;
    }

    /// Action for one observation. Placeholder linear map over the opaque
    /// weights; real inference lives with the learning backend.
    pub fn evaluate(&self, observation: &[f32]) -> Vec<f32> {
        let obs = self.spec.observation_size;
        (0..self.spec.action_size)
            .map(|a| {
                observation
                    .iter()
                    .take(obs)
                    .enumerate()
                    .map(|(i, o)| o * self.snapshot.weights.get(a * obs + i).copied().unwrap_or(0.0))
                    .sum()
            })
            .collect()
    }
}
