// GhostTrainer - self-play wrapper around a learning trainer
use std::collections::BTreeMap;
use std::path::PathBuf;

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::controller::{EloHandle, EloRating, GhostController};
use crate::env::BehaviorSpec;
use crate::error::TrainerError;
use crate::trainers::agent_processor::{AgentManagerQueue, PolicyQueue, TrajectoryQueue};
use crate::trainers::behavior_id_utils::BehaviorIdentifiers;
use crate::trainers::buffer::Trajectory;
use crate::trainers::policy::{Policy, PolicySnapshot};
use crate::trainers::settings::SelfPlaySettings;
use crate::trainers::trainer::Trainer;

/// Trains one team at a time. Trajectories of the learning team are
/// forwarded to the wrapped trainer; the other teams play fixed snapshots
/// taken from a rolling window of past models and only count ghost steps.
pub struct GhostTrainer {
    trainer: Box<Trainer>,
    controller: GhostController,
    elo: EloHandle,
    settings: SelfPlaySettings,
    parsed_behavior_ids: BTreeMap<String, BehaviorIdentifiers>,
    policies: BTreeMap<String, Policy>,
    trajectory_queues: Vec<TrajectoryQueue>,
    internal_trajectory_queues: BTreeMap<String, TrajectoryQueue>,
    internal_policy_queues: BTreeMap<String, PolicyQueue>,
    team_to_name_to_policy_queue: BTreeMap<i32, BTreeMap<String, PolicyQueue>>,
    wrapped_trainer_team: Option<i32>,
    wrapped_behavior_ids: BTreeMap<String, String>,
    learning_team: i32,
    current_policy_snapshot: BTreeMap<String, PolicySnapshot>,
    policy_snapshots: Vec<BTreeMap<String, PolicySnapshot>>,
    snapshot_counter: usize,
    ghost_step: u64,
    last_save: u64,
    last_swap: u64,
    last_team_change: u64,
    rng: StdRng,
}

impl GhostTrainer {
    pub fn new(
        trainer: Trainer,
        controller: GhostController,
        settings: SelfPlaySettings,
        seed: u64,
    ) -> Self {
        let elo = EloRating::handle(settings.initial_elo, settings.window);
        Self {
            trainer: Box::new(trainer),
            controller,
            elo,
            settings,
            parsed_behavior_ids: BTreeMap::new(),
            policies: BTreeMap::new(),
            trajectory_queues: Vec::new(),
            internal_trajectory_queues: BTreeMap::new(),
            internal_policy_queues: BTreeMap::new(),
            team_to_name_to_policy_queue: BTreeMap::new(),
            wrapped_trainer_team: None,
            wrapped_behavior_ids: BTreeMap::new(),
            learning_team: -1,
            current_policy_snapshot: BTreeMap::new(),
            policy_snapshots: Vec::new(),
            snapshot_counter: 0,
            ghost_step: 0,
            last_save: 0,
            last_swap: 0,
            last_team_change: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn wrapped(&self) -> &Trainer {
        &self.trainer
    }

    pub fn wrapped_mut(&mut self) -> &mut Trainer {
        &mut self.trainer
    }

    pub fn ghost_step(&self) -> u64 {
        self.ghost_step
    }

    pub fn learning_team(&self) -> i32 {
        self.learning_team
    }

    pub fn current_elo(&self) -> f32 {
        self.elo.lock().current_elo()
    }

    pub fn snapshot_count(&self) -> usize {
        self.policy_snapshots.len()
    }

    fn parsed(&self, behavior_id: &str) -> BehaviorIdentifiers {
        self.parsed_behavior_ids
            .get(behavior_id)
            .cloned()
            .unwrap_or_else(|| BehaviorIdentifiers::from_name_behavior_id(behavior_id))
    }

    pub fn create_policy(
        &mut self,
        parsed: &BehaviorIdentifiers,
        spec: &BehaviorSpec,
    ) -> Result<Policy, TrainerError> {
        let policy = self.trainer.create_policy(parsed, spec)?;
        let team_id = parsed.team_id;
        self.controller.subscribe_team_id(team_id, self.elo.clone());

        // First policy, or another agent on the wrapped team
        if self.wrapped_trainer_team.map_or(true, |team| team == team_id) {
            let internal = self.trainer.create_policy(parsed, spec)?;
            self.current_policy_snapshot
                .insert(parsed.brain_name.clone(), internal.snapshot().clone());
            self.trainer.add_policy(parsed, internal);
            self.wrapped_behavior_ids
                .insert(parsed.brain_name.clone(), parsed.behavior_id.clone());
            self.save_snapshot();
            self.learning_team = self.controller.learning_team();
            self.wrapped_trainer_team = Some(team_id);
        }
        Ok(policy)
    }

    pub fn add_policy(&mut self, parsed: &BehaviorIdentifiers, policy: Policy) {
        self.parsed_behavior_ids
            .insert(parsed.behavior_id.clone(), parsed.clone());
        self.policies.insert(parsed.behavior_id.clone(), policy);
    }

    pub fn subscribe_trajectory_queue(&mut self, queue: TrajectoryQueue) {
        let parsed = self.parsed(queue.behavior_id());
        self.trajectory_queues.push(queue);
        if Some(parsed.team_id) == self.wrapped_trainer_team {
            let internal = AgentManagerQueue::new(parsed.brain_name.as_str());
            self.internal_trajectory_queues
                .insert(parsed.brain_name.clone(), internal.clone());
            self.trainer.subscribe_trajectory_queue(internal);
        }
    }

    pub fn publish_policy_queue(&mut self, queue: PolicyQueue) {
        let parsed = self.parsed(queue.behavior_id());
        self.team_to_name_to_policy_queue
            .entry(parsed.team_id)
            .or_default()
            .insert(parsed.brain_name.clone(), queue);
        if Some(parsed.team_id) == self.wrapped_trainer_team {
            let internal = AgentManagerQueue::new(parsed.brain_name.as_str());
            self.internal_policy_queues
                .insert(parsed.brain_name.clone(), internal.clone());
            self.trainer.publish_policy_queue(internal);
        }
    }

    pub fn trajectory_receivers(&self) -> Vec<Receiver<Trajectory>> {
        self.trajectory_queues
            .iter()
            .map(|q| q.receiver().clone())
            .collect()
    }

    /// Updates the ELO rating from a finished episode. The final reward's
    /// sign is read as win, draw or loss.
    fn process_trajectory(&mut self, trajectory: &Trajectory) {
        if !trajectory.done_reached() {
            return;
        }
        let final_reward = trajectory.final_reward();
        let result = if final_reward > 0.0 {
            1.0
        } else if final_reward < 0.0 {
            0.0
        } else {
            0.5
        };
        let rating = self.elo.lock().current_elo();
        let change = self.controller.compute_elo_rating_changes(rating, result);
        let current = {
            let mut elo = self.elo.lock();
            elo.change_current_elo(change);
            elo.current_elo()
        };
        self.trainer.core().stats().add_stat("Self-play/ELO", current);
    }

    pub fn advance(&mut self) -> Result<(), TrainerError> {
        let mut learning = Vec::new();
        for queue in &self.trajectory_queues {
            let parsed = self.parsed(queue.behavior_id());
            let queued = queue.len();
            let drained = (0..queued).map_while(|_| queue.get_nowait());
            if parsed.team_id == self.learning_team {
                learning.extend(drained.map(|t| (parsed.brain_name.clone(), t)));
            } else {
                self.ghost_step += drained.map(|t| t.len() as u64).sum::<u64>();
            }
        }
        for (brain_name, trajectory) in learning {
            self.process_trajectory(&trajectory);
            if let Some(internal) = self.internal_trajectory_queues.get(&brain_name) {
                internal.put(trajectory);
            }
        }

        self.trainer.advance()?;

        let step = self.trainer.step();
        if step.saturating_sub(self.last_team_change) > self.settings.team_change {
            self.controller.change_training_team(step);
            self.last_team_change = step;
        }
        let next_learning_team = self.controller.learning_team();

        // Push the newest model to the learning team, whichever team that is
        for (brain_name, internal) in &self.internal_policy_queues {
            if let Some(snapshot) = internal.latest() {
                self.current_policy_snapshot.insert(brain_name.clone(), snapshot);
            }
            let Some(snapshot) = self.current_policy_snapshot.get(brain_name) else {
                continue;
            };
            let Some(queue) = self
                .team_to_name_to_policy_queue
                .get(&next_learning_team)
                .and_then(|queues| queues.get(brain_name))
            else {
                continue;
            };
            if let Some(policy) = self.policies.get_mut(queue.behavior_id()) {
                policy.load_snapshot(snapshot.clone());
            }
            queue.put(snapshot.clone());
        }

        if step.saturating_sub(self.last_save) > self.settings.save_steps {
            self.save_snapshot();
            self.last_save = step;
        }

        if self.learning_team != next_learning_team
            || self.ghost_step.saturating_sub(self.last_swap) > self.settings.swap_steps
        {
            self.learning_team = next_learning_team;
            self.swap_snapshots();
            self.last_swap = self.ghost_step;
        }
        Ok(())
    }

    fn save_snapshot(&mut self) {
        let window = self.settings.window.max(1);
        for (brain_name, snapshot) in &self.current_policy_snapshot {
            match self.policy_snapshots.get_mut(self.snapshot_counter) {
                Some(slot) => {
                    slot.insert(brain_name.clone(), snapshot.clone());
                }
                None => self
                    .policy_snapshots
                    .push(BTreeMap::from([(brain_name.clone(), snapshot.clone())])),
            }
        }
        self.elo.lock().record_snapshot(self.snapshot_counter);
        self.snapshot_counter = (self.snapshot_counter + 1) % window;
    }

    fn swap_snapshots(&mut self) {
        for (team_id, queues) in &self.team_to_name_to_policy_queue {
            if *team_id == self.learning_team {
                continue;
            }
            let use_past = self.rng.gen::<f32>() < 1.0 - self.settings.play_against_latest_model_ratio;
            let (snapshot, opponent) = if use_past && !self.policy_snapshots.is_empty() {
                let x = self.rng.gen_range(0..self.policy_snapshots.len());
                (&self.policy_snapshots[x], Some(x))
            } else {
                (&self.current_policy_snapshot, None)
            };
            self.elo.lock().set_current_opponent(opponent);
            for (brain_name, queue) in queues {
                let Some(weights) = snapshot.get(brain_name) else {
                    continue;
                };
                if let Some(policy) = self.policies.get_mut(queue.behavior_id()) {
                    policy.load_snapshot(weights.clone());
                }
                queue.put(weights.clone());
            }
            debug!(
                team = team_id,
                opponent = ?opponent,
                ghost_step = self.ghost_step,
                "swapped opponent snapshot"
            );
        }
    }

    fn wrapped_behavior_id(&self, behavior_id: &str) -> String {
        let parsed = self.parsed(behavior_id);
        self.wrapped_behavior_ids
            .get(&parsed.brain_name)
            .cloned()
            .unwrap_or(parsed.behavior_id)
    }

    /// Every team of a brain shares the wrapped trainer's model.
    pub fn save_model(&self, behavior_id: &str) -> Result<PathBuf, TrainerError> {
        self.trainer.save_model(&self.wrapped_behavior_id(behavior_id))
    }

    pub fn export_model(&self, behavior_id: &str) -> Result<PathBuf, TrainerError> {
        self.trainer.export_model(&self.wrapped_behavior_id(behavior_id))
    }

    pub fn end_episode(&mut self) {
        self.trainer.end_episode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::ppo::PPOTrainer;
    use crate::trainers::stats::StatsReporter;
    use crate::trainers::trainer::tests::{parameters, trajectory};

    struct Wired {
        ghost: GhostTrainer,
        trajectories: BTreeMap<i32, TrajectoryQueue>,
        policies: BTreeMap<i32, PolicyQueue>,
        controller: GhostController,
    }

    fn wired(dir: &std::path::Path, settings: SelfPlaySettings) -> Wired {
        let params = parameters("Soccer", dir, "trainer_type: ppo\nmax_steps: 1000");
        let wrapped = Trainer::OnPolicy(PPOTrainer::new(params, StatsReporter::new("Soccer")));
        let controller = GhostController::new(10);
        let mut ghost = GhostTrainer::new(wrapped, controller.clone(), settings, 3);
        let mut trajectories = BTreeMap::new();
        let mut policies = BTreeMap::new();
        for team in 0..2 {
            let id = format!("Soccer?team={team}");
            let parsed = BehaviorIdentifiers::from_name_behavior_id(&id);
            let policy = ghost.create_policy(&parsed, &BehaviorSpec::new(2, 1)).unwrap();
            ghost.add_policy(&parsed, policy);
            let trajectory_queue = AgentManagerQueue::new(id.as_str());
            let policy_queue = AgentManagerQueue::new(id.as_str());
            ghost.publish_policy_queue(policy_queue.clone());
            ghost.subscribe_trajectory_queue(trajectory_queue.clone());
            trajectories.insert(team, trajectory_queue);
            policies.insert(team, policy_queue);
        }
        Wired { ghost, trajectories, policies, controller }
    }

    #[test]
    fn only_learning_team_feeds_wrapped_trainer() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = wired(dir.path(), SelfPlaySettings::default());
        assert_eq!(w.ghost.learning_team(), 0);

        w.trajectories[&0].put(trajectory("Soccer?team=0", 4, 0.0, false));
        w.trajectories[&1].put(trajectory("Soccer?team=1", 6, 0.0, false));
        w.ghost.advance().unwrap();

        assert_eq!(w.ghost.wrapped().step(), 4);
        assert_eq!(w.ghost.ghost_step(), 6);
        // learning team receives the current model every advance
        assert!(w.policies[&0].latest().is_some());
    }

    #[test]
    fn team_change_rotates_learning_team_and_requests_reset() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SelfPlaySettings {
            team_change: 5,
            ..Default::default()
        };
        let mut w = wired(dir.path(), settings);
        w.trajectories[&0].put(trajectory("Soccer?team=0", 6, 0.0, false));
        w.ghost.advance().unwrap();

        assert_eq!(w.controller.learning_team(), 1);
        assert_eq!(w.ghost.learning_team(), 1);
        assert!(w.controller.should_reset());
        // the new learning team is handed the latest model
        assert!(w.policies[&1].latest().is_some());
    }

    #[test]
    fn wins_raise_elo_and_snapshots_roll_over_window() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SelfPlaySettings {
            save_steps: 1,
            window: 2,
            ..Default::default()
        };
        let mut w = wired(dir.path(), settings);
        let initial = w.ghost.current_elo();
        for _ in 0..3 {
            w.trajectories[&0].put(trajectory("Soccer?team=0", 2, 1.0, true));
            w.ghost.advance().unwrap();
        }
        assert!(w.ghost.current_elo() > initial);
        assert_eq!(w.ghost.snapshot_count(), 2);
    }

    #[test]
    fn all_teams_save_the_wrapped_model() {
        let dir = tempfile::tempdir().unwrap();
        let w = wired(dir.path(), SelfPlaySettings::default());
        let saved = w.ghost.save_model("Soccer?team=1").unwrap();
        assert!(saved.ends_with("Soccer/Soccer_team_0-0.json"));
    }
}
