// Trainer - shared bookkeeping and the closed set of trainer kinds
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::env::BehaviorSpec;
use crate::error::TrainerError;
use crate::trainers::agent_processor::{PolicyQueue, TrajectoryQueue};
use crate::trainers::behavior_id_utils::BehaviorIdentifiers;
use crate::trainers::buffer::{Experience, Trajectory};
use crate::trainers::checkpoint::{CheckpointManager, ModelCheckpoint};
use crate::trainers::ghost::GhostTrainer;
use crate::trainers::policy::{Policy, PolicySnapshot};
use crate::trainers::ppo::PPOTrainer;
use crate::trainers::sac::SACTrainer;
use crate::trainers::settings::TrainerSettings;
use crate::trainers::stats::StatsReporter;

/// Trainers are shared between the control thread and, for threaded
/// trainers, one worker thread.
pub type SharedTrainer = Arc<Mutex<Trainer>>;

/// Most recent episode rewards, newest first, bounded by `capacity`.
#[derive(Debug, Clone)]
pub struct RewardHistory {
    values: VecDeque<f32>,
    capacity: usize,
}

impl RewardHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, reward: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() >= self.capacity {
            self.values.pop_back();
        }
        self.values.push_front(reward);
    }

    /// NaN when empty.
    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return f32::NAN;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }
}

/// Lock-free view of a trainer's progress, readable by the controller while a
/// worker holds the trainer.
#[derive(Debug, Clone)]
pub struct TrainerProgress {
    step: Arc<AtomicU64>,
    rewards: Arc<RwLock<RewardHistory>>,
    max_steps: u64,
    is_training: bool,
}

impl TrainerProgress {
    pub fn new(max_steps: u64, is_training: bool, reward_buff_cap: usize) -> Self {
        Self {
            step: Arc::new(AtomicU64::new(0)),
            rewards: Arc::new(RwLock::new(RewardHistory::new(reward_buff_cap))),
            max_steps,
            is_training,
        }
    }

    pub fn step(&self) -> u64 {
        self.step.load(Ordering::Acquire)
    }

    pub fn set_step(&self, step: u64) {
        self.step.store(step, Ordering::Release);
    }

    pub fn increment_step(&self, n: u64) -> u64 {
        self.step.fetch_add(n, Ordering::AcqRel) + n
    }

    pub fn max_steps(&self) -> u64 {
        self.max_steps
    }

    pub fn is_training(&self) -> bool {
        self.is_training
    }

    pub fn should_still_train(&self) -> bool {
        self.is_training && self.step() < self.max_steps
    }

    pub fn push_reward(&self, reward: f32) {
        self.rewards.write().push(reward);
    }

    pub fn mean_reward(&self) -> f32 {
        self.rewards.read().mean()
    }

    pub fn reward_buffer_len(&self) -> usize {
        self.rewards.read().len()
    }

    pub fn reward_buffer(&self) -> Vec<f32> {
        self.rewards.read().to_vec()
    }

    pub fn clear_rewards(&self) {
        self.rewards.write().clear();
    }
}

/// Everything the factory derives for one brain.
#[derive(Debug, Clone)]
pub struct TrainerParameters {
    pub brain_name: String,
    pub settings: TrainerSettings,
    pub train_model: bool,
    pub load_model: bool,
    pub seed: u64,
    /// `<model_dir>/<brain>`
    pub model_path: PathBuf,
    /// `<run_id>_<brain>`
    pub summary_path: String,
    pub keep_checkpoints: usize,
    pub reward_buff_cap: usize,
    /// Model directory of a previous run to initialize from.
    pub init_path: Option<PathBuf>,
}

/// State common to every learning trainer: policies, queues, progress,
/// episode bookkeeping, stats and checkpoints.
pub struct TrainerCore {
    params: TrainerParameters,
    progress: TrainerProgress,
    stats: StatsReporter,
    checkpoints: CheckpointManager,
    model: Option<PolicySnapshot>,
    spec: Option<BehaviorSpec>,
    policies: BTreeMap<String, Policy>,
    trajectory_queues: Vec<TrajectoryQueue>,
    policy_queues: Vec<PolicyQueue>,
    episode_rewards: HashMap<String, f32>,
    episode_steps: HashMap<String, usize>,
    next_summary_step: u64,
    pub(crate) rng: StdRng,
}

impl TrainerCore {
    pub fn new(params: TrainerParameters, stats: StatsReporter) -> Self {
        let progress = TrainerProgress::new(
            params.settings.max_steps,
            params.train_model,
            params.reward_buff_cap,
        );
        let checkpoints = CheckpointManager::new(&params.model_path, params.keep_checkpoints);
        let rng = StdRng::seed_from_u64(params.seed);
        let next_summary_step = params.settings.summary_freq.max(1);
        Self {
            params,
            progress,
            stats,
            checkpoints,
            model: None,
            spec: None,
            policies: BTreeMap::new(),
            trajectory_queues: Vec::new(),
            policy_queues: Vec::new(),
            episode_rewards: HashMap::new(),
            episode_steps: HashMap::new(),
            next_summary_step,
            rng,
        }
    }

    pub fn brain_name(&self) -> &str {
        &self.params.brain_name
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.params.settings
    }

    pub fn parameters(&self) -> &TrainerParameters {
        &self.params
    }

    pub fn progress(&self) -> &TrainerProgress {
        &self.progress
    }

    pub fn stats(&self) -> &StatsReporter {
        &self.stats
    }

    pub fn model(&self) -> Option<&PolicySnapshot> {
        self.model.as_ref()
    }

    /// Initial model for a new brain: the newest checkpoint when resuming,
    /// the initialization run's export otherwise, else fresh weights.
    fn initial_model(
        &self,
        parsed: &BehaviorIdentifiers,
        spec: &BehaviorSpec,
    ) -> Result<PolicySnapshot, TrainerError> {
        if self.params.load_model {
            if let Some(checkpoint) = self.checkpoints.latest(&parsed.behavior_id)? {
                info!(
                    brain = %self.params.brain_name,
                    step = checkpoint.step,
                    "resuming from checkpoint"
                );
                self.progress.set_step(checkpoint.step);
                return Ok(checkpoint.policy);
            }
        }
        if let Some(init_path) = &self.params.init_path {
            let source = CheckpointManager::new(init_path.join(&self.params.brain_name), 1);
            if let Some(checkpoint) = source.latest(&parsed.behavior_id)? {
                info!(
                    brain = %self.params.brain_name,
                    from = %init_path.display(),
                    "initializing model from previous run"
                );
                return Ok(checkpoint.policy);
            }
        }
        Ok(PolicySnapshot::initial(spec))
    }

    pub fn create_policy(
        &mut self,
        parsed: &BehaviorIdentifiers,
        spec: &BehaviorSpec,
    ) -> Result<Policy, TrainerError> {
        if self.spec.is_none() {
            self.spec = Some(spec.clone());
        }
        let model = match &self.model {
            Some(model) => model.clone(),
            None => {
                let model = self.initial_model(parsed, spec)?;
                self.model = Some(model.clone());
                model
            }
        };
        Ok(Policy::new(parsed.clone(), spec.clone()).with_snapshot(model))
    }

    pub fn add_policy(&mut self, parsed: &BehaviorIdentifiers, policy: Policy) {
        if self.model.is_none() {
            self.model = Some(policy.snapshot().clone());
        }
        self.policies.insert(parsed.behavior_id.clone(), policy);
    }

    pub fn get_policy(&self, behavior_id: &str) -> Option<&Policy> {
        self.policies.get(behavior_id)
    }

    pub fn subscribe_trajectory_queue(&mut self, queue: TrajectoryQueue) {
        self.trajectory_queues.push(queue);
    }

    pub fn publish_policy_queue(&mut self, queue: PolicyQueue) {
        self.policy_queues.push(queue);
    }

    pub fn trajectory_receivers(&self) -> Vec<Receiver<Trajectory>> {
        self.trajectory_queues
            .iter()
            .map(|q| q.receiver().clone())
            .collect()
    }

    /// Takes at most what is queued right now from every trajectory queue,
    /// so a fast producer cannot keep the trainer draining forever.
    pub fn drain_trajectories(&self) -> Vec<Trajectory> {
        let mut trajectories = Vec::new();
        for queue in &self.trajectory_queues {
            let queued = queue.len();
            trajectories.extend((0..queued).map_while(|_| queue.get_nowait()));
        }
        trajectories
    }

    /// Rejects experiences whose shapes differ from the brain's spec.
    fn check_trajectory(&self, trajectory: &Trajectory) -> Result<(), TrainerError> {
        let Some(spec) = &self.spec else {
            return Ok(());
        };
        let malformed = trajectory.steps.iter().position(|e| {
            e.observation.len() != spec.observation_size || e.action.len() != spec.action_size
        });
        match malformed {
            Some(index) => Err(TrainerError::InvalidTrajectory {
                brain: self.params.brain_name.clone(),
                behavior_id: trajectory.behavior_id.clone(),
                reason: format!(
                    "step {index} has {} observations and {} actions, expected {} and {}",
                    trajectory.steps[index].observation.len(),
                    trajectory.steps[index].action.len(),
                    spec.observation_size,
                    spec.action_size
                ),
            }),
            None => Ok(()),
        }
    }

    /// Step counting, episode statistics and summary cadence for one
    /// trajectory.
    pub fn record_trajectory(&mut self, trajectory: &Trajectory) -> Result<(), TrainerError> {
        self.check_trajectory(trajectory)?;
        let agent_key = format!("{}:{}", trajectory.behavior_id, trajectory.agent_id);
        *self.episode_rewards.entry(agent_key.clone()).or_default() += trajectory.total_reward();
        *self.episode_steps.entry(agent_key.clone()).or_default() += trajectory.len();

        let step = self.progress.increment_step(trajectory.len() as u64);
        if trajectory.done_reached() {
            let reward = self.episode_rewards.remove(&agent_key).unwrap_or(0.0);
            let length = self.episode_steps.remove(&agent_key).unwrap_or(0);
            self.progress.push_reward(reward);
            self.stats.add_stat("Environment/Cumulative Reward", reward);
            self.stats.add_stat("Environment/Episode Length", length as f32);
        }
        self.maybe_write_summary(step);
        Ok(())
    }

    fn maybe_write_summary(&mut self, step: u64) {
        if step == 0 || step < self.next_summary_step {
            return;
        }
        self.stats.write_stats(self.next_summary_step);
        let freq = self.params.settings.summary_freq.max(1);
        self.next_summary_step = (step / freq + 1) * freq;
    }

    /// Produces the next model version from a batch. The parameter update is
    /// a stand-in for the learning backend: weights drift towards the batch
    /// mean reward.
    pub fn apply_update(&mut self, batch: &[Experience]) {
        let Some(model) = self.model.as_mut() else {
            return;
        };
        let mean_reward = if batch.is_empty() {
            0.0
        } else {
            batch.iter().map(|e| e.reward).sum::<f32>() / batch.len() as f32
        };
        for weight in model.weights.iter_mut() {
            *weight = 0.99 * *weight + 0.01 * mean_reward;
        }
        model.version += 1;
        let model = model.clone();
        for policy in self.policies.values_mut() {
            policy.load_snapshot(model.clone());
        }
        self.stats.add_stat("Policy/Batch Mean Reward", mean_reward);
        debug!(
            brain = %self.params.brain_name,
            version = model.version,
            batch = batch.len(),
            "policy updated"
        );
    }

    /// Puts the current model on every published policy queue.
    pub fn publish(&self) {
        if let Some(model) = &self.model {
            for queue in &self.policy_queues {
                queue.put(model.clone());
            }
        }
    }

    fn checkpoint(&self, behavior_id: &str) -> Result<ModelCheckpoint, TrainerError> {
        let policy = self
            .policies
            .get(behavior_id)
            .ok_or_else(|| TrainerError::UnknownBehavior {
                brain: self.params.brain_name.clone(),
                behavior_id: behavior_id.to_string(),
            })?;
        Ok(ModelCheckpoint {
            brain_name: self.params.brain_name.clone(),
            behavior_id: behavior_id.to_string(),
            step: self.progress.step(),
            policy: policy.snapshot().clone(),
            created_at: Utc::now(),
        })
    }

    pub fn save_model(&self, behavior_id: &str) -> Result<PathBuf, TrainerError> {
        self.checkpoints.save_checkpoint(&self.checkpoint(behavior_id)?)
    }

    pub fn export_model(&self, behavior_id: &str) -> Result<PathBuf, TrainerError> {
        self.checkpoints.export_model(&self.checkpoint(behavior_id)?)
    }

    pub fn end_episode(&mut self) {
        self.episode_rewards.clear();
        self.episode_steps.clear();
    }
}

/// The closed set of trainer kinds built by the factory.
pub enum Trainer {
    OnPolicy(PPOTrainer),
    OffPolicy(SACTrainer),
    SelfPlay(Box<GhostTrainer>),
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("kind", &self.kind())
            .field("brain_name", &self.brain_name())
            .field("step", &self.step())
            .finish()
    }
}

impl Trainer {
    pub fn kind(&self) -> &'static str {
        match self {
            Trainer::OnPolicy(_) => "ppo",
            Trainer::OffPolicy(_) => "sac",
            Trainer::SelfPlay(_) => "ghost",
        }
    }

    /// The learning core; for self-play, the wrapped trainer's.
    pub fn core(&self) -> &TrainerCore {
        match self {
            Trainer::OnPolicy(t) => t.core(),
            Trainer::OffPolicy(t) => t.core(),
            Trainer::SelfPlay(t) => t.wrapped().core(),
        }
    }

    fn core_mut(&mut self) -> &mut TrainerCore {
        match self {
            Trainer::OnPolicy(t) => t.core_mut(),
            Trainer::OffPolicy(t) => t.core_mut(),
            Trainer::SelfPlay(t) => t.wrapped_mut().core_mut(),
        }
    }

    pub fn brain_name(&self) -> &str {
        self.core().brain_name()
    }

    pub fn create_policy(
        &mut self,
        parsed: &BehaviorIdentifiers,
        spec: &BehaviorSpec,
    ) -> Result<Policy, TrainerError> {
        match self {
            Trainer::SelfPlay(t) => t.create_policy(parsed, spec),
            _ => self.core_mut().create_policy(parsed, spec),
        }
    }

    pub fn add_policy(&mut self, parsed: &BehaviorIdentifiers, policy: Policy) {
        match self {
            Trainer::SelfPlay(t) => t.add_policy(parsed, policy),
            _ => self.core_mut().add_policy(parsed, policy),
        }
    }

    pub fn subscribe_trajectory_queue(&mut self, queue: TrajectoryQueue) {
        match self {
            Trainer::SelfPlay(t) => t.subscribe_trajectory_queue(queue),
            _ => self.core_mut().subscribe_trajectory_queue(queue),
        }
    }

    pub fn publish_policy_queue(&mut self, queue: PolicyQueue) {
        match self {
            Trainer::SelfPlay(t) => t.publish_policy_queue(queue),
            _ => self.core_mut().publish_policy_queue(queue),
        }
    }

    /// Receivers a worker waits on before advancing.
    pub fn trajectory_receivers(&self) -> Vec<Receiver<Trajectory>> {
        match self {
            Trainer::SelfPlay(t) => t.trajectory_receivers(),
            _ => self.core().trajectory_receivers(),
        }
    }

    /// Consumes queued trajectories and updates the model when ready.
    /// Never blocks.
    pub fn advance(&mut self) -> Result<(), TrainerError> {
        match self {
            Trainer::OnPolicy(t) => t.advance(),
            Trainer::OffPolicy(t) => t.advance(),
            Trainer::SelfPlay(t) => t.advance(),
        }
    }

    pub fn end_episode(&mut self) {
        match self {
            Trainer::SelfPlay(t) => t.end_episode(),
            _ => self.core_mut().end_episode(),
        }
    }

    pub fn save_model(&self, behavior_id: &str) -> Result<PathBuf, TrainerError> {
        match self {
            Trainer::SelfPlay(t) => t.save_model(behavior_id),
            _ => self.core().save_model(behavior_id),
        }
    }

    pub fn export_model(&self, behavior_id: &str) -> Result<PathBuf, TrainerError> {
        match self {
            Trainer::SelfPlay(t) => t.export_model(behavior_id),
            _ => self.core().export_model(behavior_id),
        }
    }

    pub fn progress(&self) -> TrainerProgress {
        self.core().progress().clone()
    }

    pub fn stats(&self) -> StatsReporter {
        self.core().stats().clone()
    }

    pub fn step(&self) -> u64 {
        self.core().progress().step()
    }

    pub fn max_steps(&self) -> u64 {
        self.core().progress().max_steps()
    }

    pub fn reward_buffer(&self) -> Vec<f32> {
        self.core().progress().reward_buffer()
    }

    pub fn should_still_train(&self) -> bool {
        self.core().progress().should_still_train()
    }

    pub fn threaded(&self) -> bool {
        self.core().settings().threaded
    }

    pub fn settings(&self) -> &TrainerSettings {
        self.core().settings()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn parameters(brain: &str, dir: &std::path::Path, yaml: &str) -> TrainerParameters {
        TrainerParameters {
            brain_name: brain.to_string(),
            settings: serde_yaml::from_str(yaml).unwrap(),
            train_model: true,
            load_model: false,
            seed: 7,
            model_path: dir.join(brain),
            summary_path: format!("test_{brain}"),
            keep_checkpoints: 5,
            reward_buff_cap: 3,
            init_path: None,
        }
    }

    pub(crate) fn trajectory(behavior_id: &str, len: usize, reward: f32, done: bool) -> Trajectory {
        let steps = (0..len)
            .map(|i| Experience {
                observation: vec![0.0; 2],
                action: vec![0.0],
                reward,
                done: done && i + 1 == len,
            })
            .collect();
        Trajectory {
            behavior_id: behavior_id.to_string(),
            agent_id: "0".to_string(),
            steps,
        }
    }

    #[test]
    fn reward_history_is_bounded_newest_first() {
        let mut history = RewardHistory::new(2);
        assert!(history.mean().is_nan());
        history.push(1.0);
        history.push(2.0);
        history.push(3.0);
        assert_eq!(history.to_vec(), vec![3.0, 2.0]);
        assert_eq!(history.mean(), 2.5);
    }

    #[test]
    fn progress_is_shared_between_clones() {
        let progress = TrainerProgress::new(10, true, 4);
        let view = progress.clone();
        progress.increment_step(10);
        assert!(!view.should_still_train());
        view.push_reward(1.0);
        assert_eq!(progress.reward_buffer_len(), 1);
        view.clear_rewards();
        assert_eq!(progress.reward_buffer_len(), 0);

        let inference = TrainerProgress::new(10, false, 1);
        assert!(!inference.should_still_train());
    }

    #[test]
    fn core_records_episodes_and_saves_models() {
        let dir = tempfile::tempdir().unwrap();
        let params = parameters("Ball", dir.path(), "trainer_type: ppo\nsummary_freq: 4");
        let mut core = TrainerCore::new(params, StatsReporter::new("Ball"));
        let parsed = BehaviorIdentifiers::from_name_behavior_id("Ball");
        let policy = core.create_policy(&parsed, &BehaviorSpec::new(2, 1)).unwrap();
        core.add_policy(&parsed, policy);

        core.record_trajectory(&trajectory("Ball", 3, 1.0, false)).unwrap();
        core.record_trajectory(&trajectory("Ball", 2, 1.0, true)).unwrap();
        assert_eq!(core.progress().step(), 5);
        assert_eq!(core.progress().reward_buffer(), vec![5.0]);

        let saved = core.save_model("Ball").unwrap();
        assert!(saved.ends_with("Ball/Ball-5.json"));
        assert!(matches!(
            core.save_model("Walker"),
            Err(TrainerError::UnknownBehavior { .. })
        ));
    }

    #[test]
    fn malformed_trajectory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let params = parameters("Ball", dir.path(), "trainer_type: ppo");
        let mut core = TrainerCore::new(params, StatsReporter::new("Ball"));
        let parsed = BehaviorIdentifiers::from_name_behavior_id("Ball");
        let policy = core.create_policy(&parsed, &BehaviorSpec::new(3, 1)).unwrap();
        core.add_policy(&parsed, policy);

        assert!(matches!(
            core.record_trajectory(&trajectory("Ball", 2, 1.0, true)),
            Err(TrainerError::InvalidTrajectory { .. })
        ));
        assert_eq!(core.progress().step(), 0);
    }

    #[test]
    fn resume_loads_latest_checkpoint_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = BehaviorIdentifiers::from_name_behavior_id("Ball");
        let spec = BehaviorSpec::new(2, 1);
        {
            let params = parameters("Ball", dir.path(), "trainer_type: ppo");
            let mut core = TrainerCore::new(params, StatsReporter::new("Ball"));
            let policy = core.create_policy(&parsed, &spec).unwrap();
            core.add_policy(&parsed, policy);
            core.record_trajectory(&trajectory("Ball", 4, 1.0, true)).unwrap();
            core.apply_update(&[]);
            core.save_model("Ball").unwrap();
        }
        let mut params = parameters("Ball", dir.path(), "trainer_type: ppo");
        params.load_model = true;
        let mut core = TrainerCore::new(params, StatsReporter::new("Ball"));
        let policy = core.create_policy(&parsed, &spec).unwrap();
        assert_eq!(policy.version(), 1);
        assert_eq!(core.progress().step(), 4);
    }
}
