// TrainerController - drives the environment, the trainers and their workers
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Select, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::env::{BehaviorSpec, EnvManager};
use crate::error::{TrainerError, TrainingError};
use crate::trainers::agent_processor::AgentManager;
use crate::trainers::behavior_id_utils::{BehaviorIdentifiers, BehaviorRegistry};
use crate::trainers::curriculum::{MeasureType, MetaCurriculum};
use crate::trainers::environment_parameter_manager::EnvironmentParameterManager;
use crate::trainers::ghost::GhostController;
use crate::trainers::notifier::{CompletionNotifier, CompletionStatus, NoopNotifier};
use crate::trainers::stats::StatsReporter;
use crate::trainers::trainer::{SharedTrainer, TrainerProgress};
use crate::trainers::trainer_util::TrainerFactory;
use crate::utils::{create_directory_if_not_exists, CancellationToken, TimerNode};

/// How long a worker waits on its trajectory queues before re-checking the
/// kill flag.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a run that ended without a fatal error.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub global_step: u64,
    /// Global steps at which every model was checkpointed, final save included.
    pub checkpoint_steps: Vec<u64>,
    pub exported: bool,
    pub interrupted: bool,
}

enum LoopExit {
    Finished,
    Interrupted,
}

struct TrainerHandle {
    trainer: SharedTrainer,
    progress: TrainerProgress,
    stats: StatsReporter,
    threaded: bool,
}

struct TrainerWorker {
    brain_name: String,
    handle: JoinHandle<()>,
    done: Receiver<TimerNode>,
}

#[derive(Debug)]
struct WorkerFailure {
    brain_name: String,
    error: TrainerError,
}

pub struct TrainerController {
    trainer_factory: TrainerFactory,
    model_path: PathBuf,
    save_freq: u64,
    train_model: bool,
    meta_curriculum: Option<MetaCurriculum>,
    sampler_manager: EnvironmentParameterManager,
    resampling_interval: Option<u64>,
    ghost_controller: GhostController,
    trainers: BTreeMap<String, TrainerHandle>,
    registry: BehaviorRegistry,
    global_step: u64,
    kill_trainers: CancellationToken,
    workers: Vec<TrainerWorker>,
    failure_tx: Sender<WorkerFailure>,
    failure_rx: Receiver<WorkerFailure>,
    join_timeout: Duration,
    notifier: Box<dyn CompletionNotifier>,
    timers: TimerNode,
    checkpoint_steps: Vec<u64>,
    exported: bool,
}

impl TrainerController {
    pub fn new(
        trainer_factory: TrainerFactory,
        model_path: PathBuf,
        save_freq: u64,
        meta_curriculum: Option<MetaCurriculum>,
        train: bool,
        sampler_manager: EnvironmentParameterManager,
        resampling_interval: Option<u64>,
    ) -> Self {
        let ghost_controller = trainer_factory.ghost_controller().clone();
        let (failure_tx, failure_rx) = crossbeam_channel::unbounded();
        Self {
            trainer_factory,
            model_path,
            save_freq,
            train_model: train,
            meta_curriculum,
            sampler_manager,
            resampling_interval,
            ghost_controller,
            trainers: BTreeMap::new(),
            registry: BehaviorRegistry::new(),
            global_step: 0,
            kill_trainers: CancellationToken::new(),
            workers: Vec::new(),
            failure_tx,
            failure_rx,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            notifier: Box::new(NoopNotifier),
            timers: TimerNode::new(),
            checkpoint_steps: Vec::new(),
            exported: false,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn CompletionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Bounded wait per worker when shutting down.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn brain_names(&self) -> impl Iterator<Item = &str> {
        self.trainers.keys().map(String::as_str)
    }

    pub fn trainer(&self, brain_name: &str) -> Option<SharedTrainer> {
        self.trainers.get(brain_name).map(|h| h.trainer.clone())
    }

    pub fn registry(&self) -> &BehaviorRegistry {
        &self.registry
    }

    pub fn meta_curriculum(&self) -> Option<&MetaCurriculum> {
        self.meta_curriculum.as_ref()
    }

    pub fn timers(&self) -> &TimerNode {
        &self.timers
    }

    /// Runs until every trainer is done or `interrupt` is cancelled, then
    /// stops the workers, checkpoints and exports. An interrupt or a stopped
    /// communicator ends the run cleanly; any other environment or trainer
    /// failure is returned after the models were saved.
    pub fn start_learning(
        &mut self,
        env: &mut dyn EnvManager,
        interrupt: &CancellationToken,
    ) -> Result<TrainingSummary, TrainingError> {
        create_directory_if_not_exists(&self.model_path)?;

        let mut interrupted = false;
        let result = match self.run_loop(env, interrupt) {
            Ok(LoopExit::Finished) => {
                self.join_threads();
                if self.global_step != 0 && self.train_model {
                    self.save_models()
                } else {
                    Ok(())
                }
            }
            Ok(LoopExit::Interrupted) => {
                interrupted = true;
                self.join_threads();
                self.save_model_when_interrupted();
                Ok(())
            }
            Err(TrainingError::Environment(err)) if err.is_graceful_shutdown() => {
                info!(step = self.global_step, "environment stopped the communicator");
                interrupted = true;
                self.join_threads();
                self.save_model_when_interrupted();
                Ok(())
            }
            Err(err @ (TrainingError::Environment(_) | TrainingError::Trainer(_))) => {
                error!(step = self.global_step, error = %err, "training failed");
                self.join_threads();
                self.save_model_when_interrupted();
                Err(err)
            }
            Err(err) => {
                self.join_threads();
                Err(err)
            }
        };

        let export = if self.train_model {
            self.export_models()
        } else {
            Ok(())
        };

        match (result, export) {
            (Err(err), Err(export_err)) => {
                warn!(error = %export_err, "model export failed after training error");
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(TrainingSummary {
                global_step: self.global_step,
                checkpoint_steps: self.checkpoint_steps.clone(),
                exported: self.exported,
                interrupted,
            }),
        }
    }

    fn run_loop(
        &mut self,
        env: &mut dyn EnvManager,
        interrupt: &CancellationToken,
    ) -> Result<LoopExit, TrainingError> {
        self.reset_env(env)?;
        while self.not_done_training() {
            if interrupt.is_cancelled() {
                info!(step = self.global_step, "learning was interrupted");
                return Ok(LoopExit::Interrupted);
            }
            self.check_workers()?;
            let n_steps = self.advance(env)?;
            for _ in 0..n_steps {
                self.global_step += 1;
                self.reset_env_if_ready(env)?;
                if self.should_save_model() {
                    self.save_models()?;
                }
            }
        }
        Ok(LoopExit::Finished)
    }

    /// Surfaces the first failure reported by a worker, or a worker thread
    /// that exited while it was still expected to run.
    fn check_workers(&self) -> Result<(), TrainingError> {
        if let Ok(failure) = self.failure_rx.try_recv() {
            error!(brain = %failure.brain_name, "trainer worker failed");
            return Err(TrainingError::Trainer(failure.error));
        }
        let Some(worker) = self.workers.iter().find(|w| w.handle.is_finished()) else {
            return Ok(());
        };
        // A failing worker reports before it exits
        if let Ok(failure) = self.failure_rx.try_recv() {
            error!(brain = %failure.brain_name, "trainer worker failed");
            return Err(TrainingError::Trainer(failure.error));
        }
        error!(brain = %worker.brain_name, "trainer worker exited unexpectedly");
        Err(TrainingError::Trainer(TrainerError::Worker {
            brain: worker.brain_name.clone(),
            reason: "worker thread exited before it was stopped".to_string(),
        }))
    }

    fn not_done_training(&self) -> bool {
        self.trainers.values().any(|h| h.progress.should_still_train())
            || !self.train_model
            || self.trainers.is_empty()
    }

    fn should_save_model(&self) -> bool {
        self.train_model
            && self.save_freq != 0
            && self.global_step != 0
            && self.global_step % self.save_freq == 0
    }

    fn advance(&mut self, env: &mut dyn EnvManager) -> Result<usize, TrainingError> {
        let external_brains = env.external_brains();
        let mut new_trainers = Vec::new();
        for (behavior_id, spec) in &external_brains {
            // Bound identifiers keep their manager even if they went quiet
            if self.registry.contains(behavior_id) {
                continue;
            }
            if let Some(brain_name) = self.create_trainer_and_manager(env, behavior_id, spec)? {
                new_trainers.push(brain_name);
            }
        }
        for brain_name in new_trainers {
            if self.trainers.get(&brain_name).is_some_and(|h| h.threaded) {
                self.start_worker(&brain_name)?;
            }
        }

        let num_steps = self.timers.time("env_step", || env.advance())?;

        if let Some(meta) = &self.meta_curriculum {
            for (brain_name, curriculum) in meta.brains_to_curricula() {
                if let Some(handle) = self.trainers.get(brain_name) {
                    handle
                        .stats
                        .set_stat("Environment/Lesson", curriculum.lesson_num() as f32);
                }
            }
        }

        for handle in self.trainers.values().filter(|h| !h.threaded) {
            let start = Instant::now();
            handle.trainer.lock().advance()?;
            self.timers.record("trainer_advance", start.elapsed());
        }
        Ok(num_steps)
    }

    /// Wires one newly seen behavior id. Returns the brain name when a new
    /// trainer had to be created for it.
    fn create_trainer_and_manager(
        &mut self,
        env: &mut dyn EnvManager,
        behavior_id: &str,
        spec: &BehaviorSpec,
    ) -> Result<Option<String>, TrainingError> {
        let parsed = BehaviorIdentifiers::from_name_behavior_id(behavior_id);
        let brain_name = parsed.brain_name.clone();

        let newly_created = !self.trainers.contains_key(&brain_name);
        if newly_created {
            let trainer = self.trainer_factory.generate(&brain_name)?;
            info!(brain = %brain_name, kind = trainer.kind(), "created trainer");
            let handle = TrainerHandle {
                progress: trainer.progress(),
                stats: trainer.stats(),
                threaded: trainer.threaded(),
                trainer: Arc::new(Mutex::new(trainer)),
            };
            self.trainers.insert(brain_name.clone(), handle);
        }

        let (policy, manager) = {
            let Some(handle) = self.trainers.get(&brain_name) else {
                return Ok(None);
            };
            let mut trainer = handle.trainer.lock();
            let policy = trainer.create_policy(&parsed, spec)?;
            trainer.add_policy(&parsed, policy.clone());
            let manager = AgentManager::new(
                policy.clone(),
                behavior_id,
                trainer.settings().time_horizon,
                trainer.threaded(),
            );
            trainer.publish_policy_queue(manager.policy_queue());
            trainer.subscribe_trajectory_queue(manager.trajectory_queue());
            (policy, manager)
        };
        env.set_agent_manager(behavior_id, manager);
        env.set_policy(behavior_id, policy);
        self.registry.bind(&parsed);
        debug!(brain = %brain_name, behavior_id, "bound behavior to trainer");

        Ok(newly_created.then_some(brain_name))
    }

    fn start_worker(&mut self, brain_name: &str) -> Result<(), TrainingError> {
        let Some(handle) = self.trainers.get(brain_name) else {
            return Ok(());
        };
        let trainer = handle.trainer.clone();
        let kill = self.kill_trainers.clone();
        let failures = self.failure_tx.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let name = brain_name.to_string();
        let handle = thread::Builder::new()
            .name(format!("trainer-{brain_name}"))
            .spawn(move || trainer_update_func(name, trainer, kill, failures, done_tx))?;
        info!(brain = %brain_name, "started trainer worker");
        self.workers.push(TrainerWorker {
            brain_name: brain_name.to_string(),
            handle,
            done: done_rx,
        });
        Ok(())
    }

    /// Stops every worker and folds their timers into ours. A worker that
    /// does not answer within the join timeout is detached.
    fn join_threads(&mut self) {
        self.kill_trainers.cancel();
        let mut merged = TimerNode::new();
        for worker in self.workers.drain(..) {
            match worker.done.recv_timeout(self.join_timeout) {
                Ok(timers) => {
                    merged.merge(&timers);
                    if worker.handle.join().is_err() {
                        warn!(brain = %worker.brain_name, "trainer worker panicked while stopping");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                    warn!(brain = %worker.brain_name, "trainer worker exited without reporting");
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        brain = %worker.brain_name,
                        timeout_ms = self.join_timeout.as_millis() as u64,
                        "trainer worker did not stop in time; detaching"
                    );
                }
            }
        }
        self.timers.child_mut("trainer_threads").merge(&merged);
    }

    fn reset_env(&mut self, env: &mut dyn EnvManager) -> Result<(), TrainingError> {
        let mut config = self.sampler_manager.sample_all();
        if let Some(meta) = &self.meta_curriculum {
            config.extend(meta.get_config());
        }
        env.reset(&config)?;
        Ok(())
    }

    fn measure_vals(&self, meta: &MetaCurriculum) -> BTreeMap<String, f32> {
        let mut measures = BTreeMap::new();
        for (brain_name, curriculum) in meta.brains_to_curricula() {
            // Brains with a curriculum but no trainer yet are skipped
            let Some(handle) = self.trainers.get(brain_name) else {
                continue;
            };
            let measure = match curriculum.measure() {
                MeasureType::Progress => {
                    handle.progress.step() as f32 / handle.progress.max_steps().max(1) as f32
                }
                MeasureType::Reward => handle.progress.mean_reward(),
            };
            measures.insert(brain_name.clone(), measure);
        }
        measures
    }

    fn reset_env_if_ready(&mut self, env: &mut dyn EnvManager) -> Result<(), TrainingError> {
        let lessons_incremented = match self.meta_curriculum.take() {
            Some(mut meta) => {
                let measures = self.measure_vals(&meta);
                let sizes: BTreeMap<String, usize> = self
                    .trainers
                    .iter()
                    .map(|(brain, h)| (brain.clone(), h.progress.reward_buffer_len()))
                    .collect();
                let changed = meta.increment_lessons(&measures, &sizes);
                self.meta_curriculum = Some(meta);
                changed
            }
            None => BTreeMap::new(),
        };
        let meta_curriculum_reset = lessons_incremented.values().any(|changed| *changed);

        let step = self.global_step;
        let generalization_reset = !self.sampler_manager.is_empty()
            && step != 0
            && self
                .resampling_interval
                .is_some_and(|interval| interval != 0 && step % interval == 0);

        let ghost_controller_reset = self.ghost_controller.should_reset();

        if meta_curriculum_reset || generalization_reset || ghost_controller_reset {
            debug!(
                step,
                meta_curriculum_reset,
                generalization_reset,
                ghost_controller_reset,
                "resetting environment"
            );
            self.end_trainer_episodes(env, &lessons_incremented)?;
        }
        Ok(())
    }

    fn end_trainer_episodes(
        &mut self,
        env: &mut dyn EnvManager,
        lessons_incremented: &BTreeMap<String, bool>,
    ) -> Result<(), TrainingError> {
        self.reset_env(env)?;
        for handle in self.trainers.values() {
            handle.trainer.lock().end_episode();
        }
        for (brain_name, changed) in lessons_incremented {
            if !changed {
                continue;
            }
            if let Some(handle) = self.trainers.get(brain_name) {
                handle.progress.clear_rewards();
            }
        }
        Ok(())
    }

    fn save_models(&mut self) -> Result<(), TrainingError> {
        let start = Instant::now();
        for (brain_name, handle) in &self.trainers {
            let trainer = handle.trainer.lock();
            for behavior_id in self.registry.identifiers(brain_name) {
                trainer.save_model(behavior_id)?;
            }
        }
        self.timers.record("save_model", start.elapsed());
        self.checkpoint_steps.push(self.global_step);
        info!(step = self.global_step, "saved model");
        Ok(())
    }

    fn save_model_when_interrupted(&mut self) {
        if !self.train_model {
            return;
        }
        info!("learning was interrupted; saving the current models");
        if let Err(err) = self.save_models() {
            error!(error = %err, "failed to save models after interruption");
        }
        self.notifier.notify(CompletionStatus::Stopped);
    }

    fn export_models(&mut self) -> Result<(), TrainingError> {
        let start = Instant::now();
        for (brain_name, handle) in &self.trainers {
            let trainer = handle.trainer.lock();
            for behavior_id in self.registry.identifiers(brain_name) {
                trainer.export_model(behavior_id)?;
            }
        }
        self.timers.record("export_model", start.elapsed());
        self.exported = true;
        Ok(())
    }
}

impl Drop for TrainerController {
    fn drop(&mut self) {
        self.kill_trainers.cancel();
    }
}

/// Worker loop of a threaded trainer: wait for trajectories outside the
/// trainer lock, then advance under it, until `kill` is cancelled.
fn trainer_update_func(
    brain_name: String,
    trainer: SharedTrainer,
    kill: CancellationToken,
    failures: Sender<WorkerFailure>,
    done: Sender<TimerNode>,
) {
    let mut timers = TimerNode::new();
    while !kill.is_cancelled() {
        let receivers = trainer.lock().trajectory_receivers();
        if receivers.is_empty() {
            thread::sleep(WORKER_POLL_INTERVAL);
        } else {
            let mut select = Select::new();
            for receiver in &receivers {
                select.recv(receiver);
            }
            let _ = select.ready_timeout(WORKER_POLL_INTERVAL);
        }

        let start = Instant::now();
        let result = trainer.lock().advance();
        timers.record("trainer_advance", start.elapsed());
        if let Err(error) = result {
            error!(brain = %brain_name, error = %error, "trainer advance failed on worker");
            let _ = failures.send(WorkerFailure { brain_name, error });
            break;
        }
    }
    let _ = done.send(timers);
}
