// SACTrainer - off-policy update cadence over a replay buffer
use tracing::debug;

use crate::error::TrainerError;
use crate::trainers::buffer::ReplayBuffer;
use crate::trainers::stats::StatsReporter;
use crate::trainers::trainer::{TrainerCore, TrainerParameters};

/// Keeps the last `buffer_size` experiences and performs one update every
/// `steps_per_update` trainer steps once `buffer_init_steps` is reached.
pub struct SACTrainer {
    core: TrainerCore,
    replay_buffer: ReplayBuffer,
    update_steps: u64,
}

impl SACTrainer {
    pub fn new(params: TrainerParameters, stats: StatsReporter) -> Self {
        let capacity = params.settings.hyperparameters.buffer_size;
        Self {
            core: TrainerCore::new(params, stats),
            replay_buffer: ReplayBuffer::new(capacity),
            update_steps: 1,
        }
    }

    pub fn core(&self) -> &TrainerCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut TrainerCore {
        &mut self.core
    }

    pub fn replay_buffer_len(&self) -> usize {
        self.replay_buffer.len()
    }

    pub fn update_count(&self) -> u64 {
        self.update_steps - 1
    }

    fn is_ready_update(&self) -> bool {
        let hyperparameters = &self.core.settings().hyperparameters;
        self.replay_buffer.len() >= hyperparameters.batch_size
            && self.core.progress().step() >= hyperparameters.buffer_init_steps
    }

    fn update_policy(&mut self) {
        let hyperparameters = self.core.settings().hyperparameters.clone();
        let steps_per_update = hyperparameters.steps_per_update.max(1);
        let step = self.core.progress().step();
        let mut updated = false;
        while step / self.update_steps > steps_per_update {
            let batch = self
                .replay_buffer
                .sample(&mut self.core.rng, hyperparameters.batch_size);
            self.core.apply_update(&batch);
            self.update_steps += 1;
            updated = true;
        }
        if updated {
            debug!(brain = %self.core.brain_name(), updates = self.update_count(), "sac update");
            self.core.publish();
        }
    }

    pub fn advance(&mut self) -> Result<(), TrainerError> {
        for trajectory in self.core.drain_trajectories() {
            self.core.record_trajectory(&trajectory)?;
            if self.core.progress().is_training() {
                for experience in trajectory.steps {
                    self.replay_buffer.add(experience);
                }
            }
        }
        if self.core.progress().should_still_train() && self.is_ready_update() {
            self.update_policy();
        }
        Ok(())
    }
}
