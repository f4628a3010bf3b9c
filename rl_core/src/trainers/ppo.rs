// PPOTrainer - on-policy update cadence
use tracing::debug;

use crate::error::TrainerError;
use crate::trainers::buffer::AgentBuffer;
use crate::trainers::stats::StatsReporter;
use crate::trainers::trainer::{TrainerCore, TrainerParameters};

/// Collects experience until `buffer_size` is reached, updates once on the
/// whole buffer and starts over.
pub struct PPOTrainer {
    core: TrainerCore,
    update_buffer: AgentBuffer,
}

impl PPOTrainer {
    pub fn new(params: TrainerParameters, stats: StatsReporter) -> Self {
        Self {
            core: TrainerCore::new(params, stats),
            update_buffer: AgentBuffer::new(),
        }
    }

    pub fn core(&self) -> &TrainerCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut TrainerCore {
        &mut self.core
    }

    pub fn update_buffer_len(&self) -> usize {
        self.update_buffer.len()
    }

    fn is_ready_update(&self) -> bool {
        self.update_buffer.len() >= self.core.settings().hyperparameters.buffer_size.max(1)
    }

    pub fn advance(&mut self) -> Result<(), TrainerError> {
        for trajectory in self.core.drain_trajectories() {
            self.core.record_trajectory(&trajectory)?;
            if self.core.progress().is_training() {
                self.update_buffer.extend(trajectory.steps);
            }
        }
        if self.core.progress().should_still_train() {
            if self.is_ready_update() {
                let batch = self.update_buffer.take();
                debug!(brain = %self.core.brain_name(), experiences = batch.len(), "ppo update");
                self.core.apply_update(&batch);
                self.core.publish();
            }
        } else {
            self.update_buffer.clear();
        }
        Ok(())
    }
}
