// Buffer - experience containers exchanged between agents and trainers
use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct Experience {
    pub observation: Vec<f32>,
    pub action: Vec<f32>,
    pub reward: f32,
    pub done: bool,
}

/// A contiguous run of experiences for one agent, cut at the time horizon
/// or at the end of an episode.
#[derive(Clone, Debug)]
pub struct Trajectory {
    pub behavior_id: String,
    pub agent_id: String,
    pub steps: Vec<Experience>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn done_reached(&self) -> bool {
        self.steps.last().is_some_and(|s| s.done)
    }

    pub fn final_reward(&self) -> f32 {
        self.steps.last().map(|s| s.reward).unwrap_or(0.0)
    }

    pub fn total_reward(&self) -> f32 {
        self.steps.iter().map(|s| s.reward).sum()
    }
}

/// Bounded FIFO of experiences used by off-policy trainers.
pub struct ReplayBuffer {
    buffer: VecDeque<Experience>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
        }
    }

    pub fn add(&mut self, experience: Experience) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(experience);
    }

    pub fn sample<R: Rng>(&self, rng: &mut R, batch_size: usize) -> Vec<Experience> {
        let indices: Vec<usize> = (0..self.buffer.len()).collect();
        indices
            .choose_multiple(rng, batch_size.min(self.buffer.len()))
            .map(|&i| self.buffer[i].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Unbounded accumulation of experiences consumed whole by on-policy updates.
#[derive(Default)]
pub struct AgentBuffer {
    experiences: Vec<Experience>,
}

impl AgentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = Experience>) {
        self.experiences.extend(steps);
    }

    pub fn take(&mut self) -> Vec<Experience> {
        std::mem::take(&mut self.experiences)
    }

    pub fn clear(&mut self) {
        self.experiences.clear();
    }

    pub fn len(&self) -> usize {
        self.experiences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn step(reward: f32, done: bool) -> Experience {
        Experience {
            observation: vec![0.0],
            action: vec![0.0],
            reward,
            done,
        }
    }

    #[test]
    fn replay_buffer_drops_oldest() {
        let mut buffer = ReplayBuffer::new(2);
        buffer.add(step(1.0, false));
        buffer.add(step(2.0, false));
        buffer.add(step(3.0, false));
        assert_eq!(buffer.len(), 2);

        let mut rng = StdRng::seed_from_u64(7);
        let batch = buffer.sample(&mut rng, 10);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.reward >= 2.0));
    }

    #[test]
    fn trajectory_reports_episode_end() {
        let trajectory = Trajectory {
            behavior_id: "Ball".into(),
            agent_id: "0".into(),
            steps: vec![step(0.5, false), step(1.0, true)],
        };
        assert!(trajectory.done_reached());
        assert_eq!(trajectory.final_reward(), 1.0);
        assert_eq!(trajectory.total_reward(), 1.5);
    }
}
