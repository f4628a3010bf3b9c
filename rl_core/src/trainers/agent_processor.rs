// AgentProcessor - assembles agent experiences into trajectories and bridges
// the environment side with the trainer side through two queues.
use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::trainers::buffer::{Experience, Trajectory};
use crate::trainers::policy::{Policy, PolicySnapshot};

/// One-directional queue tagged with the behavior it serves. Both ends hold a
/// clone; items are delivered in FIFO order.
#[derive(Debug, Clone)]
pub struct AgentManagerQueue<T> {
    behavior_id: String,
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> AgentManagerQueue<T> {
    pub fn new(behavior_id: impl Into<String>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            behavior_id: behavior_id.into(),
            tx,
            rx,
        }
    }

    pub fn behavior_id(&self) -> &str {
        &self.behavior_id
    }

    pub fn put(&self, item: T) {
        // Both ends live in this struct, so the channel cannot be disconnected.
        let _ = self.tx.send(item);
    }

    pub fn get_nowait(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// The newest queued item, discarding older ones.
    pub fn latest(&self) -> Option<T> {
        self.rx.try_iter().last()
    }

    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub type TrajectoryQueue = AgentManagerQueue<Trajectory>;
pub type PolicyQueue = AgentManagerQueue<PolicySnapshot>;

/// Per behavior id bridge. The environment feeds experiences in and reads the
/// newest policy out; the trainer subscribes to `trajectory_queue` and
/// publishes on `policy_queue`.
#[derive(Debug)]
pub struct AgentManager {
    behavior_id: String,
    policy: Policy,
    time_horizon: usize,
    threaded: bool,
    trajectory_queue: TrajectoryQueue,
    policy_queue: PolicyQueue,
    experience_buffers: HashMap<String, Vec<Experience>>,
}

impl AgentManager {
    pub fn new(policy: Policy, behavior_id: &str, time_horizon: usize, threaded: bool) -> Self {
        Self {
            behavior_id: behavior_id.to_string(),
            policy,
            time_horizon: time_horizon.max(1),
            threaded,
            trajectory_queue: AgentManagerQueue::new(behavior_id),
            policy_queue: AgentManagerQueue::new(behavior_id),
            experience_buffers: HashMap::new(),
        }
    }

    pub fn behavior_id(&self) -> &str {
        &self.behavior_id
    }

    pub fn threaded(&self) -> bool {
        self.threaded
    }

    pub fn trajectory_queue(&self) -> TrajectoryQueue {
        self.trajectory_queue.clone()
    }

    pub fn policy_queue(&self) -> PolicyQueue {
        self.policy_queue.clone()
    }

    /// Appends one step for `agent_id`, emitting a trajectory when the episode
    /// ends or the time horizon is reached.
    pub fn add_experience(&mut self, agent_id: &str, experience: Experience) {
        let done = experience.done;
        let buffer = self.experience_buffers.entry(agent_id.to_string()).or_default();
        buffer.push(experience);
        if done || buffer.len() >= self.time_horizon {
            let steps = std::mem::take(buffer);
            if done {
                self.experience_buffers.remove(agent_id);
            }
            self.trajectory_queue.put(Trajectory {
                behavior_id: self.behavior_id.clone(),
                agent_id: agent_id.to_string(),
                steps,
            });
        }
    }

    /// Takes the newest policy published by the trainer, if any, and returns
    /// the policy currently in use.
    pub fn current_policy(&mut self) -> &Policy {
        if let Some(snapshot) = self.policy_queue.latest() {
            self.policy.load_snapshot(snapshot);
        }
        &self.policy
    }

    /// Drops partial trajectories; called when the environment resets.
    pub fn end_episode(&mut self) {
        self.experience_buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::BehaviorSpec;
    use crate::trainers::behavior_id_utils::BehaviorIdentifiers;

    fn manager(time_horizon: usize) -> AgentManager {
        let parsed = BehaviorIdentifiers::from_name_behavior_id("Ball");
        let policy = Policy::new(parsed, BehaviorSpec::new(2, 1));
        AgentManager::new(policy, "Ball", time_horizon, false)
    }

    fn step(reward: f32, done: bool) -> Experience {
        Experience {
            observation: vec![0.0, 0.0],
            action: vec![0.0],
            reward,
            done,
        }
    }

    #[test]
    fn cuts_trajectories_at_time_horizon_in_order() {
        let mut manager = manager(2);
        let queue = manager.trajectory_queue();
        for i in 0..5 {
            manager.add_experience("agent-0", step(i as f32, false));
        }
        let trajectories = queue.drain();
        assert_eq!(trajectories.len(), 2);
        assert_eq!(trajectories[0].steps[0].reward, 0.0);
        assert_eq!(trajectories[1].steps[0].reward, 2.0);
    }

    #[test]
    fn episode_end_flushes_partial_trajectory() {
        let mut manager = manager(64);
        let queue = manager.trajectory_queue();
        manager.add_experience("a", step(0.0, false));
        manager.add_experience("a", step(1.0, true));
        let trajectory = queue.get_nowait().unwrap();
        assert_eq!(trajectory.len(), 2);
        assert!(trajectory.done_reached());
    }

    #[test]
    fn environment_keeps_previous_policy_until_new_one_arrives() {
        let mut manager = manager(4);
        let publisher = manager.policy_queue();
        assert_eq!(manager.current_policy().version(), 0);

        for version in 1..=3 {
            publisher.put(PolicySnapshot { version, weights: vec![0.0; 2] });
        }
        assert_eq!(manager.current_policy().version(), 3);
        assert_eq!(manager.current_policy().version(), 3);
    }

    #[test]
    fn reset_discards_partial_experience() {
        let mut manager = manager(3);
        let queue = manager.trajectory_queue();
        manager.add_experience("a", step(0.0, false));
        manager.end_episode();
        manager.add_experience("a", step(0.0, false));
        manager.add_experience("a", step(0.0, false));
        assert!(queue.is_empty());
    }
}
