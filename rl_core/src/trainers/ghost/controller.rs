// GhostController - learning team rotation and ELO exchange between teams
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// ELO state of one ghost trainer: its own rating and the ratings of the
/// snapshots it plays against. The slot after the window is the current
/// model.
#[derive(Debug, Clone)]
pub struct EloRating {
    current_elo: f32,
    policy_elos: Vec<f32>,
    current_opponent: Option<usize>,
}

pub type EloHandle = Arc<Mutex<EloRating>>;

impl EloRating {
    pub fn new(initial_elo: f32, window: usize) -> Self {
        Self {
            current_elo: initial_elo,
            policy_elos: vec![initial_elo; window + 1],
            current_opponent: None,
        }
    }

    pub fn handle(initial_elo: f32, window: usize) -> EloHandle {
        Arc::new(Mutex::new(Self::new(initial_elo, window)))
    }

    pub fn current_elo(&self) -> f32 {
        self.current_elo
    }

    pub fn change_current_elo(&mut self, change: f32) {
        self.current_elo += change;
    }

    fn opponent_slot(&self) -> usize {
        self.current_opponent
            .filter(|i| *i + 1 < self.policy_elos.len())
            .unwrap_or(self.policy_elos.len() - 1)
    }

    pub fn opponent_elo(&self) -> f32 {
        match self.current_opponent {
            None => self.current_elo,
            Some(_) => self.policy_elos[self.opponent_slot()],
        }
    }

    pub fn change_opponent_elo(&mut self, change: f32) {
        let slot = self.opponent_slot();
        self.policy_elos[slot] -= change;
    }

    /// `None` plays against the current model.
    pub fn set_current_opponent(&mut self, opponent: Option<usize>) {
        self.current_opponent = opponent;
    }

    pub fn current_opponent(&self) -> Option<usize> {
        self.current_opponent
    }

    /// Stores the current rating as the rating of snapshot `index`.
    pub fn record_snapshot(&mut self, index: usize) {
        if let Some(slot) = self.policy_elos.get_mut(index) {
            *slot = self.current_elo;
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    queue: VecDeque<i32>,
    maxlen: usize,
    learning_team: i32,
    ghost_trainers: BTreeMap<i32, EloHandle>,
    changed_training_team: bool,
}

/// Shared by every ghost trainer of a run. Decides which team learns and
/// signals the controller to reset when that changes.
#[derive(Debug, Clone)]
pub struct GhostController {
    state: Arc<Mutex<ControllerState>>,
}

impl Default for GhostController {
    fn default() -> Self {
        Self::new(10)
    }
}

impl GhostController {
    pub fn new(maxlen: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                queue: VecDeque::with_capacity(maxlen),
                maxlen: maxlen.max(1),
                learning_team: -1,
                ghost_trainers: BTreeMap::new(),
                changed_training_team: false,
            })),
        }
    }

    /// -1 until the first team subscribes.
    pub fn learning_team(&self) -> i32 {
        self.state.lock().learning_team
    }

    /// True once after every learning team change.
    pub fn should_reset(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.changed_training_team, false)
    }

    pub fn subscribe_team_id(&self, team_id: i32, elo: EloHandle) {
        let mut state = self.state.lock();
        if state.ghost_trainers.contains_key(&team_id) {
            return;
        }
        state.ghost_trainers.insert(team_id, elo);
        if state.learning_team < 0 {
            state.learning_team = team_id;
        } else {
            state.push_team(team_id);
        }
    }

    pub fn change_training_team(&self, step: u64) {
        let mut state = self.state.lock();
        let previous = state.learning_team;
        state.push_team(previous);
        if let Some(next) = state.queue.pop_front() {
            state.learning_team = next;
        }
        debug!(team = state.learning_team, step, "learning team swapped");
        state.changed_training_team = true;
    }

    /// ELO change for a learning team rated `rating` that scored `result`
    /// (1 win, 0.5 draw, 0 loss). Opponents are debited the same amount.
    pub fn compute_elo_rating_changes(&self, rating: f32, result: f32) -> f32 {
        let state = self.state.lock();
        let mut opponent_rating = 0.0;
        for (team_id, elo) in &state.ghost_trainers {
            if *team_id != state.learning_team {
                opponent_rating = elo.lock().opponent_elo();
            }
        }
        let r1 = 10f32.powf(rating / 400.0);
        let r2 = 10f32.powf(opponent_rating / 400.0);
        let change = result - r1 / (r1 + r2);
        for (team_id, elo) in &state.ghost_trainers {
            if *team_id != state.learning_team {
                elo.lock().change_opponent_elo(change);
            }
        }
        change
    }
}

impl ControllerState {
    fn push_team(&mut self, team_id: i32) {
        if self.queue.len() >= self.maxlen {
            self.queue.pop_front();
        }
        self.queue.push_back(team_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_subscriber_learns_and_teams_rotate() {
        let controller = GhostController::new(10);
        assert_eq!(controller.learning_team(), -1);
        controller.subscribe_team_id(0, EloRating::handle(1200.0, 3));
        controller.subscribe_team_id(1, EloRating::handle(1200.0, 3));
        controller.subscribe_team_id(1, EloRating::handle(1200.0, 3));
        assert_eq!(controller.learning_team(), 0);
        assert!(!controller.should_reset());

        controller.change_training_team(100);
        assert_eq!(controller.learning_team(), 1);
        assert!(controller.should_reset());
        assert!(!controller.should_reset());

        controller.change_training_team(200);
        assert_eq!(controller.learning_team(), 0);
    }

    #[test]
    fn equal_ratings_win_gains_half_and_opponent_pays() {
        let controller = GhostController::new(10);
        let learner = EloRating::handle(1200.0, 3);
        let opponent = EloRating::handle(1200.0, 3);
        controller.subscribe_team_id(0, learner);
        controller.subscribe_team_id(1, opponent.clone());

        let change = controller.compute_elo_rating_changes(1200.0, 1.0);
        assert!((change - 0.5).abs() < 1e-6);
        // opponent plays its current model, whose slot is the last one
        let opponent = opponent.lock();
        assert_eq!(opponent.opponent_elo(), 1200.0);
        assert_eq!(opponent.policy_elos[3], 1199.5);
    }

    #[test]
    fn snapshot_ratings_follow_current_elo() {
        let mut elo = EloRating::new(1000.0, 2);
        elo.change_current_elo(50.0);
        elo.record_snapshot(1);
        elo.set_current_opponent(Some(1));
        assert_eq!(elo.opponent_elo(), 1050.0);
        elo.change_opponent_elo(10.0);
        assert_eq!(elo.opponent_elo(), 1040.0);
    }
}
