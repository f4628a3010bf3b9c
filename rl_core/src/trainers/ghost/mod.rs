// Self-play: a controller shared by every ghost trainer of a run, and the
// trainer wrapper that plays the learning team against past snapshots.
mod controller;
mod trainer;

pub use controller::{EloHandle, EloRating, GhostController};
pub use trainer::GhostTrainer;
