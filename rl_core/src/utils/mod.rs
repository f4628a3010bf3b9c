// Utils module
pub mod cancel;
pub mod directory_utils;
pub mod timers;

pub use cancel::CancellationToken;
pub use directory_utils::*;
pub use timers::TimerNode;
