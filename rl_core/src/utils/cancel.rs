// Cooperative cancellation shared between the control thread and trainer workers
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A flag that is set once and observed by every holder of a clone.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_cancel() {
        let token = CancellationToken::new();
        let worker_side = token.clone();
        assert!(!worker_side.is_cancelled());
        token.cancel();
        assert!(worker_side.is_cancelled());
    }
}
