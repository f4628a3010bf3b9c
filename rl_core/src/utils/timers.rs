// Timers - hierarchical timing of the training loop.
//
// Each worker thread keeps its own tree and hands it back when it exits; the
// controller folds those snapshots into its own tree with `merge`.
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimerNode {
    #[serde(serialize_with = "as_seconds")]
    pub total: Duration,
    pub count: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, TimerNode>,
}

fn as_seconds<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

impl TimerNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_mut(&mut self, name: &str) -> &mut TimerNode {
        self.children.entry(name.to_string()).or_default()
    }

    pub fn child(&self, name: &str) -> Option<&TimerNode> {
        self.children.get(name)
    }

    pub fn record(&mut self, name: &str, elapsed: Duration) {
        let node = self.child_mut(name);
        node.total += elapsed;
        node.count += 1;
    }

    /// Runs `f` and records its duration under `name`.
    pub fn time<R>(&mut self, name: &str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed());
        result
    }

    /// Adds another tree into this one, node by node.
    pub fn merge(&mut self, other: &TimerNode) {
        self.total += other.total;
        self.count += other.count;
        for (name, child) in &other.children {
            self.child_mut(name).merge(child);
        }
    }
}
