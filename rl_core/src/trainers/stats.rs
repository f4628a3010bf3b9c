// Stats - per-trainer metric aggregation and writers
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsAggregation {
    /// Report the mean of every value added since the last write.
    Average,
    /// Report only the most recent value.
    MostRecent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSummary {
    pub mean: f32,
    pub std: f32,
    pub num: usize,
}

impl StatsSummary {
    fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self { mean: 0.0, std: 0.0, num: 0 };
        }
        let num = values.len();
        let mean = values.iter().sum::<f32>() / num as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / num as f32;
        Self { mean, std: var.sqrt(), num }
    }
}

pub trait StatsWriter: Send {
    fn write_stats(
        &mut self,
        category: &str,
        values: &BTreeMap<String, StatsSummary>,
        step: u64,
    ) -> std::io::Result<()>;
}

/// Logs a one-line summary per write.
pub struct ConsoleWriter;

impl StatsWriter for ConsoleWriter {
    fn write_stats(
        &mut self,
        category: &str,
        values: &BTreeMap<String, StatsSummary>,
        step: u64,
    ) -> std::io::Result<()> {
        let reward = values.get("Environment/Cumulative Reward");
        match reward {
            Some(summary) if summary.num > 0 => info!(
                brain = %category,
                step,
                mean_reward = summary.mean,
                std_reward = summary.std,
                episodes = summary.num,
                "training summary"
            ),
            _ => info!(brain = %category, step, "no episode was completed since last summary"),
        }
        Ok(())
    }
}

/// Appends one JSON object per write to a file.
pub struct FileWriter {
    path: PathBuf,
}

#[derive(Serialize)]
struct StatsLine<'a> {
    category: &'a str,
    step: u64,
    values: &'a BTreeMap<String, StatsSummary>,
}

impl FileWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StatsWriter for FileWriter {
    fn write_stats(
        &mut self,
        category: &str,
        values: &BTreeMap<String, StatsSummary>,
        step: u64,
    ) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(&StatsLine { category, step, values })?;
        writeln!(file, "{line}")
    }
}

#[derive(Default)]
struct StatsState {
    stats: BTreeMap<String, Vec<f32>>,
    aggregation: BTreeMap<String, StatsAggregation>,
    writers: Vec<Box<dyn StatsWriter>>,
}

/// Cloneable handle; every clone reports into the same category.
#[derive(Clone)]
pub struct StatsReporter {
    category: String,
    state: Arc<Mutex<StatsState>>,
}

impl std::fmt::Debug for StatsReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsReporter")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl StatsReporter {
    pub fn new(category: &str) -> Self {
        Self {
            category: category.to_string(),
            state: Arc::new(Mutex::new(StatsState::default())),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn add_writer(&self, writer: Box<dyn StatsWriter>) {
        self.state.lock().writers.push(writer);
    }

    pub fn add_stat(&self, key: &str, value: f32) {
        let mut state = self.state.lock();
        state.aggregation.entry(key.to_string()).or_insert(StatsAggregation::Average);
        state.stats.entry(key.to_string()).or_default().push(value);
    }

    /// Replaces the value of `key`; only the last value is reported.
    pub fn set_stat(&self, key: &str, value: f32) {
        let mut state = self.state.lock();
        state.aggregation.insert(key.to_string(), StatsAggregation::MostRecent);
        state.stats.insert(key.to_string(), vec![value]);
    }

    pub fn get_stats_summaries(&self, key: &str) -> StatsSummary {
        let state = self.state.lock();
        StatsSummary::from_values(state.stats.get(key).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Sends the aggregated values to every writer and clears them. Writer
    /// failures are logged and do not stop training.
    pub fn write_stats(&self, step: u64) {
        let mut state = self.state.lock();
        let summaries: BTreeMap<String, StatsSummary> = state
            .stats
            .iter()
            .map(|(key, values)| {
                let summary = match state.aggregation.get(key) {
                    Some(StatsAggregation::MostRecent) => {
                        StatsSummary::from_values(values.last().map(std::slice::from_ref).unwrap_or(&[]))
                    }
                    _ => StatsSummary::from_values(values),
                };
                (key.clone(), summary)
            })
            .collect();
        for writer in state.writers.iter_mut() {
            if let Err(err) = writer.write_stats(&self.category, &summaries, step) {
                warn!(brain = %self.category, error = %err, "failed to write stats");
            }
        }
        state.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Capture(Arc<Mutex<Vec<(u64, BTreeMap<String, StatsSummary>)>>>);

    impl StatsWriter for Capture {
        fn write_stats(
            &mut self,
            _category: &str,
            values: &BTreeMap<String, StatsSummary>,
            step: u64,
        ) -> std::io::Result<()> {
            self.0.lock().push((step, values.clone()));
            Ok(())
        }
    }

    #[test]
    fn averages_and_most_recent_aggregation() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let reporter = StatsReporter::new("Ball");
        reporter.add_writer(Box::new(Capture(captured.clone())));

        reporter.add_stat("Environment/Cumulative Reward", 1.0);
        reporter.clone().add_stat("Environment/Cumulative Reward", 3.0);
        reporter.set_stat("Environment/Lesson", 1.0);
        reporter.set_stat("Environment/Lesson", 2.0);
        reporter.write_stats(100);

        let captured = captured.lock();
        let (step, values) = &captured[0];
        assert_eq!(*step, 100);
        assert_eq!(values["Environment/Cumulative Reward"].mean, 2.0);
        assert_eq!(values["Environment/Cumulative Reward"].num, 2);
        assert_eq!(values["Environment/Lesson"].mean, 2.0);
        assert_eq!(reporter.get_stats_summaries("Environment/Cumulative Reward").num, 0);
    }

    #[test]
    fn file_writer_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let reporter = StatsReporter::new("Ball");
        reporter.add_writer(Box::new(FileWriter::new(path.clone())));
        reporter.add_stat("Losses/Value Loss", 0.5);
        reporter.write_stats(10);
        reporter.add_stat("Losses/Value Loss", 0.25);
        reporter.write_stats(20);

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 20);
        assert_eq!(lines[1]["values"]["Losses/Value Loss"]["mean"], 0.25);
    }
}
