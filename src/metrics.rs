use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use tracing::debug;

use crate::agent::TrainingMetrics;

/// Log lines kept for display; oldest dropped first.
const LOG_BACKLOG: usize = 50;

/// Moving-average window for the textual report.
const REPORT_WINDOW: usize = 10;

/// Append-only training history plus push-model broadcast feeds.
///
/// Metrics and action subscribers receive only events published after they
/// subscribe — there is no replay. Raw log lines are additionally retained in
/// a capped backlog for display.
pub struct MetricsReporter {
    history: Vec<TrainingMetrics>,
    log_backlog: VecDeque<String>,
    metric_subs: Vec<Sender<TrainingMetrics>>,
    log_subs: Vec<Sender<String>>,
    action_subs: Vec<Sender<usize>>,
}

impl Default for MetricsReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsReporter {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            log_backlog: VecDeque::with_capacity(LOG_BACKLOG),
            metric_subs: Vec::new(),
            log_subs: Vec::new(),
            action_subs: Vec::new(),
        }
    }

    pub fn history(&self) -> &[TrainingMetrics] {
        &self.history
    }

    pub fn recent_logs(&self) -> impl Iterator<Item = &str> {
        self.log_backlog.iter().map(String::as_str)
    }

    /// Future metrics only; no backlog replay.
    pub fn subscribe_metrics(&mut self) -> Receiver<TrainingMetrics> {
        let (tx, rx) = channel();
        self.metric_subs.push(tx);
        rx
    }

    pub fn subscribe_logs(&mut self) -> Receiver<String> {
        let (tx, rx) = channel();
        self.log_subs.push(tx);
        rx
    }

    /// Every `select_action` call is reported here, exploratory or not.
    pub fn subscribe_actions(&mut self) -> Receiver<usize> {
        let (tx, rx) = channel();
        self.action_subs.push(tx);
        rx
    }

    pub fn publish_metrics(&mut self, metrics: TrainingMetrics) {
        self.history.push(metrics.clone());
        self.metric_subs
            .retain(|tx| tx.send(metrics.clone()).is_ok());
    }

    pub fn publish_action(&mut self, action: usize) {
        self.action_subs.retain(|tx| tx.send(action).is_ok());
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!(target: "drive_rl::metrics", "{line}");
        if self.log_backlog.len() >= LOG_BACKLOG {
            self.log_backlog.pop_front();
        }
        self.log_backlog.push_back(line.clone());
        self.log_subs.retain(|tx| tx.send(line.clone()).is_ok());
    }

    /// Drops history and the log backlog; subscriptions stay live.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.log_backlog.clear();
    }

    /// Trailing `average_reward` values over the report window, empty when
    /// the history is still shorter than the window.
    pub fn running_average(&self, window: usize) -> Vec<f64> {
        if self.history.len() < window {
            return Vec::new();
        }
        self.history[self.history.len() - window..]
            .iter()
            .map(|m| m.average_reward)
            .collect()
    }

    /// Human-readable summary of the latest record plus the trailing window.
    pub fn report(&self) -> String {
        let Some(last) = self.history.last() else {
            return "No training data available".to_string();
        };
        let mut out = String::new();
        out.push_str("Training Report\n");
        out.push_str("---------------\n");
        out.push_str(&format!("Total Episodes: {}\n", self.history.len()));
        out.push_str("Last Episode Metrics:\n");
        out.push_str(&format!("  - Total Reward: {:.2}\n", last.total_reward));
        out.push_str(&format!("  - Average Reward: {:.2}\n", last.average_reward));
        out.push_str(&format!(
            "  - Exploration Rate: {:.4}\n",
            last.exploration_rate
        ));
        out.push_str(&format!("  - Training Loss: {:.4}\n", last.loss));
        let window = self.running_average(REPORT_WINDOW);
        if !window.is_empty() {
            out.push_str(&format!(
                "Running Average (Last {REPORT_WINDOW} Episodes):\n"
            ));
            for (i, r) in window.iter().enumerate() {
                out.push_str(&format!("  Episode {}: {:.2}\n", i + 1, r));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(n: u64, avg: f64) -> TrainingMetrics {
        TrainingMetrics {
            episode_number: n,
            total_reward: avg * 64.0,
            average_reward: avg,
            exploration_rate: 0.1,
            loss: 0.5,
            action_distribution: vec![0.25; 4],
            timestamp_ms: n,
        }
    }

    #[test]
    fn report_without_history_is_empty_summary() {
        let reporter = MetricsReporter::new();
        assert_eq!(reporter.report(), "No training data available");
    }

    #[test]
    fn running_average_requires_full_window() {
        let mut reporter = MetricsReporter::new();
        for n in 0..9 {
            reporter.publish_metrics(metrics(n, n as f64));
        }
        assert!(reporter.running_average(10).is_empty());

        reporter.publish_metrics(metrics(9, 9.0));
        let window = reporter.running_average(10);
        assert_eq!(window.len(), 10);
        assert_eq!(window[0], 0.0);
        assert_eq!(window[9], 9.0);
    }

    #[test]
    fn subscribers_receive_only_future_events() {
        let mut reporter = MetricsReporter::new();
        reporter.publish_metrics(metrics(1, 1.0));

        let rx = reporter.subscribe_metrics();
        assert!(rx.try_recv().is_err());

        reporter.publish_metrics(metrics(2, 2.0));
        assert_eq!(rx.try_recv().unwrap().episode_number, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn log_backlog_caps_at_fifty() {
        let mut reporter = MetricsReporter::new();
        for i in 0..60 {
            reporter.log(format!("line {i}"));
        }
        let lines: Vec<&str> = reporter.recent_logs().collect();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines[0], "line 10");
        assert_eq!(lines[49], "line 59");
    }

    #[test]
    fn action_feed_carries_every_selection() {
        let mut reporter = MetricsReporter::new();
        let rx = reporter.subscribe_actions();
        for a in [0, 3, 1] {
            reporter.publish_action(a);
        }
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 3, 1]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut reporter = MetricsReporter::new();
        {
            let _rx = reporter.subscribe_logs();
        }
        reporter.log("after drop");
        assert_eq!(reporter.log_subs.len(), 0);
    }
}
