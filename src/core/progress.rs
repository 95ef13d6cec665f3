use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Discovery,
    Metadata,
    Hashing,
    Comparing,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub phase: Phase,
    pub processed: usize,
    pub total: usize,
    pub current: String,
    pub estimated_time_remaining: Option<u64>, // seconds
}

pub type ProgressSender = mpsc::UnboundedSender<Progress>;

/// Counts finished items for one phase and forwards updates to an optional channel.
pub(crate) struct ProgressTracker {
    sender: Option<ProgressSender>,
    phase: Phase,
    total: usize,
    processed: AtomicUsize,
    started: Instant,
}

impl ProgressTracker {
    pub(crate) fn new(sender: Option<ProgressSender>, phase: Phase, total: usize) -> Self {
        let tracker = Self {
            sender,
            phase,
            total,
            processed: AtomicUsize::new(0),
            started: Instant::now(),
        };
        tracker.send(0, String::new(), None);
        tracker
    }

    pub(crate) fn advance(&self, current: &Path) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = self.started.elapsed().as_secs();
        let estimated_remaining = if elapsed > 0 && self.total >= processed {
            let rate = processed as f64 / elapsed as f64;
            Some(((self.total - processed) as f64 / rate) as u64)
        } else {
            None
        };

        self.send(
            processed,
            current.to_string_lossy().into_owned(),
            estimated_remaining,
        );
    }

    pub(crate) fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    fn send(&self, processed: usize, current: String, estimated_time_remaining: Option<u64>) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Progress {
                phase: self.phase,
                processed,
                total: self.total,
                current,
                estimated_time_remaining,
            });
        }
    }
}

pub(crate) fn send_complete(sender: Option<&ProgressSender>, total: usize) {
    if let Some(sender) = sender {
        let _ = sender.send(Progress {
            phase: Phase::Complete,
            processed: total,
            total,
            current: String::new(),
            estimated_time_remaining: Some(0),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_reports_each_item() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(Some(tx), Phase::Hashing, 2);
        tracker.advance(Path::new("/a.jpg"));
        tracker.advance(Path::new("/b.jpg"));
        assert_eq!(tracker.processed(), 2);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].processed, 0);
        assert_eq!(events[2].processed, 2);
        assert_eq!(events[2].current, "/b.jpg");
        assert!(events.iter().all(|event| event.phase == Phase::Hashing));
    }

    #[test]
    fn test_tracker_without_sender_is_silent() {
        let tracker = ProgressTracker::new(None, Phase::Metadata, 1);
        tracker.advance(Path::new("/a.jpg"));
        assert_eq!(tracker.processed(), 1);
    }
}
