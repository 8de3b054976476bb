//! Progress notifications
//!
//! Backup and restore report how far through the volume stream they are.
//! Sinks are synchronous and must not block.

use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Operation a progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Backup => f.write_str("backup"),
            Operation::Restore => f.write_str("restore"),
        }
    }
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub operation: Operation,
    pub backup_id: String,
    pub volume_id: String,
    /// 0..=100
    pub percent: u8,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Receiver of progress notifications
pub trait ProgressSink: Send + Sync {
    fn notify_progress(&self, event: &ProgressEvent);
}

/// Logs progress through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn notify_progress(&self, event: &ProgressEvent) {
        info!(
            backup_id = %event.backup_id,
            volume_id = %event.volume_id,
            bytes = event.bytes_done,
            "{} progress: {}%",
            event.operation,
            event.percent
        );
    }
}

/// Keeps every event, for tests and embedding callers
#[derive(Debug, Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for CollectingProgress {
    fn notify_progress(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Turns processed byte counts into throttled progress events
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    operation: Operation,
    backup_id: String,
    volume_id: String,
    total: u64,
    done: u64,
    interval_chunks: u64,
    chunks_since_event: u64,
}

impl ProgressTracker {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        operation: Operation,
        backup_id: &str,
        volume_id: &str,
        total: u64,
        interval_chunks: u64,
    ) -> Self {
        Self {
            sink,
            operation,
            backup_id: backup_id.to_string(),
            volume_id: volume_id.to_string(),
            total,
            done: 0,
            interval_chunks: interval_chunks.max(1),
            chunks_since_event: 0,
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.done
    }

    /// Record one processed chunk of `bytes`
    pub fn advance(&mut self, bytes: u64) {
        self.done += bytes;
        self.chunks_since_event += 1;
        if self.chunks_since_event >= self.interval_chunks {
            self.chunks_since_event = 0;
            self.emit(self.percent());
        }
    }

    /// Report completion
    pub fn finish(&mut self) {
        self.emit(100);
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.done.saturating_mul(100) / self.total).min(100) as u8
    }

    fn emit(&self, percent: u8) {
        self.sink.notify_progress(&ProgressEvent {
            operation: self.operation,
            backup_id: self.backup_id.clone(),
            volume_id: self.volume_id.clone(),
            percent,
            bytes_done: self.done,
            bytes_total: self.total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_percentages() {
        let sink = Arc::new(CollectingProgress::new());
        let mut tracker = ProgressTracker::new(sink.clone(), Operation::Backup, "b", "v", 400, 1);
        tracker.advance(100);
        tracker.advance(100);
        tracker.advance(250);
        tracker.finish();

        let percents: Vec<u8> = sink.events().iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![25, 50, 100, 100]);
        assert_eq!(sink.events()[1].bytes_done, 200);
    }

    #[test]
    fn test_tracker_interval() {
        let sink = Arc::new(CollectingProgress::new());
        let mut tracker = ProgressTracker::new(sink.clone(), Operation::Restore, "b", "v", 10, 3);
        for _ in 0..7 {
            tracker.advance(1);
        }
        let percents: Vec<u8> = sink.events().iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![30, 60]);
        assert_eq!(tracker.bytes_done(), 7);
    }
}
