//! Best-effort progress broadcast.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Slow
//! subscribers lose events instead of slowing the pipeline down; the task
//! record stays the source of truth.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::task::{Step, STEP_TOTAL};

/// What happened at a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    StepStarted,
    StepCompleted,
    StepFailed,
    Cancelled,
    Publishing,
    Published,
    PublishFailed,
}

/// A phase-change event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub subject_id: i64,
    pub step_index: u8,
    pub step_total: u8,
    pub label: String,
    pub phase: ProgressPhase,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(subject_id: i64, step: Step, phase: ProgressPhase, label: impl Into<String>) -> Self {
        Self {
            subject_id,
            step_index: step.index(),
            step_total: STEP_TOTAL,
            label: label.into(),
            phase,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Send an event to current subscribers. Never fails.
    pub fn notify(&self, event: ProgressEvent) {
        tracing::debug!(
            subject_id = event.subject_id,
            step = event.step_index,
            phase = ?event.phase,
            "{}",
            event.label
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let notifier = ProgressNotifier::new(16);
        let mut rx = notifier.subscribe();
        assert_eq!(notifier.tx.receiver_count(), 1);

        notifier.notify(ProgressEvent::new(
            42,
            Step::Baseline,
            ProgressPhase::StepStarted,
            "Baseline research",
        ));
        notifier.notify(ProgressEvent::new(
            42,
            Step::Baseline,
            ProgressPhase::StepCompleted,
            "Baseline research",
        ));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.phase, ProgressPhase::StepStarted);
        assert_eq!(second.phase, ProgressPhase::StepCompleted);
        assert_eq!(first.step_total, 3);
        assert_eq!(first.step_index, 1);
    }

    #[test]
    fn test_notify_without_subscribers() {
        let notifier = ProgressNotifier::default();
        notifier.notify(ProgressEvent::new(
            1,
            Step::Report,
            ProgressPhase::Published,
            "Report published",
        ));
        assert_eq!(notifier.tx.receiver_count(), 0);
    }
}
