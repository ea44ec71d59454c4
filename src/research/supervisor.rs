//! Task supervisor: the public operations over research tasks.
//!
//! `start` and `resume` take the per-subject lock through the store and then
//! drive the pipeline on a spawned tokio task:
//!
//! ```text
//! acquire ──▶ step 1 ──▶ step 2 ──▶ step 3 ──▶ render + publish ──▶ release
//!                │          │          │
//!                └──────────┴──────────┴──▶ FAILED (lock released)
//! ```
//!
//! Every write the pipeline makes carries its lock token, so a worker that
//! lost its lock can never overwrite someone else's progress.
//!
//! A running worker refreshes its lock heartbeat every quarter of
//! `stale_lock_after`. A lock whose heartbeat is older than that belongs to a
//! worker that is gone: `start`, `resume` and `stop` take it over, and the
//! periodic sweep releases it. On shutdown the supervisor interrupts its own
//! pipelines so their locks do not outlive the process.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::notifier::{ProgressEvent, ProgressNotifier, ProgressPhase};
use super::steps::{self, StepError};
use super::store::{Acquire, StoreError, TaskStore};
use super::task::{
    AcquireRejection, AcquireRequest, FailureReason, ResearchTask, Step, StepCompletion,
    StepFailure, TaskHandle,
};
use crate::llm::{ProviderKind, ProviderSet};
use crate::publish::{PublishRequest, ReportPublisher};
use crate::render::{HtmlReportRenderer, ReportRenderer};
use crate::subjects::{SharedSubjectStore, Subject, SubjectError};

/// Default heartbeat age after which a held lock is considered abandoned.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(120);

const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("research for subject {0} is already running")]
    AlreadyRunning(i64),

    #[error("research for subject {0} is complete and published; nothing to resume")]
    NothingToResume(i64),

    #[error("no research task for subject {0}")]
    TaskNotFound(i64),

    #[error("provider {0} is not configured")]
    ProviderNotConfigured(ProviderKind),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reply to a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopAck {
    pub subject_id: i64,
    pub acknowledged: bool,
    /// A running pipeline was flagged and will stop at the next step boundary.
    /// `false` when nothing was running or the lock belonged to a dead worker
    /// and was released immediately.
    pub stopping: bool,
}

pub struct Supervisor {
    store: Arc<dyn TaskStore>,
    providers: ProviderSet,
    subjects: SharedSubjectStore,
    renderer: Arc<dyn ReportRenderer>,
    publisher: Option<Arc<dyn ReportPublisher>>,
    notifier: ProgressNotifier,
    stale_lock_after: Duration,
    /// Locks held by pipelines running in this process.
    active: Mutex<HashMap<i64, String>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        providers: ProviderSet,
        subjects: SharedSubjectStore,
    ) -> Self {
        Self {
            store,
            providers,
            subjects,
            renderer: Arc::new(HtmlReportRenderer),
            publisher: None,
            notifier: ProgressNotifier::default(),
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ReportPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_notifier(mut self, notifier: ProgressNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_stale_lock_after(mut self, after: Duration) -> Self {
        self.stale_lock_after = after;
        self
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.notifier.subscribe()
    }

    /// Start research for a subject.
    ///
    /// Without `force_refresh` a task with completed steps continues where it
    /// left off, keeping its original provider.
    pub async fn start(
        self: &Arc<Self>,
        subject_id: i64,
        provider: ProviderKind,
        force_refresh: bool,
    ) -> Result<TaskHandle, ResearchError> {
        if self.providers.get(provider).is_none() {
            return Err(ResearchError::ProviderNotConfigured(provider));
        }
        self.launch(
            subject_id,
            AcquireRequest::Start {
                provider,
                force_refresh,
            },
        )
        .await
    }

    /// Discard all progress and run from step 1 with `provider`.
    pub async fn force_refresh(
        self: &Arc<Self>,
        subject_id: i64,
        provider: ProviderKind,
    ) -> Result<TaskHandle, ResearchError> {
        self.start(subject_id, provider, true).await
    }

    /// Continue from the first step that is not COMPLETED.
    pub async fn resume(self: &Arc<Self>, subject_id: i64) -> Result<TaskHandle, ResearchError> {
        self.launch(subject_id, AcquireRequest::Resume).await
    }

    /// Ask a running pipeline to stop at the next step boundary.
    ///
    /// A lock whose worker is gone is released on the spot, failing its
    /// in-progress step as cancelled.
    pub async fn stop(&self, subject_id: i64) -> Result<StopAck, ResearchError> {
        let reclaimed = self
            .store
            .reclaim(
                subject_id,
                self.stale_cutoff(),
                StepFailure::new(FailureReason::Cancelled, "stopped by request"),
            )
            .await?;
        if let Some(task) = reclaimed {
            tracing::info!(subject_id, "Stop released a lock left by a dead worker");
            if let Some(step) = task.last_attempted_step {
                self.notifier.notify(ProgressEvent::new(
                    subject_id,
                    step,
                    ProgressPhase::Cancelled,
                    step.label(),
                ));
            }
            return Ok(StopAck {
                subject_id,
                acknowledged: true,
                stopping: false,
            });
        }

        let stopping = self.store.request_cancel(subject_id).await?;
        if stopping {
            tracing::info!(subject_id, "Stop requested");
        } else {
            tracing::debug!(subject_id, "Stop requested but nothing is running");
        }
        Ok(StopAck {
            subject_id,
            acknowledged: true,
            stopping,
        })
    }

    /// Snapshot of the task record.
    pub async fn status(&self, subject_id: i64) -> Result<ResearchTask, ResearchError> {
        self.store
            .get(subject_id)
            .await?
            .ok_or(ResearchError::TaskNotFound(subject_id))
    }

    /// Release locks whose workers stopped sending heartbeats.
    pub async fn recover_stale_locks(&self) -> Result<Vec<i64>, ResearchError> {
        let released = self
            .store
            .release_stale(
                self.stale_cutoff(),
                StepFailure::new(
                    FailureReason::Interrupted,
                    "worker stopped before the step finished",
                ),
            )
            .await?;
        if !released.is_empty() {
            tracing::warn!("Released {} stale research locks: {:?}", released.len(), released);
        }
        Ok(released)
    }

    /// Run [`recover_stale_locks`](Self::recover_stale_locks) periodically
    /// until the returned handle is aborted.
    pub fn spawn_lock_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let period = self.heartbeat_period();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = supervisor.recover_stale_locks().await {
                    tracing::warn!("Stale lock sweep failed: {}", e);
                }
            }
        })
    }

    /// Interrupt every pipeline running in this process: the in-progress step
    /// fails with `Interrupted` and the lock is released, so the task can be
    /// resumed after a restart. Returns the affected subjects.
    pub async fn shutdown(&self) -> Vec<i64> {
        let running: Vec<(i64, String)> = self.active.lock().await.drain().collect();
        let mut interrupted = Vec::with_capacity(running.len());
        for (subject_id, lock_token) in running {
            let failure = StepFailure::new(
                FailureReason::Interrupted,
                "server shut down before the step finished",
            );
            match self.store.abandon(subject_id, &lock_token, failure).await {
                Ok(_) => interrupted.push(subject_id),
                Err(StoreError::LockLost(_)) => {}
                Err(e) => {
                    tracing::error!(subject_id, "Failed to interrupt research pipeline: {}", e)
                }
            }
        }
        if !interrupted.is_empty() {
            tracing::warn!("Interrupted research pipelines at shutdown: {:?}", interrupted);
        }
        interrupted
    }

    fn heartbeat_period(&self) -> Duration {
        (self.stale_lock_after / 4).max(MIN_HEARTBEAT_PERIOD)
    }

    /// Heartbeats older than this mark a lock as abandoned.
    fn stale_cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.stale_lock_after)
            .map(|age| Utc::now() - age)
            .unwrap_or_else(|_| Utc::now())
    }

    async fn launch(
        self: &Arc<Self>,
        subject_id: i64,
        request: AcquireRequest,
    ) -> Result<TaskHandle, ResearchError> {
        self.store
            .reclaim(
                subject_id,
                self.stale_cutoff(),
                StepFailure::new(
                    FailureReason::Interrupted,
                    "worker stopped before the step finished",
                ),
            )
            .await?;

        let lock_token = Uuid::new_v4().to_string();
        let task = match self.store.acquire(subject_id, request, &lock_token).await? {
            Acquire::Acquired(task) => task,
            Acquire::Rejected(AcquireRejection::AlreadyRunning) => {
                return Err(ResearchError::AlreadyRunning(subject_id))
            }
            Acquire::Rejected(AcquireRejection::NothingToResume) => {
                return Err(ResearchError::NothingToResume(subject_id))
            }
            Acquire::Rejected(AcquireRejection::NotFound) => {
                return Err(ResearchError::TaskNotFound(subject_id))
            }
        };

        let handle = TaskHandle {
            subject_id,
            lock_token: lock_token.clone(),
            provider: task.provider,
            starting_step: task.first_pending_step().map(|s| s.index()),
        };
        tracing::info!(
            subject_id,
            provider = %task.provider,
            starting_step = ?handle.starting_step,
            "Research task acquired"
        );

        self.active
            .lock()
            .await
            .insert(subject_id, lock_token.clone());
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run(task, lock_token).await });

        Ok(handle)
    }

    async fn run(self: Arc<Self>, mut task: ResearchTask, lock_token: String) {
        let subject_id = task.subject_id;
        let heartbeat = self.spawn_heartbeat(subject_id, lock_token.clone());
        if let Err(e) = self.drive(&mut task, &lock_token).await {
            self.abort(subject_id, &lock_token, e).await;
        }
        heartbeat.abort();

        let mut active = self.active.lock().await;
        if active.get(&subject_id) == Some(&lock_token) {
            active.remove(&subject_id);
        }
    }

    fn spawn_heartbeat(&self, subject_id: i64, lock_token: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let period = self.heartbeat_period();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; acquire already stamped it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(subject_id, &lock_token).await {
                    Ok(()) => {}
                    Err(StoreError::LockLost(_)) => break,
                    Err(e) => tracing::warn!(subject_id, "Failed to record lock heartbeat: {}", e),
                }
            }
        })
    }

    /// Leave the record resumable after `drive` failed part-way.
    async fn abort(&self, subject_id: i64, lock_token: &str, error: StoreError) {
        if let StoreError::LockLost(_) = error {
            tracing::warn!(subject_id, "Research pipeline lost its lock");
            return;
        }
        tracing::error!(subject_id, "Research pipeline aborted: {}", error);

        let failure = StepFailure::new(
            FailureReason::Interrupted,
            format!("pipeline aborted: {}", error),
        );
        match self.store.abandon(subject_id, lock_token, failure).await {
            Ok(_) | Err(StoreError::LockLost(_)) => {}
            Err(e) => {
                tracing::error!(subject_id, "Failed to mark research step interrupted: {}", e);
                match self.store.release(subject_id, lock_token).await {
                    Ok(_) | Err(StoreError::LockLost(_)) => {}
                    Err(e) => {
                        tracing::error!(subject_id, "Failed to release research lock: {}", e)
                    }
                }
            }
        }
    }

    async fn drive(&self, task: &mut ResearchTask, lock_token: &str) -> Result<(), StoreError> {
        let subject_id = task.subject_id;

        let subject = match self.subjects.get(subject_id).await {
            Ok(subject) => subject,
            Err(e) => {
                if let Some(step) = task.first_pending_step() {
                    let reason = match e {
                        SubjectError::NotFound(_) => FailureReason::SubjectNotFound,
                        SubjectError::Unavailable(_) => FailureReason::SubjectUnavailable,
                    };
                    let failure = StepFailure::new(reason, e.to_string());
                    return self.fail(task, lock_token, step, failure).await;
                }
                // Only publishing was left; keep the compiled report.
                tracing::warn!(subject_id, "Report not published: {}", e);
                self.store
                    .record_publish_failure(subject_id, lock_token, &e.to_string())
                    .await?;
                *task = self.store.release(subject_id, lock_token).await?;
                return Ok(());
            }
        };

        let Some(provider) = self.providers.get(task.provider) else {
            if let Some(step) = task.first_pending_step() {
                let failure = StepFailure::new(
                    FailureReason::ModelUnavailable,
                    format!("provider {} is not configured", task.provider),
                );
                return self.fail(task, lock_token, step, failure).await;
            }
            return self.finish(task, &subject, lock_token).await;
        };

        while let Some(step) = task.first_pending_step() {
            if self.store.cancel_requested(subject_id, lock_token).await? {
                return self.cancel(task, lock_token, step).await;
            }

            *task = self.store.begin_step(subject_id, lock_token, step).await?;
            self.notifier.notify(ProgressEvent::new(
                subject_id,
                step,
                ProgressPhase::StepStarted,
                step.label(),
            ));

            let result = steps::execute(step, &subject, task, provider.as_ref()).await;

            // The call was allowed to finish; its output is discarded on stop.
            if self.store.cancel_requested(subject_id, lock_token).await? {
                return self.cancel(task, lock_token, step).await;
            }

            match result {
                Ok(output) => {
                    if output.truncated {
                        tracing::warn!(
                            subject_id,
                            step = step.index(),
                            model = %output.model,
                            "Provider output was truncated"
                        );
                    }
                    *task = self
                        .store
                        .complete_step(
                            subject_id,
                            lock_token,
                            step,
                            StepCompletion {
                                output: output.text,
                                continuation: output.continuation,
                                cost_cents: output.cost_cents,
                                truncated: output.truncated,
                            },
                        )
                        .await?;
                    tracing::info!(
                        subject_id,
                        step = step.index(),
                        cost_cents = output.cost_cents,
                        "{} completed",
                        step.label()
                    );
                    self.notifier.notify(ProgressEvent::new(
                        subject_id,
                        step,
                        ProgressPhase::StepCompleted,
                        step.label(),
                    ));
                }
                Err(e) => {
                    let failure = match &e {
                        StepError::Provider(err) => {
                            StepFailure::new(err.kind.into(), err.message.clone())
                        }
                        StepError::MissingPriorOutput { .. } => {
                            StepFailure::new(FailureReason::MissingPriorOutput, e.to_string())
                        }
                    };
                    return self.fail(task, lock_token, step, failure).await;
                }
            }
        }

        self.finish(task, &subject, lock_token).await
    }

    /// Publish the compiled report and release the lock.
    async fn finish(
        &self,
        task: &mut ResearchTask,
        subject: &Subject,
        lock_token: &str,
    ) -> Result<(), StoreError> {
        let subject_id = task.subject_id;
        if !task.is_published() {
            self.publish(task, subject, lock_token).await?;
        }
        *task = self.store.release(subject_id, lock_token).await?;
        tracing::info!(
            subject_id,
            state = ?task.derived_state(),
            cost_cents = task.cost_cents,
            "Research pipeline finished"
        );
        Ok(())
    }

    async fn publish(
        &self,
        task: &mut ResearchTask,
        subject: &Subject,
        lock_token: &str,
    ) -> Result<(), StoreError> {
        let subject_id = task.subject_id;
        let Some(markdown) = task.output(Step::Report).map(str::to_string) else {
            return Ok(());
        };

        self.notifier.notify(ProgressEvent::new(
            subject_id,
            Step::Report,
            ProgressPhase::Publishing,
            "Publishing report",
        ));

        let outcome = match &self.publisher {
            None => Err("no publish endpoint configured".to_string()),
            Some(publisher) => match self.renderer.render(subject, &markdown) {
                Ok(content) => {
                    let request = PublishRequest::new(subject, task, content);
                    publisher.publish(&request).await.map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            },
        };

        match outcome {
            Ok(url) => {
                *task = self
                    .store
                    .record_publish(subject_id, lock_token, &url, chrono::Utc::now())
                    .await?;
                self.notifier.notify(ProgressEvent::new(
                    subject_id,
                    Step::Report,
                    ProgressPhase::Published,
                    "Report published",
                ));
            }
            Err(message) => {
                tracing::warn!(subject_id, "Report not published: {}", message);
                *task = self
                    .store
                    .record_publish_failure(subject_id, lock_token, &message)
                    .await?;
                self.notifier.notify(ProgressEvent::new(
                    subject_id,
                    Step::Report,
                    ProgressPhase::PublishFailed,
                    "Report publishing failed",
                ));
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        task: &mut ResearchTask,
        lock_token: &str,
        step: Step,
        failure: StepFailure,
    ) -> Result<(), StoreError> {
        tracing::error!(
            subject_id = task.subject_id,
            step = step.index(),
            reason = ?failure.reason,
            "{} failed: {}",
            step.label(),
            failure.message
        );
        *task = self
            .store
            .fail_step(task.subject_id, lock_token, step, failure)
            .await?;
        self.notifier.notify(ProgressEvent::new(
            task.subject_id,
            step,
            ProgressPhase::StepFailed,
            step.label(),
        ));
        Ok(())
    }

    async fn cancel(
        &self,
        task: &mut ResearchTask,
        lock_token: &str,
        step: Step,
    ) -> Result<(), StoreError> {
        tracing::info!(subject_id = task.subject_id, step = step.index(), "Research stopped");
        *task = self
            .store
            .fail_step(
                task.subject_id,
                lock_token,
                step,
                StepFailure::new(FailureReason::Cancelled, "stopped by request"),
            )
            .await?;
        self.notifier.notify(ProgressEvent::new(
            task.subject_id,
            step,
            ProgressPhase::Cancelled,
            step.label(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ProviderError, ProviderErrorKind, ResearchProvider, ResearchRequest, ResearchResponse};
    use crate::publish::PublishError;
    use crate::research::store::SqliteTaskStore;
    use crate::research::task::{DerivedState, StepStatus};
    use crate::subjects::SubjectStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Pauses the provider inside a given step until released.
    struct Gate {
        step: usize,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    struct ScriptedProvider {
        kind: ProviderKind,
        calls: Mutex<Vec<usize>>,
        /// Fails the first call for this step with this kind.
        fail_once: Mutex<Option<(usize, ProviderErrorKind)>>,
        gate: Option<Gate>,
    }

    impl ScriptedProvider {
        fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                calls: Mutex::new(Vec::new()),
                fail_once: Mutex::new(None),
                gate: None,
            }
        }

        fn calls(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResearchProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn research(
            &self,
            request: &ResearchRequest,
        ) -> Result<ResearchResponse, ProviderError> {
            let step = request.prior_outputs.len() + 1;
            self.calls.lock().unwrap().push(step);

            if let Some(gate) = self.gate.as_ref().filter(|g| g.step == step) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            let failure = {
                let mut fail_once = self.fail_once.lock().unwrap();
                if matches!(*fail_once, Some((s, _)) if s == step) {
                    fail_once.take().map(|(_, kind)| kind)
                } else {
                    None
                }
            };
            if let Some(kind) = failure {
                return Err(ProviderError::new(kind, "scripted failure"));
            }

            let output = if step == 3 {
                "# Acme Research Report\n\n## Executive Summary\n\nSolid.".to_string()
            } else {
                format!("output of step {}", step)
            };
            Ok(ResearchResponse {
                output,
                continuation: Some(format!("resp_{}", step)),
                cost_cents: 1,
                truncated: false,
                usage: None,
                model: "scripted".to_string(),
            })
        }
    }

    struct RecordingPublisher {
        requests: Mutex<Vec<i64>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl ReportPublisher for RecordingPublisher {
        async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError> {
            self.requests.lock().unwrap().push(request.subject.id);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PublishError::Fatal("422 rejected".to_string()));
            }
            Ok(format!("https://reports.example.com/{}", request.subject.slug))
        }
    }

    struct StaticSubjects(HashMap<i64, Subject>);

    #[async_trait]
    impl SubjectStore for StaticSubjects {
        async fn get(&self, id: i64) -> Result<Subject, SubjectError> {
            self.0.get(&id).cloned().ok_or(SubjectError::NotFound(id))
        }
    }

    struct Harness {
        supervisor: Arc<Supervisor>,
        provider: Arc<ScriptedProvider>,
        publisher: Arc<RecordingPublisher>,
        store: Arc<SqliteTaskStore>,
    }

    fn harness_with(provider: ScriptedProvider, with_publisher: bool) -> Harness {
        harness_config(provider, with_publisher, DEFAULT_STALE_LOCK_AFTER)
    }

    fn harness_config(
        provider: ScriptedProvider,
        with_publisher: bool,
        stale_lock_after: Duration,
    ) -> Harness {
        let provider = Arc::new(provider);
        let publisher = Arc::new(RecordingPublisher {
            requests: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        });
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let subjects: SharedSubjectStore = Arc::new(StaticSubjects(HashMap::from([
            (42, Subject::new(42, "Acme")),
            (43, Subject::new(43, "Globex")),
        ])));

        let mut supervisor = Supervisor::new(
            store.clone(),
            ProviderSet::new().with(provider.clone()),
            subjects,
        )
        .with_stale_lock_after(stale_lock_after);
        if with_publisher {
            supervisor = supervisor.with_publisher(publisher.clone());
        }
        Harness {
            supervisor: Arc::new(supervisor),
            provider,
            publisher,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedProvider::new(ProviderKind::ProviderA), true)
    }

    fn gated(step: usize) -> (ScriptedProvider, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut provider = ScriptedProvider::new(ProviderKind::ProviderA);
        provider.gate = Some(Gate {
            step,
            entered: entered.clone(),
            release: release.clone(),
        });
        (provider, entered, release)
    }

    /// Poll until the pipeline has released its lock.
    async fn settled(supervisor: &Supervisor, subject_id: i64) -> ResearchTask {
        for _ in 0..500 {
            let task = supervisor.status(subject_id).await.unwrap();
            if !task.is_locked() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline for subject {} never settled", subject_id);
    }

    #[tokio::test]
    async fn test_end_to_end_for_subject_42() {
        let h = harness();
        let mut events = h.supervisor.subscribe();

        let handle = h
            .supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        assert_eq!(handle.starting_step, Some(1));

        let task = settled(&h.supervisor, 42).await;
        assert_eq!(task.derived_state(), DerivedState::Done);
        assert!(task.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(task.report_url.as_deref(), Some("https://reports.example.com/acme"));
        assert!(task.report_published_at.is_some());
        assert_eq!(task.continuation_handle.as_deref(), Some("resp_3"));
        assert_eq!(task.cost_cents, 3);
        assert_eq!(h.provider.calls(), vec![1, 2, 3]);
        assert_eq!(*h.publisher.requests.lock().unwrap(), vec![42]);

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            phases.push((event.step_index, event.phase));
        }
        assert_eq!(
            phases,
            vec![
                (1, ProgressPhase::StepStarted),
                (1, ProgressPhase::StepCompleted),
                (2, ProgressPhase::StepStarted),
                (2, ProgressPhase::StepCompleted),
                (3, ProgressPhase::StepStarted),
                (3, ProgressPhase::StepCompleted),
                (3, ProgressPhase::Publishing),
                (3, ProgressPhase::Published),
            ]
        );

        let again = h.supervisor.start(42, ProviderKind::ProviderA, false).await;
        assert!(matches!(again, Err(ResearchError::NothingToResume(42))));
        let resumed = h.supervisor.resume(42).await;
        assert!(matches!(resumed, Err(ResearchError::NothingToResume(42))));
    }

    #[tokio::test]
    async fn test_concurrent_starts_are_single_flight() {
        let (provider, entered, release) = gated(1);
        let h = harness_with(provider, true);

        let attempts = (0..8).map(|_| {
            let supervisor = h.supervisor.clone();
            async move { supervisor.start(42, ProviderKind::ProviderA, false).await }
        });
        let results = futures::future::join_all(attempts).await;

        let acquired = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(ResearchError::AlreadyRunning(42))))
            .count();
        assert_eq!(acquired, 1);
        assert_eq!(rejected, 7);

        entered.notified().await;
        assert_eq!(
            h.supervisor.status(42).await.unwrap().derived_state(),
            DerivedState::Running
        );
        release.notify_one();

        let task = settled(&h.supervisor, 42).await;
        assert_eq!(task.derived_state(), DerivedState::Done);
        assert_eq!(h.provider.calls(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_model_unavailable_on_step_two_then_resume() {
        let provider = ScriptedProvider::new(ProviderKind::ProviderA);
        *provider.fail_once.lock().unwrap() = Some((2, ProviderErrorKind::ModelUnavailable));
        let h = harness_with(provider, true);

        h.supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        let task = settled(&h.supervisor, 42).await;

        assert_eq!(task.derived_state(), DerivedState::Failed);
        assert_eq!(task.step(Step::Baseline).status, StepStatus::Completed);
        assert_eq!(task.output(Step::Baseline), Some("output of step 1"));
        let strategy = task.step(Step::Strategy);
        assert_eq!(strategy.status, StepStatus::Failed);
        assert_eq!(
            strategy.error.as_ref().unwrap().reason,
            FailureReason::ModelUnavailable
        );
        assert_eq!(task.step(Step::Report).status, StepStatus::NotStarted);
        assert!(task.report_url.is_none());
        assert_eq!(h.provider.calls(), vec![1, 2]);
        assert!(h.publisher.requests.lock().unwrap().is_empty());

        let handle = h.supervisor.resume(42).await.unwrap();
        assert_eq!(handle.starting_step, Some(2));
        let task = settled(&h.supervisor, 42).await;

        assert_eq!(task.derived_state(), DerivedState::Done);
        // Step 1 was not re-run.
        assert_eq!(h.provider.calls(), vec![1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_stop_during_step_two() {
        let (provider, entered, release) = gated(2);
        let h = harness_with(provider, true);

        h.supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        entered.notified().await;

        let ack = h.supervisor.stop(42).await.unwrap();
        assert!(ack.acknowledged);
        assert!(ack.stopping);
        release.notify_one();

        let task = settled(&h.supervisor, 42).await;
        assert_eq!(task.step(Step::Baseline).status, StepStatus::Completed);
        let strategy = task.step(Step::Strategy);
        assert_eq!(strategy.status, StepStatus::Failed);
        assert!(strategy.output.is_none());
        assert_eq!(
            strategy.error.as_ref().unwrap().reason,
            FailureReason::Cancelled
        );
        assert_eq!(task.step(Step::Report).status, StepStatus::NotStarted);
        assert!(!task.cancel_requested);
        assert_eq!(h.provider.calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_report_and_resume_republishes() {
        let h = harness();
        h.publisher.failing.store(true, Ordering::SeqCst);

        h.supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        let task = settled(&h.supervisor, 42).await;

        assert_eq!(task.derived_state(), DerivedState::PublishFailed);
        assert_eq!(task.step(Step::Report).status, StepStatus::Completed);
        assert!(task.report_url.is_none());
        assert!(task.publish_error.as_deref().unwrap().contains("422"));

        h.publisher.failing.store(false, Ordering::SeqCst);
        let handle = h.supervisor.resume(42).await.unwrap();
        assert_eq!(handle.starting_step, None);
        let task = settled(&h.supervisor, 42).await;

        assert_eq!(task.derived_state(), DerivedState::Done);
        assert!(task.publish_error.is_none());
        assert_eq!(h.provider.calls(), vec![1, 2, 3]);
        assert_eq!(h.publisher.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_publisher_is_a_publish_failure() {
        let h = harness_with(ScriptedProvider::new(ProviderKind::ProviderA), false);
        h.supervisor
            .start(43, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        let task = settled(&h.supervisor, 43).await;
        assert_eq!(task.derived_state(), DerivedState::PublishFailed);
        assert_eq!(
            task.publish_error.as_deref(),
            Some("no publish endpoint configured")
        );
    }

    #[tokio::test]
    async fn test_force_refresh_reruns_everything() {
        let h = harness();
        h.supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        settled(&h.supervisor, 42).await;

        let handle = h
            .supervisor
            .force_refresh(42, ProviderKind::ProviderA)
            .await
            .unwrap();
        assert_eq!(handle.starting_step, Some(1));
        let task = settled(&h.supervisor, 42).await;

        assert_eq!(task.derived_state(), DerivedState::Done);
        assert_eq!(task.cost_cents, 3);
        assert_eq!(h.provider.calls(), vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_subject_fails_first_step() {
        let h = harness();
        h.supervisor
            .start(7, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        let task = settled(&h.supervisor, 7).await;
        assert_eq!(task.derived_state(), DerivedState::Failed);
        assert_eq!(
            task.step(Step::Baseline).error.as_ref().unwrap().reason,
            FailureReason::SubjectNotFound
        );
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejections() {
        let h = harness();
        assert!(matches!(
            h.supervisor.status(42).await,
            Err(ResearchError::TaskNotFound(42))
        ));
        assert!(matches!(
            h.supervisor.resume(42).await,
            Err(ResearchError::TaskNotFound(42))
        ));
        assert!(matches!(
            h.supervisor.start(42, ProviderKind::ProviderB, false).await,
            Err(ResearchError::ProviderNotConfigured(ProviderKind::ProviderB))
        ));

        let ack = h.supervisor.stop(42).await.unwrap();
        assert!(ack.acknowledged);
        assert!(!ack.stopping);
    }

    #[tokio::test]
    async fn test_recover_stale_locks() {
        let h = harness();
        let request = AcquireRequest::Start {
            provider: ProviderKind::ProviderA,
            force_refresh: false,
        };
        h.store.acquire(42, request, "dead-worker").await.unwrap();
        h.store
            .begin_step(42, "dead-worker", Step::Baseline)
            .await
            .unwrap();

        let supervisor = Arc::new(
            Supervisor::new(
                h.store.clone(),
                ProviderSet::new().with(h.provider.clone()),
                Arc::new(StaticSubjects(HashMap::from([(42, Subject::new(42, "Acme"))]))),
            )
            .with_stale_lock_after(Duration::ZERO),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(supervisor.recover_stale_locks().await.unwrap(), vec![42]);
        let task = supervisor.status(42).await.unwrap();
        assert_eq!(task.derived_state(), DerivedState::Failed);
        assert_eq!(
            task.step(Step::Baseline).error.as_ref().unwrap().reason,
            FailureReason::Interrupted
        );

        supervisor.resume(42).await.unwrap();
        assert_eq!(settled(&supervisor, 42).await.derived_state(), DerivedState::PublishFailed);
    }

    /// Leave subject `subject_id` locked by a worker that will never return.
    async fn lock_as_dead_worker(store: &SqliteTaskStore, subject_id: i64) {
        let request = AcquireRequest::Start {
            provider: ProviderKind::ProviderA,
            force_refresh: false,
        };
        store.acquire(subject_id, request, "dead-worker").await.unwrap();
        store
            .begin_step(subject_id, "dead-worker", Step::Baseline)
            .await
            .unwrap();
    }

    /// Record step 1 as completed with no lock held.
    async fn seed_first_step(store: &SqliteTaskStore, subject_id: i64) {
        let request = AcquireRequest::Start {
            provider: ProviderKind::ProviderA,
            force_refresh: false,
        };
        store.acquire(subject_id, request, "seed").await.unwrap();
        store.begin_step(subject_id, "seed", Step::Baseline).await.unwrap();
        store
            .complete_step(
                subject_id,
                "seed",
                Step::Baseline,
                StepCompletion {
                    output: "output of step 1".to_string(),
                    continuation: Some("resp_1".to_string()),
                    cost_cents: 1,
                    truncated: false,
                },
            )
            .await
            .unwrap();
        store.release(subject_id, "seed").await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_worker_lock_is_taken_over() {
        let h = harness_config(
            ScriptedProvider::new(ProviderKind::ProviderA),
            true,
            Duration::from_millis(200),
        );
        lock_as_dead_worker(&h.store, 42).await;
        lock_as_dead_worker(&h.store, 43).await;

        // A fresh heartbeat still counts as a live worker.
        assert!(matches!(
            h.supervisor.start(42, ProviderKind::ProviderA, false).await,
            Err(ResearchError::AlreadyRunning(42))
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let ack = h.supervisor.stop(42).await.unwrap();
        assert!(ack.acknowledged);
        assert!(!ack.stopping);
        let task = h.supervisor.status(42).await.unwrap();
        assert!(!task.is_locked());
        assert_eq!(task.derived_state(), DerivedState::Failed);
        assert_eq!(
            task.step(Step::Baseline).error.as_ref().unwrap().reason,
            FailureReason::Cancelled
        );

        h.supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        assert_eq!(settled(&h.supervisor, 42).await.derived_state(), DerivedState::Done);

        // Force refresh takes over without a stop first.
        let handle = h
            .supervisor
            .force_refresh(43, ProviderKind::ProviderA)
            .await
            .unwrap();
        assert_eq!(handle.starting_step, Some(1));
        let task = settled(&h.supervisor, 43).await;
        assert_eq!(task.derived_state(), DerivedState::Done);
        assert!(task.steps.iter().all(|s| s.error.is_none()));
    }

    #[tokio::test]
    async fn test_sweeper_releases_dead_worker_lock() {
        let h = harness_config(
            ScriptedProvider::new(ProviderKind::ProviderA),
            true,
            Duration::from_millis(100),
        );
        lock_as_dead_worker(&h.store, 42).await;

        let sweeper = h.supervisor.spawn_lock_sweeper();
        let task = settled(&h.supervisor, 42).await;
        sweeper.abort();

        assert_eq!(
            task.step(Step::Baseline).error.as_ref().unwrap().reason,
            FailureReason::Interrupted
        );
        h.supervisor.resume(42).await.unwrap();
        assert_eq!(settled(&h.supervisor, 42).await.derived_state(), DerivedState::Done);
    }

    #[tokio::test]
    async fn test_live_worker_keeps_its_lock() {
        let (provider, entered, release) = gated(1);
        let h = harness_config(provider, true, Duration::from_millis(200));
        let sweeper = h.supervisor.spawn_lock_sweeper();

        h.supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        entered.notified().await;
        // Well past the stale threshold; heartbeats keep the lock alive.
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(matches!(
            h.supervisor.force_refresh(42, ProviderKind::ProviderA).await,
            Err(ResearchError::AlreadyRunning(42))
        ));
        let ack = h.supervisor.stop(42).await.unwrap();
        assert!(ack.stopping);
        release.notify_one();

        let task = settled(&h.supervisor, 42).await;
        sweeper.abort();
        assert_eq!(
            task.step(Step::Baseline).error.as_ref().unwrap().reason,
            FailureReason::Cancelled
        );
        assert_eq!(h.provider.calls(), vec![1]);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_running_pipeline() {
        let (provider, entered, release) = gated(2);
        let h = harness_with(provider, true);

        h.supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        entered.notified().await;

        assert_eq!(h.supervisor.shutdown().await, vec![42]);
        let task = h.supervisor.status(42).await.unwrap();
        assert!(!task.is_locked());
        assert_eq!(task.step(Step::Baseline).status, StepStatus::Completed);
        assert_eq!(
            task.step(Step::Strategy).error.as_ref().unwrap().reason,
            FailureReason::Interrupted
        );

        // The old worker finds its lock gone and writes nothing.
        release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.supervisor.status(42).await.unwrap(), task);

        h.supervisor.resume(42).await.unwrap();
        entered.notified().await;
        release.notify_one();
        let task = settled(&h.supervisor, 42).await;
        assert_eq!(task.derived_state(), DerivedState::Done);
        assert_eq!(h.provider.calls(), vec![1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_resume_after_first_step_skips_it() {
        let h = harness();
        seed_first_step(&h.store, 42).await;
        seed_first_step(&h.store, 43).await;

        let handle = h.supervisor.resume(42).await.unwrap();
        assert_eq!(handle.starting_step, Some(2));
        let task = settled(&h.supervisor, 42).await;
        assert_eq!(task.derived_state(), DerivedState::Done);
        assert_eq!(task.output(Step::Baseline), Some("output of step 1"));
        assert_eq!(h.provider.calls(), vec![2, 3]);

        // Start without force behaves as resume.
        let handle = h
            .supervisor
            .start(43, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        assert_eq!(handle.starting_step, Some(2));
        assert_eq!(settled(&h.supervisor, 43).await.derived_state(), DerivedState::Done);
        assert_eq!(h.provider.calls(), vec![2, 3, 2, 3]);
    }

    struct UnavailableSubjects;

    #[async_trait]
    impl SubjectStore for UnavailableSubjects {
        async fn get(&self, _id: i64) -> Result<Subject, SubjectError> {
            Err(SubjectError::Unavailable("subjects.json unreadable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_subject_store_is_not_reported_as_missing() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::ProviderA));
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(SqliteTaskStore::open_in_memory().unwrap()),
            ProviderSet::new().with(provider.clone()),
            Arc::new(UnavailableSubjects),
        ));

        supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        let task = settled(&supervisor, 42).await;
        assert_eq!(
            task.step(Step::Baseline).error.as_ref().unwrap().reason,
            FailureReason::SubjectUnavailable
        );
        assert!(provider.calls().is_empty());
    }

    /// Delegates to SQLite but fails every `complete_step`.
    struct FailingCompletionStore(SqliteTaskStore);

    #[async_trait]
    impl TaskStore for FailingCompletionStore {
        async fn get(&self, subject_id: i64) -> Result<Option<ResearchTask>, StoreError> {
            self.0.get(subject_id).await
        }

        async fn acquire(
            &self,
            subject_id: i64,
            request: AcquireRequest,
            lock_token: &str,
        ) -> Result<Acquire, StoreError> {
            self.0.acquire(subject_id, request, lock_token).await
        }

        async fn begin_step(
            &self,
            subject_id: i64,
            lock_token: &str,
            step: Step,
        ) -> Result<ResearchTask, StoreError> {
            self.0.begin_step(subject_id, lock_token, step).await
        }

        async fn complete_step(
            &self,
            _subject_id: i64,
            _lock_token: &str,
            _step: Step,
            _completion: StepCompletion,
        ) -> Result<ResearchTask, StoreError> {
            Err(StoreError::Worker("disk I/O error".to_string()))
        }

        async fn fail_step(
            &self,
            subject_id: i64,
            lock_token: &str,
            step: Step,
            failure: StepFailure,
        ) -> Result<ResearchTask, StoreError> {
            self.0.fail_step(subject_id, lock_token, step, failure).await
        }

        async fn record_publish(
            &self,
            subject_id: i64,
            lock_token: &str,
            report_url: &str,
            published_at: DateTime<Utc>,
        ) -> Result<ResearchTask, StoreError> {
            self.0
                .record_publish(subject_id, lock_token, report_url, published_at)
                .await
        }

        async fn record_publish_failure(
            &self,
            subject_id: i64,
            lock_token: &str,
            message: &str,
        ) -> Result<ResearchTask, StoreError> {
            self.0
                .record_publish_failure(subject_id, lock_token, message)
                .await
        }

        async fn cancel_requested(
            &self,
            subject_id: i64,
            lock_token: &str,
        ) -> Result<bool, StoreError> {
            self.0.cancel_requested(subject_id, lock_token).await
        }

        async fn request_cancel(&self, subject_id: i64) -> Result<bool, StoreError> {
            self.0.request_cancel(subject_id).await
        }

        async fn release(
            &self,
            subject_id: i64,
            lock_token: &str,
        ) -> Result<ResearchTask, StoreError> {
            self.0.release(subject_id, lock_token).await
        }

        async fn heartbeat(&self, subject_id: i64, lock_token: &str) -> Result<(), StoreError> {
            self.0.heartbeat(subject_id, lock_token).await
        }

        async fn abandon(
            &self,
            subject_id: i64,
            lock_token: &str,
            failure: StepFailure,
        ) -> Result<ResearchTask, StoreError> {
            self.0.abandon(subject_id, lock_token, failure).await
        }

        async fn reclaim(
            &self,
            subject_id: i64,
            heartbeat_before: DateTime<Utc>,
            failure: StepFailure,
        ) -> Result<Option<ResearchTask>, StoreError> {
            self.0.reclaim(subject_id, heartbeat_before, failure).await
        }

        async fn release_stale(
            &self,
            heartbeat_before: DateTime<Utc>,
            failure: StepFailure,
        ) -> Result<Vec<i64>, StoreError> {
            self.0.release_stale(heartbeat_before, failure).await
        }
    }

    #[tokio::test]
    async fn test_store_error_mid_step_leaves_task_resumable() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::ProviderA));
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(FailingCompletionStore(SqliteTaskStore::open_in_memory().unwrap())),
            ProviderSet::new().with(provider.clone()),
            Arc::new(StaticSubjects(HashMap::from([(42, Subject::new(42, "Acme"))]))),
        ));

        supervisor
            .start(42, ProviderKind::ProviderA, false)
            .await
            .unwrap();
        let task = settled(&supervisor, 42).await;

        let baseline = task.step(Step::Baseline);
        assert_eq!(baseline.status, StepStatus::Failed);
        assert_eq!(
            baseline.error.as_ref().unwrap().reason,
            FailureReason::Interrupted
        );
        assert!(baseline.error.as_ref().unwrap().message.contains("disk I/O error"));
        assert_eq!(task.derived_state(), DerivedState::Failed);
        assert!(supervisor.resume(42).await.is_ok());
    }
}
