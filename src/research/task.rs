//! The research task record and its state machine.
//!
//! One [`ResearchTask`] exists per subject. Steps run strictly in order:
//!
//! ```text
//! NOT_STARTED ──▶ IN_PROGRESS ──▶ COMPLETED
//!                      │
//!                      └────────▶ FAILED
//! ```
//!
//! Everything here is pure; persistence lives in `store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::llm::{ProviderErrorKind, ProviderKind};

/// Number of pipeline steps.
pub const STEP_TOTAL: u8 = 3;

/// A pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Baseline research on the subject.
    Baseline,
    /// Strategic analysis building on the baseline.
    Strategy,
    /// Compiled report built from both earlier steps.
    Report,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Baseline, Step::Strategy, Step::Report];

    /// 1-based step index.
    pub fn index(&self) -> u8 {
        match self {
            Self::Baseline => 1,
            Self::Strategy => 2,
            Self::Report => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Self::Baseline),
            2 => Some(Self::Strategy),
            3 => Some(Self::Report),
            _ => None,
        }
    }

    /// Human-readable label used in progress events and prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Baseline => "Baseline research",
            Self::Strategy => "Strategic analysis",
            Self::Report => "Compiled report",
        }
    }

    pub fn previous(&self) -> Option<Self> {
        Self::from_index(self.index() - 1)
    }

    fn slot(&self) -> usize {
        usize::from(self.index() - 1)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.index(), self.label())
    }
}

/// Status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// Why a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AuthError,
    RateLimited,
    Timeout,
    ModelUnavailable,
    MalformedResponse,
    /// Stopped by request at a step boundary.
    Cancelled,
    /// The worker holding the lock disappeared.
    Interrupted,
    /// No subject record exists for the id.
    SubjectNotFound,
    /// The subject store could not be read.
    SubjectUnavailable,
    /// A required earlier output was missing.
    MissingPriorOutput,
}

impl From<ProviderErrorKind> for FailureReason {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::AuthError => Self::AuthError,
            ProviderErrorKind::RateLimited => Self::RateLimited,
            ProviderErrorKind::Timeout => Self::Timeout,
            ProviderErrorKind::ModelUnavailable => Self::ModelUnavailable,
            ProviderErrorKind::MalformedResponse => Self::MalformedResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl StepFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Persisted state of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<StepFailure>,
    /// The provider cut the output short.
    #[serde(default)]
    pub truncated: bool,
}

/// Result of a successful step, as handed to the store.
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub output: String,
    pub continuation: Option<String>,
    pub cost_cents: u64,
    pub truncated: bool,
}

/// Task-level state derived from the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedState {
    /// Nothing has run yet.
    Idle,
    /// A worker holds the lock.
    Running,
    /// All steps completed and the report is published.
    Done,
    /// Some steps completed, none failed.
    PartiallyDone,
    /// The most recently attempted step failed.
    Failed,
    /// All steps completed but publishing failed.
    PublishFailed,
}

/// Per-subject research record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchTask {
    pub subject_id: i64,
    pub provider: ProviderKind,
    pub steps: [StepState; 3],
    pub continuation_handle: Option<String>,
    pub report_url: Option<String>,
    pub report_published_at: Option<DateTime<Utc>>,
    pub publish_error: Option<String>,
    pub lock_token: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Last time the lock holder proved it was alive.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_attempted_step: Option<Step>,
    pub cost_cents: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchTask {
    pub fn new(subject_id: i64, provider: ProviderKind, now: DateTime<Utc>) -> Self {
        Self {
            subject_id,
            provider,
            steps: Default::default(),
            continuation_handle: None,
            report_url: None,
            report_published_at: None,
            publish_error: None,
            lock_token: None,
            locked_at: None,
            heartbeat_at: None,
            cancel_requested: false,
            last_attempted_step: None,
            cost_cents: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step: Step) -> &StepState {
        &self.steps[step.slot()]
    }

    pub fn step_mut(&mut self, step: Step) -> &mut StepState {
        &mut self.steps[step.slot()]
    }

    pub fn output(&self, step: Step) -> Option<&str> {
        self.step(step).output.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_token.is_some()
    }

    pub fn holds_lock(&self, token: &str) -> bool {
        self.lock_token.as_deref() == Some(token)
    }

    /// Locked, but the holder has not checked in since `heartbeat_before`.
    pub fn lock_abandoned(&self, heartbeat_before: DateTime<Utc>) -> bool {
        self.is_locked()
            && self
                .heartbeat_at
                .or(self.locked_at)
                .map_or(true, |at| at < heartbeat_before)
    }

    pub fn release_lock(&mut self) {
        self.lock_token = None;
        self.locked_at = None;
        self.heartbeat_at = None;
        self.cancel_requested = false;
    }

    /// Fail whichever step is IN_PROGRESS with `failure` and drop the lock.
    /// Completed outputs are kept.
    pub fn abandon(&mut self, failure: StepFailure) {
        for step in Step::ALL {
            if self.step(step).status == StepStatus::InProgress {
                let state = self.step_mut(step);
                state.status = StepStatus::Failed;
                state.output = None;
                state.error = Some(failure.clone());
                self.last_attempted_step = Some(step);
            }
        }
        self.release_lock();
    }

    /// First step that is not COMPLETED.
    pub fn first_pending_step(&self) -> Option<Step> {
        Step::ALL
            .into_iter()
            .find(|s| self.step(*s).status != StepStatus::Completed)
    }

    pub fn all_completed(&self) -> bool {
        self.first_pending_step().is_none()
    }

    pub fn any_completed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Completed)
    }

    pub fn is_published(&self) -> bool {
        self.report_url.is_some()
    }

    /// Steps whose output was flagged as truncated.
    pub fn truncated_steps(&self) -> Vec<u8> {
        Step::ALL
            .into_iter()
            .filter(|s| self.step(*s).truncated)
            .map(|s| s.index())
            .collect()
    }

    pub fn derived_state(&self) -> DerivedState {
        if self.is_locked() {
            return DerivedState::Running;
        }
        let last_failed = self
            .last_attempted_step
            .map(|s| self.step(s).status == StepStatus::Failed)
            .unwrap_or(false);
        if last_failed || self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            return DerivedState::Failed;
        }
        if self.all_completed() {
            if self.is_published() {
                return DerivedState::Done;
            }
            if self.publish_error.is_some() {
                return DerivedState::PublishFailed;
            }
            return DerivedState::PartiallyDone;
        }
        if self.any_completed() {
            DerivedState::PartiallyDone
        } else {
            DerivedState::Idle
        }
    }

    /// Discard all progress for a fresh run, keeping subject identity and
    /// `created_at`. Lock fields are left untouched.
    pub fn reset(&mut self, provider: ProviderKind, now: DateTime<Utc>) {
        self.provider = provider;
        self.steps = Default::default();
        self.continuation_handle = None;
        self.report_url = None;
        self.report_published_at = None;
        self.publish_error = None;
        self.cancel_requested = false;
        self.last_attempted_step = None;
        self.cost_cents = 0;
        self.updated_at = now;
    }

    /// Check the record invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        for step in Step::ALL {
            let state = self.step(step);
            if state.status == StepStatus::Completed {
                if state.output.is_none() {
                    return Err(format!("{} is COMPLETED without output", step));
                }
                if let Some(prev) = step.previous() {
                    if self.step(prev).status != StepStatus::Completed {
                        return Err(format!("{} is COMPLETED but {} is not", step, prev));
                    }
                }
            }
        }
        if self.report_url.is_some() && self.step(Step::Report).status != StepStatus::Completed {
            return Err("report_url is set but the report step is not COMPLETED".to_string());
        }
        Ok(())
    }
}

/// What a caller asks for when acquiring a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireRequest {
    Start {
        provider: ProviderKind,
        force_refresh: bool,
    },
    Resume,
}

/// Why an acquire was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireRejection {
    AlreadyRunning,
    NothingToResume,
    NotFound,
}

/// Decide the record to write when acquiring the lock.
///
/// Must run inside the same transaction that read `existing`, so that the
/// check and the lock write are one atomic unit.
pub fn plan_acquire(
    existing: Option<ResearchTask>,
    subject_id: i64,
    request: AcquireRequest,
    lock_token: &str,
    now: DateTime<Utc>,
) -> Result<ResearchTask, AcquireRejection> {
    let mut task = match (existing, request) {
        (Some(task), _) if task.is_locked() => return Err(AcquireRejection::AlreadyRunning),
        (None, AcquireRequest::Resume) => return Err(AcquireRejection::NotFound),
        (None, AcquireRequest::Start { provider, .. }) => {
            ResearchTask::new(subject_id, provider, now)
        }
        (
            Some(mut task),
            AcquireRequest::Start {
                provider,
                force_refresh: true,
            },
        ) => {
            task.reset(provider, now);
            task
        }
        (
            Some(mut task),
            AcquireRequest::Start {
                provider,
                force_refresh: false,
            },
        ) => {
            if !task.any_completed() {
                // Nothing worth keeping: a plain fresh start.
                task.reset(provider, now);
            } else if task.all_completed() && task.is_published() {
                return Err(AcquireRejection::NothingToResume);
            }
            task
        }
        (Some(task), AcquireRequest::Resume) => {
            if task.all_completed() && task.is_published() {
                return Err(AcquireRejection::NothingToResume);
            }
            task
        }
    };

    task.lock_token = Some(lock_token.to_string());
    task.locked_at = Some(now);
    task.heartbeat_at = Some(now);
    task.cancel_requested = false;
    task.updated_at = now;
    Ok(task)
}

/// Returned to callers of start/resume; the pipeline runs in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    pub subject_id: i64,
    pub lock_token: String,
    pub provider: ProviderKind,
    /// First step the worker will run; `None` when only publishing remains.
    pub starting_step: Option<u8>,
}
