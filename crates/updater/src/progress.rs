use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Orchestration state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Initializing,
    ExecutingLocalCode,
    CheckingRemote,
    DownloadingPayload,
    ProcessingResources,
    ExecutingCode,
    Completed,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Completed | UpdateState::Failed)
    }
}

/// Snapshot of the current orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateProgress {
    pub state: UpdateState,
    /// 0..=100, non-decreasing within a run.
    pub percent: u8,
    pub description: String,
    pub error: Option<String>,
}

impl UpdateProgress {
    pub fn idle() -> Self {
        Self {
            state: UpdateState::Idle,
            percent: 0,
            description: "idle".to_string(),
            error: None,
        }
    }

    pub fn is_updating(&self) -> bool {
        !matches!(
            self.state,
            UpdateState::Idle | UpdateState::Completed | UpdateState::Failed
        )
    }
}

impl Default for UpdateProgress {
    fn default() -> Self {
        Self::idle()
    }
}

/// Read side of the progress record; cheap to clone and safe to poll from any thread.
#[derive(Debug, Clone)]
pub struct ProgressReader {
    inner: Arc<RwLock<UpdateProgress>>,
}

impl ProgressReader {
    pub fn snapshot(&self) -> UpdateProgress {
        self.inner.read().clone()
    }
}

/// Single writer of the progress record.
#[derive(Debug)]
pub struct ProgressTracker {
    inner: Arc<RwLock<UpdateProgress>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(UpdateProgress::idle())),
        }
    }

    pub fn reader(&self) -> ProgressReader {
        ProgressReader {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Back to the idle baseline; the only way percentages may go down.
    pub fn reset(&self) {
        *self.inner.write() = UpdateProgress::idle();
        tracing::debug!("progress reset");
    }

    /// Record a transition. Percentages below the current value are raised to
    /// it; an advisory error noted earlier in the run is kept.
    pub fn advance(&self, state: UpdateState, percent: u8, description: impl Into<String>) {
        self.set(state, percent, description.into(), None);
    }

    /// Terminal success. `warning` carries an advisory error that did not stop the run.
    pub fn complete(&self, description: impl Into<String>, warning: Option<String>) {
        self.set(UpdateState::Completed, 100, description.into(), warning);
    }

    /// Record a failure; the percentage is kept.
    pub fn fail(&self, description: impl Into<String>, error: impl Into<String>) {
        self.set(UpdateState::Failed, 0, description.into(), Some(error.into()));
    }

    /// Attach an advisory error to the current state without moving it.
    pub fn note_error(&self, error: impl Into<String>) {
        self.inner.write().error = Some(error.into());
    }

    fn set(&self, state: UpdateState, percent: u8, description: String, error: Option<String>) {
        let mut guard = self.inner.write();
        let percent = percent.min(100).max(guard.percent);
        let error = error.or_else(|| guard.error.take());
        tracing::info!(?state, percent, %description, "update progress");
        *guard = UpdateProgress {
            state,
            percent,
            description,
            error,
        };
    }
}

/// Maps a sub-task's local completion ratio onto a slice of the overall percentage.
#[derive(Debug, Clone, Copy)]
pub struct ProgressBand {
    pub start: u8,
    pub end: u8,
}

impl ProgressBand {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub fn at(self, completed: usize, total: usize) -> u8 {
        if total == 0 || self.end <= self.start {
            return self.end.max(self.start);
        }
        let span = (self.end - self.start) as usize;
        let offset = span * completed.min(total) / total;
        self.start + offset as u8
    }
}
