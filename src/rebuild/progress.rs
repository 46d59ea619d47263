use crate::error::{BuildSearchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressState {
    Processing,
    Complete,
    CompleteWithError,
}

impl ProgressState {
    pub fn is_terminal(self) -> bool {
        self != ProgressState::Processing
    }
}

#[derive(Debug)]
struct ProgressInner {
    state: ProgressState,
    max: Option<u64>,
    elapsed: Option<Duration>,
    reason: Option<BuildSearchError>,
    reason_message: String,
}

/// A named unit of long-running work.
///
/// State only moves forward: `Processing` to `Complete` or
/// `CompleteWithError`, never back. Once `max` is set, `current` is clamped to it.
#[derive(Debug)]
pub struct Progress {
    name: String,
    started: Instant,
    started_at: DateTime<Utc>,
    current: AtomicU64,
    inner: Mutex<ProgressInner>,
}

impl Progress {
    pub fn new(name: impl Into<String>) -> Self {
        Progress {
            name: name.into(),
            started: Instant::now(),
            started_at: Utc::now(),
            current: AtomicU64::new(0),
            inner: Mutex::new(ProgressInner {
                state: ProgressState::Processing,
                max: None,
                elapsed: None,
                reason: None,
                reason_message: String::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProgressState {
        self.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn max(&self) -> Option<u64> {
        self.lock().max
    }

    pub fn set_max(&self, max: u64) {
        let mut inner = self.lock();
        inner.max = Some(max);
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.min(max)));
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set_current(&self, current: u64) {
        let inner = self.lock();
        let value = inner.max.map_or(current, |m| current.min(m));
        self.current.store(value, Ordering::SeqCst);
    }

    pub fn inc_current(&self) {
        let inner = self.lock();
        let max = inner.max;
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| match max {
                Some(m) if c >= m => None,
                _ => Some(c + 1),
            });
    }

    /// Mark success. Ignored once the unit is already terminal.
    pub fn set_successfully_completed(&self) {
        let mut inner = self.lock();
        if inner.state == ProgressState::Processing {
            inner.state = ProgressState::Complete;
        }
    }

    /// Record `reason` and mark failure. Ignored once the unit is already terminal.
    pub fn completed_with_errors(&self, reason: BuildSearchError) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            tracing::debug!(
                "Ignoring error for finished progress {}: {}",
                self.name,
                reason
            );
            return;
        }
        inner.state = ProgressState::CompleteWithError;
        inner.reason_message = reason.to_string();
        inner.reason = Some(reason);
    }

    /// Stamp elapsed time. A unit still `Processing` here was never explicitly
    /// completed and counts as failed. Safe to call more than once.
    pub fn set_finished(&self) {
        let mut inner = self.lock();
        if inner.state == ProgressState::Processing {
            inner.state = ProgressState::CompleteWithError;
            if inner.reason_message.is_empty() {
                inner.reason_message = format!("{} finished without completing", self.name);
            }
        }
        if inner.elapsed.is_none() {
            inner.elapsed = Some(self.started.elapsed());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed.unwrap_or_else(|| self.started.elapsed())
    }

    pub fn reason(&self) -> Option<BuildSearchError> {
        self.lock().reason.clone()
    }

    pub fn reason_message(&self) -> String {
        self.lock().reason_message.clone()
    }

    /// `Err` with the recorded cause when this unit failed.
    pub fn assert_no_errors(&self) -> Result<()> {
        let inner = self.lock();
        if inner.state != ProgressState::CompleteWithError {
            return Ok(());
        }
        Err(inner
            .reason
            .clone()
            .unwrap_or_else(|| BuildSearchError::ItemFailed {
                id: self.name.clone(),
                message: inner.reason_message.clone(),
            }))
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.lock();
        ProgressSnapshot {
            name: self.name.clone(),
            state: inner.state,
            max: inner.max,
            current: self.current(),
            elapsed_millis: inner
                .elapsed
                .unwrap_or_else(|| self.started.elapsed())
                .as_millis() as u64,
            reason_message: inner.reason_message.clone(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub name: String,
    pub state: ProgressState,
    pub max: Option<u64>,
    pub current: u64,
    pub elapsed_millis: u64,
    pub reason_message: String,
    pub started_at: DateTime<Utc>,
}

/// Where the aggregate is in its lifecycle.
#[derive(Debug, Clone)]
pub enum Phase {
    NotStarted,
    /// The child most recently begun; it may already be finished.
    Running(Arc<Progress>),
    Finished(ProgressState),
}

#[derive(Debug)]
struct ManagerInner {
    phase: Phase,
    history: Vec<Arc<Progress>>,
    processed_items: u64,
}

/// Progress of a whole rebuild: one child [`Progress`] per job.
///
/// A failing child also fails the aggregate right away, without stopping
/// the remaining children. [`assert_no_errors`](Self::assert_no_errors)
/// reports the first failure across the aggregate and every child.
#[derive(Debug)]
pub struct ManagerProgress {
    overall: Progress,
    inner: Mutex<ManagerInner>,
}

impl Default for ManagerProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerProgress {
    pub const CLEAN_JOB: &'static str = "clean all";

    pub fn new() -> Self {
        ManagerProgress {
            overall: Progress::new("rebuild"),
            inner: Mutex::new(ManagerInner {
                phase: Phase::NotStarted,
                history: Vec::new(),
                processed_items: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn overall(&self) -> &Progress {
        &self.overall
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    pub fn begin_job(&self, name: impl Into<String>) -> Arc<Progress> {
        let child = Arc::new(Progress::new(name));
        self.overall.inc_current();
        let mut inner = self.lock();
        inner.history.push(Arc::clone(&child));
        inner.phase = Phase::Running(Arc::clone(&child));
        tracing::debug!("Began rebuild step {}", child.name());
        child
    }

    pub fn begin_clean_job(&self) -> Arc<Progress> {
        self.begin_job(Self::CLEAN_JOB)
    }

    pub fn current_job(&self) -> Option<Arc<Progress>> {
        match &self.lock().phase {
            Phase::Running(child) => Some(Arc::clone(child)),
            _ => None,
        }
    }

    /// Finalize the active child: success unless it already recorded an error.
    pub fn job_complete(&self) {
        let mut inner = self.lock();
        if let Phase::Running(child) = &inner.phase {
            let child = Arc::clone(child);
            child.set_successfully_completed();
            child.set_finished();
            inner.processed_items += child.max().unwrap_or_else(|| child.current());
        }
    }

    /// Fail the active child and the aggregate. Later jobs still run; the
    /// aggregate keeps the first failure.
    pub fn job_failed(&self, reason: BuildSearchError) {
        if let Some(child) = self.current_job() {
            child.completed_with_errors(reason.clone());
            child.set_finished();
        }
        self.overall.completed_with_errors(reason);
    }

    /// Fail the aggregate, and the active child if it is still running.
    pub fn completed_with_errors(&self, reason: BuildSearchError) {
        self.overall.completed_with_errors(reason.clone());
        if let Some(child) = self.current_job() {
            if !child.is_finished() {
                child.completed_with_errors(reason);
                child.set_finished();
            }
        }
    }

    pub fn set_successfully_completed(&self) {
        self.overall.set_successfully_completed();
    }

    pub fn set_finished(&self) {
        self.overall.set_finished();
        self.overall
            .set_current(self.overall.max().unwrap_or_else(|| self.overall.current()));
        self.lock().phase = Phase::Finished(self.overall.state());
    }

    pub fn state(&self) -> ProgressState {
        self.overall.state()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.lock().phase, Phase::Finished(_))
    }

    pub fn assert_no_errors(&self) -> Result<()> {
        self.overall.assert_no_errors()?;
        let history = self.history();
        for child in history {
            child.assert_no_errors()?;
        }
        Ok(())
    }

    /// The aggregate's own message, else the first failed child's.
    pub fn reasons_as_string(&self) -> String {
        let own = self.overall.reason_message();
        if !own.is_empty() {
            return own;
        }
        self.history()
            .iter()
            .find(|c| c.state() == ProgressState::CompleteWithError)
            .map(|c| c.reason_message())
            .unwrap_or_default()
    }

    pub fn history(&self) -> Vec<Arc<Progress>> {
        self.lock().history.clone()
    }

    pub fn processed_items(&self) -> u64 {
        self.lock().processed_items
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let (phase, current_job, history, processed_items) = {
            let inner = self.lock();
            let (phase, current) = match &inner.phase {
                Phase::NotStarted => ("notStarted", None),
                Phase::Running(child) => ("running", Some(child.snapshot())),
                Phase::Finished(_) => ("finished", None),
            };
            (
                phase.to_string(),
                current,
                inner.history.iter().map(|c| c.snapshot()).collect(),
                inner.processed_items,
            )
        };
        ManagerSnapshot {
            overall: self.overall.snapshot(),
            phase,
            current_job,
            history,
            processed_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSnapshot {
    #[serde(flatten)]
    pub overall: ProgressSnapshot,
    pub phase: String,
    pub current_job: Option<ProgressSnapshot>,
    pub history: Vec<ProgressSnapshot>,
    pub processed_items: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_state_is_sticky() {
        let p = Progress::new("job");
        p.set_successfully_completed();
        p.completed_with_errors(BuildSearchError::Aborted);
        assert_eq!(p.state(), ProgressState::Complete);
        assert!(p.assert_no_errors().is_ok());

        let q = Progress::new("job");
        q.completed_with_errors(BuildSearchError::Source("gone".into()));
        q.set_successfully_completed();
        assert_eq!(q.state(), ProgressState::CompleteWithError);
        assert_eq!(q.assert_no_errors(), Err(BuildSearchError::Source("gone".into())));
    }

    #[test]
    fn test_set_finished_forces_error_and_is_idempotent() {
        let p = Progress::new("forgotten");
        p.set_finished();
        assert_eq!(p.state(), ProgressState::CompleteWithError);
        let first = p.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        p.set_finished();
        assert_eq!(p.elapsed(), first);
        assert!(p.reason_message().contains("forgotten"));
        assert!(matches!(
            p.assert_no_errors(),
            Err(BuildSearchError::ItemFailed { .. })
        ));
    }

    #[test]
    fn test_current_clamped_to_max() {
        let p = Progress::new("x");
        p.set_current(10);
        p.set_max(3);
        assert_eq!(p.current(), 3);
        p.inc_current();
        assert_eq!(p.current(), 3);
        p.set_current(1);
        p.inc_current();
        assert_eq!(p.current(), 2);
    }

    #[test]
    fn test_manager_job_lifecycle() {
        let m = ManagerProgress::new();
        assert!(matches!(m.phase(), Phase::NotStarted));

        let clean = m.begin_clean_job();
        assert_eq!(clean.name(), "clean all");
        m.job_complete();

        let job = m.begin_job("project1");
        job.set_max(3);
        m.job_complete();
        assert_eq!(job.state(), ProgressState::Complete);
        assert_eq!(m.processed_items(), 3);

        m.set_successfully_completed();
        m.set_finished();
        assert!(matches!(m.phase(), Phase::Finished(ProgressState::Complete)));
        assert_eq!(m.history().len(), 2);
        assert!(m.assert_no_errors().is_ok());
    }

    #[test]
    fn test_child_failure_is_isolated_but_reported() {
        let m = ManagerProgress::new();
        m.begin_job("broken");
        m.job_failed(BuildSearchError::Source("no builds".into()));
        m.job_complete();
        assert_eq!(m.state(), ProgressState::CompleteWithError);
        assert!(!m.is_finished());

        let ok = m.begin_job("fine");
        m.job_complete();
        m.job_failed(BuildSearchError::Source("later".into()));

        assert_eq!(ok.state(), ProgressState::Complete);
        assert_eq!(m.history()[0].state(), ProgressState::CompleteWithError);
        assert_eq!(
            m.assert_no_errors(),
            Err(BuildSearchError::Source("no builds".into()))
        );
        assert!(m.reasons_as_string().contains("no builds"));
    }

    #[test]
    fn test_aggregate_error_marks_running_child() {
        let m = ManagerProgress::new();
        let child = m.begin_job("p");
        m.completed_with_errors(BuildSearchError::Aborted);
        assert_eq!(child.state(), ProgressState::CompleteWithError);
        assert_eq!(m.state(), ProgressState::CompleteWithError);
        assert_eq!(m.reasons_as_string(), "Rebuild aborted");
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = ManagerProgress::new();
        m.begin_job("p").set_max(2);
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["phase"], "running");
        assert_eq!(json["state"], "PROCESSING");
        assert_eq!(json["currentJob"]["name"], "p");
        assert_eq!(json["currentJob"]["max"], 2);
    }
}
