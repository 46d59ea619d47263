use crate::error::{BuildSearchError, Result};
use crate::index::SearchBackendManager;
use crate::rebuild::orchestrator::RebuildRequest;
use crate::rebuild::progress::{ManagerProgress, ManagerSnapshot, ProgressState};
use crate::types::RecordSource;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use uuid::Uuid;

pub const CODE_OK: u8 = 0;
pub const CODE_RUNNING: u8 = 1;
pub const CODE_FAILED: u8 = 2;

const MSG_STARTED: &str = "Work started succesfully";
const MSG_RUNNING: &str = "Currently working, wait for it ....";
const MSG_PROCESSING: &str = "processing";
const MSG_COMPLETE: &str = "Completed without errors";
const MSG_NEVER_STARTED: &str = "Never started";

/// Poll-able view of the rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStatus {
    pub code: u8,
    pub running: bool,
    pub never_started: bool,
    pub progress: Option<ManagerSnapshot>,
    pub message: String,
    pub run_id: Option<String>,
}

/// Outcome slot filled once when the rebuild thread exits.
struct Completion {
    outcome: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl Completion {
    fn new() -> Self {
        Completion {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Result<()>>> {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_done(&self) -> bool {
        self.lock().is_some()
    }

    /// First outcome wins.
    fn finish(&self, outcome: Result<()>) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.notify_all();
        }
    }

    fn wait(&self) -> Result<()> {
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Fails the run if the rebuild thread unwinds before reporting.
struct CompletionGuard {
    completion: Arc<Completion>,
    progress: Arc<ManagerProgress>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let err = BuildSearchError::Io("rebuild thread panicked".to_string());
            self.progress.completed_with_errors(err.clone());
            self.progress.set_finished();
            self.completion.finish(Err(err));
        }
    }
}

struct RunHandle {
    id: Uuid,
    progress: Arc<ManagerProgress>,
    cancel: Arc<AtomicBool>,
    completion: Arc<Completion>,
}

impl RunHandle {
    fn is_running(&self) -> bool {
        !self.completion.is_done()
    }
}

/// Starts rebuilds on a background thread, one at a time, and reports on
/// the latest one.
pub struct RebuildController {
    manager: Arc<SearchBackendManager>,
    source: Arc<dyn RecordSource>,
    state: Mutex<Option<RunHandle>>,
}

impl RebuildController {
    pub fn new(manager: Arc<SearchBackendManager>, source: Arc<dyn RecordSource>) -> Self {
        RebuildController {
            manager,
            source,
            state: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `request` unless a rebuild is already running (code 1).
    pub fn start(&self, request: RebuildRequest) -> RebuildStatus {
        let mut state = self.lock();
        if let Some(run) = state.as_ref().filter(|r| r.is_running()) {
            tracing::info!("Rebuild {} still running, refusing to start another", run.id);
            return RebuildStatus {
                code: CODE_RUNNING,
                running: true,
                never_started: false,
                progress: Some(run.progress.snapshot()),
                message: MSG_RUNNING.to_string(),
                run_id: Some(run.id.to_string()),
            };
        }

        let id = Uuid::new_v4();
        let progress = Arc::new(ManagerProgress::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let completion = Arc::new(Completion::new());

        let manager = Arc::clone(&self.manager);
        let source = Arc::clone(&self.source);
        let run_cancel = Arc::clone(&cancel);
        let guard = CompletionGuard {
            completion: Arc::clone(&completion),
            progress: Arc::clone(&progress),
        };
        let spawned = std::thread::Builder::new()
            .name("rebuild".to_string())
            .spawn(move || {
                let guard = guard;
                tracing::info!("Rebuild {} started", id);
                let outcome = manager.rebuild_database_with_cancel(
                    source,
                    &request,
                    &guard.progress,
                    run_cancel,
                );
                guard.completion.finish(outcome);
            });

        let started = match spawned {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to spawn rebuild thread: {}", e);
                let err = BuildSearchError::from(e);
                progress.completed_with_errors(err.clone());
                progress.set_finished();
                completion.finish(Err(err));
                false
            }
        };
        let status = RebuildStatus {
            code: if started { CODE_OK } else { CODE_FAILED },
            running: started,
            never_started: false,
            progress: Some(progress.snapshot()),
            message: if started {
                MSG_STARTED.to_string()
            } else {
                progress.reasons_as_string()
            },
            run_id: Some(id.to_string()),
        };
        *state = Some(RunHandle {
            id,
            progress,
            cancel,
            completion,
        });
        status
    }

    pub fn status(&self) -> RebuildStatus {
        let state = self.lock();
        let run = match state.as_ref() {
            Some(run) => run,
            None => return self.never_started(),
        };
        let running = run.is_running();
        let (code, message) = match run.progress.state() {
            ProgressState::CompleteWithError => (CODE_FAILED, run.progress.reasons_as_string()),
            ProgressState::Complete => (CODE_OK, MSG_COMPLETE.to_string()),
            ProgressState::Processing => (CODE_OK, MSG_PROCESSING.to_string()),
        };
        RebuildStatus {
            code,
            running,
            never_started: false,
            progress: Some(run.progress.snapshot()),
            message,
            run_id: Some(run.id.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|r| r.is_running())
    }

    /// Ask the running rebuild to stop before its next job. Returns whether
    /// a rebuild was running.
    pub fn abort(&self) -> bool {
        match self.lock().as_ref().filter(|r| r.is_running()) {
            Some(run) => {
                tracing::info!("Abort requested for rebuild {}", run.id);
                run.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Block until the latest rebuild ends and return its outcome. Any
    /// number of callers may wait at once.
    pub fn join(&self) -> Result<()> {
        let completion = match self.lock().as_ref() {
            Some(run) => Arc::clone(&run.completion),
            None => return Err(BuildSearchError::NotStarted),
        };
        completion.wait()
    }

    fn never_started(&self) -> RebuildStatus {
        RebuildStatus {
            code: CODE_OK,
            running: false,
            never_started: true,
            progress: None,
            message: MSG_NEVER_STARTED.to_string(),
            run_id: None,
        }
    }
}
