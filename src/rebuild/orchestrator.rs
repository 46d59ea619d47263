//! Re-derives the index from a [`RecordSource`].
//!
//! A failing job is recorded on its own progress unit and on the aggregate,
//! and the rebuild moves on; only failing to list jobs at all aborts.

use crate::config::DEFAULT_REBUILD_WORKERS;
use crate::error::{panic_message, BuildSearchError, Result};
use crate::index::SearchEngine;
use crate::rebuild::executor::BulkExecutor;
use crate::rebuild::progress::{ManagerProgress, Progress};
use crate::types::{BuildRecord, RecordSource};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebuildRequest {
    pub workers: usize,
    /// `None` rebuilds every job and first drops documents of deleted jobs.
    pub jobs: Option<Vec<String>>,
    /// Delete each job's documents first instead of skipping builds already indexed.
    pub overwrite: bool,
}

impl Default for RebuildRequest {
    fn default() -> Self {
        RebuildRequest {
            workers: DEFAULT_REBUILD_WORKERS,
            jobs: None,
            overwrite: false,
        }
    }
}

impl RebuildRequest {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn jobs(jobs: Vec<String>) -> Self {
        RebuildRequest {
            jobs: Some(jobs),
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

pub struct Rebuilder {
    engine: Arc<dyn SearchEngine>,
    source: Arc<dyn RecordSource>,
    cancel: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl Rebuilder {
    pub fn new(engine: Arc<dyn SearchEngine>, source: Arc<dyn RecordSource>) -> Self {
        Rebuilder {
            engine,
            source,
            cancel: Arc::new(AtomicBool::new(false)),
            poll_timeout: BulkExecutor::<()>::DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Share a cancellation flag; setting it stops new jobs and items from
    /// being enqueued.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run `request` to completion, reporting into `progress`. Returns the
    /// first recorded error when any job failed.
    pub fn run(&self, request: &RebuildRequest, progress: &ManagerProgress) -> Result<()> {
        tracing::info!(
            "Rebuild started: jobs={:?} overwrite={} workers={}",
            request.jobs,
            request.overwrite,
            request.workers
        );
        match self.run_jobs(request, progress) {
            Err(e) => progress.completed_with_errors(e),
            Ok(()) => match progress.assert_no_errors() {
                Err(e) => progress.completed_with_errors(e),
                Ok(()) => progress.set_successfully_completed(),
            },
        }
        progress.set_finished();

        let outcome = progress.assert_no_errors();
        match &outcome {
            Ok(()) => tracing::info!(
                "Rebuild finished: {} items in {:?}",
                progress.processed_items(),
                progress.overall().elapsed()
            ),
            Err(e) => tracing::error!("Rebuild finished with errors: {}", e),
        }
        outcome
    }

    fn run_jobs(&self, request: &RebuildRequest, progress: &ManagerProgress) -> Result<()> {
        let known = self.source.job_names()?;
        let targets = request.jobs.clone().unwrap_or_else(|| known.clone());
        let full = request.jobs.is_none();
        progress
            .overall()
            .set_max(targets.len() as u64 + u64::from(full));

        if full {
            let clean = progress.begin_clean_job();
            let live: HashSet<String> = known.into_iter().collect();
            match self.engine.clean_deleted_jobs(&live, &clean) {
                Ok(()) => progress.job_complete(),
                Err(e) => {
                    tracing::warn!("Cleaning deleted jobs failed: {}", e);
                    progress.job_failed(e);
                }
            }
        }

        for job in targets {
            if self.cancelled() {
                return Err(BuildSearchError::Aborted);
            }
            let unit = progress.begin_job(job.as_str());
            if let Err(e) = self.rebuild_job(&job, request, &unit) {
                tracing::warn!("Rebuild of job {} failed: {}", job, e);
                progress.job_failed(e);
            }
            progress.job_complete();
        }
        if self.cancelled() {
            return Err(BuildSearchError::Aborted);
        }
        Ok(())
    }

    fn rebuild_job(&self, job: &str, request: &RebuildRequest, unit: &Arc<Progress>) -> Result<()> {
        let builds = self.source.builds(job)?;

        let pending: Vec<Arc<dyn BuildRecord>> = if request.overwrite {
            self.engine.delete_job(job)?;
            builds
        } else {
            let mut pending = Vec::with_capacity(builds.len());
            for build in builds {
                if !self.engine.contains(&build.id())? {
                    pending.push(build);
                }
            }
            pending
        };
        unit.set_max(pending.len() as u64);
        tracing::debug!("Job {}: {} builds to index", job, pending.len());

        let engine = Arc::clone(&self.engine);
        let counter = Arc::clone(unit);
        let executor = BulkExecutor::new(request.workers, move |record: Arc<dyn BuildRecord>| {
            let stored = catch_unwind(AssertUnwindSafe(|| engine.store(record.as_ref())));
            let message = match stored {
                Ok(Ok(_)) => {
                    counter.inc_current();
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            Err(BuildSearchError::ItemFailed {
                id: record.id(),
                message,
            })
        })
        .with_poll_timeout(self.poll_timeout);

        for record in pending {
            if self.cancelled() {
                break;
            }
            executor.add(record);
        }
        executor.start();
        let report = executor.wait_for_completion()?;

        if let Some(first) = report.failures.first() {
            tracing::warn!(
                "Job {}: {} of {} builds failed to index",
                job,
                report.failures.len(),
                report.processed
            );
            return Err(first.clone());
        }

        if !request.overwrite {
            if let Some(first_build) = self.source.first_build_number(job)? {
                let cleanup = Progress::new(format!("{} cleanup", job));
                self.engine.clean_deleted_builds(job, first_build, &cleanup)?;
                cleanup.set_successfully_completed();
                cleanup.set_finished();
            }
        }
        Ok(())
    }
}
