use crate::error::{panic_message, BuildSearchError, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

type WorkFn<T> = dyn Fn(T) -> Result<()> + Send + Sync;

/// Outcome of one executor run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    /// Items handed to the work function, failed ones included.
    pub processed: usize,
    pub failures: Vec<BuildSearchError>,
}

impl BulkReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Shared {
    active: Mutex<usize>,
    idle: Condvar,
    peak: AtomicUsize,
    processed: AtomicUsize,
    failures: Mutex<Vec<BuildSearchError>>,
}

impl Shared {
    fn lock_active(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Worker pool draining a growing queue with at most `max_workers` threads.
///
/// Workers poll the queue with a short timeout and exit once it stays empty,
/// so nothing blocks forever on an idle queue. A failing or panicking item is
/// logged and recorded; the worker carries on with the next one.
pub struct BulkExecutor<T: Send + 'static> {
    max_workers: usize,
    poll_timeout: Duration,
    work: Arc<WorkFn<T>>,
    sender: Sender<T>,
    receiver: Receiver<T>,
    shared: Arc<Shared>,
    started: AtomicBool,
    spawned: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> BulkExecutor<T> {
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

    pub fn new<F>(max_workers: usize, work: F) -> Self
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        let (sender, receiver) = unbounded();
        BulkExecutor {
            max_workers: max_workers.max(1),
            poll_timeout: Self::DEFAULT_POLL_TIMEOUT,
            work: Arc::new(work),
            sender,
            receiver,
            shared: Arc::new(Shared {
                active: Mutex::new(0),
                idle: Condvar::new(),
                peak: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
            }),
            started: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Enqueue `item`; once started, also adds a worker if below the cap.
    pub fn add(&self, item: T) {
        if self.sender.send(item).is_err() {
            tracing::error!("Bulk executor queue is closed");
            return;
        }
        if self.started.load(Ordering::SeqCst) {
            let mut active = self.shared.lock_active();
            if *active < self.max_workers && !self.receiver.is_empty() {
                self.spawn_worker(&mut active);
            }
        }
    }

    /// Launch `min(max_workers, queued)` workers.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut active = self.shared.lock_active();
        let wanted = self.max_workers.min(self.receiver.len());
        while *active < wanted {
            if !self.spawn_worker(&mut active) {
                break;
            }
        }
        tracing::debug!("Bulk executor started {} workers", *active);
    }

    /// Block until the queue is drained and every worker has exited.
    pub fn wait_for_completion(&self) -> Result<BulkReport> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(BuildSearchError::NotStarted);
        }
        let mut active = self.shared.lock_active();
        loop {
            if *active == 0 {
                if self.receiver.is_empty() {
                    break;
                }
                if !self.spawn_worker(&mut active) {
                    return Err(BuildSearchError::Io(
                        "no bulk worker could be started".to_string(),
                    ));
                }
            }
            active = match self.shared.idle.wait_timeout(active, self.poll_timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(active);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("Bulk worker thread ended with a panic");
            }
        }

        let failures = std::mem::take(
            &mut *self
                .shared
                .failures
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        Ok(BulkReport {
            processed: self.shared.processed.load(Ordering::SeqCst),
            failures,
        })
    }

    pub fn active_workers(&self) -> usize {
        *self.shared.lock_active()
    }

    /// Highest number of simultaneously active workers seen so far.
    pub fn peak_workers(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Caller holds the active-count lock, which keeps the cap exact.
    fn spawn_worker(&self, active: &mut MutexGuard<'_, usize>) -> bool {
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        let receiver = self.receiver.clone();
        let work = Arc::clone(&self.work);
        let shared = Arc::clone(&self.shared);
        let poll = self.poll_timeout;

        **active += 1;
        self.shared.peak.fetch_max(**active, Ordering::SeqCst);

        let spawned = std::thread::Builder::new()
            .name(format!("bulk-worker-{}", n))
            .spawn(move || worker_loop(receiver, work, shared, poll));
        match spawned {
            Ok(handle) => {
                self.handles
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(handle);
                true
            }
            Err(e) => {
                **active -= 1;
                tracing::error!("Failed to spawn bulk worker: {}", e);
                false
            }
        }
    }
}

fn worker_loop<T>(receiver: Receiver<T>, work: Arc<WorkFn<T>>, shared: Arc<Shared>, poll: Duration) {
    loop {
        match receiver.recv_timeout(poll) {
            Ok(item) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| work(item)));
                shared.processed.fetch_add(1, Ordering::SeqCst);
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        tracing::warn!("Bulk item failed: {}", e);
                        Some(e)
                    }
                    Err(panic) => {
                        let worker = std::thread::current()
                            .name()
                            .unwrap_or("bulk-worker")
                            .to_string();
                        let message = panic_message(panic.as_ref());
                        tracing::error!("Bulk item panicked on {}: {}", worker, message);
                        Some(BuildSearchError::ItemFailed {
                            id: "panic".to_string(),
                            message: format!("{} (on {})", message, worker),
                        })
                    }
                };
                if let Some(e) = failure {
                    shared
                        .failures
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(e);
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let mut active = shared.lock_active();
                // an item may have arrived after the poll timed out
                if !receiver.is_empty() {
                    continue;
                }
                *active -= 1;
                shared.idle.notify_all();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_wait_requires_start() {
        let exec: BulkExecutor<u32> = BulkExecutor::new(2, |_| Ok(()));
        exec.add(1);
        assert_eq!(exec.wait_for_completion(), Err(BuildSearchError::NotStarted));
    }

    #[test]
    fn test_processes_everything_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let exec = BulkExecutor::new(3, move |i: u32| {
            sink.lock().unwrap().push(i);
            Ok(())
        })
        .with_poll_timeout(Duration::from_millis(50));
        for i in 0..20 {
            exec.add(i);
        }
        exec.start();
        let report = exec.wait_for_completion().unwrap();
        assert_eq!(report.processed, 20);
        assert!(report.is_success());
        let seen = seen.lock().unwrap();
        let unique: HashSet<u32> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 20);
        assert_eq!(unique.len(), 20);
        assert!(exec.peak_workers() <= 3);
        assert_eq!(exec.active_workers(), 0);
    }

    #[test]
    fn test_start_with_empty_queue() {
        let exec: BulkExecutor<u32> =
            BulkExecutor::new(4, |_| Ok(())).with_poll_timeout(Duration::from_millis(20));
        exec.start();
        let report = exec.wait_for_completion().unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(exec.peak_workers(), 0);
    }

    #[test]
    fn test_failures_and_panics_are_recorded() {
        let exec = BulkExecutor::new(2, |i: u32| match i {
            1 => Err(BuildSearchError::ItemFailed {
                id: "1".into(),
                message: "boom".into(),
            }),
            2 => panic!("worker exploded"),
            _ => Ok(()),
        })
        .with_poll_timeout(Duration::from_millis(20));
        for i in 0..4 {
            exec.add(i);
        }
        exec.start();
        let report = exec.wait_for_completion().unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.failures.len(), 2);
        let panicked = report
            .failures
            .iter()
            .find_map(|f| match f {
                BuildSearchError::ItemFailed { id, message } if id == "panic" => Some(message),
                _ => None,
            })
            .unwrap();
        assert!(panicked.starts_with("worker exploded (on bulk-worker-"));
    }
}
