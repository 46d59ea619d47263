//! Reindexing: the bulk executor, progress tracking, the per-job rebuild
//! and the background controller that reports on it.

pub mod controller;
pub mod executor;
pub mod orchestrator;
pub mod progress;

pub use controller::{RebuildController, RebuildStatus};
pub use executor::{BulkExecutor, BulkReport};
pub use orchestrator::{RebuildRequest, Rebuilder};
pub use progress::{ManagerProgress, ManagerSnapshot, Progress, ProgressSnapshot, ProgressState};
