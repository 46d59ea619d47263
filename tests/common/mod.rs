#![allow(dead_code)]

use buildsearch::{
    BuildRecord, BuildRecordData, ExtensionRegistry, LocalEngine, RecordSource, Result,
    SearchBackendManager, SearchSettings,
};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn build(job: &str, number: i64, console: &str) -> BuildRecordData {
    let mut b = BuildRecordData::new(job, number, console);
    b.start_time_millis = 1_000 * number;
    b.result = Some("SUCCESS".to_string());
    b
}

pub fn build_at(job: &str, number: i64, console: &str, start: i64) -> BuildRecordData {
    let mut b = build(job, number, console);
    b.start_time_millis = start;
    b
}

pub fn local_engine(dir: &TempDir) -> LocalEngine {
    LocalEngine::open(dir.path(), Arc::new(ExtensionRegistry::new())).unwrap()
}

pub fn local_manager(dir: &TempDir) -> Arc<SearchBackendManager> {
    SearchBackendManager::new(SearchSettings::local(dir.path()))
}

/// Jobs and builds held in memory, standing in for the CI host.
#[derive(Default)]
pub struct MemorySource {
    jobs: Mutex<IndexMap<String, Vec<Arc<dyn BuildRecord>>>>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, record: BuildRecordData) {
        self.jobs
            .lock()
            .unwrap()
            .entry(record.job_name.clone())
            .or_default()
            .push(Arc::new(record));
    }

    pub fn remove_job(&self, job: &str) {
        self.jobs.lock().unwrap().shift_remove(job);
    }

    pub fn retain_builds(&self, job: &str, keep: impl Fn(i64) -> bool) {
        if let Some(builds) = self.jobs.lock().unwrap().get_mut(job) {
            builds.retain(|b| keep(b.number()));
        }
    }
}

impl RecordSource for MemorySource {
    fn job_names(&self) -> Result<Vec<String>> {
        Ok(self.jobs.lock().unwrap().keys().cloned().collect())
    }

    fn builds(&self, job: &str) -> Result<Vec<Arc<dyn BuildRecord>>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(job)
            .cloned()
            .unwrap_or_default())
    }
}

/// Source used by the rebuild scenarios: project1 with three builds that
/// echo, project3 with one that cats.
pub fn sample_source() -> Arc<MemorySource> {
    let source = MemorySource::new();
    for n in 1..=3 {
        source.add(build("project1", n, "echo"));
    }
    source.add(build("project3", 1, "cat"));
    source
}
