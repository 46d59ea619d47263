pub mod distinct;
pub mod document;
pub mod extension;
pub mod local;
pub mod manager;
pub mod remote;
pub mod schema;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::rebuild::progress::Progress;
use crate::types::{BuildRecord, Hit, HitCursor, IndexedDocument};
use distinct::SearchFieldDefinition;
use schema::{FieldKind, SchemaView};
use std::collections::HashSet;
use std::sync::Arc;

pub use extension::{ExtensionField, ExtensionRegistry};
pub use local::LocalEngine;
pub use manager::{ResultFilter, SearchBackendManager};
pub use remote::RemoteEngine;

/// Hits per query page.
pub const MAX_HITS_PER_PAGE: usize = 100;

/// Longest value shown in search help before it is cut with `...`.
pub const SEARCH_HELP_MAX_LENGTH: usize = 30;

/// Storage and query contract shared by the embedded and the remote engine.
///
/// Writes are visible to the next read once the call returns. Implementations
/// must be safe to share across rebuild workers and query threads.
pub trait SearchEngine: Send + Sync {
    fn config(&self) -> &EngineConfig;

    /// The schema including the extension fields registered right now.
    fn schema_view(&self) -> SchemaView;

    /// Index `record`, replacing any document with the same id. Returns the
    /// persisted part of the replaced document.
    fn store(&self, record: &dyn BuildRecord) -> Result<Option<IndexedDocument>>;

    /// Delete the document for `id`. Absent ids are not an error.
    fn remove(&self, id: &str) -> Result<Option<IndexedDocument>>;

    /// Persisted fields of the document for `id`.
    fn get(&self, id: &str) -> Result<Option<IndexedDocument>>;

    fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// Ranked hits for `query`, at most [`MAX_HITS_PER_PAGE`], continuing
    /// after `after` when given. A malformed query yields no hits.
    fn query(&self, query: &str, highlight: bool, after: Option<&HitCursor>) -> Result<Vec<Hit>>;

    /// Number of documents matching `query`; zero for a malformed query.
    fn count(&self, query: &str) -> Result<usize>;

    /// Distinct job names present in the index.
    fn job_names(&self) -> Result<Vec<String>>;

    /// Remove every document of `job`.
    fn delete_job(&self, job: &str) -> Result<()>;

    /// Remove documents of `job` numbered below `first_build`.
    fn clean_deleted_builds(&self, job: &str, first_build: i64, progress: &Progress) -> Result<()>;

    /// Distinct stored values of `field`, optionally cut to `max_length`.
    fn distinct_values(&self, field: &str, max_length: Option<usize>) -> Result<Vec<String>>;

    /// Remove documents of every job not in `live_jobs`.
    fn clean_deleted_jobs(&self, live_jobs: &HashSet<String>, progress: &Progress) -> Result<()> {
        let stale: Vec<String> = self
            .job_names()?
            .into_iter()
            .filter(|name| !live_jobs.contains(name))
            .collect();
        progress.set_max(stale.len() as u64);
        for job in &stale {
            tracing::info!("Removing documents of deleted job {}", job);
            self.delete_job(job)?;
            progress.inc_current();
        }
        Ok(())
    }

    /// Search help: distinct values of every persisted non-numeric field
    /// except the id and the console text.
    fn search_field_definitions(&self) -> Result<Vec<SearchFieldDefinition>> {
        let view = self.schema_view();
        let mut definitions = Vec::new();
        for info in view.all() {
            if !info.persist
                || info.is_numeric()
                || info.name == schema::ID
                || info.name == schema::CONSOLE
            {
                continue;
            }
            let values = self.distinct_values(&info.name, Some(SEARCH_HELP_MAX_LENGTH))?;
            definitions.push(SearchFieldDefinition::new(
                info.name.clone(),
                info.kind == FieldKind::Keyword,
                values,
            ));
        }
        Ok(definitions)
    }

    /// Release resources. Further calls fail with `EngineClosed`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Open the engine described by `config`.
pub fn open_engine(
    config: &EngineConfig,
    extensions: Arc<ExtensionRegistry>,
) -> Result<Arc<dyn SearchEngine>> {
    let engine: Arc<dyn SearchEngine> = match config {
        EngineConfig::Local { path } => Arc::new(LocalEngine::open(path, extensions)?),
        EngineConfig::Remote { url, collection } => {
            Arc::new(RemoteEngine::connect(url, collection, extensions)?)
        }
    };
    tracing::info!("Opened search engine {:?}", config);
    Ok(engine)
}
