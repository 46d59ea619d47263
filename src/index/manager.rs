use crate::config::SearchSettings;
use crate::error::{BuildSearchError, Result};
use crate::index::distinct::SearchFieldDefinition;
use crate::index::extension::ExtensionRegistry;
use crate::index::{open_engine, SearchEngine};
use crate::query::QueryBuilder;
use crate::rebuild::orchestrator::{RebuildRequest, Rebuilder};
use crate::rebuild::progress::ManagerProgress;
use crate::types::{BuildRecord, Hit, HitCursor, RecordSource};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Drops hits the caller may not see. Runs after ranking, only when
/// `useSecurity` is on.
pub trait ResultFilter: Send + Sync {
    fn filter(&self, hits: Vec<Hit>) -> Vec<Hit>;
}

impl<F> ResultFilter for F
where
    F: Fn(Vec<Hit>) -> Vec<Hit> + Send + Sync,
{
    fn filter(&self, hits: Vec<Hit>) -> Vec<Hit> {
        self(hits)
    }
}

struct Current {
    settings: SearchSettings,
    engine: Option<Arc<dyn SearchEngine>>,
}

/// Owner of the current [`SearchEngine`].
///
/// The engine is opened lazily from the settings and can be swapped at
/// runtime with [`reconfigure`](Self::reconfigure). One lock covers both the
/// swap and [`engine`](Self::engine), so callers never see a half-swapped
/// engine.
///
/// # Examples
///
/// ```rust,no_run
/// use buildsearch::{SearchBackendManager, SearchSettings};
///
/// # fn main() -> buildsearch::Result<()> {
/// let manager = SearchBackendManager::new(SearchSettings::from_env()?);
/// for hit in manager.hits("project1 failed", true)? {
///     println!("{} {:?}", hit.display_name, hit.highlight_fragments);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SearchBackendManager {
    current: Mutex<Current>,
    extensions: Arc<ExtensionRegistry>,
    result_filter: RwLock<Option<Arc<dyn ResultFilter>>>,
    field_definitions: Mutex<Option<Arc<Vec<SearchFieldDefinition>>>>,
}

impl SearchBackendManager {
    pub fn new(settings: SearchSettings) -> Arc<Self> {
        Self::with_extensions(settings, Arc::new(ExtensionRegistry::new()))
    }

    pub fn with_extensions(settings: SearchSettings, extensions: Arc<ExtensionRegistry>) -> Arc<Self> {
        Arc::new(SearchBackendManager {
            current: Mutex::new(Current {
                settings,
                engine: None,
            }),
            extensions,
            result_filter: RwLock::new(None),
            field_definitions: Mutex::new(None),
        })
    }

    fn lock_current(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    pub fn settings(&self) -> SearchSettings {
        self.lock_current().settings.clone()
    }

    /// The current engine, opened on first use.
    pub fn engine(&self) -> Result<Arc<dyn SearchEngine>> {
        let mut current = self.lock_current();
        if let Some(engine) = current.engine.as_ref().filter(|e| !e.is_closed()) {
            return Ok(Arc::clone(engine));
        }
        let engine = open_engine(&current.settings.engine, Arc::clone(&self.extensions))?;
        current.engine = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Run `op` on the current engine. A call that lost a race with
    /// [`reconfigure`](Self::reconfigure) and found its engine closed runs
    /// once more on the engine that replaced it.
    fn with_engine<T>(&self, op: impl Fn(&dyn SearchEngine) -> Result<T>) -> Result<T> {
        let engine = self.engine()?;
        match op(engine.as_ref()) {
            Err(BuildSearchError::EngineClosed) => {
                tracing::debug!("Engine {:?} closed mid-call, retrying", engine.config());
                op(self.engine()?.as_ref())
            }
            other => other,
        }
    }

    /// Apply a new configuration map.
    ///
    /// Returns the existing engine when the target store is unchanged.
    /// Otherwise the new engine is opened first; if that fails the previous
    /// engine stays active and the error is returned.
    pub fn reconfigure(&self, config: &HashMap<String, String>) -> Result<Arc<dyn SearchEngine>> {
        let mut settings = SearchSettings::from_map(config)?;
        let mut current = self.lock_current();
        settings.rebuild_workers = current.settings.rebuild_workers;

        if let Some(engine) = current.engine.as_ref().filter(|e| !e.is_closed()) {
            if engine.config().same_target(&settings.engine) {
                let engine = Arc::clone(engine);
                current.settings = settings;
                tracing::debug!("Reconfigure kept engine {:?}", engine.config());
                return Ok(engine);
            }
        }

        let engine = match open_engine(&settings.engine, Arc::clone(&self.extensions)) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("Reconfigure to {:?} failed, keeping current engine: {}", settings.engine, e);
                return Err(e);
            }
        };
        if let Some(old) = current.engine.replace(Arc::clone(&engine)) {
            old.close();
        }
        current.settings = settings;
        drop(current);

        self.invalidate_field_definitions();
        tracing::info!("Search engine switched to {:?}", engine.config());
        Ok(engine)
    }

    pub fn set_result_filter(&self, filter: Option<Arc<dyn ResultFilter>>) {
        *self.result_filter.write().unwrap_or_else(|e| e.into_inner()) = filter;
    }

    pub fn hits(&self, query: &str, highlight: bool) -> Result<Vec<Hit>> {
        self.hits_after(query, highlight, None)
    }

    /// Next page of hits after `after`.
    pub fn hits_after(&self, query: &str, highlight: bool, after: Option<&HitCursor>) -> Result<Vec<Hit>> {
        let use_security = self.lock_current().settings.use_security;
        let hits = self.with_engine(|e| e.query(query, highlight, after)).map_err(|e| {
            if e.is_user_error() {
                tracing::debug!("Query '{}' failed: {}", query, e);
            } else {
                tracing::error!("Query '{}' failed: {}", query, e);
            }
            e
        })?;
        if !use_security {
            return Ok(hits);
        }
        let filter = self
            .result_filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(match filter {
            Some(filter) => filter.filter(hits),
            None => hits,
        })
    }

    pub fn store_build(&self, record: &dyn BuildRecord) -> Result<()> {
        self.with_engine(|e| e.store(record))?;
        Ok(())
    }

    pub fn remove_build(&self, id: &str) -> Result<()> {
        self.with_engine(|e| e.remove(id))?;
        Ok(())
    }

    pub fn delete_job(&self, job: &str) -> Result<()> {
        self.with_engine(|e| e.delete_job(job))
    }

    /// `Err(InvalidQuery)` with a message when `query` does not parse.
    pub fn validate_query(&self, query: &str) -> Result<()> {
        QueryBuilder::validate(query)
    }

    /// Search help, cached until `force_refresh` or an engine switch.
    pub fn search_field_definitions(&self, force_refresh: bool) -> Result<Arc<Vec<SearchFieldDefinition>>> {
        let mut cached = self
            .field_definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let (Some(defs), false) = (cached.as_ref(), force_refresh) {
            return Ok(Arc::clone(defs));
        }
        let defs = Arc::new(self.with_engine(|e| e.search_field_definitions())?);
        *cached = Some(Arc::clone(&defs));
        Ok(defs)
    }

    pub fn invalidate_field_definitions(&self) {
        *self
            .field_definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Full rebuild with the configured worker count.
    pub fn rebuild_request(&self) -> RebuildRequest {
        RebuildRequest::full().with_workers(self.lock_current().settings.rebuild_workers)
    }

    /// A rebuilder bound to the current engine.
    pub fn rebuilder(&self, source: Arc<dyn RecordSource>) -> Result<Rebuilder> {
        Ok(Rebuilder::new(self.engine()?, source))
    }

    /// Run a rebuild on the calling thread.
    pub fn rebuild_database(
        &self,
        source: Arc<dyn RecordSource>,
        request: &RebuildRequest,
        progress: &ManagerProgress,
    ) -> Result<()> {
        self.rebuild_database_with_cancel(source, request, progress, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`rebuild_database`](Self::rebuild_database); setting `cancel`
    /// stops the run before its next job.
    pub fn rebuild_database_with_cancel(
        &self,
        source: Arc<dyn RecordSource>,
        request: &RebuildRequest,
        progress: &ManagerProgress,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        let outcome = match self.rebuilder(source) {
            Ok(rebuilder) => rebuilder.with_cancel_flag(cancel).run(request, progress),
            Err(e) => {
                progress.completed_with_errors(e.clone());
                progress.set_finished();
                Err(e)
            }
        };
        self.invalidate_field_definitions();
        outcome
    }

    pub fn close(&self) {
        if let Some(engine) = self.lock_current().engine.take() {
            engine.close();
        }
    }
}
