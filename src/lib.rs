//! # Buildsearch
//!
//! Free-text search over CI build records. Console output, build metadata and
//! extension-contributed text are indexed into either an embedded
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index or a remote
//! Solr-compatible server, and queries come back as ranked, highlighted hits.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use buildsearch::{BuildRecordData, SearchBackendManager, SearchSettings};
//!
//! # fn main() -> buildsearch::Result<()> {
//! buildsearch::init_tracing();
//! let manager = SearchBackendManager::new(SearchSettings::from_env()?);
//!
//! let mut build = BuildRecordData::new("folder/app", 7, "compiling...\nerror: linker failed");
//! build.result = Some("FAILURE".into());
//! manager.store_build(&build)?;
//!
//! for hit in manager.hits("app linker", true)? {
//!     println!("{} {}", hit.display_name, hit.search_url());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Rebuilding in the background
//!
//! ```rust,no_run
//! use buildsearch::{RebuildController, RebuildRequest, RecordSource, SearchBackendManager};
//! use std::sync::Arc;
//!
//! # fn run(manager: Arc<SearchBackendManager>, source: Arc<dyn RecordSource>) {
//! let controller = RebuildController::new(manager, source);
//! controller.start(RebuildRequest::full().with_workers(4));
//! let status = controller.status();
//! println!("{} {}", status.code, status.message);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod query;
pub mod rebuild;
pub mod types;

pub use config::{EngineConfig, SearchSettings};
pub use error::{BuildSearchError, Result};
pub use index::{
    open_engine, ExtensionField, ExtensionRegistry, LocalEngine, RemoteEngine, ResultFilter,
    SearchBackendManager, SearchEngine,
};
pub use query::{QueryBuilder, QueryNode};
pub use rebuild::{
    BulkExecutor, ManagerProgress, Progress, ProgressState, RebuildController, RebuildRequest,
    RebuildStatus, Rebuilder,
};
pub use types::*;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`). Does
/// nothing when a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
