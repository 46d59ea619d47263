use crate::error::{BuildSearchError, Result};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

pub const KEY_ENGINE: &str = "engine";
pub const KEY_LOCAL_PATH: &str = "localPath";
pub const KEY_REMOTE_URL: &str = "remoteUrl";
pub const KEY_REMOTE_COLLECTION: &str = "remoteCollection";
pub const KEY_USE_SECURITY: &str = "useSecurity";

pub const DEFAULT_INDEX_PATH: &str = "./buildsearch-index";
pub const DEFAULT_COLLECTION: &str = "buildsearch";
pub const DEFAULT_REBUILD_WORKERS: usize = 5;

/// Which engine to run and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineConfig {
    Local { path: PathBuf },
    Remote { url: String, collection: String },
}

impl EngineConfig {
    /// Parse the opaque key/value map handed to `reconfigure`.
    ///
    /// `engine` accepts `local`/`lucene` and `remote`/`solr`; when it is absent
    /// the engine is inferred from which of `localPath`/`remoteUrl` is set.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let engine = match get(KEY_ENGINE) {
            Some(e) => e.to_ascii_lowercase(),
            None if get(KEY_REMOTE_URL).is_some() => "remote".to_string(),
            None => "local".to_string(),
        };

        match engine.as_str() {
            "local" | "lucene" => {
                let path = get(KEY_LOCAL_PATH).ok_or_else(|| {
                    BuildSearchError::Config(format!("{} is required for a local engine", KEY_LOCAL_PATH))
                })?;
                Ok(EngineConfig::Local {
                    path: PathBuf::from(path),
                })
            }
            "remote" | "solr" => {
                let url = get(KEY_REMOTE_URL).ok_or_else(|| {
                    BuildSearchError::Config(format!("{} is required for a remote engine", KEY_REMOTE_URL))
                })?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(BuildSearchError::Config(format!(
                        "{} must be an http(s) URL, got {}",
                        KEY_REMOTE_URL, url
                    )));
                }
                Ok(EngineConfig::Remote {
                    url: url.trim_end_matches('/').to_string(),
                    collection: get(KEY_REMOTE_COLLECTION)
                        .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
                })
            }
            other => Err(BuildSearchError::Config(format!(
                "unknown engine '{}', expected local or remote",
                other
            ))),
        }
    }

    pub fn local(path: impl AsRef<Path>) -> Self {
        EngineConfig::Local {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn remote(url: impl Into<String>, collection: impl Into<String>) -> Self {
        EngineConfig::Remote {
            url: url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
        }
    }

    /// True when both configs point at the same underlying store.
    pub fn same_target(&self, other: &EngineConfig) -> bool {
        match (self, other) {
            (EngineConfig::Local { path: a }, EngineConfig::Local { path: b }) => {
                normalize(a) == normalize(b)
            }
            (
                EngineConfig::Remote { url: a, collection: ca },
                EngineConfig::Remote { url: b, collection: cb },
            ) => a.trim_end_matches('/') == b.trim_end_matches('/') && ca == cb,
            _ => false,
        }
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        match self {
            EngineConfig::Local { path } => {
                map.insert(KEY_ENGINE.to_string(), "local".to_string());
                map.insert(KEY_LOCAL_PATH.to_string(), path.display().to_string());
            }
            EngineConfig::Remote { url, collection } => {
                map.insert(KEY_ENGINE.to_string(), "remote".to_string());
                map.insert(KEY_REMOTE_URL.to_string(), url.clone());
                map.insert(KEY_REMOTE_COLLECTION.to_string(), collection.clone());
            }
        }
        map
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Process-level settings, read from `BUILDSEARCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub engine: EngineConfig,
    pub use_security: bool,
    pub rebuild_workers: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        SearchSettings {
            engine: EngineConfig::local(DEFAULT_INDEX_PATH),
            use_security: false,
            rebuild_workers: DEFAULT_REBUILD_WORKERS,
        }
    }
}

impl SearchSettings {
    /// Local engine at `path`, other settings at their defaults.
    pub fn local(path: impl AsRef<Path>) -> Self {
        SearchSettings {
            engine: EngineConfig::local(path),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        let engine_name = env::var("BUILDSEARCH_ENGINE").unwrap_or_else(|_| "local".to_string());

        let mut map = HashMap::new();
        map.insert(KEY_ENGINE.to_string(), engine_name);
        map.insert(
            KEY_LOCAL_PATH.to_string(),
            env::var("BUILDSEARCH_INDEX_PATH").unwrap_or_else(|_| DEFAULT_INDEX_PATH.to_string()),
        );
        if let Ok(url) = env::var("BUILDSEARCH_REMOTE_URL") {
            map.insert(KEY_REMOTE_URL.to_string(), url);
        }
        map.insert(
            KEY_REMOTE_COLLECTION.to_string(),
            env::var("BUILDSEARCH_REMOTE_COLLECTION")
                .unwrap_or_else(|_| DEFAULT_COLLECTION.to_string()),
        );

        let use_security = env::var("BUILDSEARCH_USE_SECURITY")
            .ok()
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let rebuild_workers = env::var("BUILDSEARCH_REBUILD_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_REBUILD_WORKERS);

        Ok(SearchSettings {
            engine: EngineConfig::from_map(&map)?,
            use_security,
            rebuild_workers,
        })
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        Ok(SearchSettings {
            engine: EngineConfig::from_map(map)?,
            use_security: map
                .get(KEY_USE_SECURITY)
                .map(|v| parse_bool(v))
                .unwrap_or(false),
            rebuild_workers: DEFAULT_REBUILD_WORKERS,
        })
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = self.engine.to_map();
        map.insert(KEY_USE_SECURITY.to_string(), self.use_security.to_string());
        map
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
