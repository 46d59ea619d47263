use crate::error::Result;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stable build identity: `"<job full name>#<build number>"` unless the host
/// supplies its own id.
pub type BuildId = String;

static LINE_ENDINGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r\n|\n|\r").unwrap());

/// A single extracted field value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Long(i64),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Text rendering used for the remote engine and for distinct values.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Long(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

/// The indexed form of one build: zero or one value per schema or extension field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexedDocument {
    pub id: BuildId,
    pub fields: IndexMap<String, FieldValue>,
}

impl IndexedDocument {
    pub fn new(id: impl Into<BuildId>) -> Self {
        IndexedDocument {
            id: id.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn long(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_long)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }
}

/// Position of a hit in the ranked order; used to continue after the last
/// result of a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitCursor {
    pub score: f32,
    pub start_time: i64,
    pub id: BuildId,
}

/// One ranked query result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hit {
    pub display_name: String,
    /// `"<job full name>/<build number>"`, enough to resolve a build page.
    pub location_id: String,
    pub highlight_fragments: Vec<String>,
    pub status_category: String,
    pub project_name: String,
    pub build_number: i64,
    pub score: f32,
    pub start_time: i64,
    pub id: BuildId,
}

impl Hit {
    pub const DEFAULT_STATUS: &'static str = "grey";

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: BuildId,
        project_name: String,
        build_number: i64,
        display_name: Option<String>,
        status_category: Option<String>,
        fragments: Vec<String>,
        score: f32,
        start_time: i64,
    ) -> Self {
        let display_name =
            display_name.unwrap_or_else(|| format!("{} #{}", project_name, build_number));
        Hit {
            display_name,
            location_id: format!("{}/{}", project_name, build_number),
            highlight_fragments: fragments
                .iter()
                .map(|f| LINE_ENDINGS.replace_all(f, "<br/>").into_owned())
                .collect(),
            status_category: status_category.unwrap_or_else(|| Self::DEFAULT_STATUS.to_string()),
            project_name,
            build_number,
            score,
            start_time,
            id,
        }
    }

    /// URL of the build page relative to the CI root, e.g. `job/folder/job/app/12/`.
    pub fn search_url(&self) -> String {
        let mut url = String::new();
        for segment in self.project_name.split('/').filter(|s| !s.is_empty()) {
            url.push_str("job/");
            url.push_str(segment);
            url.push('/');
        }
        url.push_str(&self.build_number.to_string());
        url.push('/');
        url
    }

    pub fn cursor(&self) -> HitCursor {
        HitCursor {
            score: self.score,
            start_time: self.start_time,
            id: self.id.clone(),
        }
    }
}

/// Read access to one build of the host CI system.
///
/// Getters that can fail in the host (console log I/O) return `Result`; every
/// other getter is plain data. Optional values return `None` when the host has
/// nothing to report.
pub trait BuildRecord: Send + Sync {
    fn id(&self) -> BuildId {
        format!("{}#{}", self.job_name(), self.number())
    }
    /// Full hierarchical job name, `/`-separated (`folder/job`).
    fn job_name(&self) -> String;
    fn job_display_name(&self) -> String {
        self.job_name()
    }
    fn number(&self) -> i64;
    fn display_name(&self) -> String {
        format!("#{}", self.number())
    }
    fn parameters(&self) -> Vec<String> {
        Vec::new()
    }
    fn result(&self) -> Option<String>;
    fn duration_millis(&self) -> i64;
    fn start_time_millis(&self) -> i64;
    fn built_on(&self) -> Option<String> {
        None
    }
    fn causes(&self) -> Vec<String> {
        Vec::new()
    }
    fn status_color(&self) -> Option<String> {
        None
    }
    fn console_text(&self) -> Result<String>;
}

/// Plain-data build record, convenient for hosts that snapshot builds as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildRecordData {
    pub id: Option<BuildId>,
    pub job_name: String,
    pub job_display_name: Option<String>,
    pub number: i64,
    pub display_name: Option<String>,
    pub parameters: Vec<String>,
    pub result: Option<String>,
    pub duration_millis: i64,
    pub start_time_millis: i64,
    pub built_on: Option<String>,
    pub causes: Vec<String>,
    pub status_color: Option<String>,
    pub console: String,
}

impl BuildRecordData {
    pub fn new(job_name: impl Into<String>, number: i64, console: impl Into<String>) -> Self {
        BuildRecordData {
            job_name: job_name.into(),
            number,
            console: console.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(json.clone())?)
    }
}

impl BuildRecord for BuildRecordData {
    fn id(&self) -> BuildId {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}#{}", self.job_name, self.number))
    }

    fn job_name(&self) -> String {
        self.job_name.clone()
    }

    fn job_display_name(&self) -> String {
        self.job_display_name
            .clone()
            .unwrap_or_else(|| self.job_name.clone())
    }

    fn number(&self) -> i64 {
        self.number
    }

    fn display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("#{}", self.number))
    }

    fn parameters(&self) -> Vec<String> {
        self.parameters.clone()
    }

    fn result(&self) -> Option<String> {
        self.result.clone()
    }

    fn duration_millis(&self) -> i64 {
        self.duration_millis
    }

    fn start_time_millis(&self) -> i64 {
        self.start_time_millis
    }

    fn built_on(&self) -> Option<String> {
        self.built_on.clone()
    }

    fn causes(&self) -> Vec<String> {
        self.causes.clone()
    }

    fn status_color(&self) -> Option<String> {
        self.status_color.clone()
    }

    fn console_text(&self) -> Result<String> {
        Ok(self.console.clone())
    }
}

/// The host CI system as seen by a rebuild.
pub trait RecordSource: Send + Sync {
    /// Full names of every job currently known to the host.
    fn job_names(&self) -> Result<Vec<String>>;
    /// All retained builds of `job`, any order.
    fn builds(&self, job: &str) -> Result<Vec<Arc<dyn BuildRecord>>>;
    /// Oldest retained build number, `None` when the job has no builds.
    fn first_build_number(&self, job: &str) -> Result<Option<i64>> {
        Ok(self.builds(job)?.iter().map(|b| b.number()).min())
    }
}
