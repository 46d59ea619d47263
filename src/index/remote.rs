use crate::config::EngineConfig;
use crate::error::{BuildSearchError, Result};
use crate::index::distinct::DistinctValues;
use crate::index::document::extract_document;
use crate::index::extension::ExtensionRegistry;
use crate::index::schema::{self, FieldKind, SchemaView};
use crate::index::{SearchEngine, MAX_HITS_PER_PAGE};
use crate::query::highlighter::Highlighter;
use crate::query::solr::to_query_string;
use crate::query::QueryBuilder;
use crate::rebuild::progress::Progress;
use crate::types::{BuildRecord, FieldValue, Hit, HitCursor, IndexedDocument};
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine backed by a Solr-compatible document-search server.
///
/// Every default-searchable field is copied into the composite `text` field,
/// which is the default field for unqualified terms.
pub struct RemoteEngine {
    config: EngineConfig,
    base: String,
    client: Client,
    extensions: Arc<ExtensionRegistry>,
    closed: AtomicBool,
}

type Params = Vec<(&'static str, String)>;

impl RemoteEngine {
    pub const COMPOSITE_FIELD: &'static str = "text";
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Upper bound on documents fetched for cursor paging and distinct scans.
    const SCAN_ROWS: usize = 10_000;

    /// Connect to `collection` at `url` and declare any missing fields.
    pub fn connect(url: &str, collection: &str, extensions: Arc<ExtensionRegistry>) -> Result<Self> {
        let client = Client::builder().timeout(Self::REQUEST_TIMEOUT).build()?;
        let url = url.trim_end_matches('/');
        let engine = RemoteEngine {
            config: EngineConfig::Remote {
                url: url.to_string(),
                collection: collection.to_string(),
            },
            base: format!("{}/{}", url, collection),
            client,
            extensions,
            closed: AtomicBool::new(false),
        };
        engine.provision_schema()?;
        tracing::info!("Connected to remote collection {}", engine.base);
        Ok(engine)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BuildSearchError::EngineClosed);
        }
        Ok(())
    }

    fn provision_schema(&self) -> Result<()> {
        let view = self.schema_view();
        self.define_field(Self::COMPOSITE_FIELD, "text_general", false, true)?;
        for info in view.all() {
            let field_type = match info.kind {
                FieldKind::Long => "plong",
                FieldKind::Keyword => "string",
                FieldKind::Text => "text_general",
            };
            self.define_field(&info.name, field_type, info.persist, false)?;
        }
        self.define_field(schema::JOB_KEY, "string", false, false)?;
        self.define_copy_fields(&view.default_searchable())
    }

    fn define_field(&self, name: &str, field_type: &str, stored: bool, multi_valued: bool) -> Result<()> {
        let url = format!("{}/schema/fields/{}", self.base, name);
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                let body = json!({
                    "add-field": {
                        "name": name,
                        "type": field_type,
                        "indexed": true,
                        "stored": stored,
                        "multiValued": multi_valued,
                    }
                });
                self.post(&format!("{}/schema", self.base), Vec::new(), &body)?;
                tracing::info!("Declared remote field {} ({})", name, field_type);
                Ok(())
            }
            status if status.is_success() => Ok(()),
            status => Err(BuildSearchError::RemoteStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    fn define_copy_fields(&self, sources: &[&str]) -> Result<()> {
        let existing = self.get_json(
            &format!("{}/schema/copyfields", self.base),
            vec![("wt", "json".to_string())],
        )?;
        let copies_to_composite = |source: &str| {
            existing["copyFields"]
                .as_array()
                .map(|all| {
                    all.iter().any(|cf| {
                        cf["source"] == source
                            && match &cf["dest"] {
                                Value::String(d) => d == Self::COMPOSITE_FIELD,
                                Value::Array(ds) => ds.iter().any(|d| d == Self::COMPOSITE_FIELD),
                                _ => false,
                            }
                    })
                })
                .unwrap_or(false)
        };
        let missing: Vec<Value> = sources
            .iter()
            .filter(|s| !copies_to_composite(s))
            .map(|s| json!({ "source": s, "dest": [Self::COMPOSITE_FIELD] }))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        tracing::info!("Adding {} copy fields into {}", missing.len(), Self::COMPOSITE_FIELD);
        self.post(
            &format!("{}/schema", self.base),
            Vec::new(),
            &json!({ "add-copy-field": missing }),
        )?;
        Ok(())
    }

    fn get_json(&self, url: &str, params: Params) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .query(&params)
            .header(ACCEPT, "application/json")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(BuildSearchError::RemoteStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json()?)
    }

    fn post(&self, url: &str, params: Params, body: &Value) -> Result<Value> {
        let response = self.client.post(url).query(&params).json(body).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(BuildSearchError::RemoteStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json()?)
    }

    fn update(&self, body: &Value) -> Result<()> {
        self.post(
            &format!("{}/update", self.base),
            vec![("commit", "true".to_string()), ("wt", "json".to_string())],
            body,
        )?;
        Ok(())
    }

    /// `Ok(None)` when the server rejects the query as malformed.
    fn select(&self, params: Params) -> Result<Option<Value>> {
        let url = format!("{}/select", self.base);
        let mut params = params;
        params.push(("wt", "json".to_string()));
        let response = self.client.get(&url).query(&params).send()?;
        match response.status() {
            StatusCode::BAD_REQUEST => {
                tracing::debug!("Remote rejected query: {:?}", params);
                Ok(None)
            }
            status if status.is_success() => Ok(Some(response.json()?)),
            status => Err(BuildSearchError::RemoteStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    fn num_found(&self, query: &str) -> Result<usize> {
        let params = vec![
            ("q", query.to_string()),
            ("df", Self::COMPOSITE_FIELD.to_string()),
            ("q.op", "AND".to_string()),
            ("rows", "0".to_string()),
        ];
        Ok(self
            .select(params)?
            .and_then(|body| body["response"]["numFound"].as_u64())
            .unwrap_or(0) as usize)
    }

    fn from_remote(&self, value: &Value, view: &SchemaView) -> Option<IndexedDocument> {
        let obj = value.as_object()?;
        let id = scalar(obj.get(schema::ID)?)?.render();
        let mut doc = IndexedDocument::new(id);
        for (name, value) in obj {
            if !view.lookup(name).map(|f| f.persist).unwrap_or(false) {
                continue;
            }
            if let Some(v) = scalar(value) {
                doc.insert(name.clone(), v);
            }
        }
        Some(doc)
    }
}

/// First scalar of a remote field value; multi-valued fields come back as arrays.
fn scalar(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Number(n) => n.as_i64().map(FieldValue::Long),
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        Value::Array(items) => items.first().and_then(scalar),
        _ => None,
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// True when a hit keyed `(score, start, id)` ranks after `cursor`.
fn after_cursor(score: f32, start: i64, id: &str, cursor: &HitCursor) -> bool {
    score
        .total_cmp(&cursor.score)
        .reverse()
        .then(start.cmp(&cursor.start_time).reverse())
        .then(id.cmp(&cursor.id))
        .is_gt()
}

impl SearchEngine for RemoteEngine {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn schema_view(&self) -> SchemaView {
        SchemaView::new(&self.extensions.snapshot())
    }

    fn store(&self, record: &dyn BuildRecord) -> Result<Option<IndexedDocument>> {
        self.ensure_open()?;
        let extensions = self.extensions.snapshot();
        let view = SchemaView::new(&extensions);
        let doc = extract_document(record, &extensions);
        let previous = self.get(&doc.id)?;

        let mut remote = Map::new();
        for (name, value) in &doc.fields {
            if view.lookup(name).is_none() {
                continue;
            }
            let value = match value {
                FieldValue::Long(n) => json!(n),
                FieldValue::Text(s) => json!(s),
            };
            remote.insert(name.clone(), value);
        }
        remote.insert(schema::JOB_KEY.to_string(), json!(record.job_name()));

        self.update(&json!({
            "delete": { "id": doc.id },
            "add": { "doc": remote },
        }))?;
        tracing::debug!("Stored build {} remotely", doc.id);
        Ok(previous)
    }

    fn remove(&self, id: &str) -> Result<Option<IndexedDocument>> {
        self.ensure_open()?;
        let previous = self.get(id)?;
        if previous.is_some() {
            self.update(&json!({ "delete": { "id": id } }))?;
        }
        Ok(previous)
    }

    fn get(&self, id: &str) -> Result<Option<IndexedDocument>> {
        self.ensure_open()?;
        let body = self.get_json(
            &format!("{}/get", self.base),
            vec![("id", id.to_string()), ("wt", "json".to_string())],
        )?;
        Ok(self.from_remote(&body["doc"], &self.schema_view()))
    }

    fn query(&self, query: &str, highlight: bool, after: Option<&HitCursor>) -> Result<Vec<Hit>> {
        self.ensure_open()?;
        let view = self.schema_view();
        let built = QueryBuilder::build(query, |filter| {
            Ok(self.num_found(&to_query_string(filter, &view))? > 0)
        });
        let built = match built {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!("Query '{}' rejected: {}", query, e);
                return Ok(Vec::new());
            }
        };

        let rows = if after.is_some() {
            Self::SCAN_ROWS
        } else {
            MAX_HITS_PER_PAGE
        };
        let mut params = vec![
            ("q", to_query_string(&built.query, &view)),
            ("df", Self::COMPOSITE_FIELD.to_string()),
            ("q.op", "AND".to_string()),
            ("fl", "*,score".to_string()),
            ("sort", format!("score desc,{} desc,{} asc", schema::START_TIME, schema::ID)),
            ("rows", rows.to_string()),
        ];
        if highlight {
            params.extend([
                ("hl", "true".to_string()),
                ("hl.q", to_query_string(&built.highlight, &view)),
                ("hl.fl", schema::CONSOLE.to_string()),
                ("hl.snippets", Highlighter::MAX_FRAGMENTS.to_string()),
                ("hl.simple.pre", "<B>".to_string()),
                ("hl.simple.post", "</B>".to_string()),
            ]);
        }

        let Some(body) = self.select(params)? else {
            return Ok(Vec::new());
        };
        let docs = body["response"]["docs"].as_array().cloned().unwrap_or_default();

        let mut hits = Vec::new();
        for doc in &docs {
            let Some(indexed) = self.from_remote(doc, &view) else {
                continue;
            };
            let score = doc["score"].as_f64().unwrap_or(0.0) as f32;
            let start = indexed.long(schema::START_TIME).unwrap_or(0);
            if let Some(c) = after {
                if !after_cursor(score, start, &indexed.id, c) {
                    continue;
                }
            }
            let fragments: Vec<String> = body["highlighting"][indexed.id.as_str()][schema::CONSOLE]
                .as_array()
                .map(|fs| fs.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let number = indexed.long(schema::BUILD_NUMBER).unwrap_or_default();
            let display = indexed.text(schema::PROJECT_DISPLAY_NAME).map(|job| {
                let build = indexed
                    .text(schema::BUILD_DISPLAY_NAME)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{}", number));
                format!("{} {}", job, build)
            });
            hits.push(Hit::new(
                indexed.id.clone(),
                indexed.text(schema::PROJECT_NAME).unwrap_or_default().to_string(),
                number,
                display,
                indexed.text(schema::BALL_COLOR).map(str::to_string),
                fragments,
                score,
                start,
            ));
            if hits.len() == MAX_HITS_PER_PAGE {
                break;
            }
        }
        tracing::debug!("Remote query '{}' returned {} hits", query, hits.len());
        Ok(hits)
    }

    fn count(&self, query: &str) -> Result<usize> {
        self.ensure_open()?;
        match QueryBuilder::parse(query) {
            Ok(node) => self.num_found(&to_query_string(&node, &self.schema_view())),
            Err(e) => {
                tracing::debug!("Count query '{}' rejected: {}", query, e);
                Ok(0)
            }
        }
    }

    fn job_names(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let params = vec![
            ("q", "*:*".to_string()),
            ("rows", "0".to_string()),
            ("facet", "true".to_string()),
            ("facet.field", schema::JOB_KEY.to_string()),
            ("facet.limit", "-1".to_string()),
            ("facet.mincount", "1".to_string()),
        ];
        let Some(body) = self.select(params)? else {
            return Ok(Vec::new());
        };
        // facet counts arrive flattened: [name, count, name, count, ...]
        Ok(body["facet_counts"]["facet_fields"][schema::JOB_KEY]
            .as_array()
            .map(|pairs| {
                pairs
                    .iter()
                    .step_by(2)
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_job(&self, job: &str) -> Result<()> {
        self.ensure_open()?;
        self.update(&json!({
            "delete": { "query": format!("{}:{}", schema::JOB_KEY, quote(job)) }
        }))?;
        tracing::info!("Deleted all remote documents of job {}", job);
        Ok(())
    }

    fn clean_deleted_builds(&self, job: &str, first_build: i64, progress: &Progress) -> Result<()> {
        self.ensure_open()?;
        let job_query = format!("{}:{}", schema::JOB_KEY, quote(job));
        let stale_query = format!(
            "{} AND {}:{{* TO {}}}",
            job_query,
            schema::BUILD_NUMBER,
            first_build
        );
        let total = self.num_found(&job_query)?;
        progress.set_max(total as u64);
        let removed = self.num_found(&stale_query)?;
        if removed > 0 {
            self.update(&json!({ "delete": { "query": stale_query } }))?;
        }
        progress.set_current(total as u64);
        tracing::info!(
            "Removed {} of {} remote documents of job {} older than build {}",
            removed,
            total,
            job,
            first_build
        );
        Ok(())
    }

    fn distinct_values(&self, field: &str, max_length: Option<usize>) -> Result<Vec<String>> {
        self.ensure_open()?;
        let view = self.schema_view();
        let info = view
            .lookup(field)
            .ok_or_else(|| BuildSearchError::FieldNotFound(field.to_string()))?;
        let mut values = DistinctValues::new(max_length)?;
        if !info.persist {
            return Ok(values.into_vec());
        }
        let params = vec![
            ("q", format!("{}:*", field)),
            ("fl", field.to_string()),
            ("rows", Self::SCAN_ROWS.to_string()),
        ];
        if let Some(body) = self.select(params)? {
            for doc in body["response"]["docs"].as_array().into_iter().flatten() {
                if let Some(v) = scalar(&doc[field]) {
                    values.add(&v.render());
                }
            }
        }
        Ok(values.into_vec())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Closed remote engine {}", self.base);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_conversion() {
        assert_eq!(scalar(&json!(12)), Some(FieldValue::Long(12)));
        assert_eq!(scalar(&json!("x")), Some(FieldValue::Text("x".into())));
        assert_eq!(scalar(&json!(["first", "second"])), Some(FieldValue::Text("first".into())));
        assert_eq!(scalar(&json!(null)), None);
    }

    #[test]
    fn test_after_cursor_ordering() {
        let cursor = HitCursor {
            score: 1.0,
            start_time: 100,
            id: "b".into(),
        };
        assert!(!after_cursor(2.0, 0, "z", &cursor));
        assert!(after_cursor(0.5, 500, "a", &cursor));
        assert!(!after_cursor(1.0, 200, "z", &cursor));
        assert!(after_cursor(1.0, 50, "a", &cursor));
        assert!(!after_cursor(1.0, 100, "a", &cursor));
        assert!(!after_cursor(1.0, 100, "b", &cursor));
        assert!(after_cursor(1.0, 100, "c", &cursor));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }
}
