use crate::config::EngineConfig;
use crate::error::{BuildSearchError, Result};
use crate::index::distinct::DistinctCollector;
use crate::index::document::extract_document;
use crate::index::extension::ExtensionRegistry;
use crate::index::schema::{self, build_tantivy_schema, SchemaView};
use crate::index::{SearchEngine, MAX_HITS_PER_PAGE};
use crate::query::{Highlighter, QueryBuilder, QueryCompiler};
use crate::rebuild::progress::Progress;
use crate::types::{BuildRecord, FieldValue, Hit, HitCursor, IndexedDocument};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, OwnedValue, Schema as TantivySchema};
use tantivy::{
    DocAddress, Index, IndexReader, IndexSettings, IndexWriter, ReloadPolicy, Searcher,
    TantivyDocument, Term,
};

/// Embedded engine backed by a tantivy index on disk.
///
/// A single writer sits behind a mutex; every write commits and then reloads
/// the reader, so readers only ever see committed snapshots and never block
/// on writers.
pub struct LocalEngine {
    config: EngineConfig,
    index: Index,
    schema: TantivySchema,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    closed: AtomicBool,
    extensions: Arc<ExtensionRegistry>,
    highlighter: Highlighter,
}

/// Ranking key of one matching document before its stored fields are loaded.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    start_time: i64,
    addr: DocAddress,
}

impl LocalEngine {
    pub const WRITER_HEAP_BYTES: usize = 50_000_000;

    /// Open the index at `path`, creating it (and the directory) if needed.
    pub fn open(path: &Path, extensions: Arc<ExtensionRegistry>) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let index = if path.join("meta.json").exists() {
            Index::open_in_dir(path)?
        } else {
            let dir = MmapDirectory::open(path)?;
            Index::create(dir, build_tantivy_schema(), IndexSettings::default())?
        };

        let schema = index.schema();
        for f in schema::fields() {
            if schema.get_field(f.name).is_err() {
                return Err(BuildSearchError::Config(format!(
                    "Index at {} has an incompatible schema (missing field {})",
                    path.display(),
                    f.name
                )));
            }
        }

        let writer = index.writer_with_num_threads(1, Self::WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        reader.reload()?;

        tracing::info!(
            "Opened local index at {} ({} documents)",
            path.display(),
            reader.searcher().num_docs()
        );

        Ok(LocalEngine {
            config: EngineConfig::Local {
                path: PathBuf::from(path),
            },
            index,
            schema,
            reader,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            extensions,
            highlighter: Highlighter::default(),
        })
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<IndexWriter>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(BuildSearchError::EngineClosed);
        }
        Ok(())
    }

    fn field(&self, name: &str) -> Result<Field> {
        self.schema
            .get_field(name)
            .map_err(|_| BuildSearchError::FieldNotFound(name.to_string()))
    }

    /// Run `f` under the writer lock, then commit and reload the reader.
    /// Uncommitted operations are rolled back when anything fails.
    fn write<T>(&self, f: impl FnOnce(&mut IndexWriter, &Searcher) -> Result<T>) -> Result<T> {
        let mut guard = self.lock_writer();
        let writer = guard.as_mut().ok_or(BuildSearchError::EngineClosed)?;
        let searcher = self.reader.searcher();
        let outcome = f(writer, &searcher).and_then(|out| {
            writer.commit()?;
            Ok(out)
        });
        match outcome {
            Ok(out) => {
                self.reader.reload()?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = writer.rollback() {
                    tracing::error!("Rollback after failed write also failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    fn id_term(&self, id: &str) -> Result<Term> {
        Ok(Term::from_field_text(self.field(schema::ID)?, id))
    }

    fn find(&self, searcher: &Searcher, id: &str) -> Result<Option<TantivyDocument>> {
        let query = TermQuery::new(self.id_term(id)?, IndexRecordOption::Basic);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        match top.first() {
            Some((_, addr)) => Ok(Some(searcher.doc(*addr)?)),
            None => Ok(None),
        }
    }

    fn load(&self, searcher: &Searcher, id: &str, view: &SchemaView) -> Result<Option<IndexedDocument>> {
        Ok(self
            .find(searcher, id)?
            .map(|stored| self.to_indexed(id, &stored, view)))
    }

    fn to_tantivy(&self, doc: &IndexedDocument, job: &str, view: &SchemaView) -> Result<TantivyDocument> {
        let mut out = TantivyDocument::default();
        let mut ext_stored: BTreeMap<String, OwnedValue> = BTreeMap::new();
        let mut ext_hidden: BTreeMap<String, OwnedValue> = BTreeMap::new();

        for (name, value) in &doc.fields {
            let Some(info) = view.lookup(name) else {
                continue;
            };
            if info.extension {
                let target = if info.persist {
                    &mut ext_stored
                } else {
                    &mut ext_hidden
                };
                target.insert(name.clone(), OwnedValue::Str(value.render()));
                continue;
            }
            let field = self.field(name)?;
            match value {
                FieldValue::Long(v) => out.add_i64(field, *v),
                FieldValue::Text(s) => out.add_text(field, s),
            }
        }

        out.add_text(self.field(schema::JOB_KEY)?, job);
        if !ext_stored.is_empty() {
            out.add_object(self.field(schema::EXT_STORED)?, ext_stored);
        }
        if !ext_hidden.is_empty() {
            out.add_object(self.field(schema::EXT_HIDDEN)?, ext_hidden);
        }
        Ok(out)
    }

    fn to_indexed(&self, id: &str, stored: &TantivyDocument, view: &SchemaView) -> IndexedDocument {
        let mut doc = IndexedDocument::new(id);
        for info in view.all().filter(|f| f.persist && !f.extension) {
            let Ok(field) = self.schema.get_field(&info.name) else {
                continue;
            };
            if let Some(value) = stored.get_first(field) {
                match OwnedValue::from(value) {
                    OwnedValue::Str(s) => doc.insert(info.name.clone(), FieldValue::Text(s)),
                    OwnedValue::I64(n) => doc.insert(info.name.clone(), FieldValue::Long(n)),
                    _ => {}
                }
            }
        }
        if let Ok(field) = self.schema.get_field(schema::EXT_STORED) {
            if let Some(value) = stored.get_first(field) {
                if let OwnedValue::Object(pairs) = OwnedValue::from(value) {
                    for (key, value) in pairs {
                        let known = view.lookup(&key).map(|f| f.extension).unwrap_or(false);
                        if let (true, OwnedValue::Str(s)) = (known, value) {
                            doc.insert(key, FieldValue::Text(s));
                        }
                    }
                }
            }
        }
        doc
    }

    /// Score every match and read its start time from the fast column.
    fn candidates(&self, searcher: &Searcher, query: &dyn Query) -> Result<Vec<Candidate>> {
        let limit = (searcher.num_docs() as usize).max(1);
        let top = searcher.search(query, &TopDocs::with_limit(limit))?;

        let mut columns = Vec::with_capacity(searcher.segment_readers().len());
        for segment in searcher.segment_readers() {
            columns.push(segment.fast_fields().i64(schema::START_TIME).ok());
        }

        let mut out: Vec<Candidate> = top
            .into_iter()
            .map(|(score, addr)| {
                let start_time = columns
                    .get(addr.segment_ord as usize)
                    .and_then(|c| c.as_ref())
                    .and_then(|c| c.first(addr.doc_id))
                    .unwrap_or(0);
                Candidate {
                    score,
                    start_time,
                    addr,
                }
            })
            .collect();
        out.sort_by(|a, b| rank(a.score, a.start_time, b.score, b.start_time).then(a.addr.cmp(&b.addr)));
        Ok(out)
    }

    fn build_hit(
        &self,
        candidate: &Candidate,
        id: String,
        stored: &TantivyDocument,
        fragments: Vec<String>,
    ) -> Result<Hit> {
        let text = |name: &str| -> Result<Option<String>> {
            Ok(stored
                .get_first(self.field(name)?)
                .and_then(|v| match OwnedValue::from(v) {
                    OwnedValue::Str(s) => Some(s),
                    _ => None,
                }))
        };
        let project = text(schema::PROJECT_NAME)?.unwrap_or_default();
        let number = stored
            .get_first(self.field(schema::BUILD_NUMBER)?)
            .and_then(|v| match OwnedValue::from(v) {
                OwnedValue::I64(n) => Some(n),
                _ => None,
            })
            .unwrap_or_default();
        let display = text(schema::PROJECT_DISPLAY_NAME)?.map(|job| {
            let build = text(schema::BUILD_DISPLAY_NAME)
                .ok()
                .flatten()
                .unwrap_or_else(|| format!("#{}", number));
            format!("{} {}", job, build)
        });
        Ok(Hit::new(
            id,
            project,
            number,
            display,
            text(schema::BALL_COLOR)?,
            fragments,
            candidate.score,
            candidate.start_time,
        ))
    }
}

/// Score descending, then start time descending.
fn rank(score_a: f32, start_a: i64, score_b: f32, start_b: i64) -> Ordering {
    score_b.total_cmp(&score_a).then(start_b.cmp(&start_a))
}

impl SearchEngine for LocalEngine {
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
        let tantivy_doc = self.to_tantivy(&doc, &record.job_name(), &view)?;
        let id_term = self.id_term(&doc.id)?;

        let previous = self.write(|writer, searcher| {
            let previous = self.load(searcher, &doc.id, &view)?;
            writer.delete_term(id_term);
            writer.add_document(tantivy_doc)?;
            Ok(previous)
        })?;
        tracing::debug!(
            "Stored build {} ({})",
            doc.id,
            if previous.is_some() { "replaced" } else { "new" }
        );
        Ok(previous)
    }

    fn remove(&self, id: &str) -> Result<Option<IndexedDocument>> {
        self.ensure_open()?;
        let view = self.schema_view();
        let id_term = self.id_term(id)?;
        self.write(|writer, searcher| {
            let previous = self.load(searcher, id, &view)?;
            if previous.is_some() {
                writer.delete_term(id_term);
            }
            Ok(previous)
        })
    }

    fn get(&self, id: &str) -> Result<Option<IndexedDocument>> {
        self.ensure_open()?;
        self.load(&self.reader.searcher(), id, &self.schema_view())
    }

    fn query(&self, query: &str, highlight: bool, after: Option<&HitCursor>) -> Result<Vec<Hit>> {
        self.ensure_open()?;
        let view = self.schema_view();
        let searcher = self.reader.searcher();
        let compiler = QueryCompiler::new(&self.index, &view);

        let built = QueryBuilder::build(query, |filter| {
            let q = compiler.compile(filter)?;
            Ok(searcher.search(&*q, &Count)? > 0)
        });
        let built = match built {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!("Query '{}' rejected: {}", query, e);
                return Ok(Vec::new());
            }
        };
        let compiled = match compiler.compile(&built.query) {
            Ok(q) => q,
            Err(e) => {
                tracing::debug!("Query '{}' did not compile: {}", query, e);
                return Ok(Vec::new());
            }
        };

        let candidates = self.candidates(&searcher, &*compiled)?;

        let (skip, tied) = match after {
            Some(c) => {
                let skip = candidates
                    .iter()
                    .take_while(|x| rank(x.score, x.start_time, c.score, c.start_time) == Ordering::Less)
                    .count();
                let tied = candidates[skip..]
                    .iter()
                    .take_while(|x| rank(x.score, x.start_time, c.score, c.start_time) == Ordering::Equal)
                    .count();
                (skip, tied)
            }
            None => (0, 0),
        };
        let rest = &candidates[skip..];
        let mut end = (tied + MAX_HITS_PER_PAGE).min(rest.len());
        while end > 0
            && end < rest.len()
            && rank(rest[end - 1].score, rest[end - 1].start_time, rest[end].score, rest[end].start_time)
                == Ordering::Equal
        {
            end += 1;
        }

        let id_field = self.field(schema::ID)?;
        let mut page = Vec::with_capacity(end);
        for candidate in &rest[..end] {
            let stored: TantivyDocument = searcher.doc(candidate.addr)?;
            let id = stored
                .get_first(id_field)
                .and_then(|v| match OwnedValue::from(v) {
                    OwnedValue::Str(s) => Some(s),
                    _ => None,
                })
                .unwrap_or_default();
            page.push((*candidate, id, stored));
        }
        page.sort_by(|a, b| {
            rank(a.0.score, a.0.start_time, b.0.score, b.0.start_time).then_with(|| a.1.cmp(&b.1))
        });
        if let Some(c) = after {
            page.retain(|(x, id, _)| {
                rank(x.score, x.start_time, c.score, c.start_time) != Ordering::Equal || *id > c.id
            });
        }
        page.truncate(MAX_HITS_PER_PAGE);

        let (terms, mut analyzer) = if highlight {
            let terms = compiler.highlight_tokens(&built.highlight_texts())?;
            let analyzer = self.index.tokenizer_for_field(self.field(schema::CONSOLE)?)?;
            (terms, Some(analyzer))
        } else {
            (Default::default(), None)
        };
        let console = self.field(schema::CONSOLE)?;

        let mut hits = Vec::with_capacity(page.len());
        for (candidate, id, stored) in page {
            let fragments = match analyzer.as_mut() {
                Some(analyzer) => match stored.get_first(console).map(OwnedValue::from) {
                    Some(OwnedValue::Str(text)) => {
                        let spans = Highlighter::matching_spans(analyzer, &text, &terms);
                        self.highlighter.best_fragments(&text, &spans)
                    }
                    _ => Vec::new(),
                },
                None => Vec::new(),
            };
            hits.push(self.build_hit(&candidate, id, &stored, fragments)?);
        }
        tracing::debug!("Query '{}' returned {} hits", query, hits.len());
        Ok(hits)
    }

    fn count(&self, query: &str) -> Result<usize> {
        self.ensure_open()?;
        let view = self.schema_view();
        let compiler = QueryCompiler::new(&self.index, &view);
        let compiled = match QueryBuilder::parse(query).and_then(|node| compiler.compile(&node)) {
            Ok(q) => q,
            Err(e) => {
                tracing::debug!("Count query '{}' rejected: {}", query, e);
                return Ok(0);
            }
        };
        Ok(self.reader.searcher().search(&*compiled, &Count)?)
    }

    fn job_names(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let collector = DistinctCollector::new(self.field(schema::PROJECT_NAME)?);
        Ok(self.reader.searcher().search(&AllQuery, &collector)?.into_vec())
    }

    fn delete_job(&self, job: &str) -> Result<()> {
        self.ensure_open()?;
        let term = Term::from_field_text(self.field(schema::JOB_KEY)?, job);
        self.write(|writer, _| {
            writer.delete_term(term);
            Ok(())
        })?;
        tracing::info!("Deleted all documents of job {}", job);
        Ok(())
    }

    fn clean_deleted_builds(&self, job: &str, first_build: i64, progress: &Progress) -> Result<()> {
        self.ensure_open()?;
        let job_query: Box<dyn Query> = Box::new(TermQuery::new(
            Term::from_field_text(self.field(schema::JOB_KEY)?, job),
            IndexRecordOption::Basic,
        ));
        let older = QueryParser::for_index(&self.index, vec![])
            .parse_query(&format!("{}:{{* TO {}}}", schema::BUILD_NUMBER, first_build))
            .map_err(|e| BuildSearchError::InvalidQuery(e.to_string()))?;
        let stale: Box<dyn Query> = Box::new(BooleanQuery::new(vec![
            (Occur::Must, job_query.box_clone()),
            (Occur::Must, older),
        ]));

        let searcher = self.reader.searcher();
        let total = searcher.search(&*job_query, &Count)?;
        progress.set_max(total as u64);
        let removed = searcher.search(&*stale, &Count)?;
        if removed > 0 {
            self.write(|writer, _| {
                writer.delete_query(stale)?;
                Ok(())
            })?;
        }
        progress.set_current(total as u64);
        tracing::info!(
            "Removed {} of {} documents of job {} older than build {}",
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
        let mut collector = if info.extension {
            if !info.persist {
                return Ok(Vec::new());
            }
            DistinctCollector::new(self.field(schema::EXT_STORED)?).json_key(field)
        } else {
            DistinctCollector::new(self.field(field)?)
        };
        if let Some(n) = max_length {
            collector = collector.with_max_length(n)?;
        }
        Ok(self.reader.searcher().search(&AllQuery, &collector)?.into_vec())
    }

    fn close(&self) {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        if let Some(writer) = self.lock_writer().take() {
            if let Err(e) = writer.wait_merging_threads() {
                tracing::warn!("Error while closing index writer: {}", e);
            }
        }
        tracing::info!("Closed local index {:?}", self.config);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.close();
    }
}
