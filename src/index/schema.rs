use crate::error::Result;
use crate::index::extension::ExtensionField;
use crate::types::{BuildRecord, FieldValue};
use indexmap::IndexMap;
use std::sync::Arc;
use tantivy::schema::{
    IndexRecordOption, JsonObjectOptions, NumericOptions, Schema as TantivySchema,
    TextFieldIndexing, TextOptions, FAST, INDEXED, STORED, STRING,
};

pub const ID: &str = "id";
pub const PROJECT_NAME: &str = "j";
pub const PROJECT_DISPLAY_NAME: &str = "pd";
pub const BUILD_NUMBER: &str = "n";
pub const BUILD_DISPLAY_NAME: &str = "d";
pub const BUILD_PARAMETER: &str = "p";
pub const RESULT: &str = "r";
pub const DURATION: &str = "duration";
pub const START_TIME: &str = "starttime";
pub const BUILT_ON: &str = "builton";
pub const START_CAUSE: &str = "cause";
pub const BALL_COLOR: &str = "color";
pub const CONSOLE: &str = "c";

/// Exact job name, used for job deletes and existence checks.
pub const JOB_KEY: &str = "_job";
/// Persisted extension values, keyed by extension keyword.
pub const EXT_STORED: &str = "_ext";
/// Extension values that are searchable but not retrievable.
pub const EXT_HIDDEN: &str = "_ext_hidden";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Untokenized, matched exactly.
    Keyword,
    /// Tokenized free text.
    Text,
    /// Signed 64-bit, range-query eligible.
    Long,
}

type Extractor = fn(&dyn BuildRecord) -> Result<Option<FieldValue>>;

/// One static schema attribute.
pub struct SchemaField {
    pub name: &'static str,
    pub kind: FieldKind,
    pub persist: bool,
    pub default_searchable: bool,
    extract: Extractor,
}

impl SchemaField {
    pub fn is_numeric(&self) -> bool {
        self.kind == FieldKind::Long
    }

    pub fn extract(&self, record: &dyn BuildRecord) -> Result<Option<FieldValue>> {
        (self.extract)(record)
    }
}

impl std::fmt::Debug for SchemaField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaField")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("persist", &self.persist)
            .field("default_searchable", &self.default_searchable)
            .finish()
    }
}

fn text(value: String) -> Option<FieldValue> {
    if value.is_empty() {
        None
    } else {
        Some(FieldValue::Text(value))
    }
}

fn joined(values: Vec<String>) -> Option<FieldValue> {
    text(
        values
            .into_iter()
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

static FIELDS: [SchemaField; 13] = [
    SchemaField {
        name: ID,
        kind: FieldKind::Keyword,
        persist: true,
        default_searchable: false,
        extract: |r| Ok(text(r.id())),
    },
    SchemaField {
        name: PROJECT_NAME,
        kind: FieldKind::Text,
        persist: true,
        default_searchable: true,
        extract: |r| Ok(text(r.job_name())),
    },
    SchemaField {
        name: PROJECT_DISPLAY_NAME,
        kind: FieldKind::Text,
        persist: true,
        default_searchable: true,
        extract: |r| Ok(text(r.job_display_name())),
    },
    SchemaField {
        name: BUILD_NUMBER,
        kind: FieldKind::Long,
        persist: true,
        default_searchable: false,
        extract: |r| Ok(Some(FieldValue::Long(r.number()))),
    },
    SchemaField {
        name: BUILD_DISPLAY_NAME,
        kind: FieldKind::Text,
        persist: true,
        default_searchable: true,
        extract: |r| Ok(text(r.display_name())),
    },
    SchemaField {
        name: BUILD_PARAMETER,
        kind: FieldKind::Text,
        persist: true,
        default_searchable: true,
        extract: |r| Ok(joined(r.parameters())),
    },
    SchemaField {
        name: RESULT,
        kind: FieldKind::Text,
        persist: true,
        default_searchable: true,
        extract: |r| Ok(r.result().and_then(text)),
    },
    SchemaField {
        name: DURATION,
        kind: FieldKind::Long,
        persist: false,
        default_searchable: false,
        extract: |r| Ok(Some(FieldValue::Long(r.duration_millis()))),
    },
    SchemaField {
        name: START_TIME,
        kind: FieldKind::Long,
        persist: true,
        default_searchable: false,
        extract: |r| Ok(Some(FieldValue::Long(r.start_time_millis()))),
    },
    SchemaField {
        name: BUILT_ON,
        kind: FieldKind::Text,
        persist: false,
        default_searchable: true,
        extract: |r| Ok(r.built_on().and_then(text)),
    },
    SchemaField {
        name: START_CAUSE,
        kind: FieldKind::Text,
        persist: false,
        default_searchable: true,
        extract: |r| Ok(joined(r.causes())),
    },
    SchemaField {
        name: BALL_COLOR,
        kind: FieldKind::Keyword,
        persist: true,
        default_searchable: false,
        extract: |r| Ok(r.status_color().and_then(text)),
    },
    SchemaField {
        name: CONSOLE,
        kind: FieldKind::Text,
        persist: true,
        default_searchable: true,
        extract: |r| r.console_text().map(text),
    },
];

/// All static fields, in declaration order.
pub fn fields() -> &'static [SchemaField] {
    &FIELDS
}

pub fn field(name: &str) -> Option<&'static SchemaField> {
    FIELDS.iter().find(|f| f.name == name)
}

/// Lookup result covering both static and extension fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub kind: FieldKind,
    pub persist: bool,
    pub default_searchable: bool,
    pub extension: bool,
}

impl FieldInfo {
    pub fn is_numeric(&self) -> bool {
        self.kind == FieldKind::Long
    }
}

/// The schema as seen by one store or query call: static fields plus the
/// extension fields registered at the time the view was taken.
#[derive(Debug, Clone)]
pub struct SchemaView {
    fields: IndexMap<String, FieldInfo>,
}

impl SchemaView {
    pub fn new(extensions: &[Arc<dyn ExtensionField>]) -> Self {
        let mut map = IndexMap::new();
        for f in fields() {
            map.insert(
                f.name.to_string(),
                FieldInfo {
                    name: f.name.to_string(),
                    kind: f.kind,
                    persist: f.persist,
                    default_searchable: f.default_searchable,
                    extension: false,
                },
            );
        }
        for ext in extensions {
            let keyword = ext.keyword().to_string();
            if map.contains_key(&keyword) {
                continue;
            }
            map.insert(
                keyword.clone(),
                FieldInfo {
                    name: keyword,
                    kind: FieldKind::Text,
                    persist: ext.is_persist(),
                    default_searchable: ext.is_default_searchable(),
                    extension: true,
                },
            );
        }
        SchemaView { fields: map }
    }

    pub fn static_only() -> Self {
        Self::new(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.values()
    }

    pub fn lookup(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.get(name)
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        self.lookup(name).map(FieldInfo::is_numeric).unwrap_or(false)
    }

    /// Fields an unqualified term fans out to.
    pub fn default_searchable(&self) -> Vec<&str> {
        self.fields
            .values()
            .filter(|f| f.default_searchable)
            .map(|f| f.name.as_str())
            .collect()
    }
}

/// Tantivy schema for the embedded engine.
///
/// Static fields map one-to-one onto tantivy fields. Extension fields share two
/// JSON object fields so the on-disk schema never changes when contributors
/// come and go.
pub fn build_tantivy_schema() -> TantivySchema {
    let mut builder = TantivySchema::builder();

    let text_indexing = TextFieldIndexing::default()
        .set_tokenizer("default")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);

    for f in fields() {
        match f.kind {
            FieldKind::Keyword => {
                if f.persist {
                    builder.add_text_field(f.name, STRING | STORED | FAST);
                } else {
                    builder.add_text_field(f.name, STRING);
                }
            }
            FieldKind::Text => {
                let mut opts = TextOptions::default().set_indexing_options(text_indexing.clone());
                if f.persist {
                    opts = opts.set_stored();
                }
                builder.add_text_field(f.name, opts);
            }
            FieldKind::Long => {
                let opts: NumericOptions = if f.persist {
                    (INDEXED | STORED | FAST).into()
                } else {
                    (INDEXED | FAST).into()
                };
                builder.add_i64_field(f.name, opts);
            }
        }
    }

    builder.add_text_field(JOB_KEY, STRING | FAST);

    let ext_stored = JsonObjectOptions::default()
        .set_stored()
        .set_indexing_options(text_indexing.clone());
    builder.add_json_field(EXT_STORED, ext_stored);

    let ext_hidden = JsonObjectOptions::default().set_indexing_options(text_indexing);
    builder.add_json_field(EXT_HIDDEN, ext_hidden);

    builder.build()
}
