use crate::error::{BuildSearchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tantivy::collector::{Collector, SegmentCollector};
use tantivy::schema::{Field, OwnedValue};
use tantivy::store::StoreReader;
use tantivy::{DocId, Score, SegmentOrdinal, SegmentReader, TantivyDocument};

/// Set of distinct values, optionally ellipsized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistinctValues {
    max_length: Option<usize>,
    values: BTreeSet<String>,
}

impl DistinctValues {
    pub const MIN_LENGTH: usize = 4;

    pub fn new(max_length: Option<usize>) -> Result<Self> {
        if let Some(n) = max_length {
            if n < Self::MIN_LENGTH {
                return Err(BuildSearchError::InvalidQuery(format!(
                    "Length must be at least {}",
                    Self::MIN_LENGTH
                )));
            }
        }
        Ok(DistinctValues {
            max_length,
            values: BTreeSet::new(),
        })
    }

    pub fn add(&mut self, value: &str) {
        let value = match self.max_length {
            Some(max) if value.chars().count() > max => {
                let mut cut: String = value.chars().take(max - 3).collect();
                cut.push_str("...");
                cut
            }
            _ => value.to_string(),
        };
        self.values.insert(value);
    }

    pub fn merge(&mut self, other: DistinctValues) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.values.into_iter().collect()
    }
}

/// Collects the distinct stored values of one text field over every matching
/// document.
pub struct DistinctCollector {
    field: Field,
    json_key: Option<String>,
    template: DistinctValues,
}

impl DistinctCollector {
    pub fn new(field: Field) -> Self {
        DistinctCollector {
            field,
            json_key: None,
            template: DistinctValues::default(),
        }
    }

    /// Values longer than `max_length` characters are cut and end in `...`.
    pub fn length_limited(field: Field, max_length: usize) -> Result<Self> {
        DistinctCollector::new(field).with_max_length(max_length)
    }

    pub fn with_max_length(mut self, max_length: usize) -> Result<Self> {
        self.template = DistinctValues::new(Some(max_length))?;
        Ok(self)
    }

    /// Read the value under `key` of a stored JSON object field instead.
    pub fn json_key(mut self, key: impl Into<String>) -> Self {
        self.json_key = Some(key.into());
        self
    }
}

pub struct DistinctSegmentCollector {
    field: Field,
    json_key: Option<String>,
    store: StoreReader,
    values: DistinctValues,
}

impl Collector for DistinctCollector {
    type Fruit = DistinctValues;
    type Child = DistinctSegmentCollector;

    fn for_segment(
        &self,
        _segment_local_id: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        Ok(DistinctSegmentCollector {
            field: self.field,
            json_key: self.json_key.clone(),
            store: segment.get_store_reader(1)?,
            values: self.template.clone(),
        })
    }

    fn requires_scoring(&self) -> bool {
        false
    }

    fn merge_fruits(&self, segment_fruits: Vec<DistinctValues>) -> tantivy::Result<DistinctValues> {
        let mut merged = self.template.clone();
        for fruit in segment_fruits {
            merged.merge(fruit);
        }
        Ok(merged)
    }
}

impl SegmentCollector for DistinctSegmentCollector {
    type Fruit = DistinctValues;

    fn collect(&mut self, doc: DocId, _score: Score) {
        match self.store.get::<TantivyDocument>(doc) {
            Ok(stored) => {
                let Some(value) = stored.get_first(self.field) else {
                    return;
                };
                let owned: OwnedValue = value.into();
                match (owned, &self.json_key) {
                    (OwnedValue::Str(s), None) => self.values.add(&s),
                    (OwnedValue::Object(pairs), Some(key)) => {
                        for (k, v) in pairs {
                            if let (true, OwnedValue::Str(s)) = (&k == key, v) {
                                self.values.add(&s);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Err(e) => tracing::warn!("Failed to read stored document {}: {}", doc, e),
        }
    }

    fn harvest(self) -> DistinctValues {
        self.values
    }
}

/// Distinct values of one field, offered as search help.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFieldDefinition {
    pub field_name: String,
    pub case_sensitive: bool,
    pub values: Vec<String>,
}

impl SearchFieldDefinition {
    pub fn new(field_name: impl Into<String>, case_sensitive: bool, values: Vec<String>) -> Self {
        SearchFieldDefinition {
            field_name: field_name.into(),
            case_sensitive,
            values,
        }
    }

    /// The first `n` values, comma separated.
    pub fn examples(&self, n: usize) -> Result<String> {
        if n < 1 {
            return Err(BuildSearchError::InvalidQuery(
                "Cannot use so low number of examples".to_string(),
            ));
        }
        Ok(self
            .values
            .iter()
            .take(n)
            .cloned()
            .collect::<Vec<_>>()
            .join(", "))
    }
}
