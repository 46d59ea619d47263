use crate::index::extension::{extract_isolated, ExtensionField};
use crate::index::schema;
use crate::types::{BuildRecord, FieldValue, IndexedDocument};
use std::sync::Arc;

/// Extract every static field and every extension field of `record`.
///
/// A failing extractor drops only its own field. The result carries values
/// for non-persisted fields too; engines decide what they keep retrievable.
pub fn extract_document(
    record: &dyn BuildRecord,
    extensions: &[Arc<dyn ExtensionField>],
) -> IndexedDocument {
    let mut doc = IndexedDocument::new(record.id());

    for field in schema::fields() {
        match field.extract(record) {
            Ok(Some(value)) => doc.insert(field.name, value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "Failed to extract field {} for build {}: {}",
                    field.name,
                    doc.id,
                    e
                );
            }
        }
    }

    for ext in extensions {
        let keyword = ext.keyword();
        if doc.fields.contains_key(keyword) {
            continue;
        }
        if let Some(text) = extract_isolated(ext.as_ref(), record) {
            doc.insert(keyword, FieldValue::Text(text));
        }
    }

    tracing::trace!("Extracted {} fields for build {}", doc.fields.len(), doc.id);
    doc
}
