use crate::error::{panic_message, BuildSearchError, Result};
use crate::index::schema;
use crate::types::BuildRecord;
use indexmap::IndexMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// A field contributed at runtime by a plugin-style collaborator.
///
/// `text_result` may fail or even panic; callers go through [`extract_isolated`]
/// so a broken contributor only loses its own field.
pub trait ExtensionField: Send + Sync {
    fn keyword(&self) -> &str;

    fn is_persist(&self) -> bool {
        false
    }

    fn is_default_searchable(&self) -> bool {
        true
    }

    fn text_result(&self, record: &dyn BuildRecord) -> Result<Option<String>>;
}

/// Registered extension fields. Callers take a [`snapshot`](Self::snapshot)
/// once per store or query so the field set is stable for that call.
#[derive(Default)]
pub struct ExtensionRegistry {
    fields: RwLock<IndexMap<String, Arc<dyn ExtensionField>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, field: Arc<dyn ExtensionField>) -> Result<()> {
        let keyword = field.keyword().to_string();
        validate_keyword(&keyword)?;
        let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
        if fields.insert(keyword.clone(), field).is_some() {
            tracing::debug!("Replaced extension field {}", keyword);
        }
        Ok(())
    }

    pub fn unregister(&self, keyword: &str) -> bool {
        let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
        fields.shift_remove(keyword).is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ExtensionField>> {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        fields.values().cloned().collect()
    }

    pub fn keywords(&self) -> Vec<String> {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        fields.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.fields.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_keyword(keyword: &str) -> Result<()> {
    if keyword.is_empty() {
        return Err(BuildSearchError::Config(
            "extension keyword must not be empty".to_string(),
        ));
    }
    if keyword.starts_with('_') {
        return Err(BuildSearchError::Config(format!(
            "extension keyword '{}' must not start with '_'",
            keyword
        )));
    }
    if !keyword
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(BuildSearchError::Config(format!(
            "extension keyword '{}' may only contain letters, digits and '_'",
            keyword
        )));
    }
    if schema::field(keyword).is_some() {
        return Err(BuildSearchError::Config(format!(
            "extension keyword '{}' collides with a built-in field",
            keyword
        )));
    }
    Ok(())
}

/// Call one contributor, turning errors and panics into "no value".
pub fn extract_isolated(field: &dyn ExtensionField, record: &dyn BuildRecord) -> Option<String> {
    let keyword = field.keyword();
    match catch_unwind(AssertUnwindSafe(|| field.text_result(record))) {
        Ok(Ok(Some(text))) if !text.is_empty() => Some(text),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            tracing::warn!(
                "Extension field {} failed for build {}: {}",
                keyword,
                record.id(),
                e
            );
            None
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!(
                "Extension field {} panicked for build {}: {}",
                keyword,
                record.id(),
                message
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BuildRecordData;

    struct Fixed(&'static str, &'static str);

    impl ExtensionField for Fixed {
        fn keyword(&self) -> &str {
            self.0
        }
        fn text_result(&self, _record: &dyn BuildRecord) -> Result<Option<String>> {
            Ok(Some(self.1.to_string()))
        }
    }

    struct Failing;

    impl ExtensionField for Failing {
        fn keyword(&self) -> &str {
            "failing"
        }
        fn text_result(&self, _record: &dyn BuildRecord) -> Result<Option<String>> {
            Err(BuildSearchError::Extension {
                keyword: "failing".into(),
                message: "boom".into(),
            })
        }
    }

    struct Panicking;

    impl ExtensionField for Panicking {
        fn keyword(&self) -> &str {
            "panicking"
        }
        fn text_result(&self, _record: &dyn BuildRecord) -> Result<Option<String>> {
            panic!("contributor bug")
        }
    }

    #[test]
    fn test_register_and_snapshot_order() {
        let reg = ExtensionRegistry::new();
        reg.register(Arc::new(Fixed("junit", "x"))).unwrap();
        reg.register(Arc::new(Fixed("artifacts", "y"))).unwrap();
        assert_eq!(reg.keywords(), vec!["junit", "artifacts"]);
        assert_eq!(reg.snapshot().len(), 2);
        assert!(reg.unregister("junit"));
        assert!(!reg.unregister("junit"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_rejects_builtin_and_bad_keywords() {
        let reg = ExtensionRegistry::new();
        assert!(reg.register(Arc::new(Fixed("c", "x"))).is_err());
        assert!(reg.register(Arc::new(Fixed("_ext", "x"))).is_err());
        assert!(reg.register(Arc::new(Fixed("a.b", "x"))).is_err());
        assert!(reg.register(Arc::new(Fixed("", "x"))).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_extract_isolated() {
        let rec = BuildRecordData::new("app", 1, "");
        assert_eq!(extract_isolated(&Fixed("k", "v"), &rec), Some("v".to_string()));
        assert_eq!(extract_isolated(&Fixed("k", ""), &rec), None);
        assert_eq!(extract_isolated(&Failing, &rec), None);
        assert_eq!(extract_isolated(&Panicking, &rec), None);
    }
}
