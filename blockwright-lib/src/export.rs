use thiserror::Error;

const MAX_NAME_LEN: usize = 4096;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExportError {
    #[error("export name exceeds {MAX_NAME_LEN} bytes")]
    NameTooLong,
    #[error("default-export sentinel may appear only once, before any concrete entry")]
    DuplicateDefault,
}

/// A single advertised export, or the "use the server-side default
/// export name" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportEntry {
    Named { name: String, description: Option<String> },
    UseDefault,
}

/// Ordered sequence of export entries presented to a connecting client.
#[derive(Debug, Clone, Default)]
pub struct ExportsSet {
    entries: Vec<ExportEntry>,
    has_default: bool,
}

impl ExportsSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, description: Option<String>) -> Result<(), ExportError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(ExportError::NameTooLong);
        }
        self.entries.push(ExportEntry::Named { name, description });
        Ok(())
    }

    /// Appends a single default-sentinel entry. Rejected if the set
    /// already contains one or if any concrete entry precedes it.
    pub fn use_default(&mut self) -> Result<(), ExportError> {
        if self.has_default || !self.entries.is_empty() {
            return Err(ExportError::DuplicateDefault);
        }
        self.entries.push(ExportEntry::UseDefault);
        self.has_default = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExportEntry> {
        self.entries.iter()
    }

    /// Resolves the sentinel entry (if present) to `default_name`,
    /// as the dispatcher does via `backend.default_export` before the
    /// set is handed to the wire front-end.
    pub fn resolve_default(&mut self, default_name: &str) {
        for entry in &mut self.entries {
            if matches!(entry, ExportEntry::UseDefault) {
                *entry = ExportEntry::Named { name: default_name.to_string(), description: None };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_names() {
        let mut set = ExportsSet::new();
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(set.add(name, None).unwrap_err(), ExportError::NameTooLong);
    }

    #[test]
    fn default_sentinel_must_come_first_and_be_unique() {
        let mut set = ExportsSet::new();
        set.use_default().unwrap();
        assert_eq!(set.use_default().unwrap_err(), ExportError::DuplicateDefault);

        let mut set2 = ExportsSet::new();
        set2.add("a", None).unwrap();
        assert_eq!(set2.use_default().unwrap_err(), ExportError::DuplicateDefault);
    }

    #[test]
    fn resolve_default_rewrites_sentinel() {
        let mut set = ExportsSet::new();
        set.use_default().unwrap();
        set.resolve_default("primary");
        let entries: Vec<_> = set.iter().cloned().collect();
        assert_eq!(entries, vec![ExportEntry::Named { name: "primary".into(), description: None }]);
    }
}
