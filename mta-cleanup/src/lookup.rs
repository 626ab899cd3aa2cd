//! The capability trait for address-mapping backends (spec §9: "the mapping
//! pipeline and alias backend are open sets of lookup providers ... express
//! as a capability trait"). `FileTable` is the one concrete backend this
//! crate ships, grounded in Postfix's colon/equals-separated text tables
//! (`cleanup_map1n.c`/`cleanup_map11.c`); anything fancier (a real database,
//! a network directory) is out of scope per spec §1 and plugs in by
//! implementing this trait.

use std::{collections::HashMap, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("lookup table ‘{0}’ is unavailable")]
    Unavailable(String),
    #[error("I/O error reading lookup table ‘{0}’")]
    Io(String, #[source] std::io::Error),
}

/// Result of one table probe. `Found` may carry more than one value when
/// the backend matched multiple entries (eg. a regexp table with several
/// hits); spec §4.3.1 calls this a "multi-valued result".
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupOutcome {
    NotFound,
    Found(Vec<String>),
}

/// One lookup-table backend in the ordered chain spec §4.3.1/§4.3.2 iterate
/// over.
pub trait LookupTable: Send + Sync {
    fn name(&self) -> &str;

    /// Whether keys should be case-folded before probing this table. Most
    /// text tables are case-insensitive (`DICT_FLAG_FIXED`-style), but a
    /// case-sensitive backend can override this.
    fn case_fold(&self) -> bool {
        true
    }

    fn lookup(&self, key: &str) -> Result<LookupOutcome, LookupError>;
}

/// A simple in-memory table loaded from a `key: value` (or `key=value`)
/// text file, reloaded on change. This is the "one concrete backend...
/// grounded in Postfix's `cleanup_map1n.c`/`cleanup_map11.c`" default.
pub struct FileTable {
    name: String,
    entries: HashMap<String, Vec<String>>,
}

impl FileTable {
    pub fn load(name: impl Into<String>, path: &Path) -> Result<FileTable, LookupError> {
        let name = name.into();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LookupError::Io(name.clone(), e))?;
        Ok(FileTable::parse(name, &text))
    }

    /// Parses table text directly, for tests and for in-process tables that
    /// don't live on disk.
    pub fn parse(name: impl Into<String>, text: &str) -> FileTable {
        let mut entries: HashMap<String, Vec<String>> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let sep = line.find(|c| c == ':' || c == '=');
            let Some(sep) = sep else { continue };
            let key = line[..sep].trim().to_ascii_lowercase();
            let value = line[sep + 1..].trim().to_owned();
            entries.entry(key).or_default().push(value);
        }
        FileTable {
            name: name.into(),
            entries,
        }
    }

    pub fn from_pairs(name: impl Into<String>, pairs: &[(&str, &str)]) -> FileTable {
        let mut entries: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in pairs {
            entries
                .entry(k.to_ascii_lowercase())
                .or_default()
                .push((*v).to_owned());
        }
        FileTable {
            name: name.into(),
            entries,
        }
    }

    /// Number of distinct keys loaded, reported by `newaliases` (spec §6).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LookupTable for FileTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, key: &str) -> Result<LookupOutcome, LookupError> {
        let key = key.to_ascii_lowercase();
        match self.entries.get(&key) {
            Some(values) => Ok(LookupOutcome::Found(values.clone())),
            None => Ok(LookupOutcome::NotFound),
        }
    }
}

/// A table that always reports unavailable, for exercising the recoverable
/// lookup-error path (spec §7: "table backend unavailable").
pub struct UnavailableTable(pub String);

impl LookupTable for UnavailableTable {
    fn name(&self) -> &str {
        &self.0
    }

    fn lookup(&self, _key: &str) -> Result<LookupOutcome, LookupError> {
        Err(LookupError::Unavailable(self.0.clone()))
    }
}
