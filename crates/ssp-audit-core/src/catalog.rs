use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::assess::SecurityControl;

/// External control catalog: identifier → description, in file order.
///
/// Source format is a JSON array of single-key objects,
/// `[{"ISM-0421": {"Description": "..."}}, ...]`.
#[derive(Debug, Clone, Default)]
pub struct ControlCatalog {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "Description", default)]
    description: String,
}

/// Failure to read or parse the catalog source.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read control catalog at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("control catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ControlCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&raw)?;
        debug!(controls = catalog.len(), path = %path.display(), "control catalog loaded");
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let rows: Vec<HashMap<String, CatalogEntry>> = serde_json::from_str(raw)?;
        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for row in rows {
            for (id, entry) in row {
                index.entry(id.clone()).or_insert(entries.len());
                entries.push((id, entry.description));
            }
        }
        Ok(Self { entries, index })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup-by-identifier, the only operation the engine requires.
    pub fn get_description(&self, id: &str) -> Option<&str> {
        self.index
            .get(id)
            .map(|&pos| self.entries[pos].1.as_str())
    }

    /// Resolve an identifier into a full control. The identifier doubles as
    /// the title; the catalog carries none.
    pub fn control(&self, id: &str) -> Option<SecurityControl> {
        self.get_description(id)
            .map(|description| SecurityControl::new(id, id, description))
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn controls(&self) -> Vec<SecurityControl> {
        self.entries
            .iter()
            .map(|(id, description)| SecurityControl::new(id, id, description))
            .collect()
    }
}
