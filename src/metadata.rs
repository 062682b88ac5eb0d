//! `meta.json`: `{index_up_to_date: bool, reclaimable_space: i64}` (§3, §6).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Metadata {
    pub index_up_to_date: bool,
    pub reclaimable_space: i64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self { index_up_to_date: false, reclaimable_space: 0 }
    }
}

const FILE_NAME: &str = "meta.json";

impl Metadata {
    /// Loads `meta.json` from `dir`, or the default if absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| Error::BadMetadata(e.to_string()))
    }

    /// Writes `meta.json` to `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(FILE_NAME);
        let data = serde_json::to_vec_pretty(self).map_err(|e| Error::BadMetadata(e.to_string()))?;
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_when_absent() {
        let dir = tempdir().unwrap();
        let meta = Metadata::load(dir.path()).unwrap();
        assert!(!meta.index_up_to_date);
        assert_eq!(meta.reclaimable_space, 0);
    }

    #[test]
    fn round_trip() {
        let dir = tempdir().unwrap();
        let meta = Metadata { index_up_to_date: true, reclaimable_space: 42 };
        meta.save(dir.path()).unwrap();
        let loaded = Metadata::load(dir.path()).unwrap();
        assert!(loaded.index_up_to_date);
        assert_eq!(loaded.reclaimable_space, 42);
    }
}
