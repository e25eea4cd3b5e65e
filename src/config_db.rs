use std::path::Path;

use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    redb_handle::RedbHandle,
};

/// Document manifest, keyed by document name; values are JSON
/// [`DocumentRecord`]s.
const DOCUMENTS: TableDefinition<&str, &str> =
    TableDefinition::new("documents");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

pub const SETTING_MODEL: &str = "model";
pub const SETTING_EMBEDDER: &str = "embedder";
pub const SETTING_PATCHES_PER_PAGE: &str = "patches_per_page";
pub const SETTING_DIMENSION: &str = "dimension";

/// What the last build stored for one source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub path: String,
    pub mtime: u64,
    pub page_count: u32,
}

/// Settings and the per-document build manifest.
pub struct ConfigDb {
    db: RedbHandle,
}

fn create_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(DOCUMENTS)?;
    txn.open_table(SETTINGS)?;
    Ok(())
}

impl ConfigDb {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: RedbHandle::create(path, create_tables)?,
        })
    }

    /// Open for reading settings and the manifest; setters fail.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Ok(Self {
            db: RedbHandle::open_read_only(path, create_tables)?,
        })
    }

    // -- Documents --

    pub fn set_document(
        &self,
        name: &str,
        record: &DocumentRecord,
    ) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert(name, json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_document(&self, name: &str) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        match table.get(name)? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn remove_document(&self, name: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.remove(name)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// All manifest entries, sorted by document name.
    pub fn list_documents(&self) -> Result<Vec<(String, DocumentRecord)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let record = serde_json::from_str(v.value())?;
            result.push((k.value().to_string(), record));
        }
        Ok(result)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// The `(patches_per_page, dimension)` every stored page was built with,
    /// if anything has been built.
    pub fn encoder_shape(&self) -> Result<Option<(usize, usize)>> {
        let parse = |key: &str| -> Result<Option<usize>> {
            self.get_setting(key)?
                .map(|v| {
                    v.parse().map_err(|_| {
                        Error::Config(format!("setting {key} is not a number"))
                    })
                })
                .transpose()
        };
        Ok(parse(SETTING_PATCHES_PER_PAGE)?.zip(parse(SETTING_DIMENSION)?))
    }

    /// Record the encoder shape on the first build; on later builds fail
    /// if it differs, since every page in one index must be comparable.
    pub fn check_encoder_shape(
        &self,
        patches_per_page: usize,
        dimension: usize,
    ) -> Result<()> {
        match self.encoder_shape()? {
            Some(stored) if stored == (patches_per_page, dimension) => Ok(()),
            Some((p, d)) => Err(Error::Embedding(format!(
                "index was built with {p} patches of {d} dimensions per page, \
                 but the encoder produces {patches_per_page}x{dimension}; \
                 rebuild into a fresh data directory"
            ))),
            None => {
                self.set_setting(
                    SETTING_PATCHES_PER_PAGE,
                    &patches_per_page.to_string(),
                )?;
                self.set_setting(SETTING_DIMENSION, &dimension.to_string())
            }
        }
    }
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb").finish_non_exhaustive()
    }
}
