//! A redb file opened either for writing or as a shared read-only view.

use std::path::Path;

use redb::{
    Database,
    ReadOnlyDatabase,
    ReadTransaction,
    ReadableDatabase,
    WriteTransaction,
};

use crate::error::{Error, Result};

pub(crate) enum RedbHandle {
    Writable(Database),
    /// Many of these may share one file, across threads and processes.
    ReadOnly(ReadOnlyDatabase),
}

impl RedbHandle {
    /// Open or create the file for writing. `init` runs in one write
    /// transaction and creates the tables.
    pub(crate) fn create<F>(path: &Path, init: F) -> Result<Self>
    where
        F: Fn(&WriteTransaction) -> Result<()>,
    {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        init(&txn)?;
        txn.commit()?;
        Ok(Self::Writable(db))
    }

    /// Open without taking the writer lock. A missing file is first created
    /// with its tables so readers of a fresh data directory see it empty.
    pub(crate) fn open_read_only<F>(path: &Path, init: F) -> Result<Self>
    where
        F: Fn(&WriteTransaction) -> Result<()>,
    {
        if !path.exists() {
            drop(Self::create(path, init)?);
        }
        Ok(Self::ReadOnly(ReadOnlyDatabase::open(path)?))
    }

    pub(crate) fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(match self {
            Self::Writable(db) => db.begin_read()?,
            Self::ReadOnly(db) => db.begin_read()?,
        })
    }

    pub(crate) fn begin_write(&self) -> Result<WriteTransaction> {
        match self {
            Self::Writable(db) => Ok(db.begin_write()?),
            Self::ReadOnly(_) => {
                Err(Error::Config("database is open read-only".into()))
            }
        }
    }
}
