use std::path::Path;

use redb::{ReadableTable, TableDefinition, WriteTransaction};

use crate::{binary::BinaryPatches, error::Result, redb_handle::RedbHandle};

const PATCHES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("binary_patches");

/// Header size: 4 bytes patch count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// Stores sign-quantized page embeddings keyed by numeric page id.
///
/// Binary format per entry:
/// - 4 bytes: patch count P (u32 LE)
/// - 4 bytes: original dimension D in bits (u32 LE)
/// - P * ceil(D / 8) bytes: packed patches, row-major, MSB-first bits
pub struct EmbeddingDb {
    db: RedbHandle,
}

fn create_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(PATCHES)?;
    Ok(())
}

impl EmbeddingDb {
    /// Open or create a patch database at the given path for writing.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use pgxrag::EmbeddingDb;
    ///
    /// let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
    /// assert_eq!(db.batch_load(&[1]).unwrap(), vec![(1, None)]);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: RedbHandle::create(path, create_tables)?,
        })
    }

    /// Open for lookups only. Any number of read-only handles can share the
    /// file with each other; writes through one fail.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Ok(Self {
            db: RedbHandle::open_read_only(path, create_tables)?,
        })
    }

    /// Store multiple pages in a single transaction, replacing previous
    /// entries.
    ///
    /// Uses `insert_reserve` to write straight into the table page.
    pub fn batch_store(&self, entries: &[(u64, &BinaryPatches)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PATCHES)?;
            for (page_id, patches) in entries {
                let bytes = patches.as_bytes();
                let mut guard =
                    table.insert_reserve(*page_id, HEADER_SIZE + bytes.len())?;
                let dest = guard.as_mut();

                dest[0..4].copy_from_slice(&patches.num_patches().to_le_bytes());
                dest[4..8].copy_from_slice(&patches.dimension().to_le_bytes());
                dest[HEADER_SIZE..].copy_from_slice(bytes);
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Load multiple pages in a single read transaction, preserving input
    /// order. Missing or malformed entries come back as `None`.
    pub fn batch_load(
        &self,
        page_ids: &[u64],
    ) -> Result<Vec<(u64, Option<BinaryPatches>)>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(PATCHES)?;

        let mut results = Vec::with_capacity(page_ids.len());
        for &page_id in page_ids {
            let patches = table.get(page_id)?.and_then(|g| decode(g.value()));
            results.push((page_id, patches));
        }
        Ok(results)
    }

    /// Remove multiple pages in a single transaction.
    pub fn batch_remove(&self, page_ids: &[u64]) -> Result<()> {
        if page_ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PATCHES)?;
            for &page_id in page_ids {
                table.remove(page_id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Option<BinaryPatches> {
    let num_patches = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    let dimension = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
    BinaryPatches::from_packed(
        num_patches,
        dimension,
        bytes[HEADER_SIZE..].to_vec(),
    )
    .ok()
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, EmbeddingDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
        (tmp, db)
    }

    fn patches(num: u32, fill: u8) -> BinaryPatches {
        // 16-bit patches: 2 bytes each.
        BinaryPatches::from_packed(num, 16, vec![fill; num as usize * 2])
            .unwrap()
    }

    fn load(db: &EmbeddingDb, id: u64) -> Option<BinaryPatches> {
        db.batch_load(&[id]).unwrap().pop().and_then(|(_, p)| p)
    }

    #[test]
    fn store_and_load() {
        let (_tmp, db) = test_db();
        let p = BinaryPatches::from_packed(2, 16, vec![0xF0, 0x0F, 0xAA, 0x55])
            .unwrap();
        db.batch_store(&[(42, &p)]).unwrap();

        let loaded = load(&db, 42).unwrap();
        assert_eq!(loaded, p);
        assert_eq!(loaded.patch(1), &[0xAA, 0x55]);
    }

    #[test]
    fn overwrite_entry() {
        let (_tmp, db) = test_db();
        db.batch_store(&[(42, &patches(1, 0x00))]).unwrap();
        db.batch_store(&[(42, &patches(3, 0xFF))]).unwrap();

        let loaded = load(&db, 42).unwrap();
        assert_eq!(loaded.num_patches(), 3);
        assert!(loaded.as_bytes().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn batch_roundtrip_preserves_order() {
        let (_tmp, db) = test_db();
        let (a, b) = (patches(1, 1), patches(1, 2));
        db.batch_store(&[(10, &a), (20, &b)]).unwrap();

        let results = db.batch_load(&[20, 99, 10]).unwrap();
        assert_eq!(results[0], (20, Some(b)));
        assert_eq!(results[1], (99, None));
        assert_eq!(results[2], (10, Some(a)));

        db.batch_remove(&[10, 20]).unwrap();
        assert!(load(&db, 10).is_none());
        assert!(load(&db, 20).is_none());
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");

        {
            let db = EmbeddingDb::open(&path).unwrap();
            db.batch_store(&[(7, &patches(2, 0x81))]).unwrap();
        }

        let db = EmbeddingDb::open(&path).unwrap();
        assert_eq!(load(&db, 7), Some(patches(2, 0x81)));
    }

    #[test]
    fn read_only_handles_share_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");
        {
            let db = EmbeddingDb::open(&path).unwrap();
            db.batch_store(&[(7, &patches(1, 0x81))]).unwrap();
        }

        let first = EmbeddingDb::open_read_only(&path).unwrap();
        let second = EmbeddingDb::open_read_only(&path).unwrap();
        assert_eq!(load(&first, 7), Some(patches(1, 0x81)));
        assert_eq!(load(&second, 7), Some(patches(1, 0x81)));
        assert!(first.batch_store(&[(8, &patches(1, 0))]).is_err());
    }

    #[test]
    fn read_only_open_of_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let db =
            EmbeddingDb::open_read_only(&tmp.path().join("fresh.redb")).unwrap();
        assert_eq!(load(&db, 1), None);
    }
}
