use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "PGXRAG_DATA_DIR";

const APP_NAME: &str = "pgxrag";
const CONFIG_FILE: &str = "config.redb";
const EMBEDDINGS_FILE: &str = "embeddings.redb";
const LEXICAL_DIR: &str = "tantivy";

/// Where the local index lives: two redb files and a tantivy directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf> {
    match std::fs::create_dir_all(&path) {
        Ok(()) => Ok(path),
        Err(_) => Err(Error::DataDir(path)),
    }
}

fn xdg_data_home() -> Result<PathBuf> {
    xdg::BaseDirectories::with_prefix(APP_NAME)
        .get_data_home()
        .ok_or_else(|| Error::Config("no XDG data home for pgxrag".into()))
}

impl DataDir {
    /// `--data-dir` wins, then `PGXRAG_DATA_DIR`, then
    /// `$XDG_DATA_HOME/pgxrag`. The directory is created if missing.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(DATA_DIR_ENV_VAR).map(PathBuf::from);
        let root = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => path,
            None => xdg_data_home()?,
        };
        Ok(Self {
            root: ensure_dir(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings and the per-document build manifest.
    pub fn config_db(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Packed binary patch embeddings, keyed by numeric page id.
    pub fn embeddings_db(&self) -> PathBuf {
        self.root.join(EMBEDDINGS_FILE)
    }

    pub fn tantivy_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.root.join(LEXICAL_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.config_db(), tmp.path().join("config.redb"));
        assert_eq!(dir.embeddings_db(), tmp.path().join("embeddings.redb"));
    }

    #[test]
    fn missing_directories_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("cpic").join("index");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());

        let lexical = dir.tantivy_dir().unwrap();
        assert!(lexical.is_dir());
        assert_eq!(lexical, nested.join("tantivy"));
    }

    #[test]
    fn unusable_root_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("occupied");
        std::fs::write(&file, b"").unwrap();

        let err = DataDir::resolve(Some(&file.join("sub"))).unwrap_err();
        assert!(matches!(err, Error::DataDir(_)));
    }
}
