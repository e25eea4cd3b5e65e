use sha2::{Digest, Sha256};

/// A stable page identifier derived from (document_name, page_number).
///
/// The hex form is the SHA-256 of `"{document_name}_{page_number}"`, so the
/// same page always maps to the same id across runs, machines and compiler
/// versions. Re-indexing a page therefore overwrites it instead of adding a
/// second copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId {
    /// Full lowercase hex digest; the unique `id` field of the index.
    pub hex: String,
    /// First 8 digest bytes, big-endian. Key of the embedding table.
    pub numeric: u64,
}

impl PageId {
    /// Generate the id of a page from its document name and 0-indexed page
    /// number.
    pub fn new(document_name: &str, page_number: u32) -> Self {
        let digest =
            Sha256::digest(format!("{document_name}_{page_number}").as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self {
            hex: hex::encode(digest),
            numeric: u64::from_be_bytes(prefix),
        }
    }

    /// Rebuild an id from its hex form, e.g. when reading hits back from an
    /// index store. Returns `None` for anything that is not a SHA-256 hex
    /// digest.
    pub fn from_hex(text: &str) -> Option<Self> {
        let digest: [u8; 32] = hex::decode(text).ok()?.try_into().ok()?;
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Some(Self {
            hex: hex::encode(digest),
            numeric: u64::from_be_bytes(prefix),
        })
    }

    /// The short hex prefix used for human display.
    pub fn short(&self) -> &str {
        &self.hex[..8]
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn deterministic() {
        let a = PageId::new("cpic_warfarin.pdf", 3);
        let b = PageId::new("cpic_warfarin.pdf", 3);
        assert_eq!(a, b);
    }

    #[test]
    fn numeric_is_hex_prefix() {
        let id = PageId::new("a.pdf", 0);
        assert_eq!(id.hex.len(), 64);
        assert_eq!(
            id.numeric,
            u64::from_str_radix(&id.hex[..16], 16).unwrap()
        );
    }

    #[test]
    fn different_pages_differ() {
        let a = PageId::new("cpic_warfarin.pdf", 0);
        let b = PageId::new("cpic_warfarin.pdf", 1);
        assert_ne!(a.hex, b.hex);
        assert_ne!(a.numeric, b.numeric);
    }

    #[test]
    fn hex_roundtrip() {
        let id = PageId::new("cpic_clopidogrel.pdf", 12);
        assert_eq!(PageId::from_hex(&id.hex), Some(id));
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(PageId::from_hex("abc").is_none());
        assert!(PageId::from_hex(&"z".repeat(64)).is_none());
        assert!(PageId::from_hex(&"ab".repeat(31)).is_none());
    }

    #[test]
    fn from_hex_normalizes_case() {
        let id = PageId::new("cpic_codeine.pdf", 2);
        let upper = id.hex.to_ascii_uppercase();
        assert_eq!(PageId::from_hex(&upper), Some(id));
    }

    #[test]
    fn hex_is_the_full_sha256_digest() {
        let id = PageId::new("a.pdf", 0);
        assert_eq!(id.hex, hex::encode(Sha256::digest(b"a.pdf_0")));
        let prefix = hex::decode(&id.hex[..16]).unwrap();
        assert_eq!(id.numeric.to_be_bytes().to_vec(), prefix);
    }

    #[test]
    fn display_has_hash_prefix() {
        let s = PageId::new("a.pdf", 0).to_string();
        assert!(s.starts_with('#'));
        assert_eq!(s.len(), 9);
    }

    proptest! {
        #[test]
        fn recomputing_yields_identical_id(name in ".{0,40}", page in 0u32..10_000) {
            prop_assert_eq!(PageId::new(&name, page), PageId::new(&name, page));
        }
    }
}
