//! Index schema and rank profiles shared by every index store.
//!
//! Field names here are used verbatim by the local tantivy index, the Vespa
//! feed/query protocol and the deployable `.sd` definition, so a page fed to
//! either backend answers the same queries.

use std::{fmt, str::FromStr};

use crate::{
    binary,
    error::{Error, Result},
};

pub const DEFAULT_SCHEMA_NAME: &str = "pdf_page";

/// Field names.
pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const PATH: &str = "path";
    pub const PAGE_NUMBER: &str = "page_number";
    pub const IMAGE: &str = "image";
    pub const TEXT: &str = "text";
    pub const EMBEDDING: &str = "embedding";
}

/// Query tensor input names.
pub const QUERY_TENSOR: &str = "qt";
pub const BINARY_QUERY_TENSOR: &str = "qtb";

/// Second-phase depth when the request does not override it.
pub const DEFAULT_RERANK_COUNT: usize = 100;

/// A named two-phase ranking.
///
/// Both profiles share the lexical first phase, `bm25(name) + bm25(text)`.
/// They differ in how the float query tokens meet the stored sign bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankProfile {
    /// `sum_q max_p dot(q, unpack_bits(p))`.
    #[default]
    Default,
    /// `sum_q max_p (1 - hamming(sign(q), p) / dim)`.
    Hamming,
}

impl RankProfile {
    pub const ALL: [RankProfile; 2] = [RankProfile::Default, RankProfile::Hamming];

    pub fn name(self) -> &'static str {
        match self {
            RankProfile::Default => "default",
            RankProfile::Hamming => "hamming",
        }
    }

    pub fn rerank_count(self) -> usize {
        DEFAULT_RERANK_COUNT
    }

    /// Whether the query tensor must be sign-quantized before sending.
    pub fn binary_query(self) -> bool {
        matches!(self, RankProfile::Hamming)
    }

    fn second_phase_expression(self, dimension: u32) -> String {
        match self {
            RankProfile::Default => format!(
                "sum(reduce(sum(query({QUERY_TENSOR}) * unpack_bits(attribute({emb})), v), max, patch), querytoken)",
                emb = fields::EMBEDDING,
            ),
            RankProfile::Hamming => format!(
                "sum(reduce(1 - sum(hamming(query({BINARY_QUERY_TENSOR}), attribute({emb})), v) / {dimension}, max, patch), querytoken)",
                emb = fields::EMBEDDING,
            ),
        }
    }
}

impl fmt::Display for RankProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RankProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RankProfile::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| Error::NotFound {
                kind: "rank profile",
                name: s.to_string(),
            })
    }
}

/// Render the Vespa schema definition for pages whose patches have
/// `dimension` float components before quantization.
pub fn render_vespa_schema(schema_name: &str, dimension: u32) -> String {
    let bytes = binary::bytes_per_patch(dimension);
    let mut sd = String::new();
    let mut line = |indent: usize, s: &str| {
        sd.push_str(&"    ".repeat(indent));
        sd.push_str(s);
        sd.push('\n');
    };

    line(0, &format!("schema {schema_name} {{"));
    line(1, &format!("document {schema_name} {{"));
    for (name, ty, body) in [
        (fields::ID, "string", "indexing: summary | index\n            match: word"),
        (fields::NAME, "string", "indexing: summary | index\n            index: enable-bm25"),
        (fields::PATH, "string", "indexing: summary | index\n            match: text\n            index: enable-bm25"),
        (fields::PAGE_NUMBER, "int", "indexing: summary | attribute"),
        (fields::IMAGE, "raw", "indexing: summary"),
        (fields::TEXT, "string", "indexing: index\n            match: text\n            index: enable-bm25"),
    ] {
        line(2, &format!("field {name} type {ty} {{"));
        line(3, body);
        line(2, "}");
    }
    line(
        2,
        &format!(
            "field {} type tensor<int8>(patch{{}}, v[{bytes}]) {{",
            fields::EMBEDDING
        ),
    );
    line(3, "indexing: attribute | index");
    line(3, "attribute {");
    line(4, "distance-metric: hamming");
    line(3, "}");
    line(3, "index {");
    line(4, "hnsw {");
    line(5, "max-links-per-node: 8");
    line(5, "neighbors-to-explore-at-insert: 100");
    line(4, "}");
    line(3, "}");
    line(2, "}");
    line(1, "}");
    line(
        1,
        &format!(
            "fieldset default {{ fields: {}, {} }}",
            fields::NAME,
            fields::TEXT
        ),
    );

    for profile in RankProfile::ALL {
        line(1, &format!("rank-profile {} {{", profile.name()));
        line(2, "inputs {");
        if profile.binary_query() {
            line(
                3,
                &format!(
                    "query({BINARY_QUERY_TENSOR}) tensor<int8>(querytoken{{}}, v[{bytes}])"
                ),
            );
        } else {
            line(
                3,
                &format!(
                    "query({QUERY_TENSOR}) tensor<float>(querytoken{{}}, v[{dimension}])"
                ),
            );
        }
        line(2, "}");
        line(2, "function max_sim() {");
        line(3, &format!("expression: {}", profile.second_phase_expression(dimension)));
        line(2, "}");
        line(2, "function bm25_score() {");
        line(
            3,
            &format!("expression: bm25({}) + bm25({})", fields::NAME, fields::TEXT),
        );
        line(2, "}");
        line(2, "first-phase {");
        line(3, "expression: bm25_score");
        line(2, "}");
        line(2, "second-phase {");
        line(3, &format!("rerank-count: {}", profile.rerank_count()));
        line(3, "expression: max_sim");
        line(2, "}");
        line(1, "}");
    }
    line(0, "}");

    sd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_names_roundtrip() {
        for profile in RankProfile::ALL {
            assert_eq!(profile.name().parse::<RankProfile>().unwrap(), profile);
        }
        assert!(matches!(
            "bogus".parse::<RankProfile>(),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn default_profile_reranks_100() {
        assert_eq!(RankProfile::default(), RankProfile::Default);
        assert_eq!(RankProfile::Default.rerank_count(), 100);
    }

    #[test]
    fn schema_declares_packed_embedding() {
        let sd = render_vespa_schema(DEFAULT_SCHEMA_NAME, 128);
        assert!(sd.starts_with("schema pdf_page {"));
        assert!(sd.contains("tensor<int8>(patch{}, v[16])"));
        assert!(sd.contains("tensor<float>(querytoken{}, v[128])"));
        assert!(sd.contains("expression: bm25(name) + bm25(text)"));
        assert!(sd.contains("rerank-count: 100"));
        assert!(sd.contains("rank-profile hamming {"));
        assert!(sd.trim_end().ends_with('}'));
    }

    #[test]
    fn schema_braces_balance() {
        let sd = render_vespa_schema("guideline_page", 96);
        let open = sd.matches('{').count();
        let close = sd.matches('}').count();
        assert_eq!(open, close);
        assert!(sd.contains("v[12]"));
    }
}
