//! Boundary to the query-rewrite model.
//!
//! The model is an external program: question text goes in, raw generated
//! text comes out. This module only locates the answer inside that output
//! and turns it into retrieval sub-queries.

use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Answer the model gives when no guideline covers the question.
pub const NO_GUIDELINE_SENTINEL: &str =
    "No CPIC guideline information available.";

const ANSWER_MARKER: &str = "<extra_id_2>";
const MARKER_PREFIX: &str = "<extra_id_";
const ROLE_MARKER: &str = "Assistant";
const NOT_AVAILABLE: &str = "N/A";

pub trait QueryRewriter {
    /// Raw model output for `question`.
    fn rewrite(&mut self, question: &str) -> Result<String>;
}

/// Runs `program [args...] --question <question>` and captures stdout.
#[derive(Debug, Clone)]
pub struct CommandRewriter {
    program: String,
    args: Vec<String>,
}

impl CommandRewriter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl QueryRewriter for CommandRewriter {
    fn rewrite(&mut self, question: &str) -> Result<String> {
        debug!(program = %self.program, "running rewrite command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--question")
            .arg(question)
            .output()
            .map_err(|e| {
                Error::Rewrite(format!("cannot run {}: {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Rewrite(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Text up to the next `<extra_id_N>` marker, or to the end.
fn until_next_marker(text: &str) -> &str {
    let end = text
        .match_indices(MARKER_PREFIX)
        .find(|(i, _)| {
            let rest = &text[i + MARKER_PREFIX.len()..];
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            digits > 0 && rest[digits..].starts_with('>')
        })
        .map_or(text.len(), |(i, _)| i);
    &text[..end]
}

/// Carve the model's answer out of its raw output.
///
/// The answer follows the `<extra_id_2>` label marker (or, failing that, an
/// `Assistant` role line) and runs until the next `<extra_id_N>` marker. If
/// no marker is found the whole output is the answer.
pub fn extract_answer(raw: &str) -> String {
    let body = if let Some(i) = raw.find(ANSWER_MARKER) {
        until_next_marker(&raw[i + ANSWER_MARKER.len()..])
    } else if let Some(i) = raw.find(ROLE_MARKER) {
        until_next_marker(&raw[i + ROLE_MARKER.len()..])
    } else {
        warn!("no answer marker in rewrite output, using all of it");
        raw
    };
    body.trim().to_string()
}

/// One structured retrieval request produced by the rewrite model.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubQuery {
    #[serde(rename = "Drug Name", default)]
    pub drug_name: Option<String>,
    #[serde(rename = "Gene Name", default)]
    pub gene_name: Option<String>,
    #[serde(rename = "CPIC Guideline Name", default)]
    pub guideline_name: Option<String>,
    #[serde(rename = "Content to Search", default)]
    pub content_to_search: String,
}

impl SubQuery {
    pub fn free_text(text: &str) -> Self {
        Self {
            content_to_search: text.to_string(),
            ..Self::default()
        }
    }

    /// The text handed to retrieval.
    pub fn search_text(&self) -> String {
        let content = self.content_to_search.trim();
        if !content.is_empty() && content != NOT_AVAILABLE {
            return content.to_string();
        }
        [&self.drug_name, &self.gene_name, &self.guideline_name]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && *s != NOT_AVAILABLE)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnswerShape {
    Objects(Vec<SubQuery>),
    Object(SubQuery),
    Lines(Vec<String>),
}

/// `Drug Name: X, Gene Name: Y, CPIC Guideline Name: Z, Content to Search: W`
fn parse_labelled_line(line: &str) -> SubQuery {
    const LABELS: [&str; 4] = [
        "Drug Name:",
        "Gene Name:",
        "CPIC Guideline Name:",
        "Content to Search:",
    ];
    let starts: Vec<Option<usize>> =
        LABELS.iter().map(|label| line.find(label)).collect();

    let field = |idx: usize| -> Option<String> {
        let start = starts[idx]? + LABELS[idx].len();
        let end = starts
            .iter()
            .flatten()
            .copied()
            .filter(|&s| s > start)
            .min()
            .unwrap_or(line.len());
        let value = line[start..end].trim().trim_end_matches(',').trim();
        (!value.is_empty()).then(|| value.to_string())
    };

    match (field(0), field(1), field(2), field(3)) {
        (None, None, None, None) => SubQuery::free_text(line.trim()),
        (drug_name, gene_name, guideline_name, content) => SubQuery {
            drug_name,
            gene_name,
            guideline_name,
            content_to_search: content.unwrap_or_default(),
        },
    }
}

fn is_sentinel(answer: &str) -> bool {
    let unquoted =
        answer.trim().trim_matches(|c: char| c == '"' || c == '\'');
    unquoted.trim() == NO_GUIDELINE_SENTINEL
}

fn parse_shape(text: &str) -> Option<Vec<SubQuery>> {
    let shape = serde_json::from_str::<AnswerShape>(text).ok()?;
    Some(match shape {
        AnswerShape::Objects(queries) => queries,
        AnswerShape::Object(query) => vec![query],
        AnswerShape::Lines(lines) => {
            lines.iter().map(|l| parse_labelled_line(l)).collect()
        }
    })
}

/// Turn an extracted answer into sub-queries.
///
/// Accepts a JSON list of objects (or a single object), a list of labelled
/// strings, or the same with Python-style single quotes. The no-guideline
/// sentinel and an empty list both yield no sub-queries. Anything else is a
/// single free-text sub-query. Sub-queries with nothing to search for are
/// dropped.
pub fn parse_sub_queries(answer: &str) -> Vec<SubQuery> {
    let answer = answer.trim();
    let answer = answer.strip_prefix("Output:").unwrap_or(answer).trim();
    if answer.is_empty() || is_sentinel(answer) {
        return Vec::new();
    }

    let parsed = parse_shape(answer)
        .or_else(|| parse_shape(&answer.replace('\'', "\"")))
        .unwrap_or_else(|| {
            if answer.contains("Content to Search:") {
                vec![parse_labelled_line(answer)]
            } else {
                vec![SubQuery::free_text(answer)]
            }
        });

    parsed
        .into_iter()
        .filter(|q| {
            let keep = !q.search_text().is_empty();
            if !keep {
                debug!(?q, "dropping sub-query with nothing to search");
            }
            keep
        })
        .collect()
}
