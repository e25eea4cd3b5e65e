//! HTTP client for a Vespa application serving the page schema.
//!
//! Queries go to the search API, pages to the document/v1 API. Every call is
//! a single blocking request with the caller's timeout; nothing is retried.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    binary,
    error::{Error, Result},
    page::{FeedRecord, Page},
    page_id::PageId,
    schema::{BINARY_QUERY_TENSOR, DEFAULT_SCHEMA_NAME, QUERY_TENSOR, fields},
    store::{
        DEFAULT_TIMEOUT,
        FeedReport,
        IndexStore,
        QueryRequest,
        QueryResponse,
        StoredHit,
    },
};

/// Where and how to reach a Vespa endpoint.
///
/// Read from a JSON file; the capitalized key names written by Vespa Cloud
/// tooling are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    #[serde(alias = "Endpoint", alias = "url", alias = "URL")]
    pub endpoint: String,
    /// Bearer token for token-authenticated endpoints.
    #[serde(default, alias = "Secret Token")]
    pub token: Option<String>,
    /// PEM client certificate and key for mTLS endpoints.
    #[serde(default, alias = "Cert")]
    pub cert: Option<PathBuf>,
    #[serde(default, alias = "Key")]
    pub key: Option<PathBuf>,
}

impl EndpointConfig {
    pub fn from_url(url: &str) -> Self {
        Self {
            endpoint: url.to_string(),
            token: None,
            cert: None,
            key: None,
        }
    }

    /// Parse an endpoint file: a JSON object, or a bare URL on one line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let trimmed = content.trim();
        if trimmed.starts_with('{') {
            Ok(serde_json::from_str(trimmed)?)
        } else {
            Ok(Self::from_url(trimmed))
        }
    }
}

pub struct VespaStore {
    client: Client,
    endpoint: String,
    namespace: String,
    schema: String,
    feed_timeout: Duration,
}

impl VespaStore {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim().trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "endpoint must be an http(s) URL: {endpoint:?}"
            )));
        }

        let mut builder = Client::builder();
        if let Some(token) = &config.token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| Error::Config("invalid endpoint token".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert)?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key)?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| Error::Config(format!("client certificate: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "endpoint cert and key must be given together".into(),
                ));
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            namespace: DEFAULT_SCHEMA_NAME.to_string(),
            schema: DEFAULT_SCHEMA_NAME.to_string(),
            feed_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Use a schema other than the default; the document namespace follows
    /// unless set separately.
    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self.namespace = schema.to_string();
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn document_url(&self, id: &str) -> String {
        format!(
            "{}/document/v1/{}/{}/docid/{}",
            self.endpoint,
            self.namespace,
            self.schema,
            utf8_percent_encode(id, NON_ALPHANUMERIC)
        )
    }

    fn search(&self, body: &SearchBody, timeout: Duration) -> Result<SearchResult> {
        let url = format!("{}/search/", self.endpoint);
        debug!(url = %url, hits = body.hits, "querying vespa");
        let resp = self.client.post(&url).timeout(timeout).json(body).send()?;
        parse_search_response(resp)
    }
}

impl std::fmt::Debug for VespaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VespaStore")
            .field("endpoint", &self.endpoint)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Search API request body.
#[derive(Debug, Serialize)]
pub struct SearchBody {
    pub yql: String,
    pub hits: usize,
    pub ranking: String,
    /// Seconds.
    pub timeout: f64,
    #[serde(rename = "userQuery", skip_serializing_if = "Option::is_none")]
    pub user_query: Option<String>,
    #[serde(rename = "input.query(qt)", skip_serializing_if = "Option::is_none")]
    pub query_tensor: Option<BTreeMap<u32, Vec<f32>>>,
    #[serde(rename = "input.query(qtb)", skip_serializing_if = "Option::is_none")]
    pub binary_query_tensor: Option<BTreeMap<u32, Vec<i8>>>,
    #[serde(rename = "ranking.rerankCount", skip_serializing_if = "Option::is_none")]
    pub rerank_count: Option<usize>,
}

/// Build the request body for one two-phase query.
pub fn search_body(schema: &str, request: &QueryRequest) -> SearchBody {
    let mut selected = vec![
        fields::ID,
        fields::NAME,
        fields::PATH,
        fields::PAGE_NUMBER,
    ];
    if request.include_image {
        selected.push(fields::IMAGE);
    }

    let rows = request.query_tensor.iter_rows().enumerate();
    let (query_tensor, binary_query_tensor) =
        if request.rank_profile.binary_query() {
            let packed = rows
                .map(|(i, q)| {
                    let bytes = binary::pack_bits(q);
                    (i as u32, bytes.into_iter().map(|b| b as i8).collect())
                })
                .collect();
            (None, Some(packed))
        } else {
            let floats = rows.map(|(i, q)| (i as u32, q.to_vec())).collect();
            (Some(floats), None)
        };

    SearchBody {
        yql: format!(
            "select {} from {schema} where userInput(@userQuery)",
            selected.join(", ")
        ),
        hits: request.hits,
        ranking: request.rank_profile.name().to_string(),
        timeout: request.timeout.as_secs_f64(),
        user_query: Some(request.user_query.clone()),
        query_tensor,
        binary_query_tensor,
        rerank_count: request.rerank_count,
    }
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    root: SearchRoot,
}

#[derive(Debug, Deserialize)]
struct SearchRoot {
    #[serde(default)]
    fields: Option<RootFields>,
    #[serde(default)]
    children: Vec<SearchChild>,
    #[serde(default)]
    errors: Vec<SearchError>,
}

#[derive(Debug, Deserialize)]
struct RootFields {
    #[serde(rename = "totalCount", default)]
    total_count: u64,
}

#[derive(Debug, Deserialize)]
struct SearchChild {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    relevance: f64,
    #[serde(default)]
    fields: HitFields,
}

#[derive(Debug, Default, Deserialize)]
struct HitFields {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    page_number: u32,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl std::fmt::Display for SearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[{code}] ")?;
        }
        let summary = self.summary.as_deref().unwrap_or("error");
        match &self.message {
            Some(msg) => write!(f, "{summary}: {msg}"),
            None => f.write_str(summary),
        }
    }
}

fn parse_search_response(resp: Response) -> Result<SearchResult> {
    let status = resp.status();
    let text = resp.text()?;
    match serde_json::from_str::<SearchResult>(&text) {
        Ok(result) if result.root.errors.is_empty() && status.is_success() => {
            Ok(result)
        }
        Ok(result) if !result.root.errors.is_empty() => {
            let messages: Vec<String> =
                result.root.errors.iter().map(ToString::to_string).collect();
            Err(Error::RetrievalBackend(messages.join("; ")))
        }
        _ => Err(Error::RetrievalBackend(format!(
            "search request failed ({status}): {}",
            text.chars().take(500).collect::<String>()
        ))),
    }
}

fn into_query_response(result: SearchResult) -> Result<QueryResponse> {
    let total_count = result.root.fields.map(|f| f.total_count);
    let hits = result
        .root
        .children
        .into_iter()
        .map(|child| {
            let page_id = child
                .fields
                .id
                .or_else(|| {
                    child
                        .id
                        .as_deref()
                        .and_then(|id| id.rsplit("::").next())
                        .map(str::to_string)
                })
                .ok_or_else(|| {
                    Error::RetrievalBackend("hit without a page id".into())
                })?;
            let image = child
                .fields
                .image
                .map(|b64| BASE64.decode(b64.as_bytes()))
                .transpose()
                .map_err(|e| {
                    Error::RetrievalBackend(format!("hit image is not base64: {e}"))
                })?;
            Ok(StoredHit {
                page_id,
                relevance: child.relevance as f32,
                document_name: child.fields.name,
                path: child.fields.path,
                page_number: child.fields.page_number,
                image,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(QueryResponse { hits, total_count })
}

#[derive(Serialize)]
struct FeedEnvelope<'a> {
    fields: &'a FeedRecord,
}

/// A JSONL `put` operation, as consumed by `vespa feed` and by the `feed`
/// command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PutOperation {
    pub put: String,
    pub fields: FeedRecord,
}

impl PutOperation {
    pub fn new(namespace: &str, schema: &str, record: FeedRecord) -> Self {
        Self {
            put: format!("id:{namespace}:{schema}::{}", record.id),
            fields: record,
        }
    }

    /// The record, once the document id agrees with its `id` field.
    pub fn into_record(self) -> Result<FeedRecord> {
        let local = self.put.split_once("::").map(|(_, id)| id);
        if !self.put.starts_with("id:") || local != Some(&self.fields.id) {
            return Err(Error::Config(format!(
                "put {:?} does not name page {}",
                self.put, self.fields.id
            )));
        }
        Ok(self.fields)
    }
}

fn check_status(resp: Response) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp
        .text()
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(Error::RetrievalBackend(format!(
        "document request failed ({status}): {body}"
    )))
}

impl IndexStore for VespaStore {
    fn feed(&self, pages: &[Page]) -> Result<FeedReport> {
        let mut report = FeedReport::default();
        for page in pages {
            let record = FeedRecord::from(page);
            let result = self
                .client
                .post(self.document_url(&record.id))
                .timeout(self.feed_timeout)
                .json(&FeedEnvelope { fields: &record })
                .send()
                .map_err(Error::from)
                .and_then(check_status);
            match result {
                Ok(()) => report.fed += 1,
                Err(e) => {
                    warn!(page = %page.id, error = %e, "failed to feed page");
                    report.failed.push((record.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let body = search_body(&self.schema, request);
        into_query_response(self.search(&body, request.timeout)?)
    }

    fn page_count(&self) -> Result<u64> {
        let body = SearchBody {
            yql: format!("select * from {} where true", self.schema),
            hits: 0,
            ranking: "unranked".to_string(),
            timeout: DEFAULT_TIMEOUT.as_secs_f64(),
            user_query: None,
            query_tensor: None,
            binary_query_tensor: None,
            rerank_count: None,
        };
        let result = self.search(&body, DEFAULT_TIMEOUT)?;
        Ok(result.root.fields.map_or(0, |f| f.total_count))
    }

    fn delete_pages(&self, ids: &[PageId]) -> Result<()> {
        for id in ids {
            let resp = self
                .client
                .delete(self.document_url(&id.hex))
                .timeout(self.feed_timeout)
                .send()?;
            check_status(resp)?;
        }
        Ok(())
    }
}
