use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use rulegate_core::workspace::{load_local, path_from_url, service_id_from_url, tree_summary};
use rulegate_core::{
    ConsolidatedResult, FetchError, FileRecord, RepositoryContent, RuleRecord, Scope, Settings,
    ValidationRequest,
};

const RULES: &str = "SYNC_RULES_LAMBDA";
const STRUCTURE: &str = "GET_REPO_STRUCTURE_LAMBDA";
const FILE_READER: &str = "FILE_READER_LAMBDA";

/// Supplies the rule records that apply to a service.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn fetch_rules(&self, service_id: &str) -> Result<Vec<RuleRecord>, FetchError>;
}

/// Supplies the rendered content of a repository.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_content(&self, repository_url: &str) -> Result<RepositoryContent, FetchError>;

    /// Like `fetch_content`, but only files matched by one of `scopes` need
    /// their text. The tree still covers the whole repository. An empty
    /// slice wants every file.
    async fn fetch_for(
        &self,
        repository_url: &str,
        scopes: &[Scope],
    ) -> Result<RepositoryContent, FetchError> {
        let _ = scopes;
        self.fetch_content(repository_url).await
    }
}

/// Receives the consolidated result once a run finishes.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &Report) -> Result<(), ReportError>;
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report endpoint failed: {0}")]
    Http(String),
    #[error("cannot write report to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What the report sink receives.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub validation_results: ConsolidatedResult,
    pub repository_config: ValidationRequest,
    pub bucket: String,
    pub timestamp: String,
}

impl Report {
    pub fn new(result: ConsolidatedResult, request: ValidationRequest, bucket: &str) -> Self {
        Self {
            validation_results: result,
            repository_config: request,
            bucket: bucket.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn is_http(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// POST a JSON payload and return the JSON answer. Function-gateway envelopes
/// (`{"statusCode": .., "body": ..}`) are unwrapped.
async fn post_json(
    client: &reqwest::Client,
    collaborator: &'static str,
    url: &str,
    payload: &Value,
) -> Result<Value, FetchError> {
    let resp = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| FetchError::Unreachable {
            collaborator,
            reason: e.to_string(),
        })?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Unreachable {
            collaborator,
            reason: format!("HTTP {status}"),
        });
    }

    let value: Value = resp.json().await.map_err(|e| FetchError::Malformed {
        collaborator,
        reason: e.to_string(),
    })?;
    Ok(unwrap_envelope(value))
}

fn unwrap_envelope(mut value: Value) -> Value {
    if value.get("statusCode").is_none() {
        return value;
    }
    match value.get_mut("body").map(Value::take) {
        Some(Value::String(body)) => serde_json::from_str(&body).unwrap_or(Value::String(body)),
        Some(body) => body,
        None => value,
    }
}

/// Accepts `[..]`, `{"rules": [..]}` or `{"<service>": [..]}`.
fn records_from_value(value: Value, service_id: &str) -> Result<Vec<RuleRecord>, FetchError> {
    let malformed = |reason: String| FetchError::Malformed {
        collaborator: RULES,
        reason,
    };

    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => match map.remove("rules").or_else(|| map.remove(service_id)) {
            Some(list) => list,
            None => return Err(FetchError::NoRules(service_id.to_string())),
        },
        other => return Err(malformed(format!("expected a list of rules, got {other}"))),
    };

    serde_json::from_value(list).map_err(|e| malformed(e.to_string()))
}

// --- Rule sources ---

pub struct HttpRuleSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRuleSource {
    pub fn new(url: &str) -> Self {
        Self {
            client: client(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl RuleSource for HttpRuleSource {
    async fn fetch_rules(&self, service_id: &str) -> Result<Vec<RuleRecord>, FetchError> {
        let payload = json!({ "action": "get_latest_rules", "service": service_id });
        let value = post_json(&self.client, RULES, &self.url, &payload).await?;
        records_from_value(value, service_id)
    }
}

/// Rules from a JSON file, or from `<dir>/<service>.json` when given a directory.
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn file_for(&self, service_id: &str) -> PathBuf {
        if self.path.is_dir() {
            self.path.join(format!("{service_id}.json"))
        } else {
            self.path.clone()
        }
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn fetch_rules(&self, service_id: &str) -> Result<Vec<RuleRecord>, FetchError> {
        let file = self.file_for(service_id);
        let text = tokio::fs::read_to_string(&file)
            .await
            .map_err(|source| FetchError::Io {
                path: file.display().to_string(),
                source,
            })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| FetchError::Malformed {
            collaborator: RULES,
            reason: format!("{}: {e}", file.display()),
        })?;
        records_from_value(value, service_id)
    }
}

// --- Content sources ---

#[derive(Debug, Deserialize)]
struct Structure {
    #[serde(default)]
    tree: Option<String>,
    #[serde(default)]
    files: Vec<String>,
}

/// Directory listing from one endpoint, file texts from another. Files are
/// read in parallel; the load fails unless more than half of them arrive.
pub struct HttpContentSource {
    client: reqwest::Client,
    structure_url: String,
    reader_url: Arc<str>,
    limiter: Arc<Semaphore>,
}

impl HttpContentSource {
    pub fn new(structure_url: &str, reader_url: &str, concurrency: usize) -> Self {
        Self {
            client: client(),
            structure_url: structure_url.to_string(),
            reader_url: Arc::from(reader_url),
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    async fn read_all(&self, repository_url: &str, paths: &[String]) -> Vec<Result<String, FetchError>> {
        let repository_url: Arc<str> = Arc::from(repository_url);
        let mut set = JoinSet::new();

        for (slot, path) in paths.iter().enumerate() {
            let client = self.client.clone();
            let reader_url = Arc::clone(&self.reader_url);
            let repository_url = Arc::clone(&repository_url);
            let limiter = Arc::clone(&self.limiter);
            let path = path.clone();
            set.spawn(async move {
                let read = match limiter.acquire_owned().await {
                    Ok(_permit) => read_file(&client, &reader_url, &repository_url, &path).await,
                    Err(_) => Err(FetchError::Unreachable {
                        collaborator: FILE_READER,
                        reason: "reader limiter closed".to_string(),
                    }),
                };
                (slot, read)
            });
        }

        let mut slots: Vec<Option<Result<String, FetchError>>> =
            std::iter::repeat_with(|| None).take(paths.len()).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, read)) => slots[slot] = Some(read),
                Err(e) => tracing::error!(error = %e, "file read task aborted"),
            }
        }

        slots
            .into_iter()
            .map(|read| {
                read.unwrap_or_else(|| {
                    Err(FetchError::Unreachable {
                        collaborator: FILE_READER,
                        reason: "read task aborted".to_string(),
                    })
                })
            })
            .collect()
    }
}

async fn read_file(
    client: &reqwest::Client,
    reader_url: &str,
    repository_url: &str,
    path: &str,
) -> Result<String, FetchError> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let payload = json!({
        "repository_url": repository_url,
        "path": path,
        "file_name": file_name,
        "output_format": "markdown",
    });
    let value = post_json(client, FILE_READER, reader_url, &payload).await?;
    match value {
        Value::String(text) => Ok(text),
        other => other
            .get("content")
            .or_else(|| other.get("resultado"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FetchError::Malformed {
                collaborator: FILE_READER,
                reason: format!("no content for {path}"),
            }),
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch_content(&self, repository_url: &str) -> Result<RepositoryContent, FetchError> {
        self.fetch_for(repository_url, &[]).await
    }

    async fn fetch_for(
        &self,
        repository_url: &str,
        scopes: &[Scope],
    ) -> Result<RepositoryContent, FetchError> {
        let payload = json!({ "operation": "GET_STRUCTURE", "repository_url": repository_url });
        let value = post_json(&self.client, STRUCTURE, &self.structure_url, &payload).await?;
        let listing: Structure = serde_json::from_value(value).map_err(|e| FetchError::Malformed {
            collaborator: STRUCTURE,
            reason: e.to_string(),
        })?;

        let mut paths = listing.files;
        paths.sort();
        paths.dedup();

        let wanted: Vec<String> = paths
            .iter()
            .filter(|p| scopes.is_empty() || scopes.iter().any(|s| s.matches(p)))
            .cloned()
            .collect();
        tracing::debug!(listed = paths.len(), wanted = wanted.len(), "reading repository files");

        let mut files = Vec::with_capacity(wanted.len());
        let mut unread = Vec::new();
        for (path, read) in wanted.iter().zip(self.read_all(repository_url, &wanted).await) {
            match read {
                Ok(text) => files.push(FileRecord {
                    path: path.clone(),
                    text,
                }),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "file could not be read");
                    unread.push(path.clone());
                }
            }
        }

        if !wanted.is_empty() && files.len() * 2 <= wanted.len() {
            return Err(FetchError::Unreachable {
                collaborator: FILE_READER,
                reason: format!("only {} of {} files could be read", files.len(), wanted.len()),
            });
        }

        let tree = match listing.tree {
            Some(tree) if !tree.trim().is_empty() => tree,
            _ => {
                let name = service_id_from_url(repository_url).unwrap_or_else(|| "repository".to_string());
                tree_summary(&name, &paths)
            }
        };

        tracing::info!(
            repository = repository_url,
            files = files.len(),
            unread = unread.len(),
            "fetched repository content"
        );
        Ok(RepositoryContent { tree, files, unread })
    }
}

/// Walks a local checkout. `file://` URLs and plain paths are walked
/// directly; any other URL falls back to the configured root.
pub struct LocalContentSource {
    root: Option<PathBuf>,
    max_file_bytes: u64,
}

impl LocalContentSource {
    pub fn new(root: Option<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            root,
            max_file_bytes,
        }
    }
}

#[async_trait]
impl ContentSource for LocalContentSource {
    async fn fetch_content(&self, repository_url: &str) -> Result<RepositoryContent, FetchError> {
        let root = path_from_url(repository_url)
            .or_else(|| self.root.clone())
            .ok_or(FetchError::NotConfigured {
                collaborator: STRUCTURE,
            })?;
        let max = self.max_file_bytes;
        tokio::task::spawn_blocking(move || load_local(&root, max))
            .await
            .map_err(|e| FetchError::Unreachable {
                collaborator: STRUCTURE,
                reason: e.to_string(),
            })?
    }
}

// --- Report sinks ---

pub struct HttpReportSink {
    client: reqwest::Client,
    url: String,
}

impl HttpReportSink {
    pub fn new(url: &str) -> Self {
        Self {
            client: client(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn publish(&self, report: &Report) -> Result<(), ReportError> {
        let resp = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .map_err(|e| ReportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ReportError::Http(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }
}

/// Writes each report as a timestamped JSON file in a directory.
pub struct FsReportSink {
    dir: PathBuf,
}

impl FsReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ReportSink for FsReportSink {
    async fn publish(&self, report: &Report) -> Result<(), ReportError> {
        let io = |path: &Path| {
            let path = path.display().to_string();
            move |source: std::io::Error| ReportError::Io { path, source }
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io(self.dir.as_path()))?;

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let service = service_id_from_url(&report.repository_config.repository_url)
            .unwrap_or_else(|| "repository".to_string());
        let file = self.dir.join(format!("{service}-{stamp}.json"));

        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&file, json).await.map_err(io(file.as_path()))?;
        tracing::info!(path = %file.display(), "report written");
        Ok(())
    }
}

// --- Wiring ---

/// The external collaborators of a run, chosen from settings.
#[derive(Clone)]
pub struct Collaborators {
    pub rules: Arc<dyn RuleSource>,
    pub content: Arc<dyn ContentSource>,
    pub report: Option<Arc<dyn ReportSink>>,
}

impl Collaborators {
    /// `http(s)://` targets get the HTTP adapters, anything else is a
    /// filesystem path. The rule source is required.
    pub fn from_settings(settings: &Settings) -> Result<Self, FetchError> {
        let rules_target = settings.sync_rules_lambda.trim();
        let rules: Arc<dyn RuleSource> = if rules_target.is_empty() {
            return Err(FetchError::NotConfigured { collaborator: RULES });
        } else if is_http(rules_target) {
            Arc::new(HttpRuleSource::new(rules_target))
        } else {
            Arc::new(FileRuleSource::new(rules_target))
        };

        let structure = settings.get_repo_structure_lambda.trim();
        let reader = settings.file_reader_lambda.trim();
        let content: Arc<dyn ContentSource> = if is_http(structure) {
            if !is_http(reader) {
                return Err(FetchError::NotConfigured {
                    collaborator: FILE_READER,
                });
            }
            Arc::new(HttpContentSource::new(
                structure,
                reader,
                settings.download_concurrency,
            ))
        } else {
            let root = (!structure.is_empty()).then(|| PathBuf::from(structure));
            Arc::new(LocalContentSource::new(root, settings.max_file_bytes))
        };

        let report_target = settings.report_lambda.trim();
        let report: Option<Arc<dyn ReportSink>> = if report_target.is_empty() {
            None
        } else if is_http(report_target) {
            Some(Arc::new(HttpReportSink::new(report_target)))
        } else {
            Some(Arc::new(FsReportSink::new(report_target)))
        };

        tracing::debug!(
            rules = rules_target,
            structure,
            report = report_target,
            "collaborators configured"
        );

        Ok(Self {
            rules,
            content,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Endpoint {
        base: String,
        requests: Arc<Mutex<Vec<(String, Value)>>>,
        peak: Arc<AtomicUsize>,
    }

    impl Endpoint {
        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base)
        }

        fn bodies(&self, path: &str) -> Vec<Value> {
            let requests = self.requests.lock().unwrap();
            requests.iter().filter(|(p, _)| p == path).map(|(_, b)| b.clone()).collect()
        }
    }

    /// One-request-per-connection HTTP server answering JSON POSTs with
    /// `respond(path, body)` after `delay`.
    async fn serve<F>(delay: Duration, respond: F) -> Endpoint
    where
        F: Fn(&str, &Value) -> (u16, Value) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("addr");
        let respond = Arc::new(respond);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let peak = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let (requests_bg, peak_bg) = (Arc::clone(&requests), Arc::clone(&peak));
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let respond = Arc::clone(&respond);
                let requests = Arc::clone(&requests_bg);
                let peak = Arc::clone(&peak_bg);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    let Some((path, body)) = read_request(&mut stream).await else {
                        return;
                    };
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    requests.lock().unwrap().push((path.clone(), body.clone()));

                    tokio::time::sleep(delay).await;
                    let (status, reply) = respond(&path, &body);
                    in_flight.fetch_sub(1, Ordering::SeqCst);

                    let payload = reply.to_string();
                    let head = format!(
                        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        if status < 400 { "OK" } else { "Error" },
                        payload.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(payload.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Endpoint {
            base: format!("http://{addr}"),
            requests,
            peak,
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Option<(String, Value)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break i + 4;
            }
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let path = head.split_whitespace().nth(1)?.to_string();
        let length = head
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null);
        Some((path, body))
    }

    fn listing() -> Value {
        json!({
            "files": [
                "README.md", "docs/a.md", "docs/b.md", "docs/c.md", "docs/d.md",
                "docs/e.md", "docs/f.md", "src/main.rs", "logo.png"
            ]
        })
    }

    fn docs_scope() -> Vec<Scope> {
        vec![Scope::compile("docs", &["docs/*.md".into(), "README.md".into()]).unwrap()]
    }

    #[tokio::test]
    async fn http_rules_are_posted_and_unwrapped() {
        let endpoint = serve(Duration::ZERO, |_, _| {
            let body = json!([{"id": "r1", "description": "d", "type": "content", "criticality": "high"}]);
            (200, json!({ "statusCode": 200, "body": body.to_string() }))
        })
        .await;

        let source = HttpRuleSource::new(&endpoint.url("/rules"));
        let rules = source.fetch_rules("payments").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            endpoint.bodies("/rules"),
            vec![json!({ "action": "get_latest_rules", "service": "payments" })]
        );
    }

    #[tokio::test]
    async fn http_rule_source_failures_are_typed() {
        let endpoint = serve(Duration::ZERO, |_, _| (503, json!({}))).await;
        let source = HttpRuleSource::new(&endpoint.url("/rules"));
        assert!(matches!(
            source.fetch_rules("payments").await,
            Err(FetchError::Unreachable { collaborator: "SYNC_RULES_LAMBDA", .. })
        ));
    }

    #[tokio::test]
    async fn http_content_reads_scoped_files_in_parallel() {
        let endpoint = serve(Duration::from_millis(50), |path, body| match path {
            "/structure" => (200, listing()),
            _ => match body["path"].as_str().unwrap_or_default() {
                "docs/b.md" => (500, json!({ "error": "boom" })),
                p => (200, json!({ "content": format!("text of {p}") })),
            },
        })
        .await;

        let source = HttpContentSource::new(&endpoint.url("/structure"), &endpoint.url("/read"), 3);
        let content = source
            .fetch_for("https://github.com/acme/payments", &docs_scope())
            .await
            .unwrap();

        let paths: Vec<&str> = content.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            ["README.md", "docs/a.md", "docs/c.md", "docs/d.md", "docs/e.md", "docs/f.md"]
        );
        assert_eq!(content.files[1].text, "text of docs/a.md");
        assert_eq!(content.unread, ["docs/b.md"]);

        let read: Vec<String> = endpoint
            .bodies("/read")
            .iter()
            .filter_map(|b| b["path"].as_str().map(str::to_string))
            .collect();
        assert_eq!(read.len(), 7);
        assert!(!read.iter().any(|p| p == "src/main.rs" || p == "logo.png"));

        let peak = endpoint.peak.load(Ordering::SeqCst);
        assert!((2..=3).contains(&peak), "peak concurrency {peak}");

        // the tree still lists files nobody asked to read
        assert!(content.tree.contains("    main.rs\n"), "{}", content.tree);
        assert!(content.tree.contains("  logo.png\n"));
    }

    #[tokio::test]
    async fn reader_outage_fails_the_load() {
        let endpoint = serve(Duration::ZERO, |path, _| match path {
            "/structure" => (200, listing()),
            _ => (500, json!({})),
        })
        .await;

        let source = HttpContentSource::new(&endpoint.url("/structure"), &endpoint.url("/read"), 4);
        let err = source
            .fetch_content("https://github.com/acme/payments")
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Unreachable { collaborator: "FILE_READER_LAMBDA", .. }),
            "{err}"
        );
        assert!(err.to_string().contains("only 0 of 9 files could be read"));
    }

    #[tokio::test]
    async fn half_the_files_is_not_enough() {
        let endpoint = serve(Duration::ZERO, |path, body| match path {
            "/structure" => (200, json!({ "files": ["a.md", "b.md"] })),
            _ if body["path"] == "a.md" => (200, json!({ "content": "a" })),
            _ => (500, json!({})),
        })
        .await;

        let source = HttpContentSource::new(&endpoint.url("/structure"), &endpoint.url("/read"), 2);
        assert!(source.fetch_content("https://github.com/acme/svc").await.is_err());
    }

    #[test]
    fn rule_lists_come_in_three_shapes() {
        let record = json!({"id": "r1", "description": "d", "type": "content", "criticality": "high"});

        let bare = records_from_value(json!([record.clone()]), "svc").unwrap();
        let wrapped = records_from_value(json!({ "rules": [record.clone()] }), "svc").unwrap();
        let keyed = records_from_value(json!({ "svc": [record] }), "svc").unwrap();

        for list in [bare, wrapped, keyed] {
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].id.as_deref(), Some("r1"));
        }

        assert!(matches!(
            records_from_value(json!({ "other": [] }), "svc"),
            Err(FetchError::NoRules(_))
        ));
        assert!(matches!(
            records_from_value(json!("nope"), "svc"),
            Err(FetchError::Malformed { .. })
        ));
    }

    #[test]
    fn gateway_envelopes_are_unwrapped() {
        let wrapped = json!({ "statusCode": 200, "body": "{\"rules\": []}" });
        assert_eq!(unwrap_envelope(wrapped), json!({ "rules": [] }));
        let plain = json!({ "files": ["a"] });
        assert_eq!(unwrap_envelope(plain.clone()), plain);
    }

    #[tokio::test]
    async fn file_rule_source_reads_per_service_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("payments.json"),
            r#"[{"id": "r1", "description": "README exists", "type": "structural", "criticality": "low"}]"#,
        )
        .unwrap();

        let source = FileRuleSource::new(dir.path());
        let rules = source.fetch_rules("payments").await.unwrap();
        assert_eq!(rules.len(), 1);

        let missing = source.fetch_rules("orders").await;
        assert!(matches!(missing, Err(FetchError::Io { .. })));
    }

    #[tokio::test]
    async fn local_content_walks_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "# svc\n").unwrap();

        let source = LocalContentSource::new(None, 1024);
        let url = format!("file://{}", dir.path().display());
        let content = source.fetch_content(&url).await.unwrap();
        assert_eq!(content.files.len(), 1);
        assert_eq!(content.files[0].path, "README.md");

        let remote = source.fetch_content("https://github.com/acme/svc").await;
        assert!(matches!(remote, Err(FetchError::NotConfigured { .. })));
    }

    #[tokio::test]
    async fn fs_report_sink_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsReportSink::new(dir.path().join("reports"));
        let report = Report::new(
            ConsolidatedResult {
                passed: true,
                message: "All 1 rules passed validation.".into(),
                total_rules: 1,
                high_failures: 0,
                medium_failures: 0,
                low_failures: 0,
                undetermined: 0,
                rule_verdicts: vec![],
                unread_files: vec![],
            },
            ValidationRequest {
                repository_url: "https://github.com/acme/payments.git".into(),
                user_name: "dev".into(),
                user_email: "dev@acme.io".into(),
            },
            "bucket",
        );
        sink.publish(&report).await.unwrap();

        let written: Vec<_> = fs::read_dir(sink.dir()).unwrap().collect();
        assert_eq!(written.len(), 1);
        let path = written[0].as_ref().unwrap().path();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("payments-"));
        let value: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["validation_results"]["passed"], json!(true));
        assert_eq!(value["bucket"], json!("bucket"));
    }

    #[test]
    fn settings_pick_adapters_by_scheme() {
        let missing = Collaborators::from_settings(&Settings::default());
        assert!(matches!(
            missing,
            Err(FetchError::NotConfigured { collaborator: "SYNC_RULES_LAMBDA" })
        ));

        let half_http = Settings {
            sync_rules_lambda: "https://rules.internal/sync".into(),
            get_repo_structure_lambda: "https://repo.internal/structure".into(),
            ..Settings::default()
        };
        assert!(matches!(
            Collaborators::from_settings(&half_http),
            Err(FetchError::NotConfigured { collaborator: "FILE_READER_LAMBDA" })
        ));

        let local = Settings {
            sync_rules_lambda: "/etc/rulegate/rules".into(),
            report_lambda: "/var/lib/rulegate/reports".into(),
            ..Settings::default()
        };
        let c = Collaborators::from_settings(&local).unwrap();
        assert!(c.report.is_some());
    }
}
