//! HTTP fetch utilities, backoff policy and result export storage for PriceHub.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricehub_core::{AggregatedResult, ErrorKind, Marketplace, MarketplaceError, Product};
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricehub-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn render(self, result: &AggregatedResult) -> anyhow::Result<Vec<u8>> {
        match self {
            ExportFormat::Json => {
                let doc = ExportDocument {
                    query: &result.query,
                    total: result.total,
                    generated_at: result.generated_at,
                    products: &result.products,
                };
                serde_json::to_vec_pretty(&doc).context("serializing export document")
            }
            ExportFormat::Csv => render_csv(&result.products),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => anyhow::bail!("unsupported export format `{other}` (expected json or csv)"),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    query: &'a str,
    total: usize,
    generated_at: DateTime<Utc>,
    products: &'a [Product],
}

const CSV_HEADER: [&str; 9] = [
    "marketplace",
    "name",
    "price",
    "currency",
    "rating",
    "company",
    "moq",
    "url",
    "image_url",
];

pub fn render_csv(products: &[Product]) -> anyhow::Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADER)?;
    for p in products {
        wtr.write_record([
            p.marketplace.slug().to_string(),
            p.name.clone(),
            p.price.map(|v| v.to_string()).unwrap_or_default(),
            p.currency.clone(),
            p.rating.map(|v| v.to_string()).unwrap_or_default(),
            p.company.clone().unwrap_or_default(),
            p.moq.clone().unwrap_or_default(),
            p.url.clone().unwrap_or_default(),
            p.image_url.clone().unwrap_or_default(),
        ])?;
    }
    wtr.into_inner()
        .map_err(|e| anyhow::anyhow!("flushing csv export: {}", e.error()))
}

#[derive(Debug, Clone)]
pub struct StoredExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Writes search result snapshots under hash-addressed paths.
#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn query_slug(query: &str) -> String {
        let mut slug = String::new();
        for ch in query.trim().to_ascii_lowercase().chars() {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch);
            } else if !slug.ends_with('-') && !slug.is_empty() {
                slug.push('-');
            }
        }
        let slug: String = slug.trim_end_matches('-').chars().take(48).collect();
        if slug.is_empty() {
            "query".to_string()
        } else {
            slug
        }
    }

    pub fn export_relative_path(
        &self,
        generated_at: DateTime<Utc>,
        query: &str,
        content_hash: &str,
        format: ExportFormat,
    ) -> PathBuf {
        let stamp = generated_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(Self::query_slug(query))
            .join(format!("{content_hash}.{}", format.extension()))
    }

    pub async fn export(
        &self,
        result: &AggregatedResult,
        format: ExportFormat,
    ) -> anyhow::Result<StoredExport> {
        let bytes = format.render(result)?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path =
            self.export_relative_path(result.generated_at, &result.query, &content_hash, format);
        self.store_bytes(relative_path, content_hash, &bytes).await
    }

    /// Temp-file write followed by an atomic rename; an existing file with the same hash is reused.
    async fn store_bytes(
        &self,
        relative_path: PathBuf,
        content_hash: String,
        bytes: &[u8],
    ) -> anyhow::Result<StoredExport> {
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("export path {} has no parent", absolute_path.display()))?;
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating export directory {}", parent.display()))?;

        let stored = |deduplicated| StoredExport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking export path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp export {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Maps a non-success status onto the adapter error taxonomy.
pub fn classify_status(status: StatusCode, has_retry_after: bool) -> ErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => ErrorKind::RateLimit,
        StatusCode::INTERNAL_SERVER_ERROR if has_retry_after => ErrorKind::RateLimit,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Blocked,
        s if s.is_server_error() => ErrorKind::Network,
        _ => ErrorKind::Parse,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() || err.is_body() {
        ErrorKind::Parse
    } else {
        ErrorKind::Network
    }
}

/// Parses a `Retry-After` value given either as delta-seconds or as an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffCurve {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub curve: BackoffCurve,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::linear(2, Duration::from_millis(1000), Some(Duration::from_millis(3000)))
    }
}

impl BackoffPolicy {
    pub fn linear(max_retries: u32, base_delay: Duration, max_delay: Option<Duration>) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            curve: BackoffCurve::Linear,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Option<Duration>) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            curve: BackoffCurve::Exponential,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.curve {
            BackoffCurve::Linear => self.base_delay.saturating_mul(attempt),
            BackoffCurve::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_marketplace_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_marketplace_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self, marketplace: Marketplace) -> Result<T, MarketplaceError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            MarketplaceError::parse(
                marketplace,
                format!("invalid json from {}: {err}", self.final_url),
            )
        })
    }
}

/// Single-attempt HTTP client shared by the API adapters.
///
/// Retries live with the caller so a whole adapter attempt, not one request,
/// is the unit being retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_marketplace_limit: usize,
    per_marketplace: Mutex<HashMap<Marketplace, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_marketplace_limit: config.per_marketplace_concurrency.max(1),
            per_marketplace: Mutex::new(HashMap::new()),
        })
    }

    async fn marketplace_semaphore(&self, marketplace: Marketplace) -> Arc<Semaphore> {
        let mut map = self.per_marketplace.lock().await;
        map.entry(marketplace)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_marketplace_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        marketplace: Marketplace,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, MarketplaceError> {
        self.send(marketplace, url, self.client.get(url), headers).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        marketplace: Marketplace,
        url: &str,
        headers: &[(&str, &str)],
        body: &T,
    ) -> Result<FetchedResponse, MarketplaceError> {
        self.send(marketplace, url, self.client.post(url).json(body), headers)
            .await
    }

    async fn send(
        &self,
        marketplace: Marketplace,
        url: &str,
        mut request: RequestBuilder,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, MarketplaceError> {
        let closed = |_| MarketplaceError::network(marketplace, "http fetcher is shut down");
        let _global = self.global_limit.acquire().await.map_err(closed)?;
        let per_marketplace = self.marketplace_semaphore(marketplace).await;
        let _marketplace = per_marketplace.acquire().await.map_err(closed)?;

        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let span = info_span!("http_fetch", marketplace = marketplace.slug(), url);
        async move {
            let resp = request
                .send()
                .await
                .map_err(|err| request_error(marketplace, &err))?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status.is_success() {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|err| request_error(marketplace, &err))?
                    .to_vec();
                debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            let kind = classify_status(status, retry_after.is_some());
            warn!(status = status.as_u16(), %kind, "upstream returned an error status");

            Err(MarketplaceError {
                marketplace,
                kind,
                message: format!("http status {} for {final_url}", status.as_u16()),
                retry_after,
            })
        }
        .instrument(span)
        .await
    }
}

fn request_error(marketplace: Marketplace, err: &reqwest::Error) -> MarketplaceError {
    MarketplaceError::new(marketplace, classify_reqwest_error(err), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn product(name: &str, price: Option<f64>) -> Product {
        Product {
            name: name.to_string(),
            price,
            currency: "PKR".into(),
            url: Some("https://www.daraz.pk/products/i1.html".into()),
            image_url: None,
            marketplace: Marketplace::Daraz,
            rating: Some(4.5),
            company: Some("Samsung".into()),
            moq: None,
            relevance_score: 3,
        }
    }

    fn sample_result() -> AggregatedResult {
        let mut result = AggregatedResult::new(
            "Galaxy S23, 256GB",
            vec![
                product("Samsung Galaxy S23 \"Ultra\", 256GB", Some(289999.0)),
                product("Samsung Galaxy S23", None),
            ],
            vec![],
        );
        result.generated_at = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("ts");
        result
    }

    #[test]
    fn export_hashing_is_stable() {
        assert_eq!(
            ExportStore::sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn query_slug_is_filesystem_safe() {
        assert_eq!(ExportStore::query_slug("  Galaxy S23, 256GB "), "galaxy-s23-256gb");
        assert_eq!(ExportStore::query_slug("***"), "query");
    }

    #[test]
    fn csv_quotes_fields_with_separators_and_quotes() {
        let bytes = render_csv(&sample_result().products).expect("csv");
        let csv = String::from_utf8(bytes).expect("utf8");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "marketplace,name,price,currency,rating,company,moq,url,image_url");
        assert_eq!(
            lines[1],
            "daraz,\"Samsung Galaxy S23 \"\"Ultra\"\", 256GB\",289999,PKR,4.5,Samsung,,https://www.daraz.pk/products/i1.html,"
        );
        assert!(lines[2].starts_with("daraz,Samsung Galaxy S23,,PKR"));
    }

    #[tokio::test]
    async fn atomic_exports_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ExportStore::new(dir.path());
        let result = sample_result();

        let first = store.export(&result, ExportFormat::Json).await.expect("first export");
        let second = store.export(&result, ExportFormat::Json).await.expect("second export");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(Path::new("20260302_093000").join("galaxy-s23-256gb")));

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&first.absolute_path).expect("read")).expect("json");
        assert_eq!(written["total"], 2);
        assert_eq!(written["products"][1]["price"], serde_json::Value::Null);
    }

    #[test]
    fn linear_backoff_grows_per_attempt_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(3000));

        let uncapped = BackoffPolicy::linear(2, Duration::from_millis(3000), None);
        assert_eq!(uncapped.delay_for_attempt(2), Duration::from_millis(6000));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::exponential(
            3,
            Duration::from_millis(100),
            Some(Duration::from_millis(350)),
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = Utc
            .with_ymd_and_hms(2015, 10, 21, 7, 27, 30)
            .single()
            .expect("ts");
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn status_classification_follows_error_taxonomy() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS, false), ErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE, false), ErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, true), ErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, false), ErrorKind::Network);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, false), ErrorKind::Blocked);
        assert_eq!(classify_status(StatusCode::NOT_FOUND, false), ErrorKind::Parse);
    }
}
