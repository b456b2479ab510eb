//! SAM.gov opportunity search adapter: request contract, retry policy and the
//! rate-limited paginated fetcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{OpportunityRecord, SearchCriteria};
use chrono::{Days, NaiveDate};
pub use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "beacon-sam";

pub const DEFAULT_BASE_URL: &str = "https://api.sam.gov/opportunities/v2/search";

/// Widest `postedFrom..postedTo` span the API accepts.
pub const MAX_WINDOW_DAYS: i64 = 366;

pub const MAX_PAGE_SIZE: u32 = 1000;

/// Base notice types: solicitation, combined synopsis/solicitation, presolicitation.
pub const BASE_NOTICE_TYPES: [&str; 3] = ["o", "k", "p"];

#[derive(Debug, Error)]
pub enum SamError {
    #[error("invalid search window: {0}")]
    InvalidWindow(String),
    #[error("invalid search request: {0}")]
    InvalidRequest(String),
    #[error("SAM_OPPS_API_KEY is not configured")]
    MissingApiKey,
    #[error("search API rejected the api key (401 Unauthorized)")]
    Unauthorized,
    #[error("max retries exceeded after {attempts} attempts (last failure: {last_failure})")]
    RetriesExhausted {
        attempts: u32,
        last_status: Option<u16>,
        last_failure: String,
    },
    #[error("search API returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("search API transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("decoding search API response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SamError {
    /// Stable short code persisted on the run ledger.
    pub fn code(&self) -> &'static str {
        match self {
            SamError::InvalidWindow(_) => "SAM_INVALID_WINDOW",
            SamError::InvalidRequest(_) => "SAM_INVALID_REQUEST",
            SamError::MissingApiKey => "SAM_MISSING_API_KEY",
            SamError::Unauthorized => "SAM_UNAUTHORIZED",
            SamError::RetriesExhausted {
                last_status: Some(429),
                ..
            } => "SAM_RATE_LIMITED",
            SamError::RetriesExhausted { .. } => "SAM_RETRIES_EXHAUSTED",
            SamError::HttpStatus { .. } => "SAM_HTTP_STATUS",
            SamError::Transport(_) => "SAM_TRANSPORT",
            SamError::Decode(_) => "SAM_DECODE",
        }
    }
}

pub fn format_mmddyyyy(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

/// Inclusive posting-date window of one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
}

impl SearchWindow {
    pub fn new(
        posted_from: Option<NaiveDate>,
        posted_to: Option<NaiveDate>,
    ) -> Result<Self, SamError> {
        let (Some(posted_from), Some(posted_to)) = (posted_from, posted_to) else {
            return Err(SamError::InvalidWindow(
                "postedFrom and postedTo are both required".to_string(),
            ));
        };
        let window = Self {
            posted_from,
            posted_to,
        };
        window.validate()?;
        Ok(window)
    }

    /// Calendar-day window ending today: `days_back = 2` is yesterday through today.
    pub fn days_back(today: NaiveDate, days_back: u32) -> Result<Self, SamError> {
        let span = u64::from(days_back.max(1) - 1);
        let posted_from = today.checked_sub_days(Days::new(span)).ok_or_else(|| {
            SamError::InvalidWindow(format!("{days_back} days back from {today} underflows"))
        })?;
        Self::new(Some(posted_from), Some(today))
    }

    pub fn validate(&self) -> Result<(), SamError> {
        if self.posted_to < self.posted_from {
            return Err(SamError::InvalidWindow(format!(
                "postedFrom {} is after postedTo {}",
                self.posted_from, self.posted_to
            )));
        }
        let span = self.span_days();
        if span > MAX_WINDOW_DAYS {
            return Err(SamError::InvalidWindow(format!(
                "window spans {span} days; at most {MAX_WINDOW_DAYS} allowed"
            )));
        }
        Ok(())
    }

    pub fn span_days(&self) -> i64 {
        (self.posted_to - self.posted_from).num_days()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Text(String),
    List(Vec<String>),
    Number(u64),
}

impl QueryValue {
    fn render(&self) -> String {
        match self {
            QueryValue::Text(text) => text.clone(),
            QueryValue::List(items) => items.join(","),
            QueryValue::Number(n) => n.to_string(),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Text(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Text(value)
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(value: Vec<String>) -> Self {
        QueryValue::List(value)
    }
}

impl From<u64> for QueryValue {
    fn from(value: u64) -> Self {
        QueryValue::Number(value)
    }
}

/// Flattens query parameters: lists are comma-joined, absent values are
/// dropped rather than sent empty.
pub fn build_query<'a, I>(params: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, Option<QueryValue>)>,
{
    params
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), v.render())))
        .collect()
}

/// Per-user search parameters forwarded to the API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams {
    pub keywords: Option<String>,
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub set_aside_codes: Vec<String>,
    pub organization_name: Option<String>,
    pub organization_code: Option<String>,
}

impl SearchParams {
    pub fn from_criteria(criteria: &SearchCriteria) -> Self {
        Self {
            keywords: criteria.include_text(),
            naics_codes: criteria.naics_codes.clone(),
            psc_codes: criteria.psc_codes.clone(),
            set_aside_codes: criteria.set_aside_codes.clone(),
            organization_name: criteria.organization_name.clone(),
            organization_code: criteria.organization_code.clone(),
        }
    }

    pub fn page_url(
        &self,
        base: &Url,
        api_key: &str,
        window: &SearchWindow,
        page_size: u32,
        offset: u64,
    ) -> Url {
        let query = build_query([
            ("postedFrom", Some(format_mmddyyyy(window.posted_from).into())),
            ("postedTo", Some(format_mmddyyyy(window.posted_to).into())),
            ("limit", Some(u64::from(page_size).into())),
            (
                "ptype",
                Some(QueryValue::List(
                    BASE_NOTICE_TYPES.iter().map(|t| t.to_string()).collect(),
                )),
            ),
            ("api_key", Some(api_key.into())),
            ("q", non_empty_text(self.keywords.as_deref())),
            ("ncode", non_empty_list(&self.naics_codes)),
            ("ccode", non_empty_list(&self.psc_codes)),
            ("typeOfSetAside", non_empty_list(&self.set_aside_codes)),
            ("organizationName", non_empty_text(self.organization_name.as_deref())),
            ("organizationCode", non_empty_text(self.organization_code.as_deref())),
            ("offset", Some(offset.into())),
        ]);
        let mut url = base.clone();
        url.query_pairs_mut().extend_pairs(query.iter());
        url
    }
}

fn non_empty_text(value: Option<&str>) -> Option<QueryValue> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(QueryValue::from)
}

fn non_empty_list(values: &[String]) -> Option<QueryValue> {
    let values = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    if values.is_empty() {
        None
    } else {
        Some(QueryValue::List(values))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub total_records: Option<u64>,
    #[serde(default)]
    pub opportunities_data: Option<Vec<RawOpportunity>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOpportunity {
    pub notice_id: Option<String>,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub ptype: Option<String>,
    pub posted_date: Option<String>,
    pub naics_codes: Option<Vec<RawNaicsCode>>,
    pub classification_code: Option<String>,
    pub set_aside: Option<String>,
    pub ui_link: Option<String>,
    pub full_parent_path_name: Option<String>,
    pub organization_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNaicsCode {
    pub naics_code: Option<String>,
}

impl RawOpportunity {
    /// Records without a notice id cannot be deduplicated and are dropped.
    pub fn into_record(self) -> Option<OpportunityRecord> {
        let notice_id = self.notice_id.filter(|id| !id.trim().is_empty())?;
        Some(OpportunityRecord {
            notice_id,
            solicitation_number: self.solicitation_number,
            title: self.title,
            description: self.description,
            notice_type: self.ptype,
            posted_date: self.posted_date,
            naics_codes: self
                .naics_codes
                .unwrap_or_default()
                .into_iter()
                .filter_map(|c| c.naics_code)
                .collect(),
            psc_codes: split_csv(self.classification_code.as_deref()),
            set_asides: split_csv(self.set_aside.as_deref()),
            ui_link: self.ui_link,
            full_parent_path_name: self.full_parent_path_name,
            organization_name: self.organization_name,
        })
    }
}

fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("connection failed: {0}")]
    Connection(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(err) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            TransportError::Connection(_) => true,
        }
    }
}

/// Single GET against the search API. Seam for tests and alternate clients.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self, SamError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().map_err(TransportError::from)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SearchTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<TransportResponse, TransportError> {
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await?.to_vec();
        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Parses a `Retry-After` value given in seconds. Hints too large for a
/// `Duration` saturate; the caller's cap bounds the actual wait.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per page request, the first one included.
    pub max_attempts: u32,
    /// Delay after a 5xx or retryable transport failure.
    pub backoff: Backoff,
    /// Delay after a 429 without a usable `Retry-After`.
    pub rate_limit_delay: Duration,
    pub rate_limit_delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
            rate_limit_delay: Duration::from_secs(1),
            rate_limit_delay_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay_after(
        &self,
        attempt_index: u32,
        disposition: RetryDisposition,
        retry_after: Option<&str>,
    ) -> Duration {
        match disposition {
            RetryDisposition::RateLimited => retry_after
                .and_then(parse_retry_after)
                .unwrap_or(self.rate_limit_delay)
                .min(self.rate_limit_delay_cap),
            _ => self.backoff.delay_for_attempt(attempt_index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    pub max_calls_per_user: u32,
    pub delay_between_calls: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            page_size: MAX_PAGE_SIZE,
            max_calls_per_user: 10,
            delay_between_calls: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<OpportunityRecord>,
    pub total_reported: u64,
    pub calls: u32,
    /// Call budget ran out before the reported total was reached.
    pub truncated: bool,
}

pub struct OpportunityFetcher {
    transport: Arc<dyn SearchTransport>,
    config: FetchConfig,
    base_url: Url,
}

impl OpportunityFetcher {
    pub fn new(transport: Arc<dyn SearchTransport>, config: FetchConfig) -> Result<Self, SamError> {
        let base_url = Url::parse(&config.base_url).map_err(|err| {
            SamError::InvalidRequest(format!("base url {:?}: {err}", config.base_url))
        })?;
        Ok(Self {
            transport,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Pages through every record matching `params` in `window`, bounded by the
    /// per-user call budget. Validation failures return before any request.
    pub async fn fetch_all(
        &self,
        window: &SearchWindow,
        params: &SearchParams,
    ) -> Result<FetchOutcome, SamError> {
        window.validate()?;
        let page_size = self.config.page_size;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(SamError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(SamError::MissingApiKey)?;

        let span = info_span!(
            "sam_fetch",
            posted_from = %format_mmddyyyy(window.posted_from),
            posted_to = %format_mmddyyyy(window.posted_to),
        );
        self.paginate(window, params, api_key, page_size)
            .instrument(span)
            .await
    }

    async fn paginate(
        &self,
        window: &SearchWindow,
        params: &SearchParams,
        api_key: &str,
        page_size: u32,
    ) -> Result<FetchOutcome, SamError> {
        let max_calls = self.config.max_calls_per_user.max(1);
        let mut outcome = FetchOutcome::default();
        let mut offset = 0u64;

        loop {
            if outcome.calls >= max_calls {
                outcome.truncated = true;
                warn!(
                    calls = outcome.calls,
                    fetched = outcome.records.len(),
                    total = outcome.total_reported,
                    "per-user call budget reached; continuing with partial results"
                );
                break;
            }
            if outcome.calls > 0 && !self.config.delay_between_calls.is_zero() {
                tokio::time::sleep(self.config.delay_between_calls).await;
            }

            debug!(offset, "requesting page");
            let url = params.page_url(&self.base_url, api_key, window, page_size, offset);
            let page = self.get_page(&url).await?;
            outcome.calls += 1;

            let total = page.total_records.unwrap_or(0);
            outcome.total_reported = total;
            if total == 0 {
                warn!("zero records in window");
            }

            let items = page.opportunities_data.unwrap_or_default();
            let returned = items.len() as u64;
            outcome
                .records
                .extend(items.into_iter().filter_map(RawOpportunity::into_record));
            offset += returned;
            info!(offset, returned, total, "page fetched");

            if offset >= total || returned == 0 {
                break;
            }
        }

        Ok(outcome)
    }

    async fn get_page(&self, url: &Url) -> Result<SearchResponse, SamError> {
        let policy = self.config.retry;
        let max_attempts = policy.attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let (delay, last_status, last_failure) = match self.transport.get(url).await {
                Ok(resp) if resp.status.is_success() => {
                    return Ok(serde_json::from_slice(&resp.body)?);
                }
                Ok(resp) if resp.status == StatusCode::UNAUTHORIZED => {
                    warn!(status = 401, "search API rejected credentials; not retrying");
                    return Err(SamError::Unauthorized);
                }
                Ok(resp) => {
                    let disposition = classify_status(resp.status);
                    if disposition == RetryDisposition::NonRetryable {
                        return Err(SamError::HttpStatus {
                            status: resp.status.as_u16(),
                        });
                    }
                    if disposition == RetryDisposition::RateLimited {
                        warn!(attempt, retry_after = ?resp.retry_after, "search API rate limited");
                    } else {
                        warn!(attempt, status = resp.status.as_u16(), "search API server error");
                    }
                    (
                        policy.delay_after(attempt - 1, disposition, resp.retry_after.as_deref()),
                        Some(resp.status.as_u16()),
                        resp.status.to_string(),
                    )
                }
                Err(err) if err.is_retryable() => {
                    warn!(attempt, error = %err, "search API request failed");
                    (
                        policy.delay_after(attempt - 1, RetryDisposition::Retryable, None),
                        None,
                        err.to_string(),
                    )
                }
                Err(err) => return Err(SamError::Transport(err)),
            };

            if attempt >= max_attempts {
                return Err(SamError::RetriesExhausted {
                    attempts: attempt,
                    last_status,
                    last_failure,
                });
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
