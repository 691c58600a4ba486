//! Upstream adapters: review sources, the LLM insight generator, and the
//! credit ledger seam.
//!
//! Each review source speaks one store's wire format and normalizes it
//! into [`Review`] values; pagination differences are hidden behind
//! [`PageCursor`]. The insight generator turns a review bucket into a
//! structured insight through an OpenAI-compatible chat endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reviewlens_core::{
    JobOptions, NegativeInsight, PositiveInsight, Review, Sentiment, StoreKind,
};
use reviewlens_storage::{FetchError, HttpFetcher, PageArtifactStore};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reviewlens-adapters";

/// The iTunes RSS feed serves at most this many pages per app.
pub const APPLE_RSS_PAGE_CAP: u32 = 10;

/// Character budget for the review corpus embedded in one prompt.
pub const PROMPT_CORPUS_BUDGET: usize = 8000;

// ---------------------------------------------------------------------------
// JSON value helpers

fn json_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

fn json_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    json_at(value, path).and_then(Value::as_str)
}

fn json_f64(value: &Value, path: &[&str]) -> Option<f64> {
    json_at(value, path).and_then(Value::as_f64)
}

// ---------------------------------------------------------------------------
// Review sources

/// Opaque position inside one source's paginated review feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// Before the first page.
    Start,
    /// Page-numbered feeds (iTunes RSS).
    PageNumber(u32),
    /// Continuation-token feeds (Play gateway).
    Token(String),
}

/// One fetched page: normalized reviews, the raw payload for archival,
/// and the cursor for the next page when the feed continues.
#[derive(Debug, Clone)]
pub struct ReviewPage {
    pub reviews: Vec<Review>,
    pub next: Option<PageCursor>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("review fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("malformed review payload: {0}")]
    Malformed(String),
}

/// A store-specific review feed. Implementations own URL construction,
/// payload parsing, and next-cursor derivation for exactly one store.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn store(&self) -> StoreKind;

    /// Upper bound on pages this feed can serve, before job options.
    fn page_cap(&self) -> u32 {
        u32::MAX
    }

    async fn fetch_page(
        &self,
        job_id: Uuid,
        app_id: &str,
        options: &JobOptions,
        cursor: &PageCursor,
    ) -> Result<ReviewPage, SourceError>;
}

/// App Store reviews via the public iTunes customer-reviews RSS feed.
pub struct AppleRssSource {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl AppleRssSource {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(fetcher, "https://itunes.apple.com")
    }

    pub fn with_base_url(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn page_url(&self, app_id: &str, country: &str, page: u32) -> String {
        format!(
            "{}/{}/rss/customerreviews/page={}/id={}/sortby=mostrecent/json",
            self.base_url, country, page, app_id
        )
    }
}

/// Parse one iTunes RSS JSON page into normalized reviews.
///
/// The first feed entry is often the app's own metadata; anything without
/// an `im:rating` is skipped rather than treated as malformed.
pub fn parse_apple_feed(bytes: &[u8]) -> Result<Vec<Review>, SourceError> {
    let payload: Value = serde_json::from_slice(bytes)
        .map_err(|err| SourceError::Malformed(format!("invalid feed json: {err}")))?;

    let entries = match json_at(&payload, &["feed", "entry"]) {
        Some(Value::Array(entries)) => entries.as_slice(),
        // A single trailing entry arrives as an object, an exhausted page
        // omits the key entirely.
        Some(entry @ Value::Object(_)) => std::slice::from_ref(entry),
        Some(_) | None => &[],
    };

    let mut reviews = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(rating_label) = json_str(entry, &["im:rating", "label"]) else {
            continue;
        };
        let Ok(rating) = rating_label.trim().parse::<u8>() else {
            continue;
        };

        let title = json_str(entry, &["title", "label"]).unwrap_or_default();
        let content = json_str(entry, &["content", "label"]).unwrap_or_default();
        let author = json_str(entry, &["author", "name", "label"]).unwrap_or("Anonymous");
        let date = json_str(entry, &["updated", "label"])
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        reviews.push(Review::new(rating, title, content, author, date));
    }

    Ok(reviews)
}

#[async_trait]
impl ReviewSource for AppleRssSource {
    fn source_id(&self) -> &'static str {
        "apple"
    }

    fn store(&self) -> StoreKind {
        StoreKind::Apple
    }

    fn page_cap(&self) -> u32 {
        APPLE_RSS_PAGE_CAP
    }

    async fn fetch_page(
        &self,
        job_id: Uuid,
        app_id: &str,
        options: &JobOptions,
        cursor: &PageCursor,
    ) -> Result<ReviewPage, SourceError> {
        let page = match cursor {
            PageCursor::Start => 1,
            PageCursor::PageNumber(page) => *page,
            PageCursor::Token(_) => {
                return Err(SourceError::Malformed(
                    "apple rss feed is page-numbered, got a continuation token".to_string(),
                ))
            }
        };

        let url = self.page_url(app_id, &options.country, page);
        let response = self.fetcher.get_bytes(job_id, self.source_id(), &url).await?;
        let reviews = parse_apple_feed(&response.body)?;

        let next = if !reviews.is_empty() && page < self.page_cap() {
            Some(PageCursor::PageNumber(page + 1))
        } else {
            None
        };

        Ok(ReviewPage {
            reviews,
            next,
            raw: response.body,
        })
    }
}

/// Play Store reviews via a scraper gateway exposing a continuation-token
/// JSON API.
pub struct PlayGatewaySource {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl PlayGatewaySource {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn page_url(&self, app_id: &str, options: &JobOptions, cursor: &PageCursor) -> String {
        let mut url = format!(
            "{}/reviews?appId={}&country={}&num={}",
            self.base_url, app_id, options.country, options.page_size
        );
        if let PageCursor::Token(token) = cursor {
            url.push_str("&nextPaginationToken=");
            url.push_str(&urlencode(token));
        }
        url
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

/// Parse one Play gateway page into reviews plus the continuation token.
pub fn parse_play_payload(bytes: &[u8]) -> Result<(Vec<Review>, Option<String>), SourceError> {
    let payload: Value = serde_json::from_slice(bytes)
        .map_err(|err| SourceError::Malformed(format!("invalid gateway json: {err}")))?;

    let entries = match json_at(&payload, &["data"]) {
        Some(Value::Array(entries)) => entries.as_slice(),
        Some(_) => {
            return Err(SourceError::Malformed(
                "gateway `data` field is not an array".to_string(),
            ))
        }
        None => &[],
    };

    let mut reviews = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(score) = json_f64(entry, &["score"]) else {
            continue;
        };
        let rating = score.round().clamp(1.0, 5.0) as u8;

        let title = json_str(entry, &["title"]).unwrap_or_default();
        let content = json_str(entry, &["text"]).unwrap_or_default();
        let author = json_str(entry, &["userName"]).unwrap_or("Anonymous");
        let date = json_str(entry, &["date"])
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        reviews.push(Review::new(rating, title, content, author, date));
    }

    let token = json_str(&payload, &["nextPaginationToken"])
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    Ok((reviews, token))
}

#[async_trait]
impl ReviewSource for PlayGatewaySource {
    fn source_id(&self) -> &'static str {
        "google"
    }

    fn store(&self) -> StoreKind {
        StoreKind::GooglePlay
    }

    async fn fetch_page(
        &self,
        job_id: Uuid,
        app_id: &str,
        options: &JobOptions,
        cursor: &PageCursor,
    ) -> Result<ReviewPage, SourceError> {
        if let PageCursor::PageNumber(_) = cursor {
            return Err(SourceError::Malformed(
                "play gateway is token-paginated, got a page number".to_string(),
            ));
        }

        let url = self.page_url(app_id, options, cursor);
        let response = self.fetcher.get_bytes(job_id, self.source_id(), &url).await?;
        let (reviews, token) = parse_play_payload(&response.body)?;

        let next = match token {
            Some(token) if !reviews.is_empty() => Some(PageCursor::Token(token)),
            _ => None,
        };

        Ok(ReviewPage {
            reviews,
            next,
            raw: response.body,
        })
    }
}

// ---------------------------------------------------------------------------
// Fetch driver

/// Walk a source's feed from the start, archiving raw pages and reporting
/// progress in the 10..=55 band.
///
/// Stops when the feed ends, the page budget is spent, or pagination is
/// disabled (single page). Zero total reviews is a valid outcome here;
/// the caller decides whether that fails the job.
pub async fn fetch_all_reviews(
    source: &dyn ReviewSource,
    artifacts: Option<&PageArtifactStore>,
    job_id: Uuid,
    app_id: &str,
    options: &JobOptions,
    mut on_progress: impl FnMut(u8, String) + Send,
) -> Result<Vec<Review>, SourceError> {
    let planned_pages = if options.use_pagination {
        options.max_pages.clamp(1, source.page_cap())
    } else {
        1
    };

    let mut all = Vec::new();
    let mut cursor = PageCursor::Start;
    let mut pages_done: u32 = 0;

    loop {
        let page = source.fetch_page(job_id, app_id, options, &cursor).await?;
        pages_done += 1;

        if options.per_page_save {
            if let Some(store) = artifacts {
                if let Err(err) = store
                    .store_page(Utc::now(), source.store(), app_id, &page.raw)
                    .await
                {
                    // Archival is best-effort; the job keeps its reviews.
                    warn!(%job_id, app_id, page = pages_done, error = %err, "failed to archive review page");
                }
            }
        }

        all.extend(page.reviews);

        let percent = fetch_percent(pages_done, planned_pages);
        on_progress(
            percent,
            format!("Fetched page {pages_done} ({} reviews so far)", all.len()),
        );
        debug!(%job_id, app_id, page = pages_done, reviews = all.len(), "review page fetched");

        match page.next {
            Some(next) if pages_done < planned_pages => cursor = next,
            _ => break,
        }
    }

    Ok(all)
}

fn fetch_percent(pages_done: u32, planned_pages: u32) -> u8 {
    let planned = planned_pages.max(1) as u64;
    let done = (pages_done as u64).min(planned);
    (10 + (done * 45) / planned) as u8
}

// ---------------------------------------------------------------------------
// Insight generation

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("insight request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("insight response malformed: {0}")]
    Malformed(String),
}

/// A chat-completion backend. One call per insight; prompt construction
/// and response parsing stay on this side of the seam.
#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn complete(
        &self,
        job_id: Uuid,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, InsightError>;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiInsightGenerator {
    fetcher: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiInsightGenerator {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl InsightGenerator for OpenAiInsightGenerator {
    async fn complete(
        &self,
        job_id: Uuid,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, InsightError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "temperature": 0.3,
        });

        let response = self
            .fetcher
            .post_json(job_id, "insight", &url, Some(&self.api_key), &body)
            .await?;

        let payload: Value = serde_json::from_slice(&response.body)
            .map_err(|err| InsightError::Malformed(format!("invalid completion json: {err}")))?;

        let content = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| json_str(c, &["message", "content"]))
            .ok_or_else(|| {
                InsightError::Malformed("completion missing choices[0].message.content".to_string())
            })?;

        Ok(content.to_string())
    }
}

pub const POSITIVE_SYSTEM_PROMPT: &str = "You are an expert app review analyst. \
Summarize what users love about the app from the positive reviews provided. \
Respond with a single JSON object and nothing else, using exactly these keys: \
\"topFeatures\" (array of strings), \"positiveExperiences\" (array of strings), \
\"userAppreciation\" (array of strings), \"strengthHighlights\" (array of strings).";

pub const NEGATIVE_SYSTEM_PROMPT: &str = "You are an expert app review analyst. \
Summarize what frustrates users from the negative reviews provided. \
Respond with a single JSON object and nothing else, using exactly these keys: \
\"topIssues\" (array of strings), \"criticalProblems\" (array of strings), \
\"suggestedImprovements\" (array of objects with \"issue\", \"improvement\" and \
\"priority\" string fields), \"priorityActions\" (array of strings).";

/// Concatenate reviews into a prompt corpus in batch order, stopping at
/// the character budget. A review either fits whole or is dropped with
/// everything after it.
pub fn build_prompt_corpus(reviews: &[Review], budget: usize) -> String {
    let mut corpus = String::new();
    for review in reviews {
        let block = format!(
            "Rating: {}/5\nTitle: {}\nContent: {}\n\n",
            review.rating, review.title, review.content
        );
        if corpus.len() + block.len() > budget {
            break;
        }
        corpus.push_str(&block);
    }
    corpus
}

/// Strip a Markdown code fence wrapper, if the model added one.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

/// Distill the positive bucket into a [`PositiveInsight`].
///
/// Any failure degrades to the default-empty insight: a flaky model must
/// not fail a job whose counts and percentages are already computed.
pub async fn summarize_positive(
    generator: &dyn InsightGenerator,
    job_id: Uuid,
    reviews: &[Review],
) -> PositiveInsight {
    debug_assert!(reviews.iter().all(|r| r.sentiment == Sentiment::Positive));
    let corpus = build_prompt_corpus(reviews, PROMPT_CORPUS_BUDGET);
    match generator
        .complete(job_id, POSITIVE_SYSTEM_PROMPT, &corpus)
        .await
    {
        Ok(raw) => match serde_json::from_str(strip_code_fence(&raw)) {
            Ok(insight) => insight,
            Err(err) => {
                warn!(%job_id, error = %err, "positive insight did not parse, using empty insight");
                PositiveInsight::default()
            }
        },
        Err(err) => {
            warn!(%job_id, error = %err, "positive insight generation failed, using empty insight");
            PositiveInsight::default()
        }
    }
}

/// Distill the negative bucket into a [`NegativeInsight`]; same degrade
/// behavior as [`summarize_positive`].
pub async fn summarize_negative(
    generator: &dyn InsightGenerator,
    job_id: Uuid,
    reviews: &[Review],
) -> NegativeInsight {
    debug_assert!(reviews.iter().all(|r| r.sentiment == Sentiment::Negative));
    let corpus = build_prompt_corpus(reviews, PROMPT_CORPUS_BUDGET);
    match generator
        .complete(job_id, NEGATIVE_SYSTEM_PROMPT, &corpus)
        .await
    {
        Ok(raw) => match serde_json::from_str(strip_code_fence(&raw)) {
            Ok(insight) => insight,
            Err(err) => {
                warn!(%job_id, error = %err, "negative insight did not parse, using empty insight");
                NegativeInsight::default()
            }
        },
        Err(err) => {
            warn!(%job_id, error = %err, "negative insight generation failed, using empty insight");
            NegativeInsight::default()
        }
    }
}

/// Drive a future to completion while invoking `tick` on a fixed cadence,
/// so long-running insight calls keep reporting liveness.
pub async fn with_heartbeat<T>(
    future: impl std::future::Future<Output = T>,
    every: Duration,
    mut tick: impl FnMut(),
) -> T {
    tokio::pin!(future);
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            out = &mut future => return out,
            _ = interval.tick() => tick(),
        }
    }
}

// ---------------------------------------------------------------------------
// Credit ledger

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("insufficient credit: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("unknown account {0}")]
    UnknownAccount(String),
    #[error("credit backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Account balances and atomic debits. The debit must be all-or-nothing:
/// concurrent submissions may race, but a balance never goes negative.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, account_id: &str) -> Result<i64, CreditError>;

    /// Debit `amount`, returning the new balance. Fails with
    /// [`CreditError::InsufficientFunds`] without changing the balance.
    async fn debit(&self, account_id: &str, amount: i64) -> Result<i64, CreditError>;

    async fn credit(&self, account_id: &str, amount: i64) -> Result<i64, CreditError>;
}

/// In-process ledger used in tests and single-node deployments without a
/// database.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    balances: tokio::sync::Mutex<std::collections::HashMap<String, i64>>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_balance(&self, account_id: &str, balance: i64) {
        self.balances
            .lock()
            .await
            .insert(account_id.to_string(), balance);
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn balance(&self, account_id: &str) -> Result<i64, CreditError> {
        let balances = self.balances.lock().await;
        balances
            .get(account_id)
            .copied()
            .ok_or_else(|| CreditError::UnknownAccount(account_id.to_string()))
    }

    async fn debit(&self, account_id: &str, amount: i64) -> Result<i64, CreditError> {
        let mut balances = self.balances.lock().await;
        let balance = balances
            .get_mut(account_id)
            .ok_or_else(|| CreditError::UnknownAccount(account_id.to_string()))?;
        if *balance < amount {
            return Err(CreditError::InsufficientFunds {
                balance: *balance,
                required: amount,
            });
        }
        *balance -= amount;
        Ok(*balance)
    }

    async fn credit(&self, account_id: &str, amount: i64) -> Result<i64, CreditError> {
        let mut balances = self.balances.lock().await;
        let balance = balances.entry(account_id.to_string()).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reviewlens_core::Sentiment;

    const APPLE_FEED: &str = r#"{
        "feed": {
            "entry": [
                {
                    "im:name": { "label": "Some App" },
                    "rights": { "label": "(c) example" }
                },
                {
                    "im:rating": { "label": "5" },
                    "title": { "label": "Love it" },
                    "content": { "label": "Works flawlessly every day." },
                    "author": { "name": { "label": "happyuser" } },
                    "updated": { "label": "2026-08-01T10:30:00-07:00" }
                },
                {
                    "im:rating": { "label": "1" },
                    "title": { "label": "Crashes" },
                    "content": { "label": "Crashes on launch after the update." },
                    "author": { "name": { "label": "sadpanda" } },
                    "updated": { "label": "2026-08-02T08:00:00-07:00" }
                }
            ]
        }
    }"#;

    #[test]
    fn apple_feed_skips_metadata_entry_and_parses_ratings() {
        let reviews = parse_apple_feed(APPLE_FEED.as_bytes()).expect("parse");
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].rating, 5);
        assert_eq!(reviews[0].sentiment, Sentiment::Positive);
        assert_eq!(reviews[0].author, "happyuser");
        assert!(reviews[0].date.is_some());
        assert_eq!(reviews[1].rating, 1);
        assert_eq!(reviews[1].sentiment, Sentiment::Negative);
    }

    #[test]
    fn apple_feed_without_entries_is_empty_not_an_error() {
        let reviews = parse_apple_feed(br#"{"feed":{"author":{}}}"#).expect("parse");
        assert!(reviews.is_empty());
    }

    #[test]
    fn apple_feed_single_object_entry_parses() {
        let feed = r#"{"feed":{"entry":{
            "im:rating": { "label": "3" },
            "title": { "label": "meh" },
            "content": { "label": "it is fine" },
            "author": { "name": { "label": "shrug" } }
        }}}"#;
        let reviews = parse_apple_feed(feed.as_bytes()).expect("parse");
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].sentiment, Sentiment::Neutral);
        assert!(reviews[0].date.is_none());
    }

    #[test]
    fn play_payload_parses_reviews_and_token() {
        let payload = r#"{
            "data": [
                { "score": 4.0, "title": "Good", "text": "Solid app", "userName": "a", "date": "2026-07-01T00:00:00Z" },
                { "score": 2.0, "title": "", "text": "Battery drain", "userName": "b", "date": "not-a-date" }
            ],
            "nextPaginationToken": "tok=123"
        }"#;
        let (reviews, token) = parse_play_payload(payload.as_bytes()).expect("parse");
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].sentiment, Sentiment::Positive);
        assert!(reviews[1].date.is_none());
        assert_eq!(token.as_deref(), Some("tok=123"));
    }

    #[test]
    fn play_payload_empty_token_means_feed_end() {
        let payload = r#"{ "data": [], "nextPaginationToken": "" }"#;
        let (reviews, token) = parse_play_payload(payload.as_bytes()).expect("parse");
        assert!(reviews.is_empty());
        assert!(token.is_none());
    }

    #[test]
    fn prompt_corpus_respects_character_budget() {
        let reviews: Vec<Review> = (0..50)
            .map(|i| Review::new(5, format!("title {i}"), "x".repeat(300), "author", None))
            .collect();
        let corpus = build_prompt_corpus(&reviews, PROMPT_CORPUS_BUDGET);
        assert!(corpus.len() <= PROMPT_CORPUS_BUDGET);
        assert!(corpus.starts_with("Rating: 5/5\nTitle: title 0\n"));
        // Budget admits whole blocks only.
        assert!(corpus.ends_with("\n\n"));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn negative_insight_parses_camel_case_schema() {
        let raw = r#"{
            "topIssues": ["crashes"],
            "criticalProblems": ["data loss on sync"],
            "suggestedImprovements": [
                { "issue": "crashes", "improvement": "fix the launch crash", "priority": "high" }
            ],
            "priorityActions": ["ship a hotfix"]
        }"#;
        let insight: NegativeInsight = serde_json::from_str(raw).expect("parse");
        assert_eq!(insight.top_issues, vec!["crashes"]);
        assert_eq!(insight.suggested_improvements[0].priority, "high");
    }

    #[test]
    fn partial_insight_json_fills_defaults() {
        let insight: PositiveInsight =
            serde_json::from_str(r#"{ "topFeatures": ["offline mode"] }"#).expect("parse");
        assert_eq!(insight.top_features, vec!["offline mode"]);
        assert!(insight.strength_highlights.is_empty());
    }

    struct FailingGenerator;

    #[async_trait]
    impl InsightGenerator for FailingGenerator {
        async fn complete(&self, _: Uuid, _: &str, _: &str) -> Result<String, InsightError> {
            Err(InsightError::Malformed("boom".to_string()))
        }
    }

    struct FencedGenerator;

    #[async_trait]
    impl InsightGenerator for FencedGenerator {
        async fn complete(&self, _: Uuid, _: &str, _: &str) -> Result<String, InsightError> {
            Ok("```json\n{\"topFeatures\":[\"speed\"]}\n```".to_string())
        }
    }

    #[tokio::test]
    async fn generator_failure_degrades_to_empty_insight() {
        let reviews = vec![Review::new(5, "t", "c", "a", None)];
        let insight = summarize_positive(&FailingGenerator, Uuid::new_v4(), &reviews).await;
        assert_eq!(insight, PositiveInsight::default());
    }

    #[tokio::test]
    async fn fenced_generator_output_still_parses() {
        let reviews = vec![Review::new(4, "t", "c", "a", None)];
        let insight = summarize_positive(&FencedGenerator, Uuid::new_v4(), &reviews).await;
        assert_eq!(insight.top_features, vec!["speed"]);
    }

    struct ScriptedSource {
        pages: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl ReviewSource for ScriptedSource {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        fn store(&self) -> StoreKind {
            StoreKind::GooglePlay
        }

        async fn fetch_page(
            &self,
            _job_id: Uuid,
            _app_id: &str,
            _options: &JobOptions,
            cursor: &PageCursor,
        ) -> Result<ReviewPage, SourceError> {
            let index = match cursor {
                PageCursor::Start => 0,
                PageCursor::Token(token) => token.parse::<usize>().unwrap(),
                PageCursor::PageNumber(_) => panic!("scripted source is token-based"),
            };
            let raw = self.pages[index].clone();
            let (reviews, _) = parse_play_payload(&raw)?;
            let next = if index + 1 < self.pages.len() {
                Some(PageCursor::Token((index + 1).to_string()))
            } else {
                None
            };
            Ok(ReviewPage { reviews, next, raw })
        }
    }

    fn play_page(score: f64, token: Option<&str>) -> Vec<u8> {
        let token = token.map(str::to_string);
        serde_json::to_vec(&serde_json::json!({
            "data": [{ "score": score, "title": "t", "text": "c", "userName": "u" }],
            "nextPaginationToken": token,
        }))
        .expect("encode page")
    }

    #[tokio::test]
    async fn driver_walks_all_pages_and_reports_monotone_progress() {
        let source = ScriptedSource {
            pages: vec![
                play_page(5.0, Some("1")),
                play_page(3.0, Some("2")),
                play_page(1.0, None),
            ],
        };

        let mut reported = Vec::new();
        let reviews = fetch_all_reviews(
            &source,
            None,
            Uuid::new_v4(),
            "com.example.app",
            &JobOptions::default(),
            |percent, _message| reported.push(percent),
        )
        .await
        .expect("fetch");

        assert_eq!(reviews.len(), 3);
        assert_eq!(reported.len(), 3);
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert!(reported.iter().all(|&p| (10..=55).contains(&p)));
    }

    #[tokio::test]
    async fn driver_honors_max_pages_budget() {
        let source = ScriptedSource {
            pages: vec![
                play_page(5.0, Some("1")),
                play_page(4.0, Some("2")),
                play_page(3.0, None),
            ],
        };

        let options = JobOptions {
            max_pages: 2,
            ..JobOptions::default()
        };
        let reviews = fetch_all_reviews(
            &source,
            None,
            Uuid::new_v4(),
            "com.example.app",
            &options,
            |_, _| {},
        )
        .await
        .expect("fetch");

        assert_eq!(reviews.len(), 2);
    }

    #[tokio::test]
    async fn driver_archives_pages_when_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifacts = PageArtifactStore::new(dir.path());
        let source = ScriptedSource {
            pages: vec![play_page(5.0, None)],
        };

        let reviews = fetch_all_reviews(
            &source,
            Some(&artifacts),
            Uuid::new_v4(),
            "com.example.app",
            &JobOptions::default(),
            |_, _| {},
        )
        .await
        .expect("fetch");

        assert_eq!(reviews.len(), 1);
        let mut found = 0;
        for entry in walkdir(dir.path()) {
            if entry.extension().map(|e| e == "json").unwrap_or(false) {
                found += 1;
            }
        }
        assert_eq!(found, 1);
    }

    fn walkdir(root: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).expect("read_dir") {
                let path = entry.expect("entry").path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn heartbeat_ticks_while_future_is_pending() {
        tokio::time::pause();
        let mut ticks = 0;
        let _ = with_heartbeat(
            tokio::time::sleep(Duration::from_millis(1600)),
            Duration::from_millis(500),
            || ticks += 1,
        )
        .await;
        assert!(ticks >= 2, "expected heartbeats during a slow call, got {ticks}");
    }

    #[tokio::test]
    async fn ledger_rejects_overdraft_without_mutation() {
        let ledger = InMemoryCreditLedger::new();
        ledger.set_balance("acct", 1).await;

        let err = ledger.debit("acct", 2).await.expect_err("overdraft");
        match err {
            CreditError::InsufficientFunds { balance, required } => {
                assert_eq!(balance, 1);
                assert_eq!(required, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(ledger.balance("acct").await.expect("balance"), 1);

        assert_eq!(ledger.debit("acct", 1).await.expect("debit"), 0);
    }
}
