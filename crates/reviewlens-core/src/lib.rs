//! Core domain model for ReviewLens: reviews, jobs, and analysis artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reviewlens-core";

/// Which store an app (and its reviews) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Apple,
    #[serde(rename = "google")]
    GooglePlay,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Apple => "apple",
            StoreKind::GooglePlay => "google",
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentiment label derived from the star rating, not from text analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    /// Ratings of 4-5 are positive, 1-2 negative, 3 neutral.
    pub fn from_rating(rating: u8) -> Self {
        if rating >= 4 {
            Sentiment::Positive
        } else if rating <= 2 {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        }
    }
}

/// One fetched review, attributed to exactly one `(app_id, store)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub rating: u8,
    pub title: String,
    pub content: String,
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    pub sentiment: Sentiment,
}

impl Review {
    pub fn new(
        rating: u8,
        title: impl Into<String>,
        content: impl Into<String>,
        author: impl Into<String>,
        date: Option<DateTime<Utc>>,
    ) -> Self {
        let rating = rating.clamp(1, 5);
        Self {
            rating,
            title: title.into(),
            content: content.into(),
            author: author.into(),
            date,
            sentiment: Sentiment::from_rating(rating),
        }
    }
}

/// Job lifecycle states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    FetchingReviews,
    Analyzing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One entry in a job's append-only progress stream. The job's current
/// progress is always the last event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub at: DateTime<Utc>,
    pub status: JobStatus,
    pub percent: u8,
    pub message: String,
}

/// Per-job fetch tuning, defaulted from the submission payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub country: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub use_pagination: bool,
    pub per_page_save: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            country: "us".to_string(),
            page_size: 100,
            max_pages: 100,
            use_pagination: true,
            per_page_save: true,
        }
    }
}

/// Unit of work: one analysis request for one `(app_id, store)` pair.
///
/// `result` and `error` are mutually exclusive and stay `None` until a
/// terminal status. The owning `(app_id, store)` pair never changes after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub app_id: String,
    pub store: StoreKind,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub options: JobOptions,
    pub result: Option<CompositeAnalysis>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<ProgressEvent>,
}

impl Job {
    pub fn new(app_id: impl Into<String>, store: StoreKind, options: JobOptions) -> Self {
        let now = Utc::now();
        let message = "Job created".to_string();
        Self {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            store,
            status: JobStatus::Pending,
            progress: 0,
            message: message.clone(),
            options,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            events: vec![ProgressEvent {
                at: now,
                status: JobStatus::Pending,
                percent: 0,
                message,
            }],
        }
    }

    /// Synthesize an already-terminal job wrapping a cached analysis so a
    /// cache hit looks like a just-finished run to pollers.
    pub fn completed_from_cache(analysis: CompositeAnalysis) -> Self {
        let now = Utc::now();
        let message = "Served from cached analysis".to_string();
        Self {
            id: Uuid::new_v4(),
            app_id: analysis.app_id.clone(),
            store: analysis.store,
            status: JobStatus::Completed,
            progress: 100,
            message: message.clone(),
            options: JobOptions::default(),
            result: Some(analysis),
            error: None,
            created_at: now,
            updated_at: now,
            events: vec![ProgressEvent {
                at: now,
                status: JobStatus::Completed,
                percent: 100,
                message,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Aggregate counts and percentages over one fetched review set.
///
/// Percentages use `total_reviews` (neutral included) as the denominator,
/// so positive + negative + neutral percentages always sum to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentSummary {
    pub total_reviews: usize,
    pub positive_count: usize,
    pub negative_count: usize,
    pub neutral_count: usize,
    pub average_rating: f64,
    pub positive_percentage: f64,
    pub negative_percentage: f64,
}

impl SentimentSummary {
    pub fn from_reviews(reviews: &[Review]) -> Self {
        let total = reviews.len();
        let positive = reviews
            .iter()
            .filter(|r| r.sentiment == Sentiment::Positive)
            .count();
        let negative = reviews
            .iter()
            .filter(|r| r.sentiment == Sentiment::Negative)
            .count();
        let neutral = total - positive - negative;
        let average_rating = if total == 0 {
            0.0
        } else {
            reviews.iter().map(|r| f64::from(r.rating)).sum::<f64>() / total as f64
        };
        let pct = |count: usize| {
            if total == 0 {
                0.0
            } else {
                (count as f64 / total as f64) * 100.0
            }
        };
        Self {
            total_reviews: total,
            positive_count: positive,
            negative_count: negative,
            neutral_count: neutral,
            average_rating,
            positive_percentage: pct(positive),
            negative_percentage: pct(negative),
        }
    }
}

/// Structured insight extracted from the positive review bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PositiveInsight {
    pub top_features: Vec<String>,
    pub positive_experiences: Vec<String>,
    pub user_appreciation: Vec<String>,
    pub strength_highlights: Vec<String>,
}

/// One prioritized improvement proposal inside a [`NegativeInsight`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SuggestedImprovement {
    pub issue: String,
    pub improvement: String,
    pub priority: String,
}

/// Structured insight extracted from the negative review bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NegativeInsight {
    pub top_issues: Vec<String>,
    pub critical_problems: Vec<String>,
    pub suggested_improvements: Vec<SuggestedImprovement>,
    pub priority_actions: Vec<String>,
}

/// The durable, overwritable analysis artifact for one app/store pair.
/// A point-in-time cache, not a history: each successful run replaces the
/// prior entry for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeAnalysis {
    pub app_id: String,
    pub store: StoreKind,
    pub summary: SentimentSummary,
    pub positive_insight: Option<PositiveInsight>,
    pub negative_insight: Option<NegativeInsight>,
    pub generated_at: DateTime<Utc>,
}

/// A normalized app identifier with its detected store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedApp {
    pub app_id: String,
    pub store: StoreKind,
}

/// Normalize a raw user-supplied identifier into `(app_id, store)`.
///
/// Accepts Apple numeric ids ("284882215"), Apple store URLs, Android
/// package names ("com.example.app"), and Google Play URLs. Returns `None`
/// when the store cannot be determined.
pub fn detect_store(raw: &str) -> Option<DetectedApp> {
    let input = raw.trim();
    if input.is_empty() {
        return None;
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        if let Some(found) = detect_store_from_url(input) {
            return Some(found);
        }
    }

    if input.len() >= 5 && input.bytes().all(|b| b.is_ascii_digit()) {
        return Some(DetectedApp {
            app_id: input.to_string(),
            store: StoreKind::Apple,
        });
    }

    if is_android_package(input) {
        return Some(DetectedApp {
            app_id: input.to_string(),
            store: StoreKind::GooglePlay,
        });
    }

    extract_apple_numeric_id(input).map(|id| DetectedApp {
        app_id: id,
        store: StoreKind::Apple,
    })
}

fn detect_store_from_url(input: &str) -> Option<DetectedApp> {
    let without_scheme = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))?;
    let (host, rest) = match without_scheme.find('/') {
        Some(idx) => (&without_scheme[..idx], &without_scheme[idx..]),
        None => (without_scheme, ""),
    };
    let host = host.to_ascii_lowercase();

    if host.ends_with("play.google.com") {
        let package = query_param(rest, "id")?;
        if is_android_package(&package) {
            return Some(DetectedApp {
                app_id: package,
                store: StoreKind::GooglePlay,
            });
        }
        return None;
    }

    if host.ends_with("apps.apple.com") {
        return extract_apple_numeric_id(rest).map(|id| DetectedApp {
            app_id: id,
            store: StoreKind::Apple,
        });
    }

    None
}

fn query_param(path_and_query: &str, name: &str) -> Option<String> {
    let query = path_and_query.split_once('?')?.1;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Java package-name heuristic: at least two dot-separated segments of
/// letters/digits/underscores, the first starting with a letter.
fn is_android_package(input: &str) -> bool {
    let mut segments = input.split('.');
    let Some(first) = segments.next() else {
        return false;
    };
    let mut first_chars = first.chars();
    match first_chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    if !first_chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return false;
    }
    let mut seen_more = false;
    for segment in segments {
        if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        seen_more = true;
    }
    seen_more
}

/// Pull the first `id<digits>` run of at least five digits out of a string.
fn extract_apple_numeric_id(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find("id") {
        let digits_start = search_from + pos + 2;
        let digits: String = lower[digits_start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.len() >= 5 {
            return Some(digits);
        }
        if digits_start >= lower.len() {
            break;
        }
        search_from = digits_start;
    }
    None
}
