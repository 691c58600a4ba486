//! Job pipeline: the submission gate, the in-process job table, the
//! analysis orchestrator, and terminal-job garbage collection.
//!
//! One submission flows gate -> job table -> fetch stage -> analyze stage
//! -> durable analysis. Progress is an append-only event stream per job
//! and only ever moves forward; polling clients can treat any decrease as
//! a bug on this side.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reviewlens_adapters::{
    fetch_all_reviews, summarize_negative, summarize_positive, with_heartbeat, CreditError,
    CreditLedger, InsightGenerator, ReviewSource, SourceError,
};
use reviewlens_core::{
    detect_store, CompositeAnalysis, Job, JobOptions, JobStatus, ProgressEvent, Review, Sentiment,
    SentimentSummary, StoreKind,
};
use reviewlens_storage::{AnalysisStore, AnalysisStoreError, PageArtifactStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reviewlens-pipeline";

/// Credits debited for one accepted analysis job.
pub const JOB_CREDIT_COST: i64 = 1;

const HEARTBEAT_EVERY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub cache_ttl: chrono::Duration,
    pub job_retention: chrono::Duration,
    pub gc_cron: String,
    pub max_concurrent_jobs: usize,
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_ttl: chrono::Duration::hours(24),
            job_retention: chrono::Duration::hours(24),
            gc_cron: "0 0 * * * *".to_string(),
            max_concurrent_jobs: 4,
            stage_timeout: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_dir = std::env::var("REVIEWLENS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        Self {
            data_dir,
            cache_ttl: chrono::Duration::hours(env_parse("REVIEWLENS_CACHE_TTL_HOURS", 24)),
            job_retention: chrono::Duration::hours(env_parse("REVIEWLENS_JOB_RETENTION_HOURS", 24)),
            gc_cron: std::env::var("REVIEWLENS_GC_CRON").unwrap_or(defaults.gc_cron),
            max_concurrent_jobs: env_parse("REVIEWLENS_MAX_CONCURRENT_JOBS", 4),
            stage_timeout: Duration::from_secs(env_parse("REVIEWLENS_STAGE_TIMEOUT_SECS", 300)),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(err) => {
                warn!(key, raw, %err, "invalid environment value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Job table

#[derive(Debug, Error)]
pub enum AdvanceError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} already reached a terminal status")]
    Terminal(Uuid),
}

/// In-process job table. Single-writer semantics per job: only the
/// pipeline task advances a job, readers poll snapshots.
#[derive(Debug, Default)]
pub struct JobManager {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Job {
        let mut jobs = self.jobs.write().expect("job table poisoned");
        jobs.insert(job.id, job.clone());
        job
    }

    pub fn create(&self, app_id: impl Into<String>, store: StoreKind, options: JobOptions) -> Job {
        self.insert(Job::new(app_id, store, options))
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().expect("job table poisoned").get(&id).cloned()
    }

    /// All jobs ever submitted for an app, newest first.
    pub fn jobs_for_app(&self, app_id: &str) -> Vec<Job> {
        let jobs = self.jobs.read().expect("job table poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| job.app_id == app_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching
    }

    pub fn find_in_flight(&self, app_id: &str, store: StoreKind) -> Option<Job> {
        let jobs = self.jobs.read().expect("job table poisoned");
        jobs.values()
            .find(|job| job.app_id == app_id && job.store == store && !job.is_terminal())
            .cloned()
    }

    /// Move a job forward. Progress is clamped monotone: a percent below
    /// the current one reports the current one instead. Terminal jobs
    /// reject any further advance.
    pub fn advance(
        &self,
        id: Uuid,
        status: JobStatus,
        percent: u8,
        message: impl Into<String>,
    ) -> Result<Job, AdvanceError> {
        let mut jobs = self.jobs.write().expect("job table poisoned");
        let job = jobs.get_mut(&id).ok_or(AdvanceError::NotFound(id))?;
        if job.is_terminal() {
            return Err(AdvanceError::Terminal(id));
        }

        let percent = if status == JobStatus::Completed {
            100
        } else {
            percent.min(99).max(job.progress)
        };
        let message = message.into();
        let now = Utc::now();

        job.status = status;
        job.progress = percent;
        job.message = message.clone();
        job.updated_at = now;
        job.events.push(ProgressEvent {
            at: now,
            status,
            percent,
            message,
        });
        Ok(job.clone())
    }

    pub fn complete(&self, id: Uuid, analysis: CompositeAnalysis) -> Result<Job, AdvanceError> {
        let mut jobs = self.jobs.write().expect("job table poisoned");
        let job = jobs.get_mut(&id).ok_or(AdvanceError::NotFound(id))?;
        if job.is_terminal() {
            return Err(AdvanceError::Terminal(id));
        }

        let now = Utc::now();
        let message = "Analysis complete".to_string();
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.message = message.clone();
        job.result = Some(analysis);
        job.updated_at = now;
        job.events.push(ProgressEvent {
            at: now,
            status: JobStatus::Completed,
            percent: 100,
            message,
        });
        Ok(job.clone())
    }

    /// Fail a job, keeping the last reported progress so a client can see
    /// how far it got.
    pub fn fail(&self, id: Uuid, error: impl Into<String>) -> Result<Job, AdvanceError> {
        let mut jobs = self.jobs.write().expect("job table poisoned");
        let job = jobs.get_mut(&id).ok_or(AdvanceError::NotFound(id))?;
        if job.is_terminal() {
            return Err(AdvanceError::Terminal(id));
        }

        let error = error.into();
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.message = format!("Job failed: {error}");
        job.error = Some(error);
        job.updated_at = now;
        job.events.push(ProgressEvent {
            at: now,
            status: JobStatus::Failed,
            percent: job.progress,
            message: job.message.clone(),
        });
        Ok(job.clone())
    }

    /// Drop terminal jobs untouched for longer than `retention`. Running
    /// jobs are never collected regardless of age.
    pub fn gc(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut jobs = self.jobs.write().expect("job table poisoned");
        let before = jobs.len();
        jobs.retain(|_, job| !(job.is_terminal() && job.updated_at < cutoff));
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().expect("job table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hourly (by default) sweep of expired terminal jobs.
pub async fn build_gc_scheduler(
    manager: Arc<JobManager>,
    retention: chrono::Duration,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .context("creating gc scheduler")?;
    let sweep = CronJob::new_async(cron, move |_id, _scheduler| {
        let manager = Arc::clone(&manager);
        Box::pin(async move {
            let removed = manager.gc(retention);
            if removed > 0 {
                info!(removed, "collected expired terminal jobs");
            }
        })
    })
    .context("building gc cron job")?;
    scheduler.add(sweep).await.context("scheduling gc job")?;
    Ok(scheduler)
}

// ---------------------------------------------------------------------------
// Errors

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no reviews found for {app_id}")]
    NoReviewsFound { app_id: String },
    #[error("review fetch failed: {0}")]
    Source(#[from] SourceError),
    #[error("{stage} stage timed out after {seconds}s")]
    StageTimeout { stage: &'static str, seconds: u64 },
    #[error("persisting analysis failed: {0}")]
    Analysis(#[from] AnalysisStoreError),
    #[error(transparent)]
    Job(#[from] AdvanceError),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("could not recognize {0:?} as an app id or store url")]
    InvalidApp(String),
    #[error("insufficient credit: balance {balance}, required {required}")]
    InsufficientCredit { balance: i64, required: i64 },
    #[error("unknown account {0}")]
    UnknownAccount(String),
    #[error("credit ledger failure: {0}")]
    Ledger(#[source] anyhow::Error),
    #[error("analysis cache read failed: {0}")]
    Cache(#[from] AnalysisStoreError),
}

// ---------------------------------------------------------------------------
// Pipeline

/// How [`Pipeline::submit`] satisfied a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    /// A fresh cached analysis was returned as an already-completed job.
    CacheHit,
    /// An in-flight job for the same app was returned instead of a new one.
    Deduplicated,
    /// A new job was created and scheduled.
    Created,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    pub kind: SubmitKind,
}

/// Everything one analysis run needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct Pipeline {
    pub manager: Arc<JobManager>,
    analysis_store: AnalysisStore,
    artifacts: PageArtifactStore,
    apple: Arc<dyn ReviewSource>,
    google: Arc<dyn ReviewSource>,
    generator: Arc<dyn InsightGenerator>,
    ledger: Arc<dyn CreditLedger>,
    job_slots: Arc<Semaphore>,
    submit_lock: Arc<Mutex<()>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        apple: Arc<dyn ReviewSource>,
        google: Arc<dyn ReviewSource>,
        generator: Arc<dyn InsightGenerator>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self {
            manager: Arc::new(JobManager::new()),
            analysis_store: AnalysisStore::new(config.data_dir.join("analyses")),
            artifacts: PageArtifactStore::new(config.data_dir.join("pages")),
            apple,
            google,
            generator,
            ledger,
            job_slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            submit_lock: Arc::new(Mutex::new(())),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn analysis_store(&self) -> &AnalysisStore {
        &self.analysis_store
    }

    pub fn ledger(&self) -> &dyn CreditLedger {
        self.ledger.as_ref()
    }

    fn source_for(&self, store: StoreKind) -> &Arc<dyn ReviewSource> {
        match store {
            StoreKind::Apple => &self.apple,
            StoreKind::GooglePlay => &self.google,
        }
    }

    /// The submission gate. In order: normalize the identifier, serve a
    /// fresh cached analysis, return an in-flight duplicate, debit the
    /// account, and only then create and schedule a job.
    ///
    /// A cache hit or a deduplicated submission never debits credit.
    /// Anonymous submissions (no account) skip the ledger entirely.
    pub async fn submit(
        &self,
        account_id: Option<&str>,
        raw_app: &str,
        options: JobOptions,
        force_refresh: bool,
    ) -> Result<SubmitOutcome, SubmitError> {
        let detected =
            detect_store(raw_app).ok_or_else(|| SubmitError::InvalidApp(raw_app.to_string()))?;

        // Serializes dedup-check and debit so two racing submissions for
        // the same app cannot both pay.
        let _guard = self.submit_lock.lock().await;

        if !force_refresh {
            if let Some(analysis) = self
                .analysis_store
                .get_latest(&detected.app_id, detected.store)
                .await?
            {
                if analysis.generated_at > Utc::now() - self.config.cache_ttl {
                    let job = self.manager.insert(Job::completed_from_cache(analysis));
                    info!(job_id = %job.id, app_id = %detected.app_id, "submission served from cache");
                    return Ok(SubmitOutcome {
                        job,
                        kind: SubmitKind::CacheHit,
                    });
                }
            }
        }

        if let Some(job) = self.manager.find_in_flight(&detected.app_id, detected.store) {
            info!(job_id = %job.id, app_id = %detected.app_id, "submission joined an in-flight job");
            return Ok(SubmitOutcome {
                job,
                kind: SubmitKind::Deduplicated,
            });
        }

        let billed = match account_id {
            Some(account) => {
                match self.ledger.debit(account, JOB_CREDIT_COST).await {
                    Ok(remaining) => {
                        info!(account, remaining, "debited credit for new job");
                    }
                    Err(CreditError::InsufficientFunds { balance, required }) => {
                        return Err(SubmitError::InsufficientCredit { balance, required })
                    }
                    Err(CreditError::UnknownAccount(account)) => {
                        return Err(SubmitError::UnknownAccount(account))
                    }
                    Err(CreditError::Backend(err)) => return Err(SubmitError::Ledger(err)),
                }
                true
            }
            None => {
                info!(app_id = %detected.app_id, "anonymous submission, no debit");
                false
            }
        };

        let job = self
            .manager
            .create(detected.app_id.clone(), detected.store, options);
        info!(job_id = %job.id, app_id = %detected.app_id, store = %detected.store, "job created");

        let pipeline = self.clone();
        let job_id = job.id;
        tokio::spawn(async move { pipeline.run_job(job_id, billed).await });

        Ok(SubmitOutcome {
            job,
            kind: SubmitKind::Created,
        })
    }

    async fn run_job(self, job_id: Uuid, billed: bool) {
        let Ok(_permit) = self.job_slots.clone().acquire_owned().await else {
            return;
        };

        // The stages run in their own task so even a panic surfaces as a
        // Failed job instead of a silently aborted one.
        let stages = tokio::spawn({
            let pipeline = self.clone();
            async move { pipeline.execute_job(job_id).await }
        });
        let error = match stages.await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(join_err) => format!("pipeline task panicked: {join_err}"),
        };

        warn!(%job_id, error = %error, "job failed");
        if let Err(state_err) = self.manager.fail(job_id, error.clone()) {
            warn!(%job_id, error = %state_err, "could not record job failure");
        }
        // Debits are not refunded on failure; leave a trail for manual
        // reconciliation.
        if billed {
            warn!(%job_id, cost = JOB_CREDIT_COST, "credit was spent on a failed job");
        }
    }

    async fn execute_job(&self, job_id: Uuid) -> Result<(), PipelineError> {
        let job = self
            .manager
            .get(job_id)
            .ok_or(AdvanceError::NotFound(job_id))?;
        let source = self.source_for(job.store);

        self.manager
            .advance(job_id, JobStatus::FetchingReviews, 10, "Fetching reviews")?;

        let progress_manager = Arc::clone(&self.manager);
        let fetch = fetch_all_reviews(
            source.as_ref(),
            Some(&self.artifacts),
            job_id,
            &job.app_id,
            &job.options,
            move |percent, message| {
                if let Err(err) =
                    progress_manager.advance(job_id, JobStatus::FetchingReviews, percent, message)
                {
                    warn!(%job_id, error = %err, "dropping fetch progress update");
                }
            },
        );
        let reviews = tokio::time::timeout(self.config.stage_timeout, fetch)
            .await
            .map_err(|_| PipelineError::StageTimeout {
                stage: "review fetch",
                seconds: self.config.stage_timeout.as_secs(),
            })??;

        if reviews.is_empty() {
            return Err(PipelineError::NoReviewsFound { app_id: job.app_id });
        }

        self.manager.advance(
            job_id,
            JobStatus::Analyzing,
            60,
            format!("Analyzing {} reviews", reviews.len()),
        )?;

        let summary = SentimentSummary::from_reviews(&reviews);
        let positive: Vec<Review> = reviews
            .iter()
            .filter(|r| r.sentiment == Sentiment::Positive)
            .cloned()
            .collect();
        let negative: Vec<Review> = reviews
            .iter()
            .filter(|r| r.sentiment == Sentiment::Negative)
            .cloned()
            .collect();

        // One step per non-empty bucket plus the final summary step, so
        // sub-progress is weighted fairly regardless of bucket presence.
        let total_steps =
            usize::from(!positive.is_empty()) + usize::from(!negative.is_empty()) + 1;
        let mut completed_steps = 0usize;

        let positive_insight = if positive.is_empty() {
            None
        } else {
            let insight = self
                .insight_stage(
                    job_id,
                    "positive insight",
                    completed_steps,
                    total_steps,
                    summarize_positive(self.generator.as_ref(), job_id, &positive),
                )
                .await;
            completed_steps += 1;
            self.manager.advance(
                job_id,
                JobStatus::Analyzing,
                analyze_percent(completed_steps, total_steps, 0.0),
                "Positive insight ready",
            )?;
            Some(insight)
        };

        let negative_insight = if negative.is_empty() {
            None
        } else {
            let insight = self
                .insight_stage(
                    job_id,
                    "negative insight",
                    completed_steps,
                    total_steps,
                    summarize_negative(self.generator.as_ref(), job_id, &negative),
                )
                .await;
            completed_steps += 1;
            self.manager.advance(
                job_id,
                JobStatus::Analyzing,
                analyze_percent(completed_steps, total_steps, 0.0),
                "Negative insight ready",
            )?;
            Some(insight)
        };

        self.manager.advance(
            job_id,
            JobStatus::Analyzing,
            analyze_percent(completed_steps, total_steps, 0.0),
            "Saving analysis",
        )?;

        let analysis = CompositeAnalysis {
            app_id: job.app_id.clone(),
            store: job.store,
            summary,
            positive_insight,
            negative_insight,
            generated_at: Utc::now(),
        };

        self.analysis_store.upsert(&analysis).await?;
        self.manager.complete(job_id, analysis)?;
        info!(%job_id, app_id = %job.app_id, reviews = reviews.len(), "job completed");
        Ok(())
    }

    /// Run one insight call under the stage timeout, with heartbeat
    /// progress so a slow model still reads as alive to pollers. A
    /// timeout degrades to the default-empty insight instead of failing
    /// the job.
    async fn insight_stage<T: Default>(
        &self,
        job_id: Uuid,
        stage: &'static str,
        completed_steps: usize,
        total_steps: usize,
        fut: impl Future<Output = T>,
    ) -> T {
        let started = Instant::now();
        let manager = Arc::clone(&self.manager);
        let tick = move || {
            let elapsed = started.elapsed().as_secs_f64();
            // Asymptotic sub-progress: approaches but never reaches the
            // next step boundary.
            let sub = elapsed / (elapsed + 30.0);
            let percent = analyze_percent(completed_steps, total_steps, sub);
            let _ = manager.advance(
                job_id,
                JobStatus::Analyzing,
                percent,
                format!("Generating {stage}"),
            );
        };

        match tokio::time::timeout(
            self.config.stage_timeout,
            with_heartbeat(fut, HEARTBEAT_EVERY, tick),
        )
        .await
        {
            Ok(insight) => insight,
            Err(_) => {
                warn!(%job_id, stage, "insight stage timed out, using empty insight");
                T::default()
            }
        }
    }
}

/// Map analyze-stage steps into the 60..=89 progress band.
fn analyze_percent(completed_steps: usize, total_steps: usize, sub: f64) -> u8 {
    if total_steps == 0 {
        return 60;
    }
    let frac = ((completed_steps as f64 + sub.clamp(0.0, 1.0)) / total_steps as f64).clamp(0.0, 1.0);
    ((60.0 + frac * 30.0) as u8).min(89)
}

// ---------------------------------------------------------------------------
// Postgres credit ledger

/// Credit accounts backed by Postgres. The debit is one conditional
/// UPDATE, so concurrent debits serialize on the row and can never take
/// a balance negative.
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to credit database")?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running credit ledger migrations")?;
        Ok(())
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn balance(&self, account_id: &str) -> Result<i64, CreditError> {
        let row = sqlx::query("SELECT balance FROM credit_accounts WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| CreditError::Backend(err.into()))?;
        match row {
            Some(row) => row
                .try_get("balance")
                .map_err(|err| CreditError::Backend(err.into())),
            None => Err(CreditError::UnknownAccount(account_id.to_string())),
        }
    }

    async fn debit(&self, account_id: &str, amount: i64) -> Result<i64, CreditError> {
        let row = sqlx::query(
            "UPDATE credit_accounts \
             SET balance = balance - $2, updated_at = now() \
             WHERE account_id = $1 AND balance >= $2 \
             RETURNING balance",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| CreditError::Backend(err.into()))?;

        if let Some(row) = row {
            return row
                .try_get("balance")
                .map_err(|err| CreditError::Backend(err.into()));
        }

        // Refused: distinguish a missing account from a short balance.
        let balance = self.balance(account_id).await?;
        Err(CreditError::InsufficientFunds {
            balance,
            required: amount,
        })
    }

    async fn credit(&self, account_id: &str, amount: i64) -> Result<i64, CreditError> {
        let row = sqlx::query(
            "INSERT INTO credit_accounts (account_id, balance) VALUES ($1, $2) \
             ON CONFLICT (account_id) DO UPDATE \
             SET balance = credit_accounts.balance + EXCLUDED.balance, updated_at = now() \
             RETURNING balance",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| CreditError::Backend(err.into()))?;
        row.try_get("balance")
            .map_err(|err| CreditError::Backend(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reviewlens_adapters::{
        InMemoryCreditLedger, InsightError, PageCursor, ReviewPage,
    };
    use reviewlens_core::{NegativeInsight, PositiveInsight};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn review(rating: u8) -> Review {
        Review::new(rating, "title", "content body", "author", None)
    }

    /// Serves a fixed set of reviews split across two pages.
    struct StubSource {
        store: StoreKind,
        reviews: Vec<Review>,
        delay: Duration,
    }

    #[async_trait]
    impl ReviewSource for StubSource {
        fn source_id(&self) -> &'static str {
            "stub"
        }

        fn store(&self) -> StoreKind {
            self.store
        }

        async fn fetch_page(
            &self,
            _job_id: Uuid,
            _app_id: &str,
            _options: &JobOptions,
            cursor: &PageCursor,
        ) -> Result<ReviewPage, SourceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let (reviews, next) = match cursor {
                PageCursor::Start => {
                    let half = self.reviews.len() / 2;
                    let rest: Vec<Review> = self.reviews[half..].to_vec();
                    let next = if rest.is_empty() {
                        None
                    } else {
                        Some(PageCursor::Token("rest".to_string()))
                    };
                    (self.reviews[..half].to_vec(), next)
                }
                PageCursor::Token(_) => {
                    let half = self.reviews.len() / 2;
                    (self.reviews[half..].to_vec(), None)
                }
                PageCursor::PageNumber(_) => panic!("stub source is token-based"),
            };
            Ok(ReviewPage {
                reviews,
                next,
                raw: b"{}".to_vec(),
            })
        }
    }

    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InsightGenerator for CountingGenerator {
        async fn complete(
            &self,
            _job_id: Uuid,
            system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, InsightError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if system_prompt.contains("love") {
                Ok(r#"{"topFeatures":["sync"]}"#.to_string())
            } else {
                Ok(r#"{"topIssues":["crashes"]}"#.to_string())
            }
        }
    }

    struct TestHarness {
        pipeline: Pipeline,
        ledger: Arc<InMemoryCreditLedger>,
        generator: Arc<CountingGenerator>,
        _data_dir: TempDir,
    }

    fn harness(reviews: Vec<Review>, source_delay: Duration) -> TestHarness {
        harness_with_timeout(reviews, source_delay, Duration::from_secs(10))
    }

    fn harness_with_timeout(
        reviews: Vec<Review>,
        source_delay: Duration,
        stage_timeout: Duration,
    ) -> TestHarness {
        let data_dir = TempDir::new().expect("tempdir");
        let config = PipelineConfig {
            data_dir: data_dir.path().to_path_buf(),
            stage_timeout,
            ..PipelineConfig::default()
        };

        let generator = Arc::new(CountingGenerator::default());
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let google: Arc<dyn ReviewSource> = Arc::new(StubSource {
            store: StoreKind::GooglePlay,
            reviews: reviews.clone(),
            delay: source_delay,
        });
        let apple: Arc<dyn ReviewSource> = Arc::new(StubSource {
            store: StoreKind::Apple,
            reviews,
            delay: source_delay,
        });

        let pipeline = Pipeline::new(
            config,
            apple,
            google,
            generator.clone() as Arc<dyn InsightGenerator>,
            ledger.clone() as Arc<dyn CreditLedger>,
        );
        TestHarness {
            pipeline,
            ledger,
            generator,
            _data_dir: data_dir,
        }
    }

    async fn wait_terminal(manager: &JobManager, id: Uuid) -> Job {
        for _ in 0..500 {
            if let Some(job) = manager.get(id) {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal status");
    }

    #[test]
    fn advance_is_monotone_and_rejects_terminal_jobs() {
        let manager = JobManager::new();
        let job = manager.create("app", StoreKind::Apple, JobOptions::default());

        manager
            .advance(job.id, JobStatus::FetchingReviews, 40, "page 3")
            .expect("advance");
        let clamped = manager
            .advance(job.id, JobStatus::FetchingReviews, 15, "late update")
            .expect("advance");
        assert_eq!(clamped.progress, 40);

        manager.fail(job.id, "boom").expect("fail");
        let failed = manager.get(job.id).expect("present");
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.progress, 40, "failure keeps the last progress");

        let err = manager
            .advance(job.id, JobStatus::Analyzing, 70, "too late")
            .expect_err("terminal");
        assert!(matches!(err, AdvanceError::Terminal(_)));
    }

    #[test]
    fn events_form_an_append_only_stream() {
        let manager = JobManager::new();
        let job = manager.create("app", StoreKind::Apple, JobOptions::default());

        manager
            .advance(job.id, JobStatus::FetchingReviews, 20, "a")
            .expect("advance");
        manager
            .advance(job.id, JobStatus::Analyzing, 60, "b")
            .expect("advance");

        let job = manager.get(job.id).expect("present");
        assert_eq!(job.events.len(), 3);
        assert!(job
            .events
            .windows(2)
            .all(|w| w[0].percent <= w[1].percent && w[0].at <= w[1].at));
    }

    #[test]
    fn gc_collects_only_expired_terminal_jobs() {
        let manager = JobManager::new();
        let running = manager.create("app-a", StoreKind::Apple, JobOptions::default());

        let mut old_done = Job::new("app-b", StoreKind::Apple, JobOptions::default());
        old_done.status = JobStatus::Completed;
        old_done.progress = 100;
        old_done.updated_at = Utc::now() - chrono::Duration::hours(48);
        let old_id = old_done.id;
        manager.insert(old_done);

        let removed = manager.gc(chrono::Duration::hours(24));
        assert_eq!(removed, 1);
        assert!(manager.get(old_id).is_none());
        assert!(manager.get(running.id).is_some());
    }

    #[test]
    fn analyze_band_stays_under_ninety() {
        assert_eq!(analyze_percent(0, 3, 0.0), 60);
        assert_eq!(analyze_percent(1, 3, 0.0), 70);
        assert_eq!(analyze_percent(2, 3, 0.0), 80);
        assert_eq!(analyze_percent(3, 3, 0.0), 89);
        assert_eq!(analyze_percent(0, 1, 0.99), 89);
        // Heartbeat sub-progress can never reach the next step boundary.
        assert!(analyze_percent(1, 3, 0.999) < analyze_percent(2, 3, 0.0));
    }

    #[tokio::test]
    async fn job_runs_to_completion_and_persists_the_analysis() {
        let h = harness(vec![review(5), review(5), review(1), review(3)], Duration::ZERO);
        h.ledger.set_balance("acct", 3).await;

        let outcome = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        assert_eq!(outcome.kind, SubmitKind::Created);

        let job = wait_terminal(&h.pipeline.manager, outcome.job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);

        let result = job.result.expect("analysis attached");
        assert_eq!(result.summary.total_reviews, 4);
        assert_eq!(result.summary.positive_count, 2);
        assert_eq!(result.summary.negative_count, 1);
        assert_eq!(
            result.positive_insight,
            Some(PositiveInsight {
                top_features: vec!["sync".to_string()],
                ..PositiveInsight::default()
            })
        );
        assert_eq!(
            result.negative_insight,
            Some(NegativeInsight {
                top_issues: vec!["crashes".to_string()],
                ..NegativeInsight::default()
            })
        );

        // Progress never decreased across the whole run.
        assert!(job.events.windows(2).all(|w| w[0].percent <= w[1].percent));

        let persisted = h
            .pipeline
            .analysis_store()
            .get_latest("com.example.app", StoreKind::GooglePlay)
            .await
            .expect("read")
            .expect("persisted");
        assert_eq!(persisted.generated_at, result.generated_at);

        assert_eq!(h.ledger.balance("acct").await.expect("balance"), 2);
    }

    #[tokio::test]
    async fn fresh_cache_serves_a_completed_job_without_debit() {
        let h = harness(vec![review(5), review(1)], Duration::ZERO);
        h.ledger.set_balance("acct", 2).await;

        let first = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        let first_done = wait_terminal(&h.pipeline.manager, first.job.id).await;
        let first_generated_at = first_done.result.expect("first result").generated_at;

        let second = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        assert_eq!(second.kind, SubmitKind::CacheHit);
        assert_eq!(second.job.status, JobStatus::Completed);
        assert_eq!(second.job.progress, 100);
        assert_ne!(second.job.id, first.job.id);
        // The cached analysis is the first run's, timestamp included.
        assert_eq!(
            second.job.result.expect("cached result").generated_at,
            first_generated_at
        );

        assert_eq!(h.ledger.balance("acct").await.expect("balance"), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_the_cache() {
        let h = harness(vec![review(4), review(2)], Duration::ZERO);
        h.ledger.set_balance("acct", 2).await;

        let first = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        wait_terminal(&h.pipeline.manager, first.job.id).await;

        let second = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), true)
            .await
            .expect("submit");
        assert_eq!(second.kind, SubmitKind::Created);
        assert_eq!(h.ledger.balance("acct").await.expect("balance"), 0);
    }

    #[tokio::test]
    async fn concurrent_submissions_share_one_job_and_one_debit() {
        let h = harness(vec![review(5), review(1)], Duration::from_millis(200));
        h.ledger.set_balance("acct", 5).await;

        let first = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        assert_eq!(first.kind, SubmitKind::Created);

        let second = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        assert_eq!(second.kind, SubmitKind::Deduplicated);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(h.ledger.balance("acct").await.expect("balance"), 4);

        wait_terminal(&h.pipeline.manager, first.job.id).await;
    }

    #[tokio::test]
    async fn insufficient_credit_rejects_before_creating_a_job() {
        let h = harness(vec![review(5)], Duration::ZERO);
        h.ledger.set_balance("acct", 0).await;

        let err = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect_err("rejected");
        assert!(matches!(
            err,
            SubmitError::InsufficientCredit {
                balance: 0,
                required: JOB_CREDIT_COST
            }
        ));
        assert!(h.pipeline.manager.is_empty());
        assert_eq!(h.ledger.balance("acct").await.expect("balance"), 0);
    }

    #[tokio::test]
    async fn unrecognized_identifier_is_rejected_without_debit() {
        let h = harness(vec![review(5)], Duration::ZERO);
        h.ledger.set_balance("acct", 1).await;

        let err = h
            .pipeline
            .submit(Some("acct"), "???", JobOptions::default(), false)
            .await
            .expect_err("rejected");
        assert!(matches!(err, SubmitError::InvalidApp(_)));
        assert_eq!(h.ledger.balance("acct").await.expect("balance"), 1);
    }

    #[tokio::test]
    async fn anonymous_submission_runs_without_touching_the_ledger() {
        // No accounts seeded at all; an anonymous caller still gets a job.
        let h = harness(vec![review(5), review(1)], Duration::ZERO);

        let outcome = h
            .pipeline
            .submit(None, "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        assert_eq!(outcome.kind, SubmitKind::Created);

        let job = wait_terminal(&h.pipeline.manager, outcome.job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(matches!(
            h.ledger.balance("default").await,
            Err(CreditError::UnknownAccount(_))
        ));
    }

    #[tokio::test]
    async fn fetch_stage_timeout_fails_the_job() {
        let h = harness_with_timeout(
            vec![review(5), review(1)],
            Duration::from_millis(200),
            Duration::from_millis(50),
        );
        h.ledger.set_balance("acct", 1).await;

        let outcome = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        let job = wait_terminal(&h.pipeline.manager, outcome.job.id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.expect("error recorded").contains("timed out"));
    }

    /// Answers correctly, but slower than the stage timeout.
    struct SlowGenerator;

    #[async_trait]
    impl InsightGenerator for SlowGenerator {
        async fn complete(
            &self,
            _job_id: Uuid,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, InsightError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(r#"{"topFeatures":["sync"]}"#.to_string())
        }
    }

    #[tokio::test]
    async fn insight_stage_timeout_degrades_to_the_empty_insight() {
        let h = harness_with_timeout(
            vec![review(5), review(1)],
            Duration::ZERO,
            Duration::from_millis(50),
        );
        h.ledger.set_balance("acct", 1).await;

        let pipeline = Pipeline {
            generator: Arc::new(SlowGenerator),
            ..h.pipeline.clone()
        };

        let outcome = pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        let job = wait_terminal(&pipeline.manager, outcome.job.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.expect("analysis attached");
        assert_eq!(result.positive_insight, Some(PositiveInsight::default()));
        assert_eq!(result.negative_insight, Some(NegativeInsight::default()));
    }

    #[tokio::test]
    async fn zero_reviews_fails_the_job_but_keeps_progress() {
        let h = harness(vec![], Duration::ZERO);
        h.ledger.set_balance("acct", 1).await;

        let outcome = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        let job = wait_terminal(&h.pipeline.manager, outcome.job.id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.expect("error recorded").contains("no reviews"));
        assert!(job.progress >= 10, "failure keeps the last reported progress");
        // No refund on failure.
        assert_eq!(h.ledger.balance("acct").await.expect("balance"), 0);
        // And nothing was persisted for the key.
        assert!(h
            .pipeline
            .analysis_store()
            .get_latest("com.example.app", StoreKind::GooglePlay)
            .await
            .expect("read")
            .is_none());
    }

    /// Fails the negative bucket only; the positive one still parses.
    struct HalfBrokenGenerator;

    #[async_trait]
    impl InsightGenerator for HalfBrokenGenerator {
        async fn complete(
            &self,
            _job_id: Uuid,
            system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, InsightError> {
            if system_prompt.contains("love") {
                Ok(r#"{"topFeatures":["sync"]}"#.to_string())
            } else {
                Err(InsightError::Malformed("model returned prose".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn one_failed_bucket_still_completes_with_a_default_insight() {
        let h = harness(vec![review(5), review(1)], Duration::ZERO);
        h.ledger.set_balance("acct", 1).await;

        let pipeline = Pipeline {
            generator: Arc::new(HalfBrokenGenerator),
            ..h.pipeline.clone()
        };

        let outcome = pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        let job = wait_terminal(&pipeline.manager, outcome.job.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.expect("analysis attached");
        assert_eq!(
            result.positive_insight.expect("positive parsed").top_features,
            vec!["sync"]
        );
        assert_eq!(
            result.negative_insight,
            Some(NegativeInsight::default()),
            "a broken negative bucket degrades to the empty insight"
        );
    }

    #[tokio::test]
    async fn all_neutral_reviews_skip_the_generator_entirely() {
        let h = harness(vec![review(3), review(3)], Duration::ZERO);
        h.ledger.set_balance("acct", 1).await;

        let outcome = h
            .pipeline
            .submit(Some("acct"), "com.example.app", JobOptions::default(), false)
            .await
            .expect("submit");
        let job = wait_terminal(&h.pipeline.manager, outcome.job.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.expect("analysis attached");
        assert!(result.positive_insight.is_none());
        assert!(result.negative_insight.is_none());
        assert_eq!(result.summary.neutral_count, 2);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = PipelineConfig::default();
        assert_eq!(config.cache_ttl, chrono::Duration::hours(24));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.stage_timeout, Duration::from_secs(300));
    }
}
