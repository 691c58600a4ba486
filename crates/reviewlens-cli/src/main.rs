//! ReviewLens command line: run the HTTP server, analyze one app from the
//! terminal, or administer the credit ledger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use reviewlens_adapters::{
    AppleRssSource, CreditLedger, InMemoryCreditLedger, InsightGenerator,
    OpenAiInsightGenerator, PlayGatewaySource, ReviewSource,
};
use reviewlens_core::JobOptions;
use reviewlens_pipeline::{
    build_gc_scheduler, PgCreditLedger, Pipeline, PipelineConfig, SubmitKind,
};
use reviewlens_storage::{HttpClientConfig, HttpFetcher};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "reviewlens", about = "App store review analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve {
        /// Port to listen on; defaults to REVIEWLENS_WEB_PORT or 8000.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Analyze one app and print the result as JSON.
    Analyze {
        /// App id, package name, or store URL.
        app: String,
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        max_pages: Option<u32>,
        /// Account to bill; omitted means an anonymous, unbilled run.
        #[arg(long)]
        account: Option<String>,
        /// Ignore a fresh cached analysis and re-run.
        #[arg(long)]
        force: bool,
    },
    /// Apply credit ledger migrations (requires DATABASE_URL).
    Migrate,
    /// Grant credits to an account (requires DATABASE_URL).
    Credit { account: String, amount: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => serve(port).await,
        Command::Analyze {
            app,
            country,
            max_pages,
            account,
            force,
        } => analyze(app, country, max_pages, account, force).await,
        Command::Migrate => migrate().await,
        Command::Credit { account, amount } => credit(account, amount).await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

async fn build_pipeline(config: PipelineConfig) -> anyhow::Result<Pipeline> {
    let http_timeout = env_or("REVIEWLENS_HTTP_TIMEOUT_SECS", "20")
        .parse()
        .unwrap_or(20);
    let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(http_timeout),
        user_agent: std::env::var("REVIEWLENS_USER_AGENT").ok(),
        ..HttpClientConfig::default()
    })?);

    let apple: Arc<dyn ReviewSource> = Arc::new(AppleRssSource::new(fetcher.clone()));
    let google: Arc<dyn ReviewSource> = Arc::new(PlayGatewaySource::new(
        fetcher.clone(),
        env_or("REVIEWLENS_PLAY_GATEWAY_URL", "http://localhost:3100"),
    ));

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; insight generation will fail and jobs will carry empty insights");
    }
    let generator: Arc<dyn InsightGenerator> = Arc::new(OpenAiInsightGenerator::new(
        fetcher,
        api_key,
        env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
        env_or("REVIEWLENS_MODEL", "gpt-4o-mini"),
    ));

    let ledger: Arc<dyn CreditLedger> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let ledger = PgCreditLedger::connect(&url).await?;
            ledger.run_migrations().await?;
            info!("using postgres credit ledger");
            Arc::new(ledger)
        }
        Err(_) => {
            let credits = env_or("REVIEWLENS_DEFAULT_CREDITS", "100").parse().unwrap_or(100);
            let ledger = InMemoryCreditLedger::new();
            ledger.set_balance("default", credits).await;
            info!(credits, "using in-memory credit ledger for account \"default\"");
            Arc::new(ledger)
        }
    };

    Ok(Pipeline::new(config, apple, google, generator, ledger))
}

async fn serve(port: Option<u16>) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let port = match port {
        Some(port) => port,
        None => env_or("REVIEWLENS_WEB_PORT", "8000").parse().unwrap_or(8000),
    };

    let pipeline = build_pipeline(config.clone()).await?;

    let scheduler = build_gc_scheduler(
        Arc::clone(&pipeline.manager),
        config.job_retention,
        &config.gc_cron,
    )
    .await?;
    scheduler.start().await.context("starting gc scheduler")?;
    info!(cron = %config.gc_cron, "job garbage collection scheduled");

    reviewlens_web::serve(pipeline, port).await
}

async fn analyze(
    app: String,
    country: Option<String>,
    max_pages: Option<u32>,
    account: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let pipeline = build_pipeline(config).await?;

    let mut options = JobOptions::default();
    if let Some(country) = country {
        options.country = country;
    }
    if let Some(max_pages) = max_pages {
        options.max_pages = max_pages;
    }

    let outcome = pipeline
        .submit(account.as_deref(), &app, options, force)
        .await?;
    if outcome.kind == SubmitKind::CacheHit {
        info!("served from cached analysis");
    }

    let mut last_message = String::new();
    let job = loop {
        let Some(job) = pipeline.manager.get(outcome.job.id) else {
            bail!("job {} disappeared from the job table", outcome.job.id);
        };
        if job.message != last_message {
            info!(progress = job.progress, "{}", job.message);
            last_message = job.message.clone();
        }
        if job.is_terminal() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };

    match job.result {
        Some(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        None => bail!(
            "analysis failed: {}",
            job.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn migrate() -> anyhow::Result<()> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL is required for migrate")?;
    let ledger = PgCreditLedger::connect(&url).await?;
    ledger.run_migrations().await?;
    info!("credit ledger migrations applied");
    Ok(())
}

async fn credit(account: String, amount: i64) -> anyhow::Result<()> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL is required for credit")?;
    let ledger = PgCreditLedger::connect(&url).await?;
    ledger.run_migrations().await?;
    let balance = ledger.credit(&account, amount).await?;
    info!(account, balance, "credited account");
    Ok(())
}
