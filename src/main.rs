//! iFlow gateway - main entry point
//!
//! This binary loads configuration from the environment, builds the upstream
//! client and serves both inbound protocols.

use anyhow::Result;
use chrono::Local;
use iflow_proxy_rust::{
    api::{build_router, AppState},
    core::{
        init_metrics, AppConfig, CredentialProvider, RequestLog, StaticCredentialProvider,
        TokenFileCredentialProvider,
    },
    services::UpstreamClient,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(worker_threads))
}

/// Timestamps in the local timezone (respects TZ).
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_tracing() {
    let no_color = std::env::var("NO_COLOR").is_ok();
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Noise suppression is appended even when RUST_LOG is set, otherwise a
    // bare "trace" would let hyper's per-frame logs through.
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,iflow_proxy_rust=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    ));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .init();
    }
}

/// Shared outbound client. No total timeout here: streams may run for as
/// long as the model generates, non-stream calls set their own.
fn create_http_client(config: &AppConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.upstream.verify_ssl)
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()?)
}

async fn create_credentials(
    config: &AppConfig,
    http: &reqwest::Client,
) -> Result<Arc<dyn CredentialProvider>> {
    if let Some(path) = &config.upstream.token_file_path {
        let provider =
            TokenFileCredentialProvider::load(path, config.upstream.oauth.clone(), http.clone())
                .await?;
        tracing::info!(path = %path, "Using OAuth token file credentials");
        return Ok(Arc::new(provider));
    }

    let api_key = config.upstream.api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("Neither TOKEN_FILE_PATH nor IFLOW_API_KEY is set; upstream calls will be rejected");
    } else {
        tracing::info!("Using static API key credentials");
    }
    Ok(Arc::new(StaticCredentialProvider::new(api_key)))
}

async fn async_main(worker_threads: usize) -> Result<()> {
    init_tracing();
    init_metrics();

    let config = AppConfig::from_env()?;
    config.validate()?;

    let http_client = create_http_client(&config)?;
    let credentials = create_credentials(&config, &http_client).await?;
    let upstream = Arc::new(UpstreamClient::new(http_client, &config, credentials));
    let request_log = Arc::new(RequestLog::new(config.request_log_capacity));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(
        worker_threads,
        upstream = %config.upstream.base_url,
        vision_model = %config.models.vision_model,
        context_budget = config.budgets.context_token_budget,
        max_continuations = config.budgets.max_continuations,
        "Starting iFlow gateway on {}",
        addr
    );
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/models");
    tracing::info!("Messages API: /v1/messages, /v1/messages/count_tokens");
    tracing::info!("Metrics endpoint: /metrics");

    let state = Arc::new(AppState::new(config, upstream, request_log));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
