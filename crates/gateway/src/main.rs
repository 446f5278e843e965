use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use chrono::Utc;
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use lf_domain::config::{Config, ConfigSeverity};
use lf_gateway::api;
use lf_gateway::cli::{Cli, Command, ConfigCommand};
use lf_gateway::runtime::{
    ConversationLaneMap, FollowupRunner, OperatorBus, Orchestrator, WhatsAppTransport,
};
use lf_gateway::state::AppState;
use lf_pipeline::{HttpLlmClient, LlmPipeline};
use lf_store::{FileStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = lf_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config { command: ConfigCommand::Validate }) => {
            let config = lf_gateway::cli::load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                println!("{tag}: {issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration OK");
            Ok(())
        }
        Some(Command::Config { command: ConfigCommand::Show }) => {
            let config = lf_gateway::cli::load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("leadflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lf_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("leadflow starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store ────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        FileStore::new(&config.store.state_path).context("initializing store")?,
    );

    // ── Integrations (seeded from config) ────────────────────────────
    for integration_config in &config.integrations {
        store
            .upsert_integration(integration_config.to_integration())
            .await
            .context("seeding integration")?;
    }
    tracing::info!(count = config.integrations.len(), "integrations seeded");

    // ── LLM pipeline ─────────────────────────────────────────────────
    let api_key = config.llm_api_key().unwrap_or_default();
    let llm_client = Arc::new(
        HttpLlmClient::from_config(&config.llm, api_key).context("initializing LLM client")?,
    );
    let reasoner = Arc::new(LlmPipeline::new(llm_client, config.llm.clone()));
    tracing::info!(
        model = %config.llm.model,
        timeout_secs = config.llm.timeout_secs,
        "LLM pipeline ready"
    );

    // ── Outbound transport ───────────────────────────────────────────
    let transport = Arc::new(
        WhatsAppTransport::new(&config.transport.base_url, config.transport.timeout_secs)
            .context("initializing outbound transport")?,
    );
    tracing::info!(base_url = %config.transport.base_url, "outbound transport ready");

    // ── Operator bus + lanes ─────────────────────────────────────────
    let bus = Arc::new(OperatorBus::new());
    let lanes = Arc::new(ConversationLaneMap::new());
    tracing::info!("operator bus + conversation lanes ready");

    // ── Orchestrator ─────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        reasoner,
        transport,
        bus.clone(),
        lanes.clone(),
        &config,
    ));

    // ── Dedupe store (inbound idempotency) ──────────────────────────
    let dedupe = Arc::new(lf_gateway::api::webhook::DedupeStore::new(
        std::time::Duration::from_secs(config.transport.dedupe_ttl_secs),
    ));
    tracing::info!(
        ttl_secs = config.transport.dedupe_ttl_secs,
        "dedupe store ready"
    );

    // ── Operator token (read once, hash for constant-time compare) ──
    let operator_token_hash = match config.operator_token() {
        Some(token) => {
            tracing::info!("operator token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        None => {
            tracing::warn!(
                "operator token auth DISABLED — set {} to enable",
                config.server.api_token_env
            );
            None
        }
    };

    let state = AppState {
        config: config.clone(),
        store,
        orchestrator: orchestrator.clone(),
        bus,
        lanes: lanes.clone(),
        dedupe,
        operator_token_hash,
        started_at: Utc::now(),
    };

    // ── Follow-up runner ─────────────────────────────────────────────
    FollowupRunner::new(orchestrator, config.followups.clone()).spawn();
    tracing::info!(
        poll_interval_secs = config.followups.poll_interval_secs,
        "follow-up runner started"
    );

    // ── Periodic lane pruning ────────────────────────────────────────
    {
        let lanes = lanes.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                lanes.prune_idle();
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let app = api::router(state)
        .layer(build_cors_layer(&config.server.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ));

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "leadflow listening");

    axum::serve(listener, app)
        .await
        .context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the allowed origins.
///
/// Origins may carry a trailing `*` wildcard for the port segment
/// (e.g. `http://localhost:*`). A literal `"*"` allows all origins.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            // Validate the remainder is digits only to prevent
            // prefix-based bypass (e.g. "http://localhost:3000.evil.com").
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
