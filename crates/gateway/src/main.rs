use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cadence_domain::config::{Config, ConfigSeverity, CorsConfig};
use cadence_engine::{Database, Engine, JobCatalog, Scheduler, SchedulerParams};
use cadence_gateway::api;
use cadence_gateway::cli::{Cli, Command, ConfigCommand};
use cadence_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cadence_gateway::cli::load_config()?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cadence_gateway::cli::load_config()?;
            let valid = cadence_gateway::cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cadence_gateway::cli::load_config()?;
            cadence_gateway::cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("cadence {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Log filter applied when `RUST_LOG` is unset. Crate targets use
/// underscores, not the package names.
const DEFAULT_LOG_FILTER: &str = "info,cadence_engine=debug,cadence_gateway=debug";

/// Set up tracing for the `serve` command.
fn init_tracing() {
    let directives =
        std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .init();
}

/// Start the scheduler service with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("cadence starting");

    // ── Config validation ────────────────────────────────────────────
    let mut config_errors = 0;
    for issue in config.validate() {
        match issue.severity {
            ConfigSeverity::Error => {
                config_errors += 1;
                tracing::error!("config: {issue}");
            }
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
        }
    }
    if config_errors > 0 {
        anyhow::bail!("configuration has {config_errors} error(s); refusing to start");
    }

    // ── Job catalog ──────────────────────────────────────────────────
    let catalog = Arc::new(
        JobCatalog::load(&config.jobs.path)
            .with_context(|| format!("loading jobs from {}", config.jobs.path.display()))?,
    );
    tracing::info!(jobs = catalog.len(), path = %config.jobs.path.display(), "job catalog loaded");
    if catalog.is_empty() {
        tracing::warn!("job catalog is empty — nothing will be scheduled");
    }

    // ── Persistent store ─────────────────────────────────────────────
    let db = Database::open(&config.store.path)
        .with_context(|| format!("opening store at {}", config.store.path.display()))?;
    for job in catalog.iter() {
        db.jobs
            .put(job)
            .with_context(|| format!("archiving job definition {}", job.job_id))?;
    }
    tracing::info!(path = %config.store.path.display(), "store ready");

    // ── Engine + crash recovery ──────────────────────────────────────
    let engine = Engine::new(db, catalog);
    let report = engine.restore();
    tracing::info!(
        runs = report.runs,
        requeued = report.requeued,
        reattached = report.reattached,
        "engine restored"
    );
    engine.spawn_queue_loop();

    // ── Horizon scheduler ────────────────────────────────────────────
    let params = SchedulerParams::from_config(&config.scheduler);
    Scheduler::new(engine.clone(), params).spawn();
    tracing::info!(
        tick_sec = config.scheduler.tick_sec,
        lookahead_sec = config.scheduler.lookahead_sec,
        "scheduler started"
    );

    // ── HTTP API ─────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        engine: engine.clone(),
    };

    // Backpressure protection for the API surface.
    let max_concurrent = std::env::var("CADENCE_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);

    let app = api::router()
        .layer(build_cors_layer(&config.server.cors))
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "cadence listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // Abandon in-flight supervision; running runs are reattached on the
    // next startup.
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}

/// One parsed entry of `server.cors.allowed_origins`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginRule {
    /// `"*"` — every origin.
    Any,
    /// A complete origin, compared verbatim.
    Exact(String),
    /// `"<scheme>://<host>:*"` — any numeric port on that host.
    AnyPort(String),
}

impl OriginRule {
    fn parse(raw: &str) -> Option<Self> {
        if raw == "*" {
            return Some(Self::Any);
        }
        if let Some(base) = raw.strip_suffix(":*") {
            return Some(Self::AnyPort(format!("{base}:")));
        }
        // Anything that can't travel as an Origin header can't match one.
        raw.parse::<HeaderValue>().ok()?;
        Some(Self::Exact(raw.to_owned()))
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(allowed) => origin == allowed,
            Self::AnyPort(prefix) => match origin.strip_prefix(prefix.as_str()) {
                // The wildcard stands for a port: digits only, nothing
                // appended after them.
                Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
                None => false,
            },
        }
    }
}

/// Build a [`CorsLayer`] for the API from the configured origin rules.
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    use axum::http::header;

    let mut rules = Vec::new();
    for raw in &cors.allowed_origins {
        match OriginRule::parse(raw) {
            Some(OriginRule::Any) => {
                tracing::warn!("CORS allows every origin");
                rules.push(OriginRule::Any);
            }
            Some(rule) => rules.push(rule),
            None => tracing::warn!(origin = %raw, "unusable CORS origin ignored"),
        }
    }

    let allow_origin = AllowOrigin::predicate(move |origin, _| {
        let Ok(origin) = origin.to_str() else {
            return false;
        };
        rules.iter().any(|rule| rule.matches(origin))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_rule_parse_variants() {
        assert_eq!(OriginRule::parse("*"), Some(OriginRule::Any));
        assert_eq!(
            OriginRule::parse("http://localhost:*"),
            Some(OriginRule::AnyPort("http://localhost:".into()))
        );
        assert_eq!(
            OriginRule::parse("https://ops.example.com"),
            Some(OriginRule::Exact("https://ops.example.com".into()))
        );
        assert_eq!(OriginRule::parse("bad\norigin"), None);
    }

    #[test]
    fn exact_rule_requires_full_match() {
        let rule = OriginRule::parse("https://ops.example.com").unwrap();
        assert!(rule.matches("https://ops.example.com"));
        assert!(!rule.matches("https://ops.example.com.evil.com"));
        assert!(!rule.matches("http://ops.example.com"));
    }

    #[test]
    fn any_port_rule_accepts_only_numeric_ports() {
        let rule = OriginRule::parse("http://localhost:*").unwrap();
        assert!(rule.matches("http://localhost:3000"));
        assert!(rule.matches("http://localhost:80"));
        assert!(!rule.matches("http://localhost:"));
        assert!(!rule.matches("http://localhost:3000.evil.com"));
        assert!(!rule.matches("http://localhost.evil.com:3000"));
    }

    #[test]
    fn any_rule_matches_everything() {
        assert!(OriginRule::Any.matches("https://anywhere.example"));
    }
}
