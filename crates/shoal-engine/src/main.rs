use anyhow::Context;
use clap::Parser;
use shoal_engine::adapter::HttpServer;
use shoal_engine::cache::CacheManager;
use shoal_engine::config::Config;
use shoal_engine::engine::MatchEngine;
use shoal_engine::executor::ResponseExecutor;
use shoal_engine::repository::InMemoryRuleRepository;
use shoal_engine::scripting::ScriptSandbox;
use shoal_engine::MockService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "shoal", version, about = "Protocol-agnostic mock serving engine")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "SHOAL_CONFIG")]
    config: Option<String>,

    /// Overrides listen.port
    #[arg(short, long, env = "SHOAL_PORT")]
    port: Option<u16>,

    /// Used when RUST_LOG is not set
    #[arg(long, env = "SHOAL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SHOAL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            warn!("No --config given, starting with defaults and no rules");
            Config::default()
        }
    };
    if let Some(port) = args.port {
        config.listen.port = port;
    }

    let shutdown = CancellationToken::new();

    let cache = Arc::new(build_cache(&config)?);
    let cleanup = cache.spawn_cleanup(shutdown.child_token());

    let repository = Arc::new(
        InMemoryRuleRepository::from_rules(config.rules.clone())
            .context("failed to seed rule repository")?,
    );
    info!("Loaded {} rules", repository.len());

    let sandbox = Arc::new(ScriptSandbox::new(config.script.clone()));
    let engine = Arc::new(MatchEngine::new(cache, repository, sandbox.clone()));
    let executor = Arc::new(ResponseExecutor::new(config.executor.clone(), sandbox));
    let service = Arc::new(MockService::new(engine, executor));

    let address = config.listen.address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Received ctrl-c, shutting down");
        signal.cancel();
    });

    HttpServer::new(service).run(listener, shutdown.clone()).await?;
    shutdown.cancel();
    cleanup.await.ok();
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(args: &Args) -> Result<(), anyhow::Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&args.log_level)
            .with_context(|| format!("invalid log level '{}'", args.log_level))?,
    };

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

#[cfg(feature = "redis-backend")]
fn build_cache(config: &Config) -> Result<CacheManager, anyhow::Error> {
    let strategy = config.cache.strategy();
    match &config.cache.redis {
        Some(redis) => {
            let l2 = shoal_engine::cache::RedisL2::new(redis)
                .context("failed to configure Redis L2 cache")?;
            info!("Using Redis L2 cache at {}", redis.url);
            Ok(CacheManager::with_l2(strategy, Arc::new(l2)))
        }
        None => {
            info!("No L2 cache configured, running L1 only");
            Ok(CacheManager::new(strategy))
        }
    }
}

#[cfg(not(feature = "redis-backend"))]
fn build_cache(config: &Config) -> Result<CacheManager, anyhow::Error> {
    if config.cache.redis.is_some() {
        warn!("cache.redis is set but redis-backend is not compiled in; running L1 only");
    }
    Ok(CacheManager::new(config.cache.strategy()))
}
