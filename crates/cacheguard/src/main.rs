mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use cacheguard::config::loader::load_config;
use cacheguard::{CacheGuard, CacheGuardConfig, RetryBudget};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let cfg = load_config(cli.config.as_deref())
        .map_err(anyhow::Error::msg)
        .context("Configuration error")?;
    cacheguard::init_tracing_with_level(&cfg.logging.level);

    match &cli.command {
        Commands::Check => check(&cfg).await,
        Commands::Lock(args) => {
            let guard = CacheGuard::connect(&cfg).await?;
            let ttl = args
                .ttl_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| cfg.lock.ttl());
            let budget = args
                .retry_count
                .map(RetryBudget::new)
                .unwrap_or_else(|| cfg.lock.retry_budget());

            let lock = guard.lock.acquire(&args.key, ttl, budget).await?;
            println!("acquired {} (token {})", lock.key(), lock.token());
            if !args.hold().is_zero() {
                tokio::time::sleep(args.hold()).await;
            }
            let released = lock.release().await?;
            println!("released: {released}");
            Ok(())
        }
        Commands::RateLimit(args) => {
            let guard = CacheGuard::connect(&cfg).await?;
            let allowed = guard
                .rate_limiter
                .allow(&args.key, args.quota, Duration::from_secs(args.window))
                .await?;
            println!("{}", if allowed { "allowed" } else { "denied" });
            Ok(())
        }
        Commands::Evict(args) => {
            let guard = CacheGuard::connect(&cfg).await?;
            let key = guard.orchestrator.keys().key(&args.namespace, &args.key);
            guard.orchestrator.evict(&key, args.tier).await?;
            println!("evicted {key}");
            Ok(())
        }
        Commands::Clear(args) => {
            let guard = CacheGuard::connect(&cfg).await?;
            guard.orchestrator.clear(&args.namespace, args.tier).await?;
            println!(
                "cleared {}",
                guard.orchestrator.keys().namespace_pattern(&args.namespace)
            );
            Ok(())
        }
    }
}

async fn check(cfg: &CacheGuardConfig) -> Result<()> {
    println!("configuration: ok");
    if !cfg.redis.enabled {
        println!("redis: disabled (in-process store)");
        return Ok(());
    }
    cacheguard::connect_redis(&cfg.redis)
        .await
        .with_context(|| format!("Redis at {} is unreachable", cfg.redis.url))?;
    println!("redis: ok ({})", cfg.redis.url);
    Ok(())
}
