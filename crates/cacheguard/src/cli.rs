use clap::{Parser, Subcommand};
use std::time::Duration;

use cacheguard::TierKind;

#[derive(Parser)]
#[command(name = "cacheguard")]
#[command(about = "Inspect and operate cacheguard locks, caches and rate limits")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./cacheguard.toml when present)
    #[arg(short, long, global = true, env = "CACHEGUARD_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Acquire and release a lock to see whether it is free
    Lock(LockArgs),
    /// Count one request against a rate limit
    RateLimit(RateLimitArgs),
    /// Delete one cache entry
    Evict(EvictArgs),
    /// Delete every entry of a namespace
    Clear(ClearArgs),
    /// Validate configuration and test store connectivity
    Check,
}

#[derive(clap::Args)]
pub struct LockArgs {
    /// Lock key
    pub key: String,
    /// Lock lifetime in milliseconds
    #[arg(long)]
    pub ttl_ms: Option<u64>,
    /// Retries after the first attempt (negative retries forever)
    #[arg(long, allow_negative_numbers = true)]
    pub retry_count: Option<i32>,
    /// Hold the lock this long before releasing it
    #[arg(long, default_value = "0")]
    pub hold_ms: u64,
}

impl LockArgs {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

#[derive(clap::Args)]
pub struct RateLimitArgs {
    /// Counter key
    pub key: String,
    /// Requests allowed per window
    #[arg(long)]
    pub quota: u64,
    /// Window length in seconds
    #[arg(long, default_value = "60")]
    pub window: u64,
}

#[derive(clap::Args)]
pub struct EvictArgs {
    /// Cache namespace
    pub namespace: String,
    /// Dynamic part of the key
    pub key: String,
    /// Tier to evict from (local, remote, two_tier)
    #[arg(long)]
    pub tier: Option<TierKind>,
}

#[derive(clap::Args)]
pub struct ClearArgs {
    /// Cache namespace
    pub namespace: String,
    /// Tier to clear (local, remote, two_tier)
    #[arg(long)]
    pub tier: Option<TierKind>,
}
