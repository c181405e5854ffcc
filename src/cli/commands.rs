use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::cache::Freshness;
use crate::config::Config;
use crate::core::{Core, CoreError};
use crate::db::MemoryDatabase;
use crate::health::StatusReport;
use crate::worker::RetryPolicy;

/// Output format (text, json)
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Parameters of a `simulate` run
#[derive(Debug, Clone)]
pub struct CmdSimulate {
    pub tenants: usize,
    pub requests: usize,
    pub concurrency: usize,
    pub latency: Duration,
    pub kind: String,
}

impl CmdSimulate {
    pub fn new(tenants: usize, requests: usize, concurrency: usize, latency_ms: u64) -> Self {
        Self {
            tenants: tenants.max(1),
            requests,
            concurrency: concurrency.max(1),
            latency: Duration::from_millis(latency_ms),
            kind: "odds".to_string(),
        }
    }

    fn tenant(&self, n: usize) -> String {
        format!("tenant-{:03}", n % self.tenants)
    }
}

/// Outcome counters of a simulation
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationSummary {
    pub requests: usize,
    pub fresh: usize,
    pub stale: usize,
    pub defaults: usize,
    pub throttled_served: usize,
    pub rate_limited: usize,
    pub elapsed_ms: u64,
}

impl SimulationSummary {
    fn merge(&mut self, other: &SimulationSummary) {
        self.requests += other.requests;
        self.fresh += other.fresh;
        self.stale += other.stale;
        self.defaults += other.defaults;
        self.throttled_served += other.throttled_served;
        self.rate_limited += other.rate_limited;
    }
}

#[derive(Serialize)]
struct SimulationReport<'a> {
    summary: &'a SimulationSummary,
    status: &'a StatusReport,
}

/// Validate the configuration and print the effective values
pub fn cmd_check_config(config: &Config, format: OutputFormat) -> Result<()> {
    config.validate()?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        OutputFormat::Text => {
            println!("Configuration OK");
            println!("  listen:         {}", config.server.listen);
            println!(
                "  pool:           role={} min={} max={} acquire_timeout={}ms",
                config.pool.role, config.pool.min_size, config.pool.max_size, config.pool.acquire_timeout_ms
            );
            println!(
                "  breaker:        utilization>={} waiting>={} cooldown={}ms",
                config.breaker.open_utilization_threshold,
                config.breaker.open_waiting_threshold,
                config.breaker.cooldown_ms
            );
            println!("  cache ttl:      {}ms", config.cache.ttl_ms);
            println!(
                "  rate limit:     capacity={} refill={}/s ({} class overrides)",
                config.rate_limits.default.capacity,
                config.rate_limits.default.refill_per_sec,
                config.rate_limits.classes.len()
            );
        }
    }
    Ok(())
}

/// Drive the read path against the in-memory database and report the outcome
pub async fn cmd_simulate(
    config: Config,
    cmd: CmdSimulate,
    format: OutputFormat,
) -> Result<SimulationSummary> {
    let db = MemoryDatabase::new();
    db.set_latency(cmd.latency);
    let core = Core::new(config, Arc::new(db.clone())).context("Failed to initialize core")?;
    let _background = core.start_background();
    core.warm_up().await?;

    // Seed half the tenants; the rest exercise the default fallback
    let policy = RetryPolicy::default();
    for n in (0..cmd.tenants).step_by(2) {
        let payload = serde_json::json!({ "tenant": cmd.tenant(n), "markets": [] });
        core.ingest_resource(&cmd.tenant(n), &cmd.kind, &payload, &policy)
            .await
            .context("Failed to seed tenant resources")?;
    }

    let start = Instant::now();
    let cmd = Arc::new(cmd);
    let mut workers = JoinSet::new();
    for worker in 0..cmd.concurrency {
        let core = core.clone();
        let cmd = Arc::clone(&cmd);
        workers.spawn(async move { run_reads(&core, &cmd, worker).await });
    }

    let mut summary = SimulationSummary::default();
    while let Some(result) = workers.join_next().await {
        let part = result.context("Simulation worker panicked")?;
        summary.merge(&part);
    }
    summary.elapsed_ms = start.elapsed().as_millis() as u64;

    let status = core.status();
    match format {
        OutputFormat::Json => {
            let report = SimulationReport {
                summary: &summary,
                status: &status,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => print_summary(&summary, &status)?,
    }

    core.shutdown();
    Ok(summary)
}

async fn run_reads(core: &Core, cmd: &CmdSimulate, worker: usize) -> SimulationSummary {
    let mut summary = SimulationSummary::default();
    let mut n = worker;
    while n < cmd.requests {
        summary.requests += 1;
        match core.read_tenant_resource(&cmd.tenant(n), &cmd.kind, &cmd.kind) {
            Ok(outcome) => {
                if outcome.throttled.is_some() {
                    summary.throttled_served += 1;
                }
                match outcome.resource.freshness {
                    Freshness::Fresh => summary.fresh += 1,
                    Freshness::Stale => summary.stale += 1,
                    Freshness::Default => summary.defaults += 1,
                }
            }
            Err(CoreError::RateLimited { .. }) => summary.rate_limited += 1,
            Err(e) => tracing::warn!(error = %e, "simulated_read_failed"),
        }
        n += cmd.concurrency;
        tokio::task::yield_now().await;
    }
    summary
}

fn print_summary(summary: &SimulationSummary, status: &StatusReport) -> Result<()> {
    let secs = (summary.elapsed_ms as f64 / 1000.0).max(0.001);
    println!(
        "Requests: {} in {:.2}s = {:.0} req/s",
        summary.requests,
        secs,
        summary.requests as f64 / secs
    );
    println!(
        "  fresh={} stale={} default={} throttled_served={} rate_limited={}",
        summary.fresh, summary.stale, summary.defaults, summary.throttled_served, summary.rate_limited
    );
    println!();
    println!("Status:");
    println!("{}", serde_json::to_string_pretty(status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulate_accounts_for_every_request() {
        let mut config = Config::new();
        config.pool.role = "cli-simulate".to_string();
        config.pool.min_size = 1;
        config.pool.max_size = 4;

        let cmd = CmdSimulate::new(4, 200, 8, 0);
        let summary = cmd_simulate(config, cmd, OutputFormat::Json).await.unwrap();

        assert_eq!(summary.requests, 200);
        assert_eq!(
            summary.fresh + summary.stale + summary.defaults + summary.rate_limited,
            200
        );
    }

    #[test]
    fn test_tenant_names_wrap() {
        let cmd = CmdSimulate::new(3, 10, 2, 0);
        assert_eq!(cmd.tenant(0), "tenant-000");
        assert_eq!(cmd.tenant(4), "tenant-001");
    }
}
