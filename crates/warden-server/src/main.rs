//! Main entry point for the Warden runner.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use warden_common::SystemClock;
use warden_ratelimit::RateLimiterRegistry;
use warden_server::{
    Backend, Cli, Configuration, Coordination, RunMode, error_code,
    logging::init_logging,
    metrics::{init_metrics, install_prometheus},
    run_limit, run_stock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = Configuration::load(&cli)?;

    let _logging_guard = init_logging(&configuration.logging_config()?)?;

    let result = run(&cli, &configuration).await;
    if let Err(e) = &result {
        match error_code(e) {
            Some(code) => {
                error!(code = code.code, reason = code.message, error = %e, "Run failed")
            }
            None => error!(error = %e, "Run failed"),
        }
    }
    result
}

async fn run(cli: &Cli, configuration: &Configuration) -> anyhow::Result<()> {
    init_metrics();
    let metrics_options = configuration.metrics_options()?;
    if metrics_options.enabled {
        let addr: SocketAddr = metrics_options.listen.parse()?;
        install_prometheus(addr)?;
    }

    let store_options = configuration.store_options()?;
    info!(backend = ?store_options.backend, "Connecting store");
    let backend = Backend::connect(&store_options).await?;

    let registry = RateLimiterRegistry::standard(backend.executor.clone());
    backend.load_scripts(&registry).await?;

    match cli.run {
        RunMode::Stock => {
            let coordination = Coordination::from_options(&configuration.coordination_options()?);
            let report = run_stock(
                &backend,
                &coordination,
                &configuration.stock_options()?,
                &configuration.lease_lock_options()?,
                &configuration.queue_lock_options()?,
            )
            .await?;
            println!(
                "started={} lock={} workers={} initial={} remaining={} deducted={} elapsed={}ms",
                report.started_at.to_rfc3339(),
                report.lock.as_str(),
                report.workers,
                report.initial,
                report.remaining,
                report.deducted,
                report.elapsed.as_millis()
            );
            if !report.is_consistent() {
                error!(
                    initial = report.initial,
                    remaining = report.remaining,
                    deducted = report.deducted,
                    "Stock counter does not match successful deductions"
                );
                anyhow::bail!("stock run lost updates");
            }
        }
        RunMode::Limit => {
            let report = run_limit(
                &registry,
                &configuration.limit_options()?,
                Arc::new(SystemClock),
            )
            .await?;
            println!(
                "started={} limiter={} key={} admitted={} rejected={} elapsed={}ms",
                report.started_at.to_rfc3339(),
                report.limiter,
                report.key,
                report.admitted,
                report.rejected,
                report.elapsed.as_millis()
            );
        }
    }

    Ok(())
}
