//! The long-lived agent process: jittered periodic cycles, signal
//! handling, graceful drain on shutdown.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::cycle::Agent;
use crate::config::AgentConfig;
use crate::drift::BaselineConfig;
use crate::evidence::prune::Pruner;
use crate::util::logging::init_tracing;

/// Best-effort queue drain budget during shutdown.
const SHUTDOWN_FLUSH_DEADLINE: Duration = Duration::from_secs(10);
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Sleep `poll_interval` plus or minus ~10% so a fleet of appliances does
/// not stampede the coordinator on the same second.
fn jittered(poll_interval: Duration) -> Duration {
    let base = poll_interval.as_millis() as u64;
    if base == 0 {
        return poll_interval;
    }
    let spread = base / 10;
    let low = base.saturating_sub(spread);
    let high = base + spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    warn!(%err, "failed to register SIGTERM handler");
                    let _ = signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signal::ctrl_c().await;
        }
        info!("termination signal received, draining");
        cancel.cancel();
    });
}

/// Run the agent until a termination signal arrives. Startup errors
/// (config, keys, baseline) are fatal and bubble up so the process exits
/// non-zero; everything after startup recovers locally.
pub async fn run(config_path: Option<PathBuf>, headless: bool) -> Result<()> {
    let config_path = config_path.unwrap_or_else(AgentConfig::default_path);
    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    init_tracing(config.tracing_level());
    info!(
        site_id = %config.site_id,
        dry_run = config.dry_run_mode,
        headless,
        "starting custos agent"
    );

    let template = BaselineConfig {
        max_clock_skew_ms: config.max_clock_skew_ms,
        ..BaselineConfig::default()
    };
    let (baseline, captured) = BaselineConfig::load_or_capture(&config.baseline_path, template)
        .await
        .context("failed to load or capture baseline")?;
    if captured {
        info!(path = %config.baseline_path.display(), "captured initial baseline");
    }

    let pruner = Pruner::new(
        config.evidence_retention_days,
        config.evidence_retention_days_minimum,
        config.evidence_keep_last_n,
    );
    let poll_interval = Duration::from_secs(config.poll_interval_seconds);
    let agent = Agent::bootstrap(config, baseline)?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let mut cycle: u64 = 0;
    let mut last_prune = Instant::now();

    while !cancel.is_cancelled() {
        cycle += 1;
        let stats = agent.run_cycle(cycle, &cancel).await;
        info!(
            cycle = stats.cycle,
            reachable = stats.coordinator_reachable,
            orders = stats.orders_fetched,
            rejected = stats.orders_rejected,
            executed = stats.orders_executed,
            drifted = stats.checks_drifted,
            healed = stats.heals_attempted,
            persisted = stats.bundles_persisted,
            uploaded = stats.bundles_uploaded,
            seconds = format!("{:.2}", stats.duration_seconds),
            "cycle complete"
        );

        if last_prune.elapsed() >= PRUNE_INTERVAL {
            last_prune = Instant::now();
            if let Err(err) = pruner.run(agent.queue(), chrono::Utc::now()) {
                warn!(%err, "evidence pruning failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(jittered(poll_interval)) => {}
            _ = cancel.cancelled() => break,
        }
    }

    // Graceful shutdown: evidence already produced is on disk; give the
    // queue one short best-effort drain and leave the rest for next boot.
    info!("shutting down, flushing queue best-effort");
    let _ = tokio::time::timeout(
        SHUTDOWN_FLUSH_DEADLINE,
        agent.flush_queue(agent.config.upload_batch_size),
    )
    .await;
    info!("custos agent stopped");
    Ok(())
}
