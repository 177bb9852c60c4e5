mod catalog;
mod client;
mod config;
mod control;
mod descriptor;
mod disk;
mod evict;
mod kickstart;
mod marker;
mod qbittorrent;
mod simulate;
#[cfg(test)]
mod testutil;
mod tracker;
mod wire;

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::Config::load().context("load configuration")?;
    tracing::info!(
        url = %cfg.qb_url,
        queues = cfg.queues.len(),
        disk = %cfg.disk_path.display(),
        simulate = cfg.sim_enabled,
        "seedwarden: starting"
    );

    // Dropping the control loop also drops any running peer session's stop
    // channel, which the worker treats as cancellation.
    tokio::select! {
        _ = control::run(&cfg) => {}
        r = tokio::signal::ctrl_c() => {
            r.context("listen for ctrl-c")?;
            tracing::info!("seedwarden: shutting down");
        }
    }
    Ok(())
}
