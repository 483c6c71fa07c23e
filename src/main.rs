//! Entry point. Wires Discord -> Parser -> Manager (Selector, Risk, Store) -> Webull.

mod chain_cache;
mod config;
mod discord;
mod error;
mod greeks;
mod lifecycle;
mod manager;
mod parser;
mod risk;
mod selector;
mod store;
mod supervisor;
#[cfg(test)]
mod testkit;
mod types;
mod utils;
mod venue;
mod webull_client;

use dotenvy::dotenv;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::chain_cache::ChainCache;
use crate::manager::{Manager, ManagerSettings};
use crate::store::Store;
use crate::supervisor::{Backoff, Supervisor};
use crate::utils::{start_of_local_day, tif_from_str, until_next_local_hour};
use crate::venue::Venue;
use chrono::Local;
use std::{sync::Arc, time::Duration};
use tokio::task::{JoinHandle, JoinSet, LocalSet};
use webull_unofficial::models::TimeInForce;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    // Webull session futures are not Send; venue work stays on this thread
    LocalSet::new().run_until(run()).await
}

async fn run() -> anyhow::Result<()> {
    // Load config
    let cfg_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let cfg = config::AppConfig::load(&cfg_path)?;
    let discord_token = std::env::var("DISCORD_USER_TOKEN")?;
    let creds = webull_client::Credentials::from_env()?;

    // Store: open + migrate, then show what survived the last run
    let store = Arc::new(Store::connect(&cfg.store.resolved_url()?).await?);

    // Webull login (paper/live)
    let tif: TimeInForce = tif_from_str(&cfg.exec.tif);
    let venue: Arc<dyn Venue> =
        Arc::new(webull_client::WebullVenue::login(creds, &cfg.webull, tif.clone()).await?);

    let chains = Arc::new(ChainCache::new());
    let supervisor = Arc::new(Supervisor::new(Backoff::from(&cfg.supervisor)));
    let manager = Arc::new(Manager::new(
        Arc::clone(&venue),
        Arc::clone(&store),
        Arc::clone(&chains),
        Arc::clone(&supervisor),
        risk::RiskEngine::new(&cfg.risk),
        ManagerSettings::from_config(&cfg),
    ));

    manager.restore().await?;
    match manager.reconcile().await {
        Ok(missing) if missing.is_empty() => info!("Positions reconciled with Webull holdings"),
        Ok(missing) => warn!("{} persisted position(s) not held at Webull", missing.len()),
        Err(e) => error!("Startup reconciliation failed: {e}"),
    }

    let venue_timeout = cfg.exec.venue_timeout();
    chains
        .refresh_all(venue.as_ref(), &cfg.chain.underlyings, venue_timeout)
        .await;

    // Chain refresh on its own schedule; signal processing only reads snapshots
    let chain_handle = tokio::task::spawn_local({
        let chains = Arc::clone(&chains);
        let venue = Arc::clone(&venue);
        let underlyings = cfg.chain.underlyings.clone();
        let every = Duration::from_secs(cfg.chain.refresh_interval_sec);
        async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // startup refresh already done
            loop {
                ticker.tick().await;
                chains
                    .refresh_all(venue.as_ref(), &underlyings, venue_timeout)
                    .await;
            }
        }
    });

    // End-of-day outcome counts
    let report_handle = tokio::spawn({
        let store = Arc::clone(&store);
        let hour = cfg.report.summary_hour;
        async move {
            loop {
                tokio::time::sleep(until_next_local_hour(Local::now(), hour)).await;
                match store.outcome_summary(start_of_local_day(Local::now())).await {
                    Ok(s) => info!(
                        wins = s.wins,
                        losses = s.losses,
                        pending = s.pending,
                        "End of day results"
                    ),
                    Err(e) => error!("End of day summary failed: {e}"),
                }
            }
        }
    });

    // Discord channel -> internal MPSC of raw payloads
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1024);
    let discord_handle = tokio::spawn({
        let token = discord_token.clone();
        let dcfg = cfg.discord.clone();
        async move {
            if let Err(e) = discord::run(&token, dcfg.channel_ids, dcfg.tracked_users, tx).await {
                error!("Discord run error: {:#}", e);
            }
        }
    });

    info!(
        "Trader started. Mode={}, TIF={:?}, DryRun={}, KeyByRight={}, Fallback={:?}, CheckEvery={}s",
        cfg.webull.mode,
        tif,
        cfg.exec.dry_run,
        cfg.positions.key_includes_right,
        cfg.selection.fallback,
        cfg.supervisor.check_interval_sec
    );

    // Periodic connectivity check
    let mut check_ticker =
        tokio::time::interval(Duration::from_secs(cfg.supervisor.check_interval_sec));
    let mut inflight: JoinSet<()> = JoinSet::new();
    let mut check: Option<JoinHandle<()>> = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(payload) = maybe else {
                    warn!("Signal intake closed");
                    break;
                };
                let m = Arc::clone(&manager);
                inflight.spawn_local(async move { m.process_payload(&payload).await });
            }

            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = done {
                    error!("Signal task failed: {e}");
                }
            }

            // runs beside intake; a long reconnect must not stall signals or ctrl-c
            _ = check_ticker.tick() => {
                if check.as_ref().is_some_and(|h| !h.is_finished()) {
                    debug!("Previous connectivity check still running");
                } else {
                    let m = Arc::clone(&manager);
                    check = Some(tokio::task::spawn_local(async move {
                        m.health_check().await;
                    }));
                }
            }

            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    // stop intake, then let every open/close in flight finish
    discord_handle.abort();
    chain_handle.abort();
    report_handle.abort();
    if let Some(h) = check {
        h.abort();
    }
    info!("Draining {} in-flight signal(s)", inflight.len());
    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done {
            error!("Signal task failed: {e}");
        }
    }
    store.close().await;
    info!("Stopped");
    Ok(())
}
