//! Component wiring and process lifecycle.
//!
//! The bot runs four long-lived components on one runtime: the feed monitor,
//! the recheck scheduler, the inbox monitor, and (optionally) the follow-up
//! worker. They share a watch channel for shutdown; the first component to
//! fail brings the whole process down.

use crate::classify::RuleSet;
use crate::config::Config;
use crate::http_client::HttpPlatform;
use crate::ingest::run_ingestion;
use crate::inbox::{run_inbox, InboxHandler};
use crate::messages::MessageBuilder;
use crate::recheck::{run_scheduler, Reconciler};
use crate::store::SqliteStore;
use crate::throttle::{run_worker, FollowupQueue};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run_bot(config: Config) -> Result<()> {
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("failed to open database at {}", config.database_path))?;
    let platform = HttpPlatform::new(&config.api_base_url, &config.api_token)
        .context("failed to build the platform client")?;
    let reconciler = Reconciler {
        platform: Arc::new(platform),
        store: Arc::new(store),
        rules: Arc::new(RuleSet::new()?),
        messages: Arc::new(MessageBuilder::new(
            &config.site_base_url,
            &config.bot_username,
        )),
    };
    let config = Arc::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = Duration::from_secs(config.feed_poll_interval_secs);
    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    let followups = if config.advanced_replying_enabled {
        let (queue, rx) = FollowupQueue::new();
        let worker = reconciler.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { ("follow-up worker", run_worker(worker, rx, shutdown).await) });
        Some(queue)
    } else {
        None
    };

    {
        let monitor = reconciler.clone();
        let feed = config.feed.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            (
                "feed monitor",
                run_ingestion(monitor, feed, poll_interval, shutdown).await,
            )
        });
    }
    {
        let scheduler = reconciler.clone();
        let cfg = config.recheck.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            ("recheck scheduler", run_scheduler(scheduler, cfg, shutdown).await)
        });
    }
    {
        let handler = InboxHandler::new(reconciler.clone(), config.clone(), followups);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            ("inbox monitor", run_inbox(handler, poll_interval, shutdown).await)
        });
    }

    log::info!(
        "bot running as {} on feed {}, watching {} components",
        config.bot_username,
        config.feed,
        tasks.len()
    );

    let result = tokio::select! {
        joined = tasks.join_next() => match joined {
            Some(Ok((name, Ok(())))) => {
                log::warn!("{name} stopped unexpectedly");
                Ok(())
            }
            Some(Ok((name, Err(err)))) => Err(err.context(format!("{name} failed"))),
            Some(Err(err)) => Err(anyhow::anyhow!("component panicked: {err}")),
            None => Ok(()),
        },
        _ = wait_for_signal() => {
            log::info!("shutdown signal received");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    drain_with_grace(&mut tasks).await;
    result
}

/// Give remaining components a bounded window to finish their current
/// iteration, then abort whatever is left.
async fn drain_with_grace(tasks: &mut JoinSet<(&'static str, Result<()>)>) {
    let grace = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => return,
                Some(Ok((name, Ok(())))) => log::info!("{name} stopped"),
                Some(Ok((name, Err(err)))) => log::error!("{name} failed during shutdown: {err:#}"),
                Some(Err(err)) => log::error!("component panicked during shutdown: {err}"),
            },
            _ = &mut grace => {
                log::warn!("shutdown grace period elapsed, aborting remaining components");
                tasks.shutdown().await;
                return;
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
