//! `mailledger-syncd` - keeps mailboxes synced for offline use.
//!
//! Opens the sync engine on the local store, watches the configured
//! accounts and replays queued writes whenever the mailbox service is
//! reachable.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mailledger_remote::{AccountId, HttpRemote, RemoteApi};
use mailledger_sync::{Engine, MutationQueue};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::DaemonSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mailledger_syncd=info,mailledger_sync=info,mailledger_remote=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mailledger-syncd");

    let path = DaemonSettings::path();
    let settings = DaemonSettings::load(&path).await?;

    let remote = Arc::new(
        HttpRemote::new(
            &settings.remote_base_url,
            settings.api_token.clone(),
            settings.engine.remote_timeout,
        )
        .context("creating remote client")?,
    );

    let mut engine = Engine::open(settings.engine.clone(), Arc::clone(&remote))
        .await
        .context("opening sync engine")?;
    if engine.was_recovered() {
        warn!("Local store was recreated; every folder will fully resync");
    }

    for &account in &settings.accounts {
        engine
            .watch(account)
            .await
            .with_context(|| format!("watching account {account}"))?;
    }
    engine.start_background();

    let probe = settings.accounts.first().copied().map(|account| {
        tokio::spawn(probe_connectivity(
            Arc::clone(&remote),
            engine.outbox().clone(),
            account,
            settings.probe_interval,
        ))
    });

    info!(
        "Syncing {} account(s) against {}",
        settings.accounts.len(),
        settings.remote_base_url
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutting down");
    if let Some(probe) = probe {
        probe.abort();
    }
    engine.shutdown().await;
    Ok(())
}

/// Mark the outbox online or offline from a cheap remote call.
async fn probe_connectivity<R: RemoteApi>(
    remote: Arc<R>,
    queue: MutationQueue<R>,
    account: AccountId,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match remote.list_folders(account).await {
            Ok(_) => queue.set_online(true),
            Err(e) if e.is_transient() => {
                warn!("Mailbox service unreachable: {e}");
                queue.set_online(false);
            }
            // The service answered, so it is reachable.
            Err(e) => {
                warn!("Connectivity probe for account {account} failed: {e}");
                queue.set_online(true);
            }
        }
    }
}
