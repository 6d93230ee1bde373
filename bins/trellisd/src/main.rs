// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Trellis sync daemon (trellisd)
//!
//! Hosts the long-lived halves of the sync engine: the git directory-sync
//! loop, the realtime client, and the preview RPC listener. The editor
//! integration embeds the orchestrator in-process and talks to the same
//! store; this daemon only needs the store directory to agree.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use trellis_config::TrellisConfig;
use trellis_store::Store;
use trellis_sync::gitdir::GitSync;
use trellis_sync::orchestrator::Trigger;
use trellis_sync::preview::{run_preview_listener, PREVIEW_PORT};
use trellis_sync::realtime::RealtimeClient;
use trellis_sync::RealtimeError;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Override the configured data directory.
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Seconds between unforced directory-sync cycles.
    #[clap(long, default_value_t = 15)]
    git_interval: u64,

    /// Port for the preview RPC listener.
    #[clap(long, default_value_t = PREVIEW_PORT)]
    preview_port: u16,

    /// Run one directory-sync cycle and exit (non-zero on failure).
    #[clap(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = TrellisConfig::load_or_init().context("loading configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }

    let store = Store::open(config.db_dir()?, config.short_id_bytes).context("opening store")?;
    let (root, client) = store.with_write(|txn| {
        let root = store.ensure_root(txn)?;
        let client = store.client(txn)?;
        Ok((root, client))
    })?;
    info!(%root, client = %client.client_name, "store ready");

    let git_sync = Arc::new(GitSync::new(
        store.clone(),
        config.git_dir()?,
        config.git.remote.clone(),
        config.git.branch.clone(),
        config.sort_file_children,
    ));
    if config.git.enabled {
        git_sync.bootstrap(&client).context("preparing repository")?;
    }

    if args.once {
        return match git_sync.sync() {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(?err, "directory sync failed");
                std::process::exit(1);
            }
        };
    }

    // Wakes when a background sync changed the store; an attached editor
    // re-renders on it. Headless, it only logs.
    let buffer_trigger = Trigger::new();
    let git_trigger = Trigger::new();

    if config.realtime.enabled {
        let (client_loop, _handle) = RealtimeClient::new(
            store.clone(),
            config.realtime.hub_addr.clone(),
            client.client_id.clone(),
            buffer_trigger.clone(),
        );
        tokio::spawn(async move {
            match client_loop.run().await {
                Ok(()) => info!("realtime client stopped"),
                Err(RealtimeError::IndexDisabled(msg)) => {
                    // Operator action required; retrying would spin.
                    error!("{msg}");
                }
                Err(err) => error!(?err, "realtime client failed"),
            }
        });
    }

    {
        let store = store.clone();
        let port = args.preview_port;
        tokio::spawn(async move {
            if let Err(err) = run_preview_listener(store, port).await {
                error!(?err, "preview listener failed");
            }
        });
    }

    if config.git.enabled {
        let git_sync = Arc::clone(&git_sync);
        let git_trigger = git_trigger.clone();
        let buffer_trigger = buffer_trigger.clone();
        let interval = Duration::from_secs(args.git_interval.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = git_trigger.wait() => {}
                    () = tokio::time::sleep(interval) => {}
                }
                let sync = Arc::clone(&git_sync);
                match tokio::task::spawn_blocking(move || sync.sync()).await {
                    Ok(Ok(true)) => buffer_trigger.set(),
                    Ok(Ok(false)) => debug!("directory sync clean"),
                    Ok(Err(err)) => {
                        // The cycle aborted before touching the store; the
                        // next one starts from a consistent state.
                        error!(?err, "directory sync failed");
                    }
                    Err(err) => error!(?err, "directory sync task panicked"),
                }
            }
        });
    }

    {
        let buffer_trigger = buffer_trigger.clone();
        tokio::spawn(async move {
            loop {
                buffer_trigger.wait().await;
                debug!("buffer refresh requested");
            }
        });
    }

    wait_for_shutdown().await;
    info!("shutting down");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl-C; tasks abort with the runtime.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(?err, "no SIGTERM handler, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
