mod dbus;
mod idle;
mod reload;

use crate::api::{FetchClient, Notice};
use crate::core::notifications::show_desktop_notice;
use crate::core::settings::{Settings, SettingsWatcher};
use crate::core::store::SnapshotStore;
use crate::hooks::{self, HookBus};
use crate::poller::{poll_callback, Registry};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub use dbus::DbusCommand;
pub use idle::run_idle_watch;
pub use reload::{configurations_settled, full_reload};

pub const DBUS_NAME: &str = "io.github.ConsolePoller";
pub const DBUS_PATH: &str = "/io/github/ConsolePoller";

pub async fn run() -> Result<()> {
    tracing::info!("Starting console-poller daemon");

    let mut settings_watcher = SettingsWatcher::new()?;
    let settings = settings_watcher.get().await;
    settings.validate().context("Invalid configuration")?;
    if let Err(e) = settings_watcher.start_watching() {
        tracing::warn!(error = %e, "Config hot-reload unavailable");
    }
    let live_settings = Arc::new(RwLock::new(settings.clone()));

    let (notice_tx, notice_rx) = mpsc::unbounded_channel::<Notice>();
    let client = FetchClient::from_settings(&settings, notice_tx)?;
    let hooks = HookBus::new();
    let store = SnapshotStore::new();
    let registry = Arc::new(Registry::new(client, &settings.poller).with_hooks(hooks.clone()));

    subscribe_store(&hooks, &store);
    tokio::spawn(handle_notices(
        notice_rx,
        Arc::clone(&registry),
        store.clone(),
        Arc::clone(&live_settings),
    ));

    register_endpoints(&registry, &store, &settings.poller.endpoints);
    hooks.call(hooks::INIT, json!({ "endpoints": registry.all().list() }));

    let (activity_tx, activity_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(run_idle_watch(
        Arc::clone(&registry),
        settings.idle.clone(),
        activity_rx,
    ));

    let (dbus_tx, dbus_rx) = mpsc::unbounded_channel::<DbusCommand>();
    let _dbus_connection = match dbus::start_dbus_server(dbus_tx).await {
        Ok(connection) => Some(connection),
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus control unavailable, continuing without it");
            None
        }
    };
    tokio::spawn(handle_dbus_commands(
        dbus_rx,
        Arc::clone(&registry),
        Arc::clone(&live_settings),
        activity_tx,
    ));

    tokio::spawn(apply_settings_changes(
        settings_watcher.subscribe(),
        Arc::clone(&registry),
        store.clone(),
        live_settings,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    registry.all().remove();
    Ok(())
}

/// Polls each endpoint and keeps its latest payload in `store`.
fn register_endpoints(registry: &Registry, store: &SnapshotStore, endpoints: &[String]) {
    for uri in endpoints {
        let store = store.clone();
        let key = uri.clone();
        let callback = poll_callback(move |payload: Value| {
            let store = store.clone();
            let uri = key.clone();
            async move {
                if store.update_snapshot(&uri, payload).await {
                    tracing::debug!(uri = %uri, "Snapshot updated");
                }
            }
        });
        registry.add(uri, callback, true, None);
    }
}

fn subscribe_store(hooks: &HookBus, store: &SnapshotStore) {
    let stale_store = store.clone();
    hooks.register(hooks::POLL_CIRCUIT_OPEN, move |payload| {
        let Some(uri) = payload["uri"].as_str().map(str::to_string) else {
            return;
        };
        let store = stale_store.clone();
        tokio::spawn(async move { store.mark_stale(&uri).await });
    });

    hooks.register(&format!("{}:{}", hooks::INIT, hooks::ONCE), |payload| {
        let count = payload["endpoints"].as_array().map_or(0, Vec::len);
        tracing::info!(endpoints = count, "Pollers initialised");
    });
}

/// Drops every poller, the credentials they were using and what they
/// fetched.
pub async fn logout(registry: &Registry, store: &SnapshotStore) {
    registry.all().remove();
    registry.client().flush_cache();
    registry.client().session().clear();
    store.clear().await;
    tracing::info!("Logged out, polling stopped");
}

async fn handle_notices(
    mut notice_rx: mpsc::UnboundedReceiver<Notice>,
    registry: Arc<Registry>,
    store: SnapshotStore,
    settings: Arc<RwLock<Settings>>,
) {
    while let Some(notice) = notice_rx.recv().await {
        if notice.is_persistent() {
            tracing::warn!(title = notice.title(), "{}", notice.message());
        } else {
            tracing::info!(title = notice.title(), "{}", notice.message());
        }

        if settings.read().notifications.desktop {
            if let Err(e) = show_desktop_notice(&notice) {
                tracing::warn!(error = %e, "Failed to show desktop notification");
            }
        }

        if notice == Notice::SessionExpired {
            logout(&registry, &store).await;
        }
    }
}

async fn handle_dbus_commands(
    mut cmd_rx: mpsc::UnboundedReceiver<DbusCommand>,
    registry: Arc<Registry>,
    settings: Arc<RwLock<Settings>>,
    activity_tx: mpsc::UnboundedSender<()>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            DbusCommand::Refresh => registry.all().refresh().await,
            DbusCommand::Pause => registry.all().stop(),
            DbusCommand::Resume => registry.all().start(),
            DbusCommand::Reload(configuration) => {
                let registry = Arc::clone(&registry);
                let reload_settings = settings.read().reload.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        full_reload(&registry, &reload_settings, configuration.as_deref()).await
                    {
                        tracing::warn!(error = %e, "Reload failed");
                    }
                });
            }
            DbusCommand::Activity => {
                let _ = activity_tx.send(());
            }
            DbusCommand::List(reply) => {
                let _ = reply.send(registry.all().list());
            }
            DbusCommand::Status(reply) => {
                let _ = reply.send(registry.snapshots());
            }
        }
    }
}

/// Applies interval and credential changes from the config file.
async fn apply_settings_changes(
    mut settings_rx: broadcast::Receiver<Settings>,
    registry: Arc<Registry>,
    store: SnapshotStore,
    live: Arc<RwLock<Settings>>,
) {
    loop {
        let new_settings = match settings_rx.recv().await {
            Ok(settings) => settings,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Missed config updates");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let previous = std::mem::replace(&mut *live.write(), new_settings.clone());

        if previous.poller.interval_ms != new_settings.poller.interval_ms {
            registry.set_default_interval(new_settings.poller.interval());
            registry.all().change_interval(None);
        }

        if previous.server.token != new_settings.server.token {
            match &new_settings.server.token {
                Some(token) if !token.is_empty() => {
                    registry.client().session().set_token(token.clone())
                }
                _ => registry.client().session().clear(),
            }
            if registry.is_empty() && registry.client().session().is_authenticated() {
                tracing::info!("Credentials updated, resuming polling");
                register_endpoints(&registry, &store, &new_settings.poller.endpoints);
            }
        }
    }
}
