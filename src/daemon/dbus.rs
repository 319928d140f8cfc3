use crate::daemon::{DBUS_NAME, DBUS_PATH};
use crate::poller::TaskSnapshot;
use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use zbus::interface;

#[derive(Debug)]
pub enum DbusCommand {
    Refresh,
    Pause,
    Resume,
    /// `None` reloads every configuration.
    Reload(Option<String>),
    Activity,
    List(oneshot::Sender<Vec<String>>),
    Status(oneshot::Sender<Vec<TaskSnapshot>>),
}

pub struct ConsolePollerService {
    tx: mpsc::UnboundedSender<DbusCommand>,
}

impl ConsolePollerService {
    pub fn new(tx: mpsc::UnboundedSender<DbusCommand>) -> Self {
        Self { tx }
    }

    fn send(&self, command: DbusCommand) -> zbus::fdo::Result<()> {
        self.tx
            .send(command)
            .map_err(|_| zbus::fdo::Error::Failed("Daemon is shutting down".to_string()))
    }
}

#[interface(name = "io.github.ConsolePoller")]
impl ConsolePollerService {
    async fn refresh(&self) -> zbus::fdo::Result<()> {
        tracing::info!("D-Bus Refresh called");
        self.send(DbusCommand::Refresh)
    }

    async fn pause(&self) -> zbus::fdo::Result<()> {
        tracing::info!("D-Bus Pause called");
        self.send(DbusCommand::Pause)
    }

    async fn resume(&self) -> zbus::fdo::Result<()> {
        tracing::info!("D-Bus Resume called");
        self.send(DbusCommand::Resume)
    }

    /// An empty name reloads everything.
    async fn reload(&self, configuration: String) -> zbus::fdo::Result<()> {
        tracing::info!(configuration = %configuration, "D-Bus Reload called");
        let configuration = (!configuration.is_empty()).then_some(configuration);
        self.send(DbusCommand::Reload(configuration))
    }

    async fn activity(&self) -> zbus::fdo::Result<()> {
        self.send(DbusCommand::Activity)
    }

    async fn list(&self) -> zbus::fdo::Result<Vec<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DbusCommand::List(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| zbus::fdo::Error::Failed("Daemon dropped the request".to_string()))
    }

    /// Per-task state as a JSON array.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DbusCommand::Status(reply_tx))?;
        let snapshots = reply_rx
            .await
            .map_err(|_| zbus::fdo::Error::Failed("Daemon dropped the request".to_string()))?;
        serde_json::to_string(&snapshots).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

pub async fn start_dbus_server(tx: mpsc::UnboundedSender<DbusCommand>) -> Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()
        .context("Failed to connect to session D-Bus")?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, ConsolePollerService::new(tx))?
        .build()
        .await
        .context("Failed to register D-Bus service")?;

    tracing::info!(name = DBUS_NAME, path = DBUS_PATH, "D-Bus service registered");
    Ok(connection)
}
