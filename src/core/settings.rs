use anyhow::{Context, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

const APP_DIR: &str = "console-poller";
const CONFIG_FILE: &str = "config.toml";
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub poller: PollerSettings,
    pub idle: IdleSettings,
    pub reload: ReloadSettings,
    pub notifications: NotificationSettings,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub base_url: String,
    pub token: Option<String>,
    /// Defaults to one second below the poll interval.
    pub request_timeout_ms: Option<u64>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/iaf/api/".to_string(),
            token: None,
            request_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub interval_ms: u64,
    /// Requested intervals at or below this fall back to `interval_ms`.
    pub min_interval_ms: u64,
    /// Ceiling for adaptive slow-down.
    pub max_interval_ms: u64,
    pub endpoints: Vec<String>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            min_interval_ms: 1_500,
            max_interval_ms: 300_000,
            endpoints: vec![
                "server/warnings".to_string(),
                "adapters?expanded=all".to_string(),
            ],
        }
    }
}

impl PollerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSettings {
    /// 0 disables the idle watch.
    pub after_secs: u64,
    pub interval_ms: u64,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            after_secs: 300,
            interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSettings {
    pub settle_timeout_secs: u64,
    pub settle_uri: String,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            settle_timeout_secs: 120,
            settle_uri: "server/configurations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub desktop: bool,
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path().context("Could not determine config directory")?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(?path, "Loaded config");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let base_url = self.server.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            anyhow::bail!(
                "server.base_url must be an http(s) URL, got {:?}",
                self.server.base_url
            );
        }
        if self.poller.min_interval_ms == 0 {
            anyhow::bail!("poller.min_interval_ms must be positive");
        }
        if self.poller.interval_ms <= self.poller.min_interval_ms {
            anyhow::bail!(
                "poller.interval_ms ({}) must exceed poller.min_interval_ms ({})",
                self.poller.interval_ms,
                self.poller.min_interval_ms
            );
        }
        if self.poller.max_interval_ms < self.poller.interval_ms {
            anyhow::bail!(
                "poller.max_interval_ms ({}) must be at least poller.interval_ms ({})",
                self.poller.max_interval_ms,
                self.poller.interval_ms
            );
        }
        if self.idle.interval_ms == 0 {
            anyhow::bail!("idle.interval_ms must be positive");
        }
        if self.reload.settle_timeout_secs == 0 {
            anyhow::bail!("reload.settle_timeout_secs must be positive");
        }
        if self.server.request_timeout_ms == Some(0) {
            anyhow::bail!("server.request_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        match self.server.request_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(self.poller.interval_ms.saturating_sub(1_000).max(1_000)),
        }
    }
}

struct WatchedSettings {
    path: PathBuf,
    current: RwLock<Settings>,
    tx: broadcast::Sender<Settings>,
}

impl WatchedSettings {
    /// Re-reads the file. Invalid files are logged and ignored so the last
    /// good settings stay in effect.
    async fn reload(&self) -> bool {
        let loaded = Settings::load_from(&self.path).and_then(|s| s.validate().map(|_| s));
        let settings = match loaded {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, path = ?self.path, "Ignoring invalid config change");
                return false;
            }
        };

        let mut current = self.current.write().await;
        if *current == settings {
            return false;
        }
        *current = settings.clone();
        drop(current);

        tracing::info!(path = ?self.path, "Config reloaded");
        let _ = self.tx.send(settings);
        true
    }
}

/// Keeps the settings file loaded and broadcasts every valid change.
pub struct SettingsWatcher {
    shared: Arc<WatchedSettings>,
    _watcher: Option<RecommendedWatcher>,
}

impl SettingsWatcher {
    pub fn new() -> Result<Self> {
        let path = Settings::config_path().context("Could not determine config directory")?;
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Result<Self> {
        let settings = Settings::load_from(&path)?;
        let (tx, _) = broadcast::channel(8);
        Ok(Self {
            shared: Arc::new(WatchedSettings {
                path,
                current: RwLock::new(settings),
                tx,
            }),
            _watcher: None,
        })
    }

    pub async fn get(&self) -> Settings {
        self.shared.current.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Settings> {
        self.shared.tx.subscribe()
    }

    pub async fn reload(&self) -> bool {
        self.shared.reload().await
    }

    /// Watches the config directory; a missing directory is skipped.
    pub fn start_watching(&mut self) -> Result<()> {
        let path = self.shared.path.clone();
        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            anyhow::bail!("Invalid config path: {}", path.display());
        };
        if !dir.exists() {
            tracing::warn!(?dir, "Config directory does not exist, skipping watch");
            return Ok(());
        }

        let file_name = file_name.to_os_string();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else {
                    return;
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    let _ = notify_tx.send(());
                }
            },
            Config::default(),
        )?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory: {}", dir.display()))?;
        tracing::info!(?dir, "Watching config directory");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while notify_rx.recv().await.is_some() {
                // Editors emit bursts of events for a single save.
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while notify_rx.try_recv().is_ok() {}
                shared.reload().await;
            }
        });

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.poller.interval_ms, 10_000);
        assert_eq!(settings.poller.min_interval_ms, 1_500);
        assert_eq!(settings.idle.after_secs, 300);
        assert_eq!(settings.idle.interval_ms, 60_000);
        assert_eq!(settings.reload.settle_uri, "server/configurations");
        assert!(!settings.notifications.desktop);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        settings.server.base_url = "localhost:8080".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.poller.interval_ms = 1_000;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.poller.max_interval_ms = 5_000;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.reload.settle_timeout_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_request_timeout() {
        let mut settings = Settings::default();
        assert_eq!(settings.request_timeout(), Duration::from_secs(9));

        settings.poller.interval_ms = 1_800;
        assert_eq!(settings.request_timeout(), Duration::from_secs(1));

        settings.server.request_timeout_ms = Some(2_500);
        assert_eq!(settings.request_timeout(), Duration::from_millis(2_500));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            debug = true

            [server]
            base_url = "https://console.example.com/iaf/api"
            token = "abc"

            [poller]
            interval_ms = 5000
            endpoints = ["adapters"]

            [idle]
            after_secs = 0

            [notifications]
            desktop = true
        "#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert!(settings.debug);
        assert_eq!(settings.server.token.as_deref(), Some("abc"));
        assert_eq!(settings.poller.interval_ms, 5000);
        assert_eq!(settings.poller.min_interval_ms, 1_500);
        assert_eq!(settings.poller.endpoints, vec!["adapters".to_string()]);
        assert_eq!(settings.idle.after_secs, 0);
        assert_eq!(settings.idle.interval_ms, 60_000);
        assert!(settings.notifications.desktop);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[tokio::test]
    async fn test_watcher_reload_broadcasts_valid_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[poller]\ninterval_ms = 5000\n").unwrap();

        let watcher = SettingsWatcher::with_path(path.clone()).unwrap();
        assert_eq!(watcher.get().await.poller.interval_ms, 5000);
        let mut rx = watcher.subscribe();

        // Unchanged file: nothing to broadcast.
        assert!(!watcher.reload().await);

        std::fs::write(&path, "[poller]\ninterval_ms = 20000\n").unwrap();
        assert!(watcher.reload().await);
        assert_eq!(rx.recv().await.unwrap().poller.interval_ms, 20000);

        // Invalid values keep the last good settings.
        std::fs::write(&path, "[poller]\ninterval_ms = 10\n").unwrap();
        assert!(!watcher.reload().await);
        assert_eq!(watcher.get().await.poller.interval_ms, 20000);

        std::fs::write(&path, "not toml [").unwrap();
        assert!(!watcher.reload().await);
        assert!(rx.try_recv().is_err());
    }
}
