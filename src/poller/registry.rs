use crate::api::FetchClient;
use crate::core::settings::PollerSettings;
use crate::hooks::HookBus;
use crate::poller::task::{PollCallback, PollTask, TaskSnapshot};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Owns at most one [`PollTask`] per URI.
pub struct Registry {
    client: FetchClient,
    hooks: Option<HookBus>,
    default_interval_ms: AtomicU64,
    min_interval: Duration,
    max_interval: Duration,
    tasks: RwLock<IndexMap<String, Arc<PollTask>>>,
}

impl Registry {
    pub fn new(client: FetchClient, settings: &PollerSettings) -> Self {
        Self {
            client,
            hooks: None,
            default_interval_ms: AtomicU64::new(settings.interval_ms),
            min_interval: Duration::from_millis(settings.min_interval_ms),
            max_interval: Duration::from_millis(settings.max_interval_ms),
            tasks: RwLock::new(IndexMap::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: HookBus) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn client(&self) -> &FetchClient {
        &self.client
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_default_interval(&self, interval: Duration) {
        self.default_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Creates a task for `uri`. Returns `None` when one already exists.
    ///
    /// Intervals at or below the floor are ignored in favour of the default.
    /// With `auto_start` the first fetch is dispatched immediately.
    pub fn add(
        &self,
        uri: &str,
        callback: PollCallback,
        auto_start: bool,
        interval: Option<Duration>,
    ) -> Option<Arc<PollTask>> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(uri) {
            tracing::warn!(uri, "Tried to register poller twice");
            return None;
        }

        let interval = match interval {
            Some(interval) => self.above_floor(interval),
            None => self.default_interval(),
        };

        let mut task = PollTask::new(
            uri,
            callback,
            self.client.clone(),
            interval,
            self.max_interval,
        );
        if let Some(hooks) = &self.hooks {
            task = task.with_hooks(hooks.clone());
        }
        let task = Arc::new(task);
        tasks.insert(uri.to_string(), Arc::clone(&task));
        drop(tasks);

        tracing::info!(uri, interval_ms = interval.as_millis() as u64, "Added poller");
        if auto_start {
            task.start_now();
        }
        Some(task)
    }

    /// Stops and forgets the task for `uri` along with its cached validator.
    pub fn remove(&self, uri: &str) -> bool {
        let Some(task) = self.tasks.write().shift_remove(uri) else {
            return false;
        };
        task.stop();
        self.client.cache().remove(uri);
        tracing::info!(uri, "Removed poller");
        true
    }

    pub fn get(&self, uri: &str) -> Option<Arc<PollTask>> {
        self.tasks.read().get(uri).cloned()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.tasks.read().contains_key(uri)
    }

    /// Visits tasks in registration order. The callback may call back into
    /// the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<PollTask>),
    {
        for task in self.tasks_snapshot() {
            f(&task);
        }
    }

    /// Switches `uri` to the waiting regime at the given interval.
    pub fn change_interval(&self, uri: &str, interval: Duration) -> bool {
        let Some(task) = self.get(uri) else {
            tracing::debug!(uri, "No poller to change interval for");
            return false;
        };
        task.wait_for_response(true);
        task.set_interval(self.above_floor(interval), false);
        true
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks_snapshot().iter().map(|t| t.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Operations applied to every registered task.
    pub fn all(&self) -> BatchHandle<'_> {
        BatchHandle { registry: self }
    }

    /// Intervals at or below the floor fall back to the default.
    fn above_floor(&self, interval: Duration) -> Duration {
        if interval > self.min_interval {
            return interval;
        }
        tracing::debug!(
            requested_ms = interval.as_millis() as u64,
            "Requested interval below floor, using default"
        );
        self.default_interval()
    }

    fn tasks_snapshot(&self) -> Vec<Arc<PollTask>> {
        self.tasks.read().values().cloned().collect()
    }
}

pub struct BatchHandle<'a> {
    registry: &'a Registry,
}

impl BatchHandle<'_> {
    pub fn start(&self) {
        tracing::debug!(count = self.registry.len(), "Starting all pollers");
        self.registry.for_each(|task| task.start_now());
    }

    pub fn stop(&self) {
        tracing::debug!(count = self.registry.len(), "Stopping all pollers");
        self.registry.for_each(|task| task.stop());
    }

    /// `None` restores the registry default. Takes effect from the next arm.
    pub fn change_interval(&self, interval: Option<Duration>) {
        let interval = match interval {
            Some(interval) => self.registry.above_floor(interval),
            None => self.registry.default_interval(),
        };
        self.registry
            .for_each(|task| task.set_interval(interval, false));
    }

    pub fn remove(&self) {
        let drained: Vec<(String, Arc<PollTask>)> =
            self.registry.tasks.write().drain(..).collect();
        for (uri, task) in drained {
            task.stop();
            self.registry.client.cache().remove(&uri);
        }
        tracing::info!("Removed all pollers");
    }

    pub fn list(&self) -> Vec<String> {
        self.registry.tasks.read().keys().cloned().collect()
    }

    /// One immediate cycle on every task, outside their schedules.
    pub async fn refresh(&self) {
        let mut cycles = JoinSet::new();
        for task in self.registry.tasks_snapshot() {
            cycles.spawn(async move { task.run_once().await });
        }
        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Refresh cycle panicked");
            }
        }
    }
}
