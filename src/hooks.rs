//! Deferred named pub/sub.
//!
//! Hooks are registered as `name` or `name:id`. Calling a hook never runs
//! subscribers on the caller's stack: dispatch happens on a spawned task, so
//! a hook fired from inside a fetch completion cannot re-enter its caller.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Subscribers registered under this id run once and are then removed.
pub const ONCE: &str = "once";

/// Fired after a poll cycle delivered a changed payload. Payload: `{"uri": ..}`.
pub const POLL_UPDATED: &str = "pollUpdated";
/// Fired when a poll task opened its circuit. Payload: `{"uri": ..}`.
pub const POLL_CIRCUIT_OPEN: &str = "pollCircuitOpen";
/// Fired once the daemon registered its endpoints.
pub const INIT: &str = "init";

const DEFAULT_ID: &str = "0";

pub type HookCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone, Default)]
pub struct HookBus {
    hooks: Arc<Mutex<HashMap<String, Vec<(String, HookCallback)>>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when `name:id` is already taken. Any number of `once`
    /// subscribers may be registered.
    pub fn register<F>(&self, key: &str, callback: F) -> bool
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let (name, id) = split_key(key);
        let mut hooks = self.hooks.lock();
        let entries = hooks.entry(name.to_string()).or_default();

        if id != ONCE && entries.iter().any(|(existing, _)| existing == id) {
            tracing::warn!(hook = name, id, "Tried to register the same hook twice");
            return false;
        }

        entries.push((id.to_string(), Arc::new(callback)));
        true
    }

    pub fn remove(&self, name: &str, id: &str) -> bool {
        let mut hooks = self.hooks.lock();
        let Some(entries) = hooks.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| existing != id);
        before != entries.len()
    }

    pub fn count(&self, name: &str) -> usize {
        self.hooks.lock().get(name).map_or(0, Vec::len)
    }

    /// Schedules every subscriber of `name`, in registration order.
    pub fn call(&self, name: &str, payload: Value) -> JoinHandle<()> {
        let hooks = Arc::clone(&self.hooks);
        let name = name.to_string();

        tokio::spawn(async move {
            tokio::task::yield_now().await;

            let callbacks: Vec<HookCallback> = {
                let mut hooks = hooks.lock();
                let Some(entries) = hooks.get_mut(&name) else {
                    tracing::trace!(hook = %name, "No subscribers");
                    return;
                };
                let callbacks = entries.iter().map(|(_, cb)| Arc::clone(cb)).collect();
                entries.retain(|(id, _)| id != ONCE);
                callbacks
            };

            for callback in callbacks {
                callback(&payload);
            }
        })
    }
}

fn split_key(key: &str) -> (&str, &str) {
    match key.split_once(':') {
        Some((name, id)) => (name, id),
        None => (key, DEFAULT_ID),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_once_fires_exactly_once() {
        let bus = HookBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        assert!(bus.register("init:once", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let first = bus.call("init", Value::Null);
        let second = bus.call("init", Value::Null);
        first.await.unwrap();
        second.await.unwrap();
        bus.call("init", Value::Null).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.count("init"), 0);
    }

    #[tokio::test]
    async fn test_dispatch_is_deferred() {
        let bus = HookBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.register("adapterUpdated", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handle = bus.call("adapterUpdated", Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected_except_once() {
        let bus = HookBus::new();
        assert!(bus.register("adapterUpdated", |_| {}));
        assert!(!bus.register("adapterUpdated", |_| {}));
        assert!(bus.register("adapterUpdated:summary", |_| {}));
        assert!(!bus.register("adapterUpdated:summary", |_| {}));
        assert!(bus.register("adapterUpdated:once", |_| {}));
        assert!(bus.register("adapterUpdated:once", |_| {}));
        assert_eq!(bus.count("adapterUpdated"), 4);

        assert!(bus.remove("adapterUpdated", "summary"));
        assert!(!bus.remove("adapterUpdated", "summary"));
        assert_eq!(bus.count("adapterUpdated"), 3);
    }

    #[tokio::test]
    async fn test_registration_order_and_payload() {
        let bus = HookBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.register(&format!("adapterUpdated:{}", id), move |payload| {
                seen.lock().push((id, payload["name"].clone()));
            });
        }

        bus.call("adapterUpdated", json!({"name": "Receiver"}))
            .await
            .unwrap();

        let seen = seen.lock();
        let ids: Vec<&str> = seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert!(seen.iter().all(|(_, name)| name == "Receiver"));
    }

    #[tokio::test]
    async fn test_call_without_subscribers_is_harmless() {
        let bus = HookBus::new();
        bus.call("missing", Value::Null).await.unwrap();
    }
}
