use crate::api::RequestConfig;
use crate::core::settings::ReloadSettings;
use crate::poller::{poll_callback, Registry};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Every configuration is `STARTED`, or `STOPPED` with an exception.
pub fn configurations_settled(payload: &Value) -> bool {
    let configurations: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => return false,
    };

    configurations.iter().all(|config| {
        match config.get("state").and_then(Value::as_str) {
            Some("STARTED") => true,
            Some("STOPPED") => config.get("exception").is_some_and(|e| !e.is_null()),
            _ => false,
        }
    })
}

/// Pauses polling, asks the server to reload one or all configurations and
/// resumes once they have settled. Polling resumes on failure as well.
pub async fn full_reload(
    registry: &Arc<Registry>,
    settings: &ReloadSettings,
    configuration: Option<&str>,
) -> Result<()> {
    let uri = match configuration {
        Some(name) => format!("configurations/{}", name),
        None => "configurations".to_string(),
    };
    tracing::info!(uri = %uri, "Reloading configurations");

    registry.all().stop();

    let body = json!({ "action": "reload" });
    if let Err(e) = registry
        .client()
        .put(&uri, Some(body), &RequestConfig::default())
        .await
    {
        registry.all().start();
        return Err(e).with_context(|| format!("Reload request to {} failed", uri));
    }

    let settled = wait_until_settled(
        registry,
        &settings.settle_uri,
        Duration::from_secs(settings.settle_timeout_secs),
    )
    .await;

    registry.all().start();
    if settled.is_ok() {
        tracing::info!(uri = %uri, "Configurations settled, polling resumed");
    }
    settled
}

/// Polls `uri` until the payload satisfies [`configurations_settled`]; the
/// poller removes itself on success.
async fn wait_until_settled(registry: &Arc<Registry>, uri: &str, timeout: Duration) -> Result<()> {
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));
    let weak = Arc::downgrade(registry);
    let settle_uri = uri.to_string();

    let callback = poll_callback(move |payload| {
        let done_tx = Arc::clone(&done_tx);
        let weak = weak.clone();
        let uri = settle_uri.clone();
        async move {
            if !configurations_settled(&payload) {
                tracing::debug!(uri = %uri, "Configurations still loading");
                return;
            }
            if let Some(registry) = weak.upgrade() {
                registry.remove(&uri);
            }
            if let Some(done) = done_tx.lock().take() {
                let _ = done.send(());
            }
        }
    });

    if registry.add(uri, callback, true, None).is_none() {
        anyhow::bail!("{} is already being polled", uri);
    }

    match tokio::time::timeout(timeout, done_rx).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => anyhow::bail!("Poller for {} was removed before configurations settled", uri),
        Err(_) => {
            registry.remove(uri);
            anyhow::bail!(
                "Configurations did not settle within {}s",
                timeout.as_secs()
            )
        }
    }
}
