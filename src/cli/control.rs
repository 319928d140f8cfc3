use anyhow::{Context, Result};
use console_poller::daemon::{DBUS_NAME, DBUS_PATH};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use zbus::zvariant::DynamicType;

async fn call<B, R>(method: &str, body: &B) -> Result<R>
where
    B: Serialize + DynamicType,
    R: DeserializeOwned + zbus::zvariant::Type,
{
    let connection = zbus::Connection::session()
        .await
        .context("Failed to connect to session D-Bus")?;

    let reply: R = connection
        .call_method(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), method, body)
        .await
        .with_context(|| format!("Failed to call {} method - is the daemon running?", method))?
        .body()
        .deserialize()
        .context("Failed to deserialize response")?;

    Ok(reply)
}

pub async fn refresh() -> Result<()> {
    call::<_, ()>("Refresh", &()).await?;
    println!("Refresh triggered successfully");
    Ok(())
}

pub async fn pause() -> Result<()> {
    call::<_, ()>("Pause", &()).await?;
    println!("Polling paused");
    Ok(())
}

pub async fn resume() -> Result<()> {
    call::<_, ()>("Resume", &()).await?;
    println!("Polling resumed");
    Ok(())
}

pub async fn reload(configuration: Option<String>) -> Result<()> {
    let name = configuration.clone().unwrap_or_default();
    call::<_, ()>("Reload", &(name,)).await?;
    match configuration {
        Some(name) => println!("Reload of {} requested", name),
        None => println!("Full reload requested"),
    }
    Ok(())
}

/// Lists polled endpoints with their scheduling state.
pub async fn list(json: bool) -> Result<()> {
    let raw: String = call("Status", &()).await?;
    let tasks: Vec<Value> = serde_json::from_str(&raw).context("Daemon sent malformed status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else if tasks.is_empty() {
        println!("No endpoints are being polled");
    } else {
        for task in &tasks {
            println!("{}", format_task(task));
        }
    }
    Ok(())
}

fn format_task(task: &Value) -> String {
    let mut line = format!(
        "{:<32} {:<12} {:<14} every {}ms",
        task["uri"].as_str().unwrap_or("?"),
        task["status"].as_str().unwrap_or("?"),
        task["regime"].as_str().unwrap_or("?"),
        task["interval_ms"].as_u64().unwrap_or(0),
    );
    let errors = task["errors"].as_u64().unwrap_or(0);
    if errors > 0 {
        line.push_str(&format!(", {} recent error(s)", errors));
    }
    line
}
