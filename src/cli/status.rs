use anyhow::Result;
use chrono::{DateTime, Utc};
use console_poller::api::{FetchClient, FetchError, Fetched, RequestConfig};
use console_poller::core::settings::Settings;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Serialize)]
struct StatusOutput {
    server: String,
    endpoints: BTreeMap<String, EndpointStatus>,
    #[serde(with = "chrono::serde::ts_seconds")]
    fetched_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct EndpointStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(json: bool, endpoint: Option<String>) -> Result<()> {
    let settings = Settings::load()?;
    settings.validate()?;

    let endpoints = match endpoint {
        Some(uri) => vec![uri],
        None => settings.poller.endpoints.clone(),
    };
    if endpoints.is_empty() {
        anyhow::bail!("No endpoints configured. Set poller.endpoints or pass --endpoint.");
    }

    // One-shot fetches report errors inline, nobody listens for notices.
    let (notice_tx, _) = mpsc::unbounded_channel();
    let client = FetchClient::from_settings(&settings, notice_tx)?;

    let mut results = BTreeMap::new();
    for uri in endpoints {
        let status = fetch_endpoint(&client, &uri).await;
        results.insert(uri, status);
    }

    if json {
        let output = StatusOutput {
            server: settings.server.base_url.clone(),
            endpoints: results,
            fetched_at: Utc::now(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text_output(&settings.server.base_url, &results);
    }

    Ok(())
}

async fn fetch_endpoint(client: &FetchClient, uri: &str) -> EndpointStatus {
    match client.get(uri, &RequestConfig::without_intercept()).await {
        Ok(Fetched::Changed(payload)) => EndpointStatus {
            payload: Some(payload),
            status: None,
            error: None,
        },
        // Fresh client, no validators yet: only a misbehaving server gets here.
        Ok(Fetched::Unchanged) => EndpointStatus {
            payload: None,
            status: Some(304),
            error: None,
        },
        Err(e) => error_status(&e),
    }
}

fn error_status(error: &FetchError) -> EndpointStatus {
    EndpointStatus {
        payload: None,
        status: Some(error.status()),
        error: Some(error.to_string()),
    }
}

fn summarize(payload: &Value) -> String {
    match payload {
        Value::Array(items) => format!("{} item(s)", items.len()),
        Value::Object(map) => format!("{} field(s)", map.len()),
        Value::Null => "empty".to_string(),
        other => {
            let text = other.to_string();
            if text.chars().count() > 60 {
                format!("{}...", text.chars().take(57).collect::<String>())
            } else {
                text
            }
        }
    }
}

fn print_text_output(server: &str, results: &BTreeMap<String, EndpointStatus>) {
    println!("{}", server);
    for (uri, status) in results {
        match (&status.payload, &status.error) {
            (_, Some(error)) => println!("  {:<32} error: {}", uri, error),
            (Some(payload), None) => println!("  {:<32} ok ({})", uri, summarize(payload)),
            (None, None) => println!("  {:<32} not modified", uri),
        }
    }
}
