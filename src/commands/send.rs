use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use herald::config::Config;
use herald::dispatch::{DispatchContext, Dispatcher, SendRequest};
use herald::metrics;
use herald::models::{BroadcastId, UserId};
use herald::utils::parse_id_list;

use super::open_storage;

/// Parameters for the send command
pub struct SendParams {
    pub id: i64,
    pub caller: i64,
    pub to: Option<String>,
    pub timeout_secs: Option<u64>,
    pub print_metrics: bool,
}

pub async fn send(config: &Config, params: SendParams) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without metrics");
    }

    let targets = match params.to.as_deref() {
        Some(list) => parse_id_list(list).context("Invalid --to list")?,
        None => Vec::new(),
    };

    let storage = open_storage(config).await?;
    let dispatcher = Dispatcher::new(&storage, config.dispatch.clone());

    // Ctrl-C stops new deliveries; in-flight ones finish and the broadcast is finalized
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling dispatch");
            let _ = cancel_tx.send(true);
        }
    });

    let timeout = params
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.dispatch.default_timeout());
    let context = DispatchContext::new()
        .with_timeout(timeout)
        .with_cancellation(cancel_rx);

    let request = SendRequest::new(BroadcastId(params.id), UserId(params.caller))
        .with_targets(targets.into_iter().map(UserId));

    let result = dispatcher
        .send_with_context(request, context)
        .await
        .with_context(|| format!("Failed to send broadcast {}", params.id))?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if params.print_metrics {
        let text = metrics::encode_metrics()
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {e}"))?;
        println!("\n{text}");
    }

    Ok(())
}

pub async fn reap(config: &Config, older_than_secs: Option<u64>) -> Result<()> {
    let storage = open_storage(config).await?;
    let dispatcher = Dispatcher::new(&storage, config.dispatch.clone());

    let expired = match older_than_secs {
        Some(secs) => dispatcher.reap_older_than(Duration::from_secs(secs)).await?,
        None => dispatcher.reap_stale().await?,
    };

    if expired.is_empty() {
        println!("No stale broadcasts.");
    } else {
        println!("Marked {} broadcast(s) as failed:", expired.len());
        for id in expired {
            println!("  {id}");
        }
    }
    Ok(())
}
