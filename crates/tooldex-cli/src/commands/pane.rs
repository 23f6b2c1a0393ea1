//! `tooldex pane`: drive the primary pane by hand.
//!
//! The same operations the MCP tools expose, for checking a setup from a
//! second terminal.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

use tooldex_core::{
    ActivationId, CaptureOptions, FetchOptions, Multiplexer, PaneId, SubscribeOptions,
    SubscriptionManager,
};

/// Owner used for subscriptions opened by this command.
const MANUAL_OWNER: ActivationId = ActivationId(0);

pub async fn send(
    mux: Arc<dyn Multiplexer>,
    pane: &PaneId,
    text: &str,
    enter: bool,
) -> Result<()> {
    mux.send(pane, text, enter)
        .await
        .with_context(|| format!("failed to send to pane {pane}"))?;
    Ok(())
}

pub async fn read(
    mux: Arc<dyn Multiplexer>,
    pane: &PaneId,
    options: CaptureOptions,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let manager = SubscriptionManager::new(mux);
    let read = manager
        .tracker()
        .read(pane, options)
        .await
        .with_context(|| format!("failed to read pane {pane}"))?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&read)?)?;
    } else {
        for line in &read.content {
            writeln!(out, "{line}")?;
        }
    }
    Ok(())
}

/// Stream new lines until `stop` resolves or `limit` fetches have run.
pub async fn watch(
    mux: Arc<dyn Multiplexer>,
    pane: &PaneId,
    subscribe: SubscribeOptions,
    fetch: FetchOptions,
    limit: Option<usize>,
    out: &mut impl Write,
    stop: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let manager = SubscriptionManager::new(mux);
    let info = manager
        .subscribe(MANUAL_OWNER, pane, subscribe)
        .await
        .with_context(|| format!("failed to subscribe to pane {pane}"))?;
    for line in &info.initial_lines {
        writeln!(out, "{line}")?;
    }
    debug!(token = %info.token, "watching");

    tokio::pin!(stop);
    let mut fetches = 0usize;
    let outcome = loop {
        if limit.is_some_and(|n| fetches >= n) {
            break Ok(());
        }
        fetches += 1;
        let result = tokio::select! {
            result = manager.fetch(&info.token, fetch) => result,
            _ = &mut stop => break Ok(()),
        };
        match result {
            Ok(poll) => {
                if poll.truncated {
                    writeln!(
                        out,
                        "... {} earlier lines skipped",
                        poll.new_line_count - poll.lines.len() as u64
                    )?;
                }
                for line in &poll.lines {
                    writeln!(out, "{line}")?;
                }
                out.flush()?;
            }
            Err(e) => break Err(anyhow::Error::new(e).context("fetch failed")),
        }
    };

    // The token may already be gone if the fetch failed; that is fine.
    let _ = manager.unsubscribe(&info.token).await;
    outcome
}

/// Fetch options from CLI seconds.
pub fn fetch_options(timeout: f64, max_lines: usize, poll_interval: f64) -> Result<FetchOptions> {
    let options = FetchOptions::from_secs(timeout, max_lines as i64, poll_interval)?;
    Ok(options)
}
