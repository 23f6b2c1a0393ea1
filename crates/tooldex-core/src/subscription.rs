//! Subscription bookkeeping.
//!
//! A subscription pins a reader's position in one pane. Tokens are random
//! and never reused. Every subscription belongs to an [`ActivationId`];
//! closing an owner cancels its in-flight fetches and releases its tokens
//! in one step, and refuses any later subscribe for that owner.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::capture::{CaptureTracker, Cursor};
use crate::error::{ToolError, ToolResult};
use crate::pane::{Multiplexer, PaneId};
use crate::poll::{wait_for_lines, FetchOptions, PollResult};

/// Identifies the activation (or other scope) that owns subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ActivationId(pub u64);

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "activation-{}", self.0)
    }
}

/// Parameters of a new subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Keep ANSI colour escapes in delivered lines.
    pub include_colors: bool,
    /// Recent lines to return immediately (0 = none).
    pub initial_lines: usize,
}

/// Returned by [`SubscriptionManager::subscribe`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub token: String,
    pub pane: PaneId,
    pub include_colors: bool,
    pub lines_recorded: u64,
    pub initial_lines: Vec<String>,
    pub initial_truncated: bool,
}

/// Listing entry for a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSummary {
    pub token: String,
    pub pane: PaneId,
    pub owner: ActivationId,
    pub include_colors: bool,
    pub age_secs: u64,
}

struct Subscription {
    token: String,
    pane: PaneId,
    owner: ActivationId,
    include_colors: bool,
    created_at: Instant,
    /// Held for the whole of a fetch, so fetches on one token run one at a time.
    cursor: Mutex<Cursor>,
    cancel: watch::Sender<bool>,
}

impl Subscription {
    fn summary(&self) -> SubscriptionSummary {
        SubscriptionSummary {
            token: self.token.clone(),
            pane: self.pane.clone(),
            owner: self.owner,
            include_colors: self.include_colors,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<String, Arc<Subscription>>,
    closed_owners: HashSet<ActivationId>,
}

/// Token → subscription map shared by every activation.
pub struct SubscriptionManager {
    tracker: CaptureTracker,
    registry: RwLock<Registry>,
}

impl SubscriptionManager {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self {
            tracker: CaptureTracker::new(mux),
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn tracker(&self) -> &CaptureTracker {
        &self.tracker
    }

    /// Start tracking `pane` from its current end.
    pub async fn subscribe(
        &self,
        owner: ActivationId,
        pane: &PaneId,
        options: SubscribeOptions,
    ) -> ToolResult<SubscriptionInfo> {
        if self.registry.read().await.closed_owners.contains(&owner) {
            return Err(ToolError::Cancelled);
        }

        let snapshot = self
            .tracker
            .snapshot(pane, options.initial_lines, options.include_colors)
            .await?;

        let token = generate_token();
        let lines_recorded = snapshot.cursor.delivered;
        let (cancel, _) = watch::channel(false);
        let subscription = Arc::new(Subscription {
            token: token.clone(),
            pane: pane.clone(),
            owner,
            include_colors: options.include_colors,
            created_at: Instant::now(),
            cursor: Mutex::new(snapshot.cursor),
            cancel,
        });

        let mut registry = self.registry.write().await;
        // Re-check under the write lock: the owner may have closed while
        // the baseline was being captured.
        if registry.closed_owners.contains(&owner) {
            return Err(ToolError::Cancelled);
        }
        registry.subscriptions.insert(token.clone(), subscription);
        drop(registry);

        info!(token = %token, pane = %pane, %owner, lines_recorded, "subscribed");
        Ok(SubscriptionInfo {
            token,
            pane: pane.clone(),
            include_colors: options.include_colors,
            lines_recorded,
            initial_lines: snapshot.lines,
            initial_truncated: snapshot.truncated,
        })
    }

    /// Wait for new lines on `token`.
    pub async fn fetch(&self, token: &str, options: FetchOptions) -> ToolResult<PollResult> {
        options.validate()?;
        let subscription = self.get(token).await?;
        let mut cancel = subscription.cancel.subscribe();

        let mut cursor = tokio::select! {
            guard = subscription.cursor.lock() => guard,
            _ = cancel.wait_for(|flag| *flag) => return Err(ToolError::Cancelled),
        };

        wait_for_lines(
            &self.tracker,
            &subscription.token,
            &subscription.pane,
            subscription.include_colors,
            &mut cursor,
            &options,
            &mut cancel,
        )
        .await
    }

    /// Release `token`. Releasing twice reports [`ToolError::UnknownToken`].
    pub async fn unsubscribe(&self, token: &str) -> ToolResult<()> {
        let removed = self.registry.write().await.subscriptions.remove(token);
        match removed {
            Some(subscription) => {
                let _ = subscription.cancel.send(true);
                info!(token, pane = %subscription.pane, "unsubscribed");
                Ok(())
            }
            None => Err(ToolError::UnknownToken(token.to_string())),
        }
    }

    /// Cancel and release every subscription of `owner`; returns how many.
    pub async fn close_owner(&self, owner: ActivationId) -> usize {
        let mut registry = self.registry.write().await;
        registry.closed_owners.insert(owner);
        let tokens: Vec<String> = registry
            .subscriptions
            .values()
            .filter(|s| s.owner == owner)
            .map(|s| s.token.clone())
            .collect();
        for token in &tokens {
            if let Some(subscription) = registry.subscriptions.remove(token) {
                let _ = subscription.cancel.send(true);
            }
        }
        drop(registry);

        if !tokens.is_empty() {
            info!(%owner, count = tokens.len(), "released subscriptions");
        } else {
            debug!(%owner, "no subscriptions to release");
        }
        tokens.len()
    }

    /// Live subscriptions, optionally limited to one owner.
    pub async fn list(&self, owner: Option<ActivationId>) -> Vec<SubscriptionSummary> {
        let registry = self.registry.read().await;
        let mut out: Vec<SubscriptionSummary> = registry
            .subscriptions
            .values()
            .filter(|s| owner.map_or(true, |o| s.owner == o))
            .map(|s| s.summary())
            .collect();
        out.sort_by(|a, b| a.token.cmp(&b.token));
        out
    }

    pub async fn count(&self) -> usize {
        self.registry.read().await.subscriptions.len()
    }

    async fn get(&self, token: &str) -> ToolResult<Arc<Subscription>> {
        self.registry
            .read()
            .await
            .subscriptions
            .get(token)
            .cloned()
            .ok_or_else(|| ToolError::UnknownToken(token.to_string()))
    }
}

/// Random 128-bit token, hex encoded.
fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::MockMultiplexer;
    use std::time::Duration;

    const OWNER: ActivationId = ActivationId(1);

    fn setup() -> (Arc<MockMultiplexer>, Arc<SubscriptionManager>, PaneId) {
        let mux = Arc::new(MockMultiplexer::new());
        let pane = mux.add_pane(24, 10_000);
        let manager = Arc::new(SubscriptionManager::new(mux.clone()));
        (mux, manager, pane)
    }

    fn quick(timeout_ms: u64) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_millis(timeout_ms),
            max_lines: 200,
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn echo_scenario() {
        let (mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        assert!(sub.initial_lines.is_empty());

        mux.send(&pane, "echo hi", true).await.unwrap();
        let result = manager
            .fetch(
                &sub.token,
                FetchOptions {
                    timeout: Duration::from_secs(2),
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(!result.timed_out);
        let echo = result.lines.iter().position(|l| l.contains("echo hi")).unwrap();
        assert_eq!(result.lines[echo + 1], "hi");
    }

    #[tokio::test]
    async fn successive_fetches_partition_output() {
        let (mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();

        let mut delivered = Vec::new();
        for batch in 0..5 {
            for i in 0..(batch + 1) {
                mux.write(&pane, &format!("\nline-{batch}-{i}"));
            }
            let result = manager.fetch(&sub.token, quick(200)).await.unwrap();
            delivered.extend(result.lines);
        }
        mux.write(&pane, "\n");
        delivered.extend(manager.fetch(&sub.token, quick(200)).await.unwrap().lines);

        let mut expected = vec!["$ ".to_string()];
        for batch in 0..5 {
            for i in 0..(batch + 1) {
                expected.push(format!("line-{batch}-{i}"));
            }
        }
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn timeout_without_output() {
        let (_mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        let options = FetchOptions {
            timeout: Duration::from_millis(150),
            max_lines: 10,
            poll_interval: Duration::from_millis(50),
        };
        let started = std::time::Instant::now();
        let result = manager.fetch(&sub.token, options).await.unwrap();
        let elapsed = started.elapsed();
        assert!(result.timed_out);
        assert!(result.lines.is_empty());
        assert!(elapsed >= Duration::from_millis(150));
        // Scheduling slack on a loaded machine; the loop itself never
        // sleeps past the deadline.
        assert!(elapsed < Duration::from_millis(150 + 50 + 150));
    }

    #[tokio::test]
    async fn truncation_accounting() {
        let (mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        for i in 0..10 {
            mux.write(&pane, &format!("{i}\n"));
        }
        let result = manager
            .fetch(
                &sub.token,
                FetchOptions {
                    max_lines: 3,
                    ..quick(100)
                },
            )
            .await
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.lines.len(), 3);
        assert_eq!(result.new_line_count, 10);
        assert_eq!(result.lines, vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn unsubscribe_then_fetch_is_unknown() {
        let (_mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        manager.unsubscribe(&sub.token).await.unwrap();
        assert!(matches!(
            manager.fetch(&sub.token, quick(10)).await,
            Err(ToolError::UnknownToken(_))
        ));
        assert!(matches!(
            manager.unsubscribe(&sub.token).await,
            Err(ToolError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn cleared_scrollback_reports_gap() {
        let mux = Arc::new(MockMultiplexer::new());
        let pane = mux.add_pane(3, 10_000);
        let manager = SubscriptionManager::new(mux.clone());
        mux.write(&pane, "a\nb\nc\nd\ne\n");
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        mux.clear_history(&pane);
        let err = manager.fetch(&sub.token, quick(50)).await.unwrap_err();
        assert!(matches!(err, ToolError::Gap { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_cancels_inflight_fetch() {
        let (_mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        let fetcher = {
            let manager = manager.clone();
            let token = sub.token.clone();
            tokio::spawn(async move { manager.fetch(&token, quick(5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.unsubscribe(&sub.token).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), fetcher)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ToolError::Cancelled)));
    }

    #[tokio::test]
    async fn close_owner_releases_only_its_tokens() {
        let (_mux, manager, pane) = setup();
        let mine = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        let other = manager
            .subscribe(ActivationId(2), &pane, SubscribeOptions::default())
            .await
            .unwrap();

        assert_eq!(manager.close_owner(OWNER).await, 1);
        assert!(matches!(
            manager.fetch(&mine.token, quick(10)).await,
            Err(ToolError::UnknownToken(_))
        ));
        assert!(manager.fetch(&other.token, quick(10)).await.is_ok());
        assert!(matches!(
            manager
                .subscribe(OWNER, &pane, SubscribeOptions::default())
                .await,
            Err(ToolError::Cancelled)
        ));
        assert_eq!(manager.list(None).await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_fetches_do_not_duplicate() {
        let (mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        mux.write(&pane, "\nx\ny\n");
        let a = {
            let manager = manager.clone();
            let token = sub.token.clone();
            tokio::spawn(async move { manager.fetch(&token, quick(100)).await })
        };
        let b = {
            let manager = manager.clone();
            let token = sub.token.clone();
            tokio::spawn(async move { manager.fetch(&token, quick(100)).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        let mut all: Vec<String> = a.lines.into_iter().chain(b.lines).collect();
        all.sort();
        assert_eq!(all, vec!["$ ", "x", "y"]);
    }

    #[tokio::test]
    async fn vanished_pane_is_reported() {
        let (mux, manager, pane) = setup();
        let sub = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        mux.remove_pane(&pane);
        assert!(matches!(
            manager.fetch(&sub.token, quick(50)).await,
            Err(ToolError::PaneNotFound(_))
        ));
    }

    #[tokio::test]
    async fn tokens_are_unique() {
        let (_mux, manager, pane) = setup();
        let a = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        let b = manager
            .subscribe(OWNER, &pane, SubscribeOptions::default())
            .await
            .unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), 32);
    }
}
