//! Live/Cache Reconciliation Layer
//!
//! Decides per platform query whether to go live or serve snapshots:
//!
//! 1. Live call when the connector has a direct capability, retried with
//!    bounded exponential backoff on transient failures.
//! 2. Snapshot store; answers carry `Disclosure::Cached(synced_at)`.
//! 3. Empty store: trigger a sync, poll its task status at a fixed interval
//!    up to a timeout, then re-read the store exactly once. Still empty
//!    means `NoContent`.
//!
//! The store is never re-read without at least one poll interval elapsing
//! after a sync was triggered. Authentication failures are never retried.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, StewardError};
use crate::platform::{ConnectorRegistry, PlatformIntent, PlatformItem, QueryParams};
use crate::storage::{snapshots, Storage};
use crate::sync::SyncBackend;
use crate::types::{Platform, ReconcileConfig, SyncSnapshot};

/// Staleness annotation attached to an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Disclosure {
    Live,
    /// Oldest `synced_at` among the returned items
    Cached { synced_at: DateTime<Utc> },
}

impl Disclosure {
    pub fn is_live(&self) -> bool {
        matches!(self, Disclosure::Live)
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Disclosure::Live => None,
            Disclosure::Cached { synced_at } => Some(*synced_at),
        }
    }
}

/// One item of an answer; cached items carry their own sync time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcedItem {
    #[serde(flatten)]
    pub item: PlatformItem,
    pub synced_at: Option<DateTime<Utc>>,
}

impl From<SyncSnapshot> for SourcedItem {
    fn from(snapshot: SyncSnapshot) -> Self {
        Self {
            item: PlatformItem {
                resource_id: snapshot.resource_id,
                content: snapshot.content,
                metadata: snapshot.metadata,
            },
            synced_at: Some(snapshot.synced_at),
        }
    }
}

/// Content plus its disclosure
#[derive(Debug, Clone, Serialize)]
pub struct PlatformAnswer {
    pub platform: Platform,
    pub items: Vec<SourcedItem>,
    pub disclosure: Disclosure,
}

impl PlatformAnswer {
    fn live(platform: Platform, items: Vec<PlatformItem>) -> Self {
        Self {
            platform,
            items: items
                .into_iter()
                .map(|item| SourcedItem {
                    item,
                    synced_at: None,
                })
                .collect(),
            disclosure: Disclosure::Live,
        }
    }

    /// `None` when `snapshots` is empty; a cached answer is never built without a sync time
    fn cached(platform: Platform, snapshots: Vec<SyncSnapshot>) -> Option<Self> {
        let oldest = snapshots.iter().map(|s| s.synced_at).min()?;
        Some(Self {
            platform,
            items: snapshots.into_iter().map(SourcedItem::from).collect(),
            disclosure: Disclosure::Cached { synced_at: oldest },
        })
    }

    /// Human-readable age note for cached answers
    pub fn staleness_note(&self, now: DateTime<Utc>) -> Option<String> {
        let synced_at = self.disclosure.synced_at()?;
        Some(format!(
            "Cached {} data, last synced {} ({} ago). Mention this age when using it.",
            self.platform.display_name(),
            synced_at.format("%Y-%m-%d %H:%M UTC"),
            humanize_age(now - synced_at)
        ))
    }
}

fn humanize_age(age: chrono::Duration) -> String {
    let minutes = age.num_minutes().max(0);
    match minutes {
        0 => "less than a minute".to_string(),
        1..=59 => format!("{} min", minutes),
        60..=2879 => format!("{} h", minutes / 60),
        _ => format!("{} days", minutes / 1440),
    }
}

/// Per-platform query resolver
#[derive(Clone)]
pub struct Reconciler {
    storage: Storage,
    connectors: ConnectorRegistry,
    sync: Arc<dyn SyncBackend>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        storage: Storage,
        connectors: ConnectorRegistry,
        sync: Arc<dyn SyncBackend>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            storage,
            connectors,
            sync,
            config,
        }
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    pub async fn resolve_platform_query(
        &self,
        user_id: &str,
        platform: Platform,
        intent: &PlatformIntent,
        params: QueryParams,
    ) -> Result<PlatformAnswer> {
        if let Some(items) = self.try_live(user_id, platform, intent, params).await? {
            return Ok(PlatformAnswer::live(platform, items));
        }

        if let Some(answer) = self.read_cache(user_id, platform, intent, params)? {
            debug!(user_id, %platform, intent = intent.name(), "served from snapshots");
            return Ok(answer);
        }

        self.sync_then_reread(user_id, platform, intent, params).await
    }

    /// `Ok(None)` means: fall through to the snapshot store
    async fn try_live(
        &self,
        user_id: &str,
        platform: Platform,
        intent: &PlatformIntent,
        params: QueryParams,
    ) -> Result<Option<Vec<PlatformItem>>> {
        let connector = match self.connectors.get(platform) {
            Some(c) if c.supports(intent) => c,
            _ => return Ok(None),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match intent {
                PlatformIntent::ListResources => connector.list_resources(user_id, params).await,
                PlatformIntent::Fetch { resource_id } => {
                    connector.fetch(user_id, resource_id).await.map(|item| vec![item])
                }
                PlatformIntent::Search { query } => connector.search(user_id, query, params).await,
            };

            match result {
                Ok(items) => return Ok(Some(items)),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.backoff(attempt, &e);
                    debug!(%platform, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying live call");
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!(%platform, attempt, error = %e, "live call failed, falling back to snapshots");
                    return Ok(None);
                }
            }
        }
    }

    /// Exponential backoff with jitter, honoring a rate limiter's hint
    fn backoff(&self, attempt: u32, error: &StewardError) -> Duration {
        let base = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        let mut delay_ms = base.min(self.config.max_backoff_ms);
        if let StewardError::RateLimited {
            retry_after_secs, ..
        } = error
        {
            delay_ms = delay_ms.max(retry_after_secs.saturating_mul(1000));
            delay_ms = delay_ms.min(self.config.max_backoff_ms);
        }
        let jitter = rand::thread_rng().gen_range(0..=delay_ms / 4);
        Duration::from_millis(delay_ms + jitter)
    }

    fn read_cache(
        &self,
        user_id: &str,
        platform: Platform,
        intent: &PlatformIntent,
        params: QueryParams,
    ) -> Result<Option<PlatformAnswer>> {
        let found = self.storage.with_connection(|conn| match intent {
            PlatformIntent::Fetch { resource_id } => {
                Ok(snapshots::get_snapshot(conn, user_id, platform, resource_id)?
                    .into_iter()
                    .collect())
            }
            PlatformIntent::ListResources => {
                snapshots::list_snapshots(conn, user_id, platform, params.limit)
            }
            PlatformIntent::Search { query } => {
                snapshots::search_snapshots(conn, user_id, platform, query, params.limit)
            }
        })?;

        let found = match params.since {
            Some(since) => found.into_iter().filter(|s| s.synced_at >= since).collect(),
            None => found,
        };

        Ok(PlatformAnswer::cached(platform, found))
    }

    async fn sync_then_reread(
        &self,
        user_id: &str,
        platform: Platform,
        intent: &PlatformIntent,
        params: QueryParams,
    ) -> Result<PlatformAnswer> {
        let task_id = match self
            .sync
            .trigger_sync(user_id, platform, intent.resource_id())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(user_id, %platform, error = %e, "could not trigger sync");
                return Err(StewardError::NoContent { platform });
            }
        };

        let started = Instant::now();
        let deadline = started + self.config.poll_timeout();
        let interval = self.config.poll_interval();

        // At least one full interval elapses before the first status check
        sleep(interval).await;
        loop {
            match self.sync.sync_status(&task_id).await {
                Ok(task) if task.state.is_terminal() => {
                    if let Some(error) = task.error {
                        warn!(user_id, %platform, %task_id, error = %error, "sync finished with failure");
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(%task_id, error = %e, "failed to read sync status"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    user_id,
                    %platform,
                    %task_id,
                    waited_secs = (now - started).as_secs(),
                    "sync poll timed out"
                );
                break;
            }
            sleep(interval.min(deadline - now)).await;
        }

        match self.read_cache(user_id, platform, intent, params)? {
            Some(answer) => {
                info!(user_id, %platform, items = answer.items.len(), "served after sync");
                Ok(answer)
            }
            None => Err(StewardError::NoContent { platform }),
        }
    }

    /// Search every connected platform concurrently. Platforms answering
    /// `NoContent` are omitted; other failures are returned per platform.
    pub async fn search_all(
        &self,
        user_id: &str,
        query: &str,
        params: QueryParams,
    ) -> Vec<(Platform, Result<PlatformAnswer>)> {
        let intent = PlatformIntent::Search {
            query: query.to_string(),
        };
        let platforms = self.connectors.platforms();
        let futures = platforms.iter().map(|platform| {
            let intent = intent.clone();
            async move {
                let result = self
                    .resolve_platform_query(user_id, *platform, &intent, params)
                    .await;
                (*platform, result)
            }
        });

        futures::future::join_all(futures)
            .await
            .into_iter()
            .filter(|(_, result)| !matches!(result, Err(StewardError::NoContent { .. })))
            .collect()
    }
}
