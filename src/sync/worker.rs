//! Background sync worker
//!
//! Pulls content through the platform connector and overwrites snapshots
//! last-write-wins per (platform, resource). Every request ends in a terminal
//! task state, including when no connector is registered.

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::SyncRequest;
use crate::error::{Result, StewardError};
use crate::platform::{ConnectorRegistry, PlatformItem, QueryParams};
use crate::storage::{snapshots, sync_tasks, Storage};
use crate::types::SyncSnapshot;

/// Resources pulled per whole-platform sync
const LIST_LIMIT: usize = 200;

pub struct SyncWorker {
    storage: Storage,
    connectors: ConnectorRegistry,
    receiver: async_channel::Receiver<SyncRequest>,
}

impl SyncWorker {
    pub fn new(
        storage: Storage,
        connectors: ConnectorRegistry,
        receiver: async_channel::Receiver<SyncRequest>,
    ) -> Self {
        Self {
            storage,
            connectors,
            receiver,
        }
    }

    /// Spawn the worker loop. It exits when the queue closes or `shutdown` flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = self.receiver.recv() => {
                        match request {
                            Ok(request) => self.process(request).await,
                            Err(_) => break,
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sync worker stopped");
        })
    }

    /// Run one request to a terminal state
    pub async fn process(&self, request: SyncRequest) {
        if let Err(e) = self
            .storage
            .with_connection(|conn| sync_tasks::mark_running(conn, &request.task_id))
        {
            error!(task_id = %request.task_id, error = %e, "failed to mark sync task running");
        }

        let outcome = self.pull(&request).await;

        let recorded = match &outcome {
            Ok(count) => {
                info!(
                    task_id = %request.task_id,
                    platform = %request.platform,
                    items = count,
                    "Sync completed"
                );
                self.storage.with_connection(|conn| {
                    sync_tasks::mark_completed(conn, &request.task_id, *count)
                })
            }
            Err(e) => {
                warn!(
                    task_id = %request.task_id,
                    platform = %request.platform,
                    error = %e,
                    "Sync failed"
                );
                self.storage.with_connection(|conn| {
                    sync_tasks::mark_failed(conn, &request.task_id, &e.to_string())
                })
            }
        };

        if let Err(e) = recorded {
            error!(task_id = %request.task_id, error = %e, "failed to record sync outcome");
        }
    }

    async fn pull(&self, request: &SyncRequest) -> Result<usize> {
        let connector = self.connectors.get(request.platform).ok_or_else(|| {
            StewardError::Sync(format!("no connector registered for {}", request.platform))
        })?;

        let items: Vec<PlatformItem> = match &request.resource_id {
            Some(resource_id) => vec![connector.fetch(&request.user_id, resource_id).await?],
            None => {
                connector
                    .list_resources(
                        &request.user_id,
                        QueryParams {
                            limit: LIST_LIMIT,
                            since: None,
                        },
                    )
                    .await?
            }
        };

        let synced_at = Utc::now();
        let count = items.len();
        self.storage.with_transaction(|conn| {
            for item in items {
                snapshots::upsert_snapshot(
                    conn,
                    &SyncSnapshot {
                        platform: request.platform,
                        user_id: request.user_id.clone(),
                        resource_id: item.resource_id,
                        content: item.content,
                        metadata: item.metadata,
                        synced_at,
                        retained_until: None,
                    },
                )?;
            }
            Ok(())
        })?;

        Ok(count)
    }
}
