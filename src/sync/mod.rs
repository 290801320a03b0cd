//! Platform synchronization
//!
//! Sync requests are explicit tasks: each one gets a `sync_tasks` row
//! (`pending -> running -> completed | failed`) before it is queued, so the
//! reconciliation layer always has a concrete status to poll. A single
//! [`SyncWorker`] drains the queue and is the only snapshot writer.

mod worker;

pub use worker::SyncWorker;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{Result, StewardError};
use crate::storage::{sync_tasks, Storage};
use crate::types::{Platform, SyncTask, SyncTaskId, UserId};

/// One queued synchronization
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub task_id: SyncTaskId,
    pub user_id: UserId,
    pub platform: Platform,
    /// `None` syncs every resource the connector lists
    pub resource_id: Option<String>,
}

/// Out-of-band sync trigger and status, as consumed by reconciliation
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn trigger_sync(
        &self,
        user_id: &str,
        platform: Platform,
        resource_id: Option<&str>,
    ) -> Result<SyncTaskId>;

    async fn sync_status(&self, task_id: &str) -> Result<SyncTask>;
}

/// Task queue backed by the `sync_tasks` table and an async channel
#[derive(Clone)]
pub struct SyncQueue {
    storage: Storage,
    sender: async_channel::Sender<SyncRequest>,
}

impl SyncQueue {
    /// Create a queue and the receiving end for a [`SyncWorker`]
    pub fn new(storage: Storage, capacity: usize) -> (Self, async_channel::Receiver<SyncRequest>) {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        (Self { storage, sender }, receiver)
    }

    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<SyncTask>> {
        self.storage
            .with_connection(|conn| sync_tasks::recent_tasks(conn, user_id, limit))
    }

    /// Stop accepting new requests; the worker exits once the queue drains
    pub fn close(&self) {
        self.sender.close();
    }
}

#[async_trait]
impl SyncBackend for SyncQueue {
    async fn trigger_sync(
        &self,
        user_id: &str,
        platform: Platform,
        resource_id: Option<&str>,
    ) -> Result<SyncTaskId> {
        let task = self.storage.with_connection(|conn| {
            sync_tasks::insert_task(conn, user_id, platform, resource_id, Utc::now())
        })?;

        let request = SyncRequest {
            task_id: task.id.clone(),
            user_id: user_id.to_string(),
            platform,
            resource_id: resource_id.map(str::to_string),
        };

        if let Err(e) = self.sender.send(request).await {
            let message = format!("sync queue closed: {}", e);
            self.storage
                .with_connection(|conn| sync_tasks::mark_failed(conn, &task.id, &message))?;
            return Err(StewardError::Sync(message));
        }

        debug!(task_id = %task.id, %platform, resource = ?resource_id, "queued sync");
        Ok(task.id)
    }

    async fn sync_status(&self, task_id: &str) -> Result<SyncTask> {
        self.storage
            .with_connection(|conn| sync_tasks::get_task(conn, task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncTaskState;

    #[tokio::test]
    async fn test_trigger_records_pending_task() {
        let storage = Storage::open_in_memory().unwrap();
        let (queue, receiver) = SyncQueue::new(storage, 8);

        let id = queue.trigger_sync("u1", Platform::Gmail, Some("thread-1")).await.unwrap();
        let task = queue.sync_status(&id).await.unwrap();
        assert_eq!(task.state, SyncTaskState::Pending);

        let request = receiver.recv().await.unwrap();
        assert_eq!(request.task_id, id);
        assert_eq!(request.resource_id.as_deref(), Some("thread-1"));
    }

    #[tokio::test]
    async fn test_closed_queue_fails_task() {
        let storage = Storage::open_in_memory().unwrap();
        let (queue, receiver) = SyncQueue::new(storage, 8);
        drop(receiver);

        let result = queue.trigger_sync("u1", Platform::Slack, None).await;
        assert!(matches!(result, Err(StewardError::Sync(_))));
        let tasks = queue.recent("u1", 10).unwrap();
        assert_eq!(tasks[0].state, SyncTaskState::Failed);
    }
}
