//! Recurring tick
//!
//! Each tick lists users with deliverables or synced content and runs triage
//! for every (user, platform) pair, then hands actionable decisions to the
//! pipeline. Users run in parallel up to `max_concurrent_users`; a single
//! user's tick is serialized so one deliverable is never triggered twice by
//! overlapping ticks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::orchestration::{GenerationOutcome, Pipeline};
use crate::storage::{deliverables, Storage};
use crate::sync::{SyncBackend, SyncQueue};
use crate::triage::TriageEngine;
use crate::types::{Platform, SchedulerConfig, SignalDecision, UserId};

/// Counters for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub users: usize,
    pub decisions: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Meeting-prep deliverables retired because their meeting started
    pub archived: usize,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.users += other.users;
        self.decisions += other.decisions;
        self.generated += other.generated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.archived += other.archived;
    }
}

#[derive(Clone)]
pub struct Scheduler {
    storage: Storage,
    triage: TriageEngine,
    pipeline: Pipeline,
    config: SchedulerConfig,
    user_locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
    /// Platforms to re-sync after each user's triage, feeding the next tick
    refresh: Option<(SyncQueue, Vec<Platform>)>,
}

impl Scheduler {
    pub fn new(storage: Storage, triage: TriageEngine, pipeline: Pipeline, config: SchedulerConfig) -> Self {
        Self {
            storage,
            triage,
            pipeline,
            config,
            user_locks: Arc::new(DashMap::new()),
            refresh: None,
        }
    }

    pub fn with_refresh(mut self, queue: SyncQueue, platforms: Vec<Platform>) -> Self {
        self.refresh = Some((queue, platforms));
        self
    }

    /// Run ticks until `shutdown` flips or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            max_concurrent_users = self.config.max_concurrent_users,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// One tick across every active user
    pub async fn tick(&self) -> Result<TickReport> {
        let users = self.storage.with_connection(deliverables::list_active_users)?;
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_users.max(1)));
        let mut set = JoinSet::new();

        for user_id in users {
            let this = self.clone();
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return TickReport::default();
                };
                this.tick_user(&user_id).await
            });
        }

        let mut report = TickReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(user_report) => report.merge(user_report),
                Err(e) => {
                    error!(error = %e, "user tick aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            users = report.users,
            decisions = report.decisions,
            generated = report.generated,
            skipped = report.skipped,
            failed = report.failed,
            archived = report.archived,
            "tick complete"
        );
        Ok(report)
    }

    /// Triage and act for one user, serialized per user
    pub async fn tick_user(&self, user_id: &str) -> TickReport {
        let lock = self.user_locks.entry(user_id.to_string()).or_default().clone();
        let report = {
            let _held = lock.lock().await;
            self.tick_user_locked(user_id).await
        };

        // Prune the lock once no other tick holds or waits on it
        drop(lock);
        self.user_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
        report
    }

    async fn tick_user_locked(&self, user_id: &str) -> TickReport {
        let mut report = TickReport {
            users: 1,
            ..Default::default()
        };
        let mut handled: HashSet<String> = HashSet::new();

        match self.pipeline.archive_past_meetings(user_id, Utc::now()) {
            Ok(archived) => report.archived = archived.len(),
            Err(e) => {
                warn!(user_id, error = %e, "could not archive past meeting preps");
                report.failed += 1;
            }
        }

        for platform in Platform::ALL {
            let evaluations = match self.triage.evaluate_all(user_id, platform) {
                Ok(evaluations) => evaluations,
                Err(e) => {
                    warn!(user_id, %platform, error = %e, "triage failed");
                    report.failed += 1;
                    continue;
                }
            };

            for evaluation in evaluations {
                if evaluation.decision == SignalDecision::NoAction {
                    continue;
                }
                report.decisions += 1;
                if let Some(id) = &evaluation.deliverable_id {
                    if !handled.insert(id.clone()) {
                        continue;
                    }
                }

                match self.pipeline.handle_signal(&evaluation).await {
                    Ok(Some(GenerationOutcome::Generated { version, .. })) => {
                        handled.insert(version.deliverable_id);
                        report.generated += 1;
                    }
                    Ok(Some(GenerationOutcome::Skipped { .. })) | Ok(None) => report.skipped += 1,
                    Err(_) => report.failed += 1,
                }
            }
        }

        if let Some((queue, platforms)) = &self.refresh {
            for platform in platforms {
                if let Err(e) = queue.trigger_sync(user_id, *platform, None).await {
                    warn!(user_id, %platform, error = %e, "could not queue refresh sync");
                }
            }
        }

        report
    }
}
