//! Signal Triage Engine
//!
//! Decides, without invoking the model, whether fresh synced content should
//! regenerate an existing deliverable, propose a new one, or do nothing.
//! One evaluation covers one (user, source platform) pair at one tick and
//! only touches local storage.

pub mod rules;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{deliverables, preferences, snapshots, Storage};
use crate::types::*;

/// Snapshots scanned for related content per emergent candidate
const RELATED_SCAN_LIMIT: usize = 500;

#[derive(Clone)]
pub struct TriageEngine {
    storage: Storage,
    config: TriageConfig,
}

impl TriageEngine {
    pub fn new(storage: Storage, config: TriageConfig) -> Self {
        Self { storage, config }
    }

    /// Single decision by priority: `trigger_existing` > `create_emergent` > `no_action`
    pub fn evaluate(&self, user_id: &str, source: Platform) -> Result<SignalEvaluation> {
        self.evaluate_at(user_id, source, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        user_id: &str,
        source: Platform,
        now: DateTime<Utc>,
    ) -> Result<SignalEvaluation> {
        let mut all = self.evaluate_all_at(user_id, source, now)?;
        let pick = all
            .iter()
            .position(|e| e.decision == SignalDecision::TriggerExisting)
            .or_else(|| {
                all.iter()
                    .position(|e| e.decision == SignalDecision::CreateEmergent)
            })
            .unwrap_or(0);
        Ok(all.swap_remove(pick))
    }

    /// Every actionable decision for this tick, or a single `no_action`
    pub fn evaluate_all(&self, user_id: &str, source: Platform) -> Result<Vec<SignalEvaluation>> {
        self.evaluate_all_at(user_id, source, Utc::now())
    }

    pub fn evaluate_all_at(
        &self,
        user_id: &str,
        source: Platform,
        now: DateTime<Utc>,
    ) -> Result<Vec<SignalEvaluation>> {
        let mut decisions = self.freshness_decisions(user_id, source, now)?;
        if source == Platform::Calendar {
            decisions.extend(self.meeting_prep_decisions(user_id, now)?);
        }

        for decision in &decisions {
            info!(
                user_id,
                %source,
                decision = ?decision.decision,
                deliverable_id = ?decision.deliverable_id,
                "triage decision"
            );
        }

        if decisions.is_empty() {
            debug!(user_id, %source, "triage: no action");
            let mut none = SignalEvaluation::no_action(
                user_id,
                source,
                format!("No deliverable reading {} has new content", source.display_name()),
            );
            none.evaluated_at = now;
            decisions.push(none);
        }
        Ok(decisions)
    }

    fn freshness_decisions(
        &self,
        user_id: &str,
        source: Platform,
        now: DateTime<Utc>,
    ) -> Result<Vec<SignalEvaluation>> {
        self.storage.with_connection(|conn| {
            let active = deliverables::list_deliverables(conn, user_id, Some(DeliverableState::Active))?;
            let mut out = Vec::new();

            for deliverable in active.iter().filter(|d| d.reads_from(source)) {
                let on_source: Vec<SourceRef> = deliverable
                    .sources
                    .iter()
                    .filter(|s| s.platform == source)
                    .cloned()
                    .collect();
                let latest = snapshots::latest_changed_at(conn, user_id, &on_source)?;

                if let Some(reasoning) = rules::freshness_trigger(
                    deliverable,
                    latest,
                    now,
                    self.config.default_min_interval_minutes,
                ) {
                    out.push(SignalEvaluation {
                        user_id: user_id.to_string(),
                        source,
                        decision: SignalDecision::TriggerExisting,
                        deliverable_id: Some(deliverable.id.clone()),
                        candidate: None,
                        reasoning,
                        evaluated_at: now,
                    });
                }
            }
            Ok(out)
        })
    }

    fn meeting_prep_decisions(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<SignalEvaluation>> {
        self.storage.with_connection(|conn| {
            let window_end = rules::lookahead_end(now, self.config.meeting_lookahead_hours);
            let events = snapshots::upcoming_events(conn, user_id, Platform::Calendar, now, window_end)?;
            if events.is_empty() {
                return Ok(Vec::new());
            }

            let internal = preferences::internal_domains(conn, user_id)?;
            let user_email = preferences::get_preference(conn, user_id, preferences::EMAIL)?;
            let others = snapshots::snapshots_excluding_platform(
                conn,
                user_id,
                Platform::Calendar,
                RELATED_SCAN_LIMIT,
            )?;

            let mut out = Vec::new();
            for (event, starts_at) in events {
                let anchor = SourceRef::resource(Platform::Calendar, event.resource_id.clone());
                if deliverables::find_covering(conn, user_id, &anchor)?.is_some() {
                    continue;
                }
                if let Some((candidate, reasoning)) = rules::meeting_prep_candidate(
                    &event,
                    starts_at,
                    &internal,
                    user_email.as_deref(),
                    self.config.min_external_participants,
                    &others,
                ) {
                    out.push(SignalEvaluation {
                        user_id: user_id.to_string(),
                        source: Platform::Calendar,
                        decision: SignalDecision::CreateEmergent,
                        deliverable_id: None,
                        candidate: Some(candidate),
                        reasoning,
                        evaluated_at: now,
                    });
                }
            }
            Ok(out)
        })
    }
}
