//! Orchestration Pipeline
//!
//! trigger -> freshness check -> strategy -> headless run -> persist version
//! -> deliver -> mark retention.
//!
//! A failed run leaves the previous version and `last_generated_at`
//! untouched; the version row and the timestamp are written in one
//! transaction. At most one generation per deliverable is in flight.

mod chat;
pub mod delivery;
pub mod strategy;

pub use chat::ChatSession;
pub use delivery::{ConnectorDelivery, DeliveryChannel, DeliveryRegistry};
pub use strategy::{strategy_for, SeedContext, Strategy};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::prompt::resolve_timezone;
use crate::agent::AgentRunner;
use crate::error::{Result, StewardError};
use crate::primitives::PrimitiveContext;
use crate::retrieval::Retriever;
use crate::storage::{deliverables, preferences, snapshots, Storage};
use crate::types::*;

/// What started a generation
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Explicit request; skips the freshness check
    User,
    /// Cadence tick; skipped when nothing changed or the interval has not elapsed
    Schedule,
    /// Triage decision; its reasoning becomes investigation guidance
    Signal { reasoning: String },
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::User => TriggerKind::UserRequest,
            Trigger::Schedule => TriggerKind::Schedule,
            Trigger::Signal { .. } => TriggerKind::Signal,
        }
    }

    fn guidance(&self) -> Option<&str> {
        match self {
            Trigger::Signal { reasoning } => Some(reasoning.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Generated {
        version: DeliverableVersion,
        rounds: u32,
    },
    Skipped {
        deliverable_id: DeliverableId,
        reason: String,
    },
}

/// Removes the in-flight marker when the generation ends, however it ends
struct InFlight {
    map: Arc<DashMap<DeliverableId, DateTime<Utc>>>,
    id: DeliverableId,
}

impl InFlight {
    fn acquire(map: &Arc<DashMap<DeliverableId, DateTime<Utc>>>, id: &str) -> Result<Self> {
        match map.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StewardError::GenerationInFlight(id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(Self {
                    map: Arc::clone(map),
                    id: id.to_string(),
                })
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

#[derive(Clone)]
pub struct Pipeline {
    storage: Storage,
    retriever: Retriever,
    runner: AgentRunner,
    delivery: DeliveryRegistry,
    config: OrchestrationConfig,
    default_min_interval_minutes: i64,
    in_flight: Arc<DashMap<DeliverableId, DateTime<Utc>>>,
}

impl Pipeline {
    pub fn new(
        storage: Storage,
        retriever: Retriever,
        runner: AgentRunner,
        delivery: DeliveryRegistry,
        config: &StewardConfig,
    ) -> Self {
        Self {
            storage,
            retriever,
            runner,
            delivery,
            config: config.orchestration.clone(),
            default_min_interval_minutes: config.triage.default_min_interval_minutes,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn is_in_flight(&self, deliverable_id: &str) -> bool {
        self.in_flight.contains_key(deliverable_id)
    }

    /// Interactive session for `user_id`
    pub fn chat(&self, user_id: impl Into<UserId>, scope: MemoryScope) -> ChatSession {
        ChatSession::new(
            self.storage.clone(),
            self.retriever.clone(),
            self.runner.clone(),
            user_id.into(),
            scope,
            self.config.context_memory_limit,
        )
    }

    /// Act on a triage decision. `no_action` returns `Ok(None)`.
    pub async fn handle_signal(&self, evaluation: &SignalEvaluation) -> Result<Option<GenerationOutcome>> {
        let trigger = Trigger::Signal {
            reasoning: evaluation.reasoning.clone(),
        };
        match evaluation.decision {
            SignalDecision::NoAction => Ok(None),
            SignalDecision::TriggerExisting => {
                let id = evaluation.deliverable_id.as_deref().ok_or_else(|| {
                    StewardError::InvalidInput("trigger_existing without a deliverable".to_string())
                })?;
                self.generate(&evaluation.user_id, id, trigger).await.map(Some)
            }
            SignalDecision::CreateEmergent => {
                let candidate = evaluation.candidate.as_ref().ok_or_else(|| {
                    StewardError::InvalidInput("create_emergent without a candidate".to_string())
                })?;
                let deliverable = self.create_emergent(&evaluation.user_id, candidate)?;
                self.generate(&evaluation.user_id, &deliverable.id, trigger).await.map(Some)
            }
        }
    }

    /// Materialize an emergent candidate, unless something already covers its anchor
    pub fn create_emergent(&self, user_id: &str, candidate: &EmergentCandidate) -> Result<Deliverable> {
        self.storage.with_transaction(|conn| {
            if let Some(existing) = deliverables::find_covering(conn, user_id, &candidate.anchor)? {
                return Ok(existing);
            }
            let mut sources = vec![candidate.anchor.clone()];
            sources.extend(candidate.related.iter().cloned());
            sources.dedup();

            let instructions = candidate.starts_at.map(|at| {
                format!(
                    "Meeting starts {}. Participants: {}.",
                    at.format("%Y-%m-%d %H:%M UTC"),
                    candidate.participants.join(", ")
                )
            });

            let deliverable = deliverables::create_deliverable(
                conn,
                &CreateDeliverableInput {
                    user_id: user_id.to_string(),
                    title: candidate.title.clone(),
                    deliverable_type: candidate.deliverable_type,
                    schedule: Schedule {
                        cadence: Cadence::OnChange,
                        min_interval_minutes: None,
                    },
                    sources,
                    destination: None,
                    origin: DeliverableOrigin::Emergent,
                    instructions,
                    project_id: None,
                },
            )?;
            info!(user_id, deliverable_id = %deliverable.id, title = %deliverable.title, "emergent deliverable created");
            Ok(deliverable)
        })
    }

    /// Archive emergent meeting-prep deliverables whose meeting has started.
    ///
    /// The anchor event's synced `start` decides; a missing anchor snapshot
    /// leaves the deliverable alone.
    pub fn archive_past_meetings(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<DeliverableId>> {
        self.storage.with_transaction(|conn| {
            let mut archived = Vec::new();
            for deliverable in deliverables::list_deliverables(conn, user_id, None)? {
                if deliverable.origin != DeliverableOrigin::Emergent
                    || deliverable.deliverable_type != DeliverableType::MeetingPrep
                    || deliverable.state == DeliverableState::Archived
                {
                    continue;
                }
                let Some(resource_id) = deliverable
                    .sources
                    .iter()
                    .filter(|s| s.platform == Platform::Calendar)
                    .find_map(|s| s.resource_id.clone())
                else {
                    continue;
                };
                let started = snapshots::get_snapshot(conn, user_id, Platform::Calendar, &resource_id)?
                    .and_then(|event| snapshots::event_start(&event))
                    .is_some_and(|start| start <= now);
                if started {
                    deliverables::set_state(conn, user_id, &deliverable.id, DeliverableState::Archived)?;
                    info!(user_id, deliverable_id = %deliverable.id, "meeting started; prep archived");
                    archived.push(deliverable.id);
                }
            }
            Ok(archived)
        })
    }

    pub async fn generate(
        &self,
        user_id: &str,
        deliverable_id: &str,
        trigger: Trigger,
    ) -> Result<GenerationOutcome> {
        self.generate_at(user_id, deliverable_id, trigger, Utc::now()).await
    }

    pub async fn generate_at(
        &self,
        user_id: &str,
        deliverable_id: &str,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<GenerationOutcome> {
        let _guard = InFlight::acquire(&self.in_flight, deliverable_id)?;

        let deliverable = self
            .storage
            .with_connection(|conn| deliverables::get_deliverable(conn, user_id, deliverable_id))?;

        if let Some(reason) = self.skip_reason(&deliverable, &trigger, now)? {
            info!(user_id, deliverable_id, trigger = trigger.kind().as_str(), %reason, "generation skipped");
            return Ok(GenerationOutcome::Skipped {
                deliverable_id: deliverable.id,
                reason,
            });
        }

        let strategy = strategy_for(deliverable.deliverable_type);
        let (context, tz) = self.seed_context(&deliverable, &strategy).await?;
        let system_prompt = strategy.system_prompt(&deliverable, now, tz);
        let seed = strategy.seed_message(&context, trigger.guidance(), now);

        let ctx = PrimitiveContext::new(user_id, deliverable.memory_scope());
        let run = self
            .runner
            .run(
                ExecutionMode::Headless,
                &ctx,
                &system_prompt,
                vec![seed],
                self.runner.config().headless_round_ceiling,
            )
            .await
            .and_then(|outcome| {
                if outcome.text.trim().is_empty() {
                    Err(StewardError::Model("run finished without content".to_string()))
                } else {
                    Ok(outcome)
                }
            });

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    user_id,
                    deliverable_id,
                    trigger = trigger.kind().as_str(),
                    error = %e,
                    "generation failed, previous version kept"
                );
                return Err(e);
            }
        };

        let version = self.storage.with_transaction(|conn| {
            deliverables::record_generation(
                conn,
                &deliverable.id,
                outcome.text.trim(),
                trigger.kind(),
                outcome.ceiling_truncated,
                now,
            )
        })?;
        info!(
            user_id,
            deliverable_id,
            version = version.version,
            rounds = outcome.rounds,
            ceiling_truncated = outcome.ceiling_truncated,
            "deliverable generated"
        );

        let version = self.deliver(&deliverable, version).await;
        self.mark_retention(&deliverable, now);

        Ok(GenerationOutcome::Generated {
            version,
            rounds: outcome.rounds,
        })
    }

    fn skip_reason(
        &self,
        deliverable: &Deliverable,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        if deliverable.state == DeliverableState::Archived {
            return Ok(Some("deliverable is archived".to_string()));
        }
        if matches!(trigger, Trigger::User) {
            return Ok(None);
        }
        if deliverable.state != DeliverableState::Active {
            return Ok(Some(format!("deliverable is {}", deliverable.state.as_str())));
        }

        let latest = self.storage.with_connection(|conn| {
            snapshots::latest_changed_at(conn, &deliverable.user_id, &deliverable.sources)
        })?;
        let Some(last) = deliverable.last_generated_at else {
            return Ok(None);
        };
        if latest.map_or(true, |latest| latest <= last) {
            return Ok(Some("no source content changed since the last generation".to_string()));
        }
        if let Trigger::Schedule = trigger {
            let min = deliverable.schedule.min_interval(self.default_min_interval_minutes);
            if now - last < min {
                return Ok(Some("minimum interval since the last generation has not elapsed".to_string()));
            }
        }
        Ok(None)
    }

    async fn seed_context(&self, deliverable: &Deliverable, strategy: &Strategy) -> Result<(SeedContext, chrono_tz::Tz)> {
        let (snapshots, previous, timezone) = self.storage.with_connection(|conn| {
            Ok((
                snapshots::snapshots_for_sources(
                    conn,
                    &deliverable.user_id,
                    &deliverable.sources,
                    self.config.context_snapshot_limit,
                )?,
                if strategy.include_previous {
                    deliverables::list_versions(conn, &deliverable.id, 1)?.into_iter().next()
                } else {
                    None
                },
                preferences::get_preference(conn, &deliverable.user_id, preferences::TIMEZONE)?,
            ))
        })?;

        let query = match &deliverable.instructions {
            Some(instructions) => format!("{} {}", deliverable.title, instructions),
            None => deliverable.title.clone(),
        };
        let memories = match self
            .retriever
            .retrieve(
                &deliverable.user_id,
                &deliverable.memory_scope(),
                &query,
                self.config.context_memory_limit,
            )
            .await
        {
            Ok(memories) => memories,
            Err(StewardError::EmptyScope) => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok((
            SeedContext {
                memories,
                snapshots,
                previous,
            },
            resolve_timezone(timezone.as_deref()),
        ))
    }

    /// Delivery failure is recorded on the version; the version itself stands
    async fn deliver(&self, deliverable: &Deliverable, version: DeliverableVersion) -> DeliverableVersion {
        let Some(target) = &deliverable.destination else {
            return version;
        };

        let result = self
            .delivery
            .deliver(&deliverable.user_id, target, &deliverable.title, &version.content)
            .await;
        let error = result.as_ref().err().map(|e| e.to_string());
        if let Some(ref e) = error {
            warn!(deliverable_id = %deliverable.id, version = version.version, error = %e, "delivery failed");
        }

        let recorded = self.storage.with_connection(|conn| {
            deliverables::mark_delivery(conn, version.id, error.is_none(), error.as_deref())
        });
        if let Err(e) = recorded {
            warn!(deliverable_id = %deliverable.id, error = %e, "failed to record delivery outcome");
        }

        DeliverableVersion {
            delivered: error.is_none(),
            delivery_error: error,
            ..version
        }
    }

    fn mark_retention(&self, deliverable: &Deliverable, now: DateTime<Utc>) {
        let until = now + Duration::days(self.config.snapshot_retention_days);
        match self.storage.with_connection(|conn| {
            snapshots::mark_retained(conn, &deliverable.user_id, &deliverable.sources, until)
        }) {
            Ok(marked) => debug!(deliverable_id = %deliverable.id, marked, "snapshots retained"),
            Err(e) => warn!(deliverable_id = %deliverable.id, error = %e, "failed to mark retention"),
        }
    }
}
