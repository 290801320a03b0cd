//! End-to-end scenarios
//!
//! Wires the real storage, retrieval, reconciliation, triage, agent and
//! pipeline together with in-memory connectors and a scripted model.
//!
//! Run with: cargo test --test scenarios

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use steward::agent::{AgentRunner, ModelProvider, ModelRequest, ModelResponse, Role, ToolCall};
use steward::embedding::{Embedder, TfIdfEmbedder};
use steward::orchestration::{DeliveryRegistry, GenerationOutcome, Pipeline, Trigger};
use steward::platform::{ConnectorRegistry, InMemoryConnector, PlatformIntent, PlatformItem, QueryParams};
use steward::primitives::PrimitiveRegistry;
use steward::reconcile::{Disclosure, Reconciler};
use steward::retrieval::{rank, Retriever};
use steward::storage::{deliverables, queries, snapshots, Storage};
use steward::sync::{SyncQueue, SyncRequest, SyncWorker};
use steward::triage::TriageEngine;
use steward::types::*;
use steward::StewardError;

struct Scripted {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl Scripted {
    fn new(responses: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ModelProvider for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> steward::Result<ModelResponse> {
        self.requests.lock().push(request.clone());
        let next = self.responses.lock().pop_front();
        Ok(next.unwrap_or_else(|| ModelResponse::text("done")))
    }
}

fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

struct World {
    storage: Storage,
    retriever: Retriever,
    reconciler: Reconciler,
    triage: TriageEngine,
    pipeline: Pipeline,
    config: StewardConfig,
    _receiver: async_channel::Receiver<SyncRequest>,
}

fn world(connectors: ConnectorRegistry, model: Arc<Scripted>) -> World {
    let storage = Storage::open_in_memory().unwrap();
    let config = StewardConfig::default();
    let (queue, receiver) = SyncQueue::new(storage.clone(), 32);
    let retriever = Retriever::new(
        storage.clone(),
        Arc::new(TfIdfEmbedder::new(384)),
        config.retrieval.clone(),
    );
    let reconciler = Reconciler::new(
        storage.clone(),
        connectors.clone(),
        Arc::new(queue),
        config.reconcile.clone(),
    );
    let runner = AgentRunner::new(
        model,
        PrimitiveRegistry::new(storage.clone(), retriever.clone(), reconciler.clone()),
        config.agent.clone(),
    );
    let pipeline = Pipeline::new(
        storage.clone(),
        retriever.clone(),
        runner,
        DeliveryRegistry::from_connectors(&connectors),
        &config,
    );
    World {
        triage: TriageEngine::new(storage.clone(), config.triage.clone()),
        storage,
        retriever,
        reconciler,
        pipeline,
        config,
        _receiver: receiver,
    }
}

fn snapshot(user_id: &str, resource_id: &str, content: &str, synced_at: chrono::DateTime<Utc>) -> SyncSnapshot {
    SyncSnapshot {
        platform: Platform::Slack,
        user_id: user_id.to_string(),
        resource_id: resource_id.to_string(),
        content: content.to_string(),
        metadata: json!({}),
        synced_at,
        retained_until: None,
    }
}

// ============================================================================
// RETRIEVAL
// ============================================================================

#[tokio::test]
async fn empty_user_scope_is_empty_scope_not_failure() {
    let w = world(ConnectorRegistry::new(), Scripted::new(vec![]));
    let result = w.retriever.retrieve("u1", &MemoryScope::User, "anything", 10).await;
    let err = result.unwrap_err();
    assert!(matches!(err, StewardError::EmptyScope));
    assert!(err.is_empty_result());
}

#[test]
fn blended_score_favors_higher_relevance() {
    let now = Utc::now();
    let memory = |id: i64, embedding: Vec<f32>, importance: f32| Memory {
        id,
        user_id: "u1".to_string(),
        scope: MemoryScope::User,
        content: format!("m{}", id),
        embedding,
        tags: vec![],
        entities: Default::default(),
        importance,
        provenance: Provenance::default(),
        active: true,
        created_at: now,
        updated_at: now,
        last_referenced_at: None,
    };
    let query = vec![1.0, 0.0];
    // similarity 0.1, importance 0.9 -> 0.7 * 0.1 + 0.3 * 0.9 = 0.34
    let important = memory(1, vec![0.1, (1.0f32 - 0.01).sqrt()], 0.9);
    // similarity 0.95, importance 0.1 -> 0.7 * 0.95 + 0.3 * 0.1 = 0.695
    let similar = memory(2, vec![0.95, (1.0f32 - 0.9025).sqrt()], 0.1);

    let ranked = rank(&query, vec![important, similar], 0.7, 10);
    assert_eq!(ranked[0].memory.id, 2);
    assert!((ranked[0].relevance - 0.695).abs() < 1e-4);
    assert!((ranked[1].relevance - 0.34).abs() < 1e-4);
}

#[tokio::test]
async fn project_query_sees_user_wide_and_own_project_only() {
    let w = world(ConnectorRegistry::new(), Scripted::new(vec![]));
    let embedder = TfIdfEmbedder::new(384);
    let mut ids = Vec::new();
    for (scope, content) in [
        (MemoryScope::User, "Team standup is at 9:30 every weekday"),
        (MemoryScope::project("apollo"), "Apollo launch review is on Thursday"),
        (MemoryScope::project("zephyr"), "Zephyr budget review is on Friday"),
    ] {
        let embedding = embedder.embed(content).await.unwrap();
        let input = CreateMemoryInput {
            user_id: "u1".to_string(),
            scope,
            content: content.to_string(),
            ..Default::default()
        };
        let created = w
            .storage
            .with_connection(|conn| queries::create_memory(conn, &input, &embedding))
            .unwrap();
        ids.push(created.id);
    }

    let apollo = w
        .retriever
        .retrieve("u1", &MemoryScope::project("apollo"), "review", 10)
        .await
        .unwrap();
    let mut got: Vec<i64> = apollo.iter().map(|s| s.memory.id).collect();
    got.sort();
    assert_eq!(got, vec![ids[0], ids[1]]);

    let user_wide = w.retriever.retrieve("u1", &MemoryScope::User, "review", 10).await.unwrap();
    assert_eq!(user_wide.len(), 1);
    assert_eq!(user_wide[0].memory.id, ids[0]);
}

// ============================================================================
// RECONCILIATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn no_live_no_cache_syncs_polls_then_no_content() {
    let slack = Arc::new(InMemoryConnector::new(Platform::Slack));
    slack.disable_all_live();
    let w = world(ConnectorRegistry::new().with(slack), Scripted::new(vec![]));

    let started = Instant::now();
    let result = w
        .reconciler
        .resolve_platform_query(
            "u1",
            Platform::Slack,
            &PlatformIntent::Fetch {
                resource_id: "C1".to_string(),
            },
            QueryParams::default(),
        )
        .await;

    assert!(matches!(result, Err(StewardError::NoContent { platform: Platform::Slack })));
    assert!(started.elapsed() >= Duration::from_secs(w.config.reconcile.poll_timeout_secs));

    let tasks = w
        .storage
        .with_connection(|conn| steward::storage::sync_tasks::recent_tasks(conn, "u1", 10))
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].resource_id.as_deref(), Some("C1"));
}

#[tokio::test(start_paused = true)]
async fn sync_completes_then_cached_answer_is_disclosed() {
    let slack = Arc::new(
        InMemoryConnector::new(Platform::Slack)
            .with_items([PlatformItem::new("C1", "Launch moved to Friday")]),
    );
    slack.disable_all_live();
    let connectors = ConnectorRegistry::new().with(slack);

    let storage = Storage::open_in_memory().unwrap();
    let config = ReconcileConfig::default();
    let (queue, receiver) = SyncQueue::new(storage.clone(), 8);
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = SyncWorker::new(storage.clone(), connectors.clone(), receiver).spawn(stop_rx);
    let reconciler = Reconciler::new(storage.clone(), connectors, Arc::new(queue), config.clone());

    let started = Instant::now();
    let answer = reconciler
        .resolve_platform_query(
            "u1",
            Platform::Slack,
            &PlatformIntent::Fetch {
                resource_id: "C1".to_string(),
            },
            QueryParams::default(),
        )
        .await
        .unwrap();

    // The snapshot store is re-read only after a full poll interval
    assert!(started.elapsed() >= Duration::from_secs(config.poll_interval_secs));
    assert!(matches!(answer.disclosure, Disclosure::Cached { .. }));
    assert!(answer.items.iter().all(|i| i.synced_at.is_some()));
    assert_eq!(answer.items[0].item.content, "Launch moved to Friday");
    assert!(answer.staleness_note(Utc::now()).is_some());

    stop_tx.send(true).unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn live_answers_carry_no_disclosure() {
    let slack = Arc::new(
        InMemoryConnector::new(Platform::Slack).with_items([PlatformItem::new("C1", "fresh")]),
    );
    let w = world(ConnectorRegistry::new().with(slack), Scripted::new(vec![]));
    w.storage
        .with_connection(|conn| {
            snapshots::upsert_snapshot(conn, &snapshot("u1", "C1", "old", Utc::now() - ChronoDuration::days(2)))
        })
        .unwrap();

    let answer = w
        .reconciler
        .resolve_platform_query("u1", Platform::Slack, &PlatformIntent::ListResources, QueryParams::default())
        .await
        .unwrap();
    assert_eq!(answer.disclosure, Disclosure::Live);
    assert!(answer.items.iter().all(|i| i.synced_at.is_none()));
    assert_eq!(answer.staleness_note(Utc::now()), None);
}

// ============================================================================
// TRIAGE
// ============================================================================

#[test]
fn snapshot_after_last_generation_triggers_and_before_does_not() {
    let t = Utc.with_ymd_and_hms(2026, 4, 6, 9, 0, 0).unwrap();
    // Past the daily minimum interval, so only the timestamps decide
    let now = t + ChronoDuration::hours(25);

    for (offset, expected) in [
        (ChronoDuration::minutes(1), SignalDecision::TriggerExisting),
        (ChronoDuration::minutes(-1), SignalDecision::NoAction),
    ] {
        let w = world(ConnectorRegistry::new(), Scripted::new(vec![]));
        let deliverable_id = w
            .storage
            .with_connection(|conn| {
                let d = deliverables::create_deliverable(
                    conn,
                    &CreateDeliverableInput {
                        user_id: "u1".to_string(),
                        title: "Weekly status".to_string(),
                        deliverable_type: DeliverableType::StatusReport,
                        schedule: Schedule {
                            cadence: Cadence::Daily,
                            min_interval_minutes: None,
                        },
                        sources: vec![SourceRef::platform(Platform::Slack)],
                        ..Default::default()
                    },
                )?;
                deliverables::record_generation(conn, &d.id, "v1", TriggerKind::Schedule, false, t)?;
                snapshots::upsert_snapshot(conn, &snapshot("u1", "C1", "update", t + offset))?;
                Ok(d.id)
            })
            .unwrap();

        let evaluations = w.triage.evaluate_all_at("u1", Platform::Slack, now).unwrap();
        assert_eq!(evaluations.len(), 1);
        assert_eq!(evaluations[0].decision, expected);
        if expected == SignalDecision::TriggerExisting {
            assert_eq!(evaluations[0].deliverable_id.as_deref(), Some(deliverable_id.as_str()));
        }
    }
}

// ============================================================================
// AGENT AND PIPELINE
// ============================================================================

#[tokio::test]
async fn chat_only_primitive_in_headless_run_is_a_tool_error() {
    let slack = Arc::new(InMemoryConnector::new(Platform::Slack));
    let model = Scripted::new(vec![
        ModelResponse::tools(vec![call(
            "c1",
            "send_message",
            json!({"platform": "slack", "action": "post_message", "payload": {"text": "hi"}}),
        )]),
        ModelResponse::text("Report body"),
    ]);
    let w = world(ConnectorRegistry::new().with(slack.clone()), model.clone());
    let id = w
        .storage
        .with_connection(|conn| {
            deliverables::create_deliverable(
                conn,
                &CreateDeliverableInput {
                    user_id: "u1".to_string(),
                    title: "Notes".to_string(),
                    deliverable_type: DeliverableType::Custom,
                    sources: vec![SourceRef::platform(Platform::Slack)],
                    ..Default::default()
                },
            )
        })
        .unwrap()
        .id;

    let outcome = w.pipeline.generate("u1", &id, Trigger::User).await.unwrap();
    let GenerationOutcome::Generated { version, .. } = outcome else {
        panic!("expected a generated version");
    };
    assert_eq!(version.content, "Report body");
    assert!(slack.sent().is_empty());

    let requests = model.requests.lock();
    assert!(requests[0].tools.iter().all(|t| t.name != "send_message"));
    let tool_result = requests[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_result.content.contains("primitive_permission"));
}

#[tokio::test]
async fn triage_generate_deliver_retain_then_quiet() {
    let slack = Arc::new(
        InMemoryConnector::new(Platform::Slack)
            .with_items([PlatformItem::new("C1", "Launch moved to Friday")]),
    );
    let model = Scripted::new(vec![
        ModelResponse::tools(vec![call("c1", "read_platform", json!({"platform": "slack", "resource_id": "C1"}))]),
        ModelResponse::text("# Digest\n- Launch moved to Friday (Slack C1)"),
    ]);
    let w = world(ConnectorRegistry::new().with(slack.clone()), model.clone());

    let id = w
        .storage
        .with_connection(|conn| {
            let d = deliverables::create_deliverable(
                conn,
                &CreateDeliverableInput {
                    user_id: "u1".to_string(),
                    title: "Channel digest".to_string(),
                    deliverable_type: DeliverableType::Digest,
                    schedule: Schedule {
                        cadence: Cadence::OnChange,
                        min_interval_minutes: Some(0),
                    },
                    sources: vec![SourceRef::platform(Platform::Slack)],
                    destination: Some(DeliveryTarget {
                        channel: ChannelKind::ChatPost,
                        destination: "#team".to_string(),
                    }),
                    ..Default::default()
                },
            )?;
            snapshots::upsert_snapshot(
                conn,
                &snapshot("u1", "C1", "Launch moved to Friday", Utc::now() - ChronoDuration::minutes(5)),
            )?;
            Ok(d.id)
        })
        .unwrap();

    let evaluation = w.triage.evaluate("u1", Platform::Slack).unwrap();
    assert_eq!(evaluation.decision, SignalDecision::TriggerExisting);

    let outcome = w.pipeline.handle_signal(&evaluation).await.unwrap().unwrap();
    let GenerationOutcome::Generated { version, .. } = outcome else {
        panic!("expected a generated version");
    };
    assert_eq!(version.version, 1);
    assert_eq!(version.trigger, TriggerKind::Signal);
    assert!(version.delivered);

    // Triage reasoning reached the agent, and the live read came back undisclosed
    let requests = model.requests.lock().clone();
    assert!(requests[0].messages[0].content.contains("Why this run was started"));
    let tool_result = requests[1].messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_result.content.contains("Launch moved to Friday"));
    assert!(tool_result.content.contains("\"live\""));

    let sent = slack.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "post_message");
    assert_eq!(sent[0].1["channel"], "#team");

    let (stored, retained) = w
        .storage
        .with_connection(|conn| {
            Ok((
                deliverables::get_deliverable(conn, "u1", &id)?,
                snapshots::get_snapshot(conn, "u1", Platform::Slack, "C1")?,
            ))
        })
        .unwrap();
    assert!(stored.last_generated_at.is_some());
    assert!(retained.unwrap().retained_until.is_some());

    // Nothing new synced since: the same rule now says no_action
    let again = w.triage.evaluate("u1", Platform::Slack).unwrap();
    assert_eq!(again.decision, SignalDecision::NoAction);
}

#[tokio::test]
async fn failed_delivery_keeps_the_version() {
    let slack = Arc::new(InMemoryConnector::new(Platform::Slack));
    slack.fail_next(StewardError::Transient {
        platform: Platform::Slack,
        message: "503 from upstream".to_string(),
    });
    let model = Scripted::new(vec![ModelResponse::text("Status: green")]);
    let w = world(ConnectorRegistry::new().with(slack), model);

    let id = w
        .storage
        .with_connection(|conn| {
            deliverables::create_deliverable(
                conn,
                &CreateDeliverableInput {
                    user_id: "u1".to_string(),
                    title: "Status".to_string(),
                    deliverable_type: DeliverableType::StatusReport,
                    sources: vec![SourceRef::platform(Platform::Slack)],
                    destination: Some(DeliveryTarget {
                        channel: ChannelKind::ChatPost,
                        destination: "#team".to_string(),
                    }),
                    ..Default::default()
                },
            )
        })
        .unwrap()
        .id;

    w.pipeline.generate("u1", &id, Trigger::User).await.unwrap();

    let versions = w
        .storage
        .with_connection(|conn| deliverables::list_versions(conn, &id, 10))
        .unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].content, "Status: green");
    assert!(!versions[0].delivered);
    assert!(versions[0].delivery_error.is_some());
}
