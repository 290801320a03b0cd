//! Primitive handlers
//!
//! Empty results (`EmptyScope`, `NoContent`) are returned as successful
//! answers with a plain note, so the model reports "nothing found" instead of
//! treating it as a failure to work around.

use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::PrimitiveContext;
use crate::error::{Result, StewardError};
use crate::platform::{PlatformIntent, QueryParams};
use crate::reconcile::{PlatformAnswer, Reconciler};
use crate::retrieval::{RememberOutcome, Retriever};
use crate::storage::{deliverables, preferences, snapshots, sync_tasks, Storage};
use crate::types::*;

const RECENT_SYNC_TASKS: usize = 10;

#[derive(Debug, Deserialize)]
pub(super) struct SearchMemoryArgs {
    query: String,
    max_results: Option<usize>,
}

pub(super) async fn search_memory(
    retriever: &Retriever,
    ctx: &PrimitiveContext,
    args: SearchMemoryArgs,
) -> Result<Value> {
    let max = args
        .max_results
        .unwrap_or(retriever.config().default_max_results)
        .clamp(1, 50);

    match retriever.retrieve(&ctx.user_id, &ctx.scope, &args.query, max).await {
        Ok(scored) => Ok(json!({
            "memories": scored
                .iter()
                .map(|s| json!({
                    "id": s.memory.id,
                    "content": s.memory.content,
                    "tags": s.memory.tags,
                    "importance": s.memory.importance,
                    "relevance": s.relevance,
                    "project_id": s.memory.scope.project_id(),
                }))
                .collect::<Vec<_>>(),
        })),
        Err(e @ StewardError::EmptyScope) => Ok(json!({
            "memories": [],
            "note": e.user_message(),
        })),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ReadPlatformArgs {
    platform: Platform,
    resource_id: Option<String>,
    query: Option<String>,
    limit: Option<usize>,
}

pub(super) async fn read_platform(
    reconciler: &Reconciler,
    ctx: &PrimitiveContext,
    args: ReadPlatformArgs,
) -> Result<Value> {
    let intent = match (args.resource_id, args.query) {
        (Some(resource_id), _) => PlatformIntent::Fetch { resource_id },
        (None, Some(query)) if !query.trim().is_empty() => PlatformIntent::Search { query },
        _ => PlatformIntent::ListResources,
    };
    let params = QueryParams {
        limit: args.limit.unwrap_or(20).clamp(1, 100),
        since: None,
    };

    match reconciler
        .resolve_platform_query(&ctx.user_id, args.platform, &intent, params)
        .await
    {
        Ok(answer) => Ok(render_answer(&answer)),
        Err(e @ StewardError::NoContent { .. }) => Ok(json!({
            "platform": args.platform,
            "items": [],
            "note": e.user_message(),
        })),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct SearchPlatformsArgs {
    query: String,
    limit: Option<usize>,
}

pub(super) async fn search_platforms(
    reconciler: &Reconciler,
    ctx: &PrimitiveContext,
    args: SearchPlatformsArgs,
) -> Result<Value> {
    if args.query.trim().is_empty() {
        return Err(StewardError::InvalidInput("query cannot be empty".to_string()));
    }
    if reconciler.connectors().is_empty() {
        return Ok(json!({
            "results": [],
            "note": "No platforms are connected yet.",
        }));
    }

    let params = QueryParams {
        limit: args.limit.unwrap_or(10).clamp(1, 100),
        since: None,
    };
    let answers = reconciler.search_all(&ctx.user_id, &args.query, params).await;

    let results: Vec<Value> = answers
        .iter()
        .map(|(platform, result)| match result {
            Ok(answer) => render_answer(answer),
            Err(e) => json!({
                "platform": platform,
                "error": e.user_message(),
            }),
        })
        .collect();

    if results.is_empty() {
        return Ok(json!({
            "results": [],
            "note": format!("No connected platform has anything matching '{}', even after a fresh sync.", args.query),
        }));
    }
    Ok(json!({ "results": results }))
}

pub(super) fn read_system_state(
    storage: &Storage,
    reconciler: &Reconciler,
    ctx: &PrimitiveContext,
) -> Result<Value> {
    let (all, freshness, tasks, prefs) = storage.with_connection(|conn| {
        Ok((
            deliverables::list_deliverables(conn, &ctx.user_id, None)?,
            snapshots::platform_freshness(conn, &ctx.user_id)?,
            sync_tasks::recent_tasks(conn, &ctx.user_id, RECENT_SYNC_TASKS)?,
            preferences::list_preferences(conn, &ctx.user_id)?,
        ))
    })?;
    let now = Utc::now();

    Ok(json!({
        "deliverables": all
            .iter()
            .map(|d| json!({
                "id": d.id,
                "title": d.title,
                "type": d.deliverable_type,
                "state": d.state,
                "origin": d.origin,
                "last_generated_at": d.last_generated_at,
            }))
            .collect::<Vec<_>>(),
        "connected_platforms": reconciler.connectors().platforms(),
        "synced_data": freshness
            .iter()
            .map(|(platform, synced_at, count)| json!({
                "platform": platform,
                "latest_synced_at": synced_at,
                "age_minutes": (now - *synced_at).num_minutes().max(0),
                "items": count,
            }))
            .collect::<Vec<_>>(),
        "recent_syncs": tasks
            .iter()
            .map(|t| json!({
                "platform": t.platform,
                "resource_id": t.resource_id,
                "state": t.state,
                "error": t.error,
                "requested_at": t.requested_at,
            }))
            .collect::<Vec<_>>(),
        "preferences": prefs,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct RememberArgs {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    importance: Option<f32>,
}

pub(super) async fn remember(
    retriever: &Retriever,
    ctx: &PrimitiveContext,
    args: RememberArgs,
) -> Result<Value> {
    let outcome = retriever
        .remember(CreateMemoryInput {
            user_id: ctx.user_id.clone(),
            scope: ctx.scope.clone(),
            content: args.content,
            tags: args.tags,
            importance: args.importance,
            provenance: Provenance {
                kind: OriginKind::Conversation,
                reference: None,
            },
            ..Default::default()
        })
        .await?;

    let status = match outcome {
        RememberOutcome::Created(_) => "created",
        RememberOutcome::Merged(_) => "merged",
    };
    let memory = outcome.into_memory();
    Ok(json!({
        "status": status,
        "memory_id": memory.id,
        "importance": memory.importance,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateDeliverableArgs {
    title: String,
    #[serde(default)]
    deliverable_type: DeliverableType,
    sources: Vec<SourceRef>,
    cadence: Option<Cadence>,
    min_interval_minutes: Option<i64>,
    instructions: Option<String>,
    destination: Option<DeliveryTarget>,
}

pub(super) fn create_deliverable(
    storage: &Storage,
    ctx: &PrimitiveContext,
    args: CreateDeliverableArgs,
) -> Result<Value> {
    if args.sources.is_empty() {
        return Err(StewardError::InvalidInput(
            "a deliverable needs at least one source".to_string(),
        ));
    }

    let input = CreateDeliverableInput {
        user_id: ctx.user_id.clone(),
        title: args.title,
        deliverable_type: args.deliverable_type,
        schedule: Schedule {
            cadence: args.cadence.unwrap_or_default(),
            min_interval_minutes: args.min_interval_minutes,
        },
        sources: args.sources,
        destination: args.destination,
        origin: DeliverableOrigin::User,
        instructions: args.instructions,
        project_id: ctx.scope.project_id().map(str::to_string),
    };
    let deliverable = storage.with_connection(|conn| deliverables::create_deliverable(conn, &input))?;
    info!(user_id = %ctx.user_id, deliverable_id = %deliverable.id, "deliverable created from chat");

    Ok(json!({ "deliverable": deliverable }))
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdateDeliverableArgs {
    deliverable_id: String,
    title: Option<String>,
    state: Option<DeliverableState>,
    cadence: Option<Cadence>,
    min_interval_minutes: Option<i64>,
    sources: Option<Vec<SourceRef>>,
    instructions: Option<String>,
    destination: Option<DeliveryTarget>,
}

pub(super) fn update_deliverable(
    storage: &Storage,
    ctx: &PrimitiveContext,
    args: UpdateDeliverableArgs,
) -> Result<Value> {
    let deliverable = storage.with_transaction(|conn| {
        let current = deliverables::get_deliverable(conn, &ctx.user_id, &args.deliverable_id)?;
        let schedule = if args.cadence.is_some() || args.min_interval_minutes.is_some() {
            Some(Schedule {
                cadence: args.cadence.unwrap_or(current.schedule.cadence),
                min_interval_minutes: args
                    .min_interval_minutes
                    .or(current.schedule.min_interval_minutes),
            })
        } else {
            None
        };

        deliverables::update_deliverable(
            conn,
            &ctx.user_id,
            &args.deliverable_id,
            &UpdateDeliverableInput {
                title: args.title,
                state: args.state,
                schedule,
                sources: args.sources,
                destination: args.destination,
                instructions: args.instructions,
            },
        )
    })?;

    Ok(json!({ "deliverable": deliverable }))
}

#[derive(Debug, Deserialize)]
pub(super) struct SendMessageArgs {
    platform: Platform,
    action: String,
    #[serde(default)]
    payload: Value,
}

pub(super) async fn send_message(
    reconciler: &Reconciler,
    ctx: &PrimitiveContext,
    args: SendMessageArgs,
) -> Result<Value> {
    let connector = reconciler.connectors().get(args.platform).ok_or_else(|| {
        StewardError::NotFound(format!("a {} connection", args.platform.display_name()))
    })?;

    let result = connector.send(&ctx.user_id, &args.action, args.payload).await?;
    info!(user_id = %ctx.user_id, platform = %args.platform, action = %args.action, "outbound action sent");

    Ok(json!({
        "sent": true,
        "platform": args.platform,
        "action": args.action,
        "result": result,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdatePreferencesArgs {
    preferences: HashMap<String, String>,
}

pub(super) fn update_preferences(
    storage: &Storage,
    ctx: &PrimitiveContext,
    args: UpdatePreferencesArgs,
) -> Result<Value> {
    if args.preferences.is_empty() {
        return Err(StewardError::InvalidInput("no preferences given".to_string()));
    }
    if let Some(tz) = args.preferences.get(preferences::TIMEZONE) {
        tz.parse::<chrono_tz::Tz>()
            .map_err(|_| StewardError::InvalidInput(format!("unknown timezone '{}'", tz)))?;
    }

    let mut keys: Vec<&String> = args.preferences.keys().collect();
    keys.sort();
    storage.with_transaction(|conn| {
        for key in &keys {
            preferences::set_preference(conn, &ctx.user_id, key, &args.preferences[*key])?;
        }
        Ok(())
    })?;

    Ok(json!({ "updated": keys }))
}

/// Answer plus the disclosure the model must pass on
fn render_answer(answer: &PlatformAnswer) -> Value {
    json!({
        "platform": answer.platform,
        "disclosure": answer.disclosure,
        "staleness_note": answer.staleness_note(Utc::now()),
        "items": answer.items,
    })
}
