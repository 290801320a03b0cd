//! Primitive Registry
//!
//! The closed set of capabilities the reasoning loop may call. Every
//! primitive is an enum variant carrying its tool schema and the execution
//! modes it is allowed in, and dispatch is a single `match`, so the tool list
//! a mode advertises and the calls it accepts can never diverge.
//!
//! Failures never escape [`PrimitiveRegistry::execute`]: permission denials,
//! unknown names, bad arguments and handler errors all come back as a
//! structured [`ToolOutput`] with `is_error` set, for the model to adapt to.

mod handlers;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, StewardError};
use crate::reconcile::Reconciler;
use crate::retrieval::Retriever;
use crate::storage::Storage;
use crate::types::{ExecutionMode, MemoryScope, UserId};

const BOTH_MODES: &[ExecutionMode] = &[ExecutionMode::Chat, ExecutionMode::Headless];
const CHAT_ONLY: &[ExecutionMode] = &[ExecutionMode::Chat];

/// Tool definition as advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Every capability exposed to the reasoning loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    SearchMemory,
    ReadPlatform,
    SearchPlatforms,
    ReadSystemState,
    Remember,
    CreateDeliverable,
    UpdateDeliverable,
    SendMessage,
    UpdatePreferences,
}

impl Primitive {
    pub const ALL: [Primitive; 9] = [
        Primitive::SearchMemory,
        Primitive::ReadPlatform,
        Primitive::SearchPlatforms,
        Primitive::ReadSystemState,
        Primitive::Remember,
        Primitive::CreateDeliverable,
        Primitive::UpdateDeliverable,
        Primitive::SendMessage,
        Primitive::UpdatePreferences,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::SearchMemory => "search_memory",
            Primitive::ReadPlatform => "read_platform",
            Primitive::SearchPlatforms => "search_platforms",
            Primitive::ReadSystemState => "read_system_state",
            Primitive::Remember => "remember",
            Primitive::CreateDeliverable => "create_deliverable",
            Primitive::UpdateDeliverable => "update_deliverable",
            Primitive::SendMessage => "send_message",
            Primitive::UpdatePreferences => "update_preferences",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Read-only investigation runs everywhere; anything with consequences needs a human
    pub fn allowed_modes(&self) -> &'static [ExecutionMode] {
        match self {
            Primitive::SearchMemory
            | Primitive::ReadPlatform
            | Primitive::SearchPlatforms
            | Primitive::ReadSystemState => BOTH_MODES,
            Primitive::Remember
            | Primitive::CreateDeliverable
            | Primitive::UpdateDeliverable
            | Primitive::SendMessage
            | Primitive::UpdatePreferences => CHAT_ONLY,
        }
    }

    pub fn allowed_in(&self, mode: ExecutionMode) -> bool {
        self.allowed_modes().contains(&mode)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Primitive::SearchMemory => "Semantic search over what the user has asked you to remember. Returns memories ranked by relevance; an empty list means nothing is known yet.",
            Primitive::ReadPlatform => "Read content from one connected platform: fetch a resource by id, search by query, or list recent resources. Cached answers include when they were synced; mention that age when you use them.",
            Primitive::SearchPlatforms => "Search every connected platform at once and merge the results. Each platform's answer states whether it is live or cached.",
            Primitive::ReadSystemState => "Read the user's deliverables, connected platforms, how fresh each platform's synced data is, and recent sync tasks.",
            Primitive::Remember => "Store a durable fact, preference or decision for later. Near-duplicates are merged with what is already known.",
            Primitive::CreateDeliverable => "Create a recurring deliverable (status report, digest, meeting prep, research brief, custom) that regenerates from the listed sources.",
            Primitive::UpdateDeliverable => "Change a deliverable's title, schedule, sources, destination, instructions or state (active, paused, archived).",
            Primitive::SendMessage => "Perform an outbound action on a connected platform, such as posting a message or sending an email. Only do this when the user asked for it.",
            Primitive::UpdatePreferences => "Set user preferences such as timezone, email or internal_domains (comma separated).",
        }
    }

    fn schema_json(&self) -> &'static str {
        match self {
            Primitive::SearchMemory => r#"{
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for"},
                    "max_results": {"type": "integer", "minimum": 1, "maximum": 50, "description": "Maximum memories to return"}
                },
                "required": ["query"]
            }"#,
            Primitive::ReadPlatform => r#"{
                "type": "object",
                "properties": {
                    "platform": {"type": "string", "enum": ["slack", "gmail", "notion", "calendar"]},
                    "resource_id": {"type": "string", "description": "Fetch this resource"},
                    "query": {"type": "string", "description": "Search this platform"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 100, "default": 20}
                },
                "required": ["platform"]
            }"#,
            Primitive::SearchPlatforms => r#"{
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 100, "default": 10, "description": "Per platform"}
                },
                "required": ["query"]
            }"#,
            Primitive::ReadSystemState => r#"{
                "type": "object",
                "properties": {}
            }"#,
            Primitive::Remember => r#"{
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "The fact to remember"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "importance": {"type": "number", "minimum": 0, "maximum": 1}
                },
                "required": ["content"]
            }"#,
            Primitive::CreateDeliverable => r#"{
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "deliverable_type": {"type": "string", "enum": ["status_report", "digest", "meeting_prep", "research_brief", "custom"], "default": "status_report"},
                    "sources": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "platform": {"type": "string", "enum": ["slack", "gmail", "notion", "calendar"]},
                                "resource_id": {"type": "string", "description": "Omit to read the whole platform"}
                            },
                            "required": ["platform"]
                        }
                    },
                    "cadence": {"type": "string", "enum": ["hourly", "daily", "weekly", "on_change"], "default": "daily"},
                    "min_interval_minutes": {"type": "integer", "minimum": 0},
                    "instructions": {"type": "string"},
                    "destination": {
                        "type": "object",
                        "properties": {
                            "channel": {"type": "string", "enum": ["email", "chat_post", "document"]},
                            "destination": {"type": "string"}
                        },
                        "required": ["channel", "destination"]
                    }
                },
                "required": ["title", "sources"]
            }"#,
            Primitive::UpdateDeliverable => r#"{
                "type": "object",
                "properties": {
                    "deliverable_id": {"type": "string"},
                    "title": {"type": "string"},
                    "state": {"type": "string", "enum": ["active", "paused", "archived"]},
                    "cadence": {"type": "string", "enum": ["hourly", "daily", "weekly", "on_change"]},
                    "min_interval_minutes": {"type": "integer", "minimum": 0},
                    "sources": {"type": "array", "items": {"type": "object"}},
                    "instructions": {"type": "string"},
                    "destination": {"type": "object"}
                },
                "required": ["deliverable_id"]
            }"#,
            Primitive::SendMessage => r#"{
                "type": "object",
                "properties": {
                    "platform": {"type": "string", "enum": ["slack", "gmail", "notion", "calendar"]},
                    "action": {"type": "string", "description": "Connector action, e.g. post_message, send_email, update_page"},
                    "payload": {"type": "object", "description": "Action arguments"}
                },
                "required": ["platform", "action", "payload"]
            }"#,
            Primitive::UpdatePreferences => r#"{
                "type": "object",
                "properties": {
                    "preferences": {
                        "type": "object",
                        "additionalProperties": {"type": "string"},
                        "description": "Key/value pairs to set"
                    }
                },
                "required": ["preferences"]
            }"#,
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: serde_json::from_str(self.schema_json()).unwrap_or_else(|_| json!({})),
        }
    }
}

/// Tool definitions for every primitive allowed in `mode`
pub fn get_tools_for_mode(mode: ExecutionMode) -> Vec<ToolDefinition> {
    Primitive::ALL
        .iter()
        .filter(|p| p.allowed_in(mode))
        .map(Primitive::definition)
        .collect()
}

/// Who a run acts for
#[derive(Debug, Clone)]
pub struct PrimitiveContext {
    pub user_id: UserId,
    pub scope: MemoryScope,
}

impl PrimitiveContext {
    pub fn new(user_id: impl Into<UserId>, scope: MemoryScope) -> Self {
        Self {
            user_id: user_id.into(),
            scope,
        }
    }
}

/// Result of one tool call, as handed back to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(error: &StewardError) -> Self {
        Self {
            content: json!({
                "error": {
                    "kind": error.class().as_str(),
                    "message": error.to_string(),
                    "explanation": error.user_message(),
                }
            }),
            is_error: true,
        }
    }
}

/// Mode-gated dispatcher over the primitive handlers
#[derive(Clone)]
pub struct PrimitiveRegistry {
    storage: Storage,
    retriever: Retriever,
    reconciler: Reconciler,
}

impl PrimitiveRegistry {
    pub fn new(storage: Storage, retriever: Retriever, reconciler: Reconciler) -> Self {
        Self {
            storage,
            retriever,
            reconciler,
        }
    }

    pub fn tools_for_mode(&self, mode: ExecutionMode) -> Vec<ToolDefinition> {
        get_tools_for_mode(mode)
    }

    /// Run one tool call. Never fails; errors become structured tool output.
    pub async fn execute(
        &self,
        mode: ExecutionMode,
        ctx: &PrimitiveContext,
        name: &str,
        arguments: &Value,
    ) -> ToolOutput {
        let result = match Primitive::from_name(name) {
            None => Err(StewardError::UnknownPrimitive(name.to_string())),
            Some(primitive) if !primitive.allowed_in(mode) => {
                warn!(
                    user_id = %ctx.user_id,
                    primitive = name,
                    %mode,
                    "primitive not permitted in this mode"
                );
                Err(StewardError::PrimitiveNotPermitted {
                    primitive: name.to_string(),
                    mode,
                })
            }
            Some(primitive) => self.dispatch(primitive, ctx, arguments).await,
        };

        match result {
            Ok(content) => {
                debug!(user_id = %ctx.user_id, primitive = name, "primitive succeeded");
                ToolOutput::ok(content)
            }
            Err(e) => {
                debug!(user_id = %ctx.user_id, primitive = name, error = %e, "primitive failed");
                ToolOutput::error(&e)
            }
        }
    }

    async fn dispatch(
        &self,
        primitive: Primitive,
        ctx: &PrimitiveContext,
        arguments: &Value,
    ) -> Result<Value> {
        match primitive {
            Primitive::SearchMemory => {
                handlers::search_memory(&self.retriever, ctx, parse_args(primitive, arguments)?).await
            }
            Primitive::ReadPlatform => {
                handlers::read_platform(&self.reconciler, ctx, parse_args(primitive, arguments)?).await
            }
            Primitive::SearchPlatforms => {
                handlers::search_platforms(&self.reconciler, ctx, parse_args(primitive, arguments)?)
                    .await
            }
            Primitive::ReadSystemState => {
                handlers::read_system_state(&self.storage, &self.reconciler, ctx)
            }
            Primitive::Remember => {
                handlers::remember(&self.retriever, ctx, parse_args(primitive, arguments)?).await
            }
            Primitive::CreateDeliverable => {
                handlers::create_deliverable(&self.storage, ctx, parse_args(primitive, arguments)?)
            }
            Primitive::UpdateDeliverable => {
                handlers::update_deliverable(&self.storage, ctx, parse_args(primitive, arguments)?)
            }
            Primitive::SendMessage => {
                handlers::send_message(&self.reconciler, ctx, parse_args(primitive, arguments)?).await
            }
            Primitive::UpdatePreferences => {
                handlers::update_preferences(&self.storage, ctx, parse_args(primitive, arguments)?)
            }
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(primitive: Primitive, arguments: &Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|e| {
        StewardError::InvalidInput(format!("invalid arguments for {}: {}", primitive.name(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TfIdfEmbedder;
    use crate::platform::{ConnectorRegistry, InMemoryConnector, PlatformItem};
    use crate::storage::{deliverables, preferences};
    use crate::sync::SyncQueue;
    use crate::types::{DeliverableState, Platform, ReconcileConfig, RetrievalConfig};
    use std::sync::Arc;

    struct Fixture {
        registry: PrimitiveRegistry,
        storage: Storage,
        slack: Arc<InMemoryConnector>,
        _receiver: async_channel::Receiver<crate::sync::SyncRequest>,
    }

    fn fixture() -> Fixture {
        let storage = Storage::open_in_memory().unwrap();
        let retriever = Retriever::new(
            storage.clone(),
            Arc::new(TfIdfEmbedder::new(384)),
            RetrievalConfig::default(),
        );
        let slack = Arc::new(
            InMemoryConnector::new(Platform::Slack)
                .with_items([PlatformItem::new("C1", "launch moved to friday")]),
        );
        let (queue, receiver) = SyncQueue::new(storage.clone(), 8);
        let reconciler = Reconciler::new(
            storage.clone(),
            ConnectorRegistry::new().with(slack.clone()),
            Arc::new(queue),
            ReconcileConfig::default(),
        );
        Fixture {
            registry: PrimitiveRegistry::new(storage.clone(), retriever, reconciler),
            storage,
            slack,
            _receiver: receiver,
        }
    }

    fn ctx() -> PrimitiveContext {
        PrimitiveContext::new("u1", MemoryScope::User)
    }

    #[test]
    fn test_names_round_trip_and_are_unique() {
        let mut names: Vec<&str> = Primitive::ALL.iter().map(|p| p.name()).collect();
        for primitive in Primitive::ALL {
            assert_eq!(Primitive::from_name(primitive.name()), Some(primitive));
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Primitive::ALL.len());
        assert_eq!(Primitive::from_name("drop_tables"), None);
    }

    #[test]
    fn test_every_schema_parses_as_object() {
        for primitive in Primitive::ALL {
            let schema: Value = serde_json::from_str(primitive.schema_json()).unwrap();
            assert_eq!(schema["type"], "object", "{}", primitive.name());
        }
    }

    #[test]
    fn test_tools_for_mode_filters_by_allow_list() {
        let headless: Vec<String> = get_tools_for_mode(ExecutionMode::Headless)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            headless,
            vec!["search_memory", "read_platform", "search_platforms", "read_system_state"]
        );
        assert_eq!(get_tools_for_mode(ExecutionMode::Chat).len(), Primitive::ALL.len());
    }

    #[tokio::test]
    async fn test_chat_only_primitive_rejected_in_headless() {
        let f = fixture();
        let output = f
            .registry
            .execute(
                ExecutionMode::Headless,
                &ctx(),
                "send_message",
                &json!({"platform": "slack", "action": "post_message", "payload": {"text": "hi"}}),
            )
            .await;

        assert!(output.is_error);
        assert_eq!(output.content["error"]["kind"], "primitive_permission");
        assert!(f.slack.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_calls_are_tool_errors() {
        let f = fixture();
        let unknown = f
            .registry
            .execute(ExecutionMode::Chat, &ctx(), "format_disk", &json!({}))
            .await;
        assert!(unknown.is_error);

        let malformed = f
            .registry
            .execute(ExecutionMode::Chat, &ctx(), "search_memory", &json!({"max_results": 3}))
            .await;
        assert!(malformed.is_error);
        assert!(malformed.content["error"]["message"]
            .as_str()
            .unwrap()
            .contains("search_memory"));
    }

    #[tokio::test]
    async fn test_search_memory_empty_scope_is_an_answer() {
        let f = fixture();
        let output = f
            .registry
            .execute(ExecutionMode::Headless, &ctx(), "search_memory", &json!({"query": "pricing"}))
            .await;
        assert!(!output.is_error);
        assert_eq!(output.content["memories"], json!([]));
    }

    #[tokio::test]
    async fn test_remember_then_search() {
        let f = fixture();
        let stored = f
            .registry
            .execute(
                ExecutionMode::Chat,
                &ctx(),
                "remember",
                &json!({"content": "Dana prefers async status updates", "tags": ["dana"]}),
            )
            .await;
        assert!(!stored.is_error);
        assert_eq!(stored.content["status"], "created");

        let found = f
            .registry
            .execute(
                ExecutionMode::Headless,
                &ctx(),
                "search_memory",
                &json!({"query": "how does Dana like status updates"}),
            )
            .await;
        assert_eq!(found.content["memories"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_platform_live() {
        let f = fixture();
        let output = f
            .registry
            .execute(
                ExecutionMode::Headless,
                &ctx(),
                "read_platform",
                &json!({"platform": "slack", "resource_id": "C1"}),
            )
            .await;
        assert!(!output.is_error);
        assert_eq!(output.content["disclosure"]["source"], "live");
        assert!(output.content["staleness_note"].is_null());
        assert_eq!(output.content["items"][0]["content"], "launch moved to friday");
    }

    #[tokio::test]
    async fn test_create_and_pause_deliverable() {
        let f = fixture();
        let created = f
            .registry
            .execute(
                ExecutionMode::Chat,
                &ctx(),
                "create_deliverable",
                &json!({
                    "title": "Launch digest",
                    "deliverable_type": "digest",
                    "sources": [{"platform": "slack", "resource_id": "C1"}],
                    "cadence": "on_change"
                }),
            )
            .await;
        assert!(!created.is_error, "{}", created.content);
        let id = created.content["deliverable"]["id"].as_str().unwrap().to_string();

        let paused = f
            .registry
            .execute(
                ExecutionMode::Chat,
                &ctx(),
                "update_deliverable",
                &json!({"deliverable_id": id, "state": "paused"}),
            )
            .await;
        assert!(!paused.is_error);

        let stored = f
            .storage
            .with_connection(|conn| deliverables::get_deliverable(conn, "u1", &id))
            .unwrap();
        assert_eq!(stored.state, DeliverableState::Paused);
    }

    #[tokio::test]
    async fn test_send_message_and_preferences_in_chat() {
        let f = fixture();
        let sent = f
            .registry
            .execute(
                ExecutionMode::Chat,
                &ctx(),
                "send_message",
                &json!({"platform": "slack", "action": "post_message", "payload": {"text": "shipped"}}),
            )
            .await;
        assert!(!sent.is_error);
        assert_eq!(f.slack.sent().len(), 1);

        let bad_tz = f
            .registry
            .execute(
                ExecutionMode::Chat,
                &ctx(),
                "update_preferences",
                &json!({"preferences": {"timezone": "Mars/Olympus"}}),
            )
            .await;
        assert!(bad_tz.is_error);

        let ok = f
            .registry
            .execute(
                ExecutionMode::Chat,
                &ctx(),
                "update_preferences",
                &json!({"preferences": {"timezone": "Europe/Lisbon", "internal_domains": "acme.io"}}),
            )
            .await;
        assert!(!ok.is_error);
        let tz = f
            .storage
            .with_connection(|conn| preferences::get_preference(conn, "u1", preferences::TIMEZONE))
            .unwrap();
        assert_eq!(tz.as_deref(), Some("Europe/Lisbon"));
    }

    #[tokio::test]
    async fn test_system_state_lists_connected_platforms() {
        let f = fixture();
        let output = f
            .registry
            .execute(ExecutionMode::Headless, &ctx(), "read_system_state", &Value::Null)
            .await;
        assert!(!output.is_error);
        assert_eq!(output.content["connected_platforms"], json!(["slack"]));
    }
}
