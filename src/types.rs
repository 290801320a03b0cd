//! Core types for Steward

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StewardError};

/// Identifier of the owning user account
pub type UserId = String;

/// Unique identifier for a memory
pub type MemoryId = i64;

/// Deliverables are addressed by UUID
pub type DeliverableId = String;

/// Sync tasks are addressed by UUID
pub type SyncTaskId = String;

// ============================================================================
// MEMORY
// ============================================================================

/// Visibility scope of a memory.
///
/// `User` memories are portable knowledge visible everywhere for that user.
/// `Project` memories are isolated to a single project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryScope {
    #[default]
    User,
    Project { project_id: String },
}

impl MemoryScope {
    pub fn project(id: impl Into<String>) -> Self {
        MemoryScope::Project {
            project_id: id.into(),
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            MemoryScope::User => None,
            MemoryScope::Project { project_id } => Some(project_id),
        }
    }

    /// Whether a memory stored under `memory_scope` is visible to a query in this scope.
    ///
    /// User-wide memories are always visible; project memories only to the same project.
    pub fn admits(&self, memory_scope: &MemoryScope) -> bool {
        match (self, memory_scope) {
            (_, MemoryScope::User) => true,
            (MemoryScope::Project { project_id: want }, MemoryScope::Project { project_id: have }) => {
                want == have
            }
            (MemoryScope::User, MemoryScope::Project { .. }) => false,
        }
    }
}

/// Where a memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Conversation,
    Document,
    #[default]
    Manual,
    Import,
}

impl OriginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginKind::Conversation => "conversation",
            OriginKind::Document => "document",
            OriginKind::Manual => "manual",
            OriginKind::Import => "import",
        }
    }
}

impl std::str::FromStr for OriginKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conversation" => Ok(OriginKind::Conversation),
            "document" => Ok(OriginKind::Document),
            "manual" => Ok(OriginKind::Manual),
            "import" => Ok(OriginKind::Import),
            _ => Err(format!("Unknown origin kind: {}", s)),
        }
    }
}

/// Provenance descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Provenance {
    pub kind: OriginKind,
    /// Conversation id, document id, import batch, ...
    pub reference: Option<String>,
}

/// A durable knowledge fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub user_id: UserId,
    #[serde(default)]
    pub scope: MemoryScope,
    pub content: String,
    /// Fixed-length embedding vector
    #[serde(skip)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Extracted entities keyed by kind (person, org, ...)
    #[serde(default)]
    pub entities: HashMap<String, Vec<String>>,
    /// Importance score (0.0 - 1.0)
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub provenance: Provenance,
    /// Soft-delete flag; inactive memories are kept for audit only
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Advisory bookkeeping for importance decay
    pub last_referenced_at: Option<DateTime<Utc>>,
}

fn default_importance() -> f32 {
    0.5
}

fn default_true() -> bool {
    true
}

/// Input for creating a new memory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateMemoryInput {
    pub user_id: UserId,
    #[serde(default)]
    pub scope: MemoryScope,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entities: HashMap<String, Vec<String>>,
    pub importance: Option<f32>,
    #[serde(default)]
    pub provenance: Provenance,
}

/// The only mutations a memory accepts after creation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateMemoryInput {
    pub importance: Option<f32>,
    pub tags: Option<Vec<String>>,
}

/// A memory with its blended relevance for one query
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub similarity: f32,
    pub relevance: f32,
}

// ============================================================================
// PLATFORMS & SNAPSHOTS
// ============================================================================

/// Connected third-party workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Slack,
    Gmail,
    Notion,
    Calendar,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Slack,
        Platform::Gmail,
        Platform::Notion,
        Platform::Calendar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Slack => "slack",
            Platform::Gmail => "gmail",
            Platform::Notion => "notion",
            Platform::Calendar => "calendar",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Slack => "Slack",
            Platform::Gmail => "Gmail",
            Platform::Notion => "Notion",
            Platform::Calendar => "Google Calendar",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slack" => Ok(Platform::Slack),
            "gmail" | "email" => Ok(Platform::Gmail),
            "notion" => Ok(Platform::Notion),
            "calendar" | "google_calendar" => Ok(Platform::Calendar),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

/// Locally stored copy of an external-platform resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSnapshot {
    pub platform: Platform,
    pub user_id: UserId,
    pub resource_id: String,
    pub content: String,
    /// Structural metadata (thread, position, attendees, start time, ...)
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Timestamp of the sync that produced this copy
    pub synced_at: DateTime<Utc>,
    /// Set when a generated deliverable version relied on this snapshot
    pub retained_until: Option<DateTime<Utc>>,
}

/// Reference to the platform resources feeding a deliverable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub platform: Platform,
    /// `None` means every resource on that platform
    #[serde(default)]
    pub resource_id: Option<String>,
}

impl SourceRef {
    pub fn platform(platform: Platform) -> Self {
        Self {
            platform,
            resource_id: None,
        }
    }

    pub fn resource(platform: Platform, resource_id: impl Into<String>) -> Self {
        Self {
            platform,
            resource_id: Some(resource_id.into()),
        }
    }

    pub fn matches(&self, platform: Platform, resource_id: &str) -> bool {
        self.platform == platform
            && self
                .resource_id
                .as_deref()
                .map_or(true, |r| r == resource_id)
    }
}

// ============================================================================
// DELIVERABLES
// ============================================================================

/// Kind of recurring artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableType {
    #[default]
    StatusReport,
    Digest,
    MeetingPrep,
    ResearchBrief,
    Custom,
}

impl DeliverableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverableType::StatusReport => "status_report",
            DeliverableType::Digest => "digest",
            DeliverableType::MeetingPrep => "meeting_prep",
            DeliverableType::ResearchBrief => "research_brief",
            DeliverableType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for DeliverableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeliverableType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "status_report" | "status" => Ok(DeliverableType::StatusReport),
            "digest" => Ok(DeliverableType::Digest),
            "meeting_prep" => Ok(DeliverableType::MeetingPrep),
            "research_brief" | "research" => Ok(DeliverableType::ResearchBrief),
            "custom" => Ok(DeliverableType::Custom),
            _ => Err(format!("Unknown deliverable type: {}", s)),
        }
    }
}

/// Lifecycle state of a deliverable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliverableState {
    #[default]
    Active,
    Paused,
    Archived,
}

impl DeliverableState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverableState::Active => "active",
            DeliverableState::Paused => "paused",
            DeliverableState::Archived => "archived",
        }
    }
}

impl std::str::FromStr for DeliverableState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(DeliverableState::Active),
            "paused" => Ok(DeliverableState::Paused),
            "archived" => Ok(DeliverableState::Archived),
            _ => Err(format!("Unknown deliverable state: {}", s)),
        }
    }
}

/// How often a deliverable is expected to regenerate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Hourly,
    #[default]
    Daily,
    Weekly,
    /// Regenerate whenever sources change, subject to the minimum interval
    OnChange,
}

/// Schedule / trigger configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Schedule {
    #[serde(default)]
    pub cadence: Cadence,
    /// Overrides the cadence-derived minimum inter-generation interval
    pub min_interval_minutes: Option<i64>,
}

impl Schedule {
    /// Minimum time between two generations
    pub fn min_interval(&self, on_change_default_minutes: i64) -> ChronoDuration {
        let minutes = self.min_interval_minutes.unwrap_or(match self.cadence {
            Cadence::Hourly => 60,
            Cadence::Daily => 24 * 60,
            Cadence::Weekly => 7 * 24 * 60,
            Cadence::OnChange => on_change_default_minutes,
        });
        ChronoDuration::minutes(minutes.max(0))
    }
}

/// How a deliverable came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliverableOrigin {
    #[default]
    User,
    Emergent,
}

/// Delivery channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    ChatPost,
    Document,
}

/// Where generated content goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub channel: ChannelKind,
    pub destination: String,
}

/// A recurring, typed output object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: DeliverableId,
    pub user_id: UserId,
    pub title: String,
    pub deliverable_type: DeliverableType,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    pub destination: Option<DeliveryTarget>,
    #[serde(default)]
    pub state: DeliverableState,
    #[serde(default)]
    pub origin: DeliverableOrigin,
    /// Free-form guidance from the user
    pub instructions: Option<String>,
    /// Optional project the deliverable belongs to (drives memory scope)
    pub project_id: Option<String>,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deliverable {
    pub fn memory_scope(&self) -> MemoryScope {
        match &self.project_id {
            Some(id) => MemoryScope::project(id.clone()),
            None => MemoryScope::User,
        }
    }

    pub fn reads_from(&self, platform: Platform) -> bool {
        self.sources.iter().any(|s| s.platform == platform)
    }
}

/// Input for creating a deliverable
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateDeliverableInput {
    pub user_id: UserId,
    pub title: String,
    #[serde(default)]
    pub deliverable_type: DeliverableType,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    pub destination: Option<DeliveryTarget>,
    #[serde(default)]
    pub origin: DeliverableOrigin,
    pub instructions: Option<String>,
    pub project_id: Option<String>,
}

/// Partial update of a deliverable
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateDeliverableInput {
    pub title: Option<String>,
    pub state: Option<DeliverableState>,
    pub schedule: Option<Schedule>,
    pub sources: Option<Vec<SourceRef>>,
    pub destination: Option<DeliveryTarget>,
    pub instructions: Option<String>,
}

/// What started a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    UserRequest,
    Schedule,
    Signal,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::UserRequest => "user_request",
            TriggerKind::Schedule => "schedule",
            TriggerKind::Signal => "signal",
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user_request" => Ok(TriggerKind::UserRequest),
            "schedule" => Ok(TriggerKind::Schedule),
            "signal" => Ok(TriggerKind::Signal),
            _ => Err(format!("Unknown trigger kind: {}", s)),
        }
    }
}

/// One persisted generation of a deliverable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableVersion {
    pub id: i64,
    pub deliverable_id: DeliverableId,
    pub version: i64,
    pub content: String,
    pub trigger: TriggerKind,
    pub ceiling_truncated: bool,
    pub delivered: bool,
    pub delivery_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// TRIAGE
// ============================================================================

/// Triage outcome kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDecision {
    TriggerExisting,
    CreateEmergent,
    NoAction,
}

/// A proposed deliverable discovered from synced content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergentCandidate {
    pub deliverable_type: DeliverableType,
    pub title: String,
    /// The resource that prompted the proposal (e.g. calendar event id)
    pub anchor: SourceRef,
    pub starts_at: Option<DateTime<Utc>>,
    pub participants: Vec<String>,
    /// Related content found on other platforms
    pub related: Vec<SourceRef>,
}

/// The triage decision for one (user, source) pair at one tick. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvaluation {
    pub user_id: UserId,
    pub source: Platform,
    pub decision: SignalDecision,
    pub deliverable_id: Option<DeliverableId>,
    pub candidate: Option<EmergentCandidate>,
    /// Carried forward to the agent as investigation guidance
    pub reasoning: String,
    pub evaluated_at: DateTime<Utc>,
}

impl SignalEvaluation {
    pub fn no_action(user_id: &str, source: Platform, reasoning: impl Into<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            source,
            decision: SignalDecision::NoAction,
            deliverable_id: None,
            candidate: None,
            reasoning: reasoning.into(),
            evaluated_at: Utc::now(),
        }
    }
}

// ============================================================================
// AGENT
// ============================================================================

/// Execution mode of the agent loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Interactive, streaming, human present
    Chat,
    /// Background generation, no observer
    Headless,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Chat => "chat",
            ExecutionMode::Headless => "headless",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One round of the agent loop. Not persisted beyond logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub round: u32,
    pub primitive: String,
    pub arguments: serde_json::Value,
    pub output: serde_json::Value,
    pub is_error: bool,
}

// ============================================================================
// SYNC TASKS
// ============================================================================

/// Status of a queued synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SyncTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTaskState::Pending => "pending",
            SyncTaskState::Running => "running",
            SyncTaskState::Completed => "completed",
            SyncTaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncTaskState::Completed | SyncTaskState::Failed)
    }
}

impl std::str::FromStr for SyncTaskState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncTaskState::Pending),
            "running" => Ok(SyncTaskState::Running),
            "completed" => Ok(SyncTaskState::Completed),
            "failed" => Ok(SyncTaskState::Failed),
            _ => Err(format!("Unknown sync task state: {}", s)),
        }
    }
}

/// Status record of one synchronization request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: SyncTaskId,
    pub user_id: UserId,
    pub platform: Platform,
    pub resource_id: Option<String>,
    pub state: SyncTaskState,
    pub error: Option<String>,
    pub items_synced: i64,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Storage mode for database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// WAL journal, local disk
    #[default]
    Local,
    /// DELETE journal, safe inside cloud-synced folders
    CloudSafe,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
    #[serde(default)]
    pub storage_mode: StorageMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.local/share/steward/steward.db".to_string(),
            storage_mode: StorageMode::Local,
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model to use: "openai", "tfidf"
    pub model: String,
    pub api_key: Option<String>,
    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,
    /// Embedding model name override
    pub embedding_model: Option<String>,
    /// Embedding dimensions (must match model output)
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "tfidf".to_string(),
            api_key: None,
            base_url: None,
            embedding_model: None,
            dimensions: 384,
        }
    }
}

/// Retrieval tuning. Both constants are empirical defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Weight of cosine similarity against importance
    pub alpha: f32,
    /// Similarity at or above which two memories are considered the same
    pub match_threshold: f32,
    pub default_max_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            match_threshold: 0.72,
            default_max_results: 10,
        }
    }
}

/// Live/cache reconciliation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 4_000,
            poll_interval_secs: 5,
            poll_timeout_secs: 60,
        }
    }
}

impl ReconcileConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Triage rule tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    pub meeting_lookahead_hours: i64,
    pub min_external_participants: usize,
    /// Minimum interval for on-change deliverables without an explicit override
    pub default_min_interval_minutes: i64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            meeting_lookahead_hours: 48,
            min_external_participants: 2,
            default_min_interval_minutes: 60,
        }
    }
}

/// Agent loop bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub chat_round_ceiling: u32,
    pub headless_round_ceiling: u32,
    pub max_tokens: u32,
    /// Wall-clock bound for a whole headless run
    pub headless_timeout_secs: u64,
    /// Bound for a single model call
    pub model_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            chat_round_ceiling: 15,
            headless_round_ceiling: 3,
            max_tokens: 4096,
            headless_timeout_secs: 300,
            model_timeout_secs: 120,
        }
    }
}

impl AgentConfig {
    pub fn round_ceiling(&self, mode: ExecutionMode) -> u32 {
        match mode {
            ExecutionMode::Chat => self.chat_round_ceiling,
            ExecutionMode::Headless => self.headless_round_ceiling,
        }
    }
}

/// Recurring tick configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Users evaluated in parallel; each user is always serialized
    pub max_concurrent_users: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 3600,
            max_concurrent_users: 4,
        }
    }
}

/// Generation pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub snapshot_retention_days: i64,
    /// Snapshots included in the seed context
    pub context_snapshot_limit: usize,
    /// Memories included in the seed context
    pub context_memory_limit: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            snapshot_retention_days: 30,
            context_snapshot_limit: 40,
            context_memory_limit: 8,
        }
    }
}

/// Full configuration, every section defaulted
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StewardConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub reconcile: ReconcileConfig,
    pub triage: TriageConfig,
    pub agent: AgentConfig,
    pub scheduler: SchedulerConfig,
    pub orchestration: OrchestrationConfig,
}

impl StewardConfig {
    /// Load overrides from a JSON file; missing sections keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: StewardConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retrieval.alpha) {
            return Err(StewardError::Config(format!(
                "retrieval.alpha must be within [0, 1], got {}",
                self.retrieval.alpha
            )));
        }
        if self.reconcile.max_attempts == 0 {
            return Err(StewardError::Config(
                "reconcile.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_users == 0 {
            return Err(StewardError::Config(
                "scheduler.max_concurrent_users must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an RFC 3339 column value, falling back to now for corrupt rows
pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_optional_timestamp(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_admits() {
        let user = MemoryScope::User;
        let alpha = MemoryScope::project("alpha");
        let beta = MemoryScope::project("beta");

        assert!(user.admits(&MemoryScope::User));
        assert!(!user.admits(&alpha));
        assert!(alpha.admits(&MemoryScope::User));
        assert!(alpha.admits(&alpha));
        assert!(!alpha.admits(&beta));
    }

    #[test]
    fn test_schedule_min_interval() {
        let daily = Schedule::default();
        assert_eq!(daily.min_interval(60), ChronoDuration::hours(24));

        let on_change = Schedule {
            cadence: Cadence::OnChange,
            min_interval_minutes: None,
        };
        assert_eq!(on_change.min_interval(45), ChronoDuration::minutes(45));

        let overridden = Schedule {
            cadence: Cadence::Weekly,
            min_interval_minutes: Some(10),
        };
        assert_eq!(overridden.min_interval(60), ChronoDuration::minutes(10));
    }

    #[test]
    fn test_source_ref_matching() {
        let whole = SourceRef::platform(Platform::Slack);
        assert!(whole.matches(Platform::Slack, "C123"));
        assert!(!whole.matches(Platform::Gmail, "C123"));

        let one = SourceRef::resource(Platform::Slack, "C123");
        assert!(one.matches(Platform::Slack, "C123"));
        assert!(!one.matches(Platform::Slack, "C999"));
    }

    #[test]
    fn test_config_partial_json() {
        let config: StewardConfig =
            serde_json::from_str(r#"{"retrieval": {"alpha": 0.5, "match_threshold": 0.8, "default_max_results": 5}}"#)
                .unwrap();
        assert_eq!(config.retrieval.alpha, 0.5);
        assert_eq!(config.reconcile.poll_timeout_secs, 60);
        assert_eq!(config.agent.headless_round_ceiling, 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = StewardConfig::default();
        assert!(config.validate().is_ok());
        config.retrieval.alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_platform_roundtrip_names() {
        for platform in Platform::ALL {
            let parsed: Platform = platform.as_str().parse().unwrap();
            assert_eq!(parsed, platform);
        }
    }
}
