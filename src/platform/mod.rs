//! Platform connectors
//!
//! One connector per external workspace system. Connectors only talk to the
//! platform; snapshot bookkeeping and sync scheduling live in `sync`, and the
//! live/cache decision lives in `reconcile`.

mod memory;

pub use memory::InMemoryConnector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::types::Platform;

/// What a caller wants from a platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformIntent {
    ListResources,
    Fetch { resource_id: String },
    Search { query: String },
}

impl PlatformIntent {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformIntent::ListResources => "list resources",
            PlatformIntent::Fetch { .. } => "fetch",
            PlatformIntent::Search { .. } => "search",
        }
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            PlatformIntent::Fetch { resource_id } => Some(resource_id),
            _ => None,
        }
    }
}

/// Query bounds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueryParams {
    pub limit: usize,
    /// Only items updated after this instant, when the platform supports it
    pub since: Option<DateTime<Utc>>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            limit: 20,
            since: None,
        }
    }
}

/// One resource as returned by a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformItem {
    pub resource_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PlatformItem {
    pub fn new(resource_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            content: content.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Live access to one external platform for one user's connection
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether a direct (live) capability exists for this intent
    fn supports(&self, intent: &PlatformIntent) -> bool;

    async fn list_resources(&self, user_id: &str, params: QueryParams) -> Result<Vec<PlatformItem>>;

    async fn fetch(&self, user_id: &str, resource_id: &str) -> Result<PlatformItem>;

    async fn search(&self, user_id: &str, query: &str, params: QueryParams) -> Result<Vec<PlatformItem>>;

    /// Outbound action (post message, send email, update page)
    async fn send(
        &self,
        user_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Connected platforms, keyed by platform
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<Platform, Arc<dyn PlatformConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn PlatformConnector>) {
        self.connectors.insert(connector.platform(), connector);
    }

    pub fn with(mut self, connector: Arc<dyn PlatformConnector>) -> Self {
        self.register(connector);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformConnector>> {
        self.connectors.get(&platform).cloned()
    }

    /// Connected platforms in stable order
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.connectors.keys().copied().collect();
        platforms.sort();
        platforms
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
