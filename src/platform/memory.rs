//! In-memory connector
//!
//! Serves a fixed item set. Used for offline runs and tests: live
//! capabilities can be switched off per intent, and failures can be queued
//! to simulate rate limits or revoked credentials.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{PlatformConnector, PlatformIntent, PlatformItem, QueryParams};
use crate::error::{Result, StewardError};
use crate::types::Platform;

pub struct InMemoryConnector {
    platform: Platform,
    items: Mutex<BTreeMap<String, PlatformItem>>,
    live_disabled: Mutex<HashSet<&'static str>>,
    failures: Mutex<VecDeque<StewardError>>,
    sent: Mutex<Vec<(String, serde_json::Value)>>,
    calls: AtomicUsize,
}

impl InMemoryConnector {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            items: Mutex::new(BTreeMap::new()),
            live_disabled: Mutex::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, item: PlatformItem) {
        self.items.lock().insert(item.resource_id.clone(), item);
    }

    pub fn with_items(self, items: impl IntoIterator<Item = PlatformItem>) -> Self {
        for item in items {
            self.insert(item);
        }
        self
    }

    /// Report no live capability for the given intent kind ("fetch", "search", ...)
    pub fn disable_live(&self, intent_name: &'static str) {
        self.live_disabled.lock().insert(intent_name);
    }

    /// Report no live capability for anything
    pub fn disable_all_live(&self) {
        let mut disabled = self.live_disabled.lock();
        for name in ["list resources", "fetch", "search"] {
            disabled.insert(name);
        }
    }

    /// The next live call fails with `error`
    pub fn fail_next(&self, error: StewardError) {
        self.failures.lock().push_back(error);
    }

    /// Number of read calls that reached the connector
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
        self.sent.lock().clone()
    }

    fn begin_call(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformConnector for InMemoryConnector {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn supports(&self, intent: &PlatformIntent) -> bool {
        !self.live_disabled.lock().contains(intent.name())
    }

    async fn list_resources(&self, _user_id: &str, params: QueryParams) -> Result<Vec<PlatformItem>> {
        self.begin_call()?;
        Ok(self
            .items
            .lock()
            .values()
            .take(params.limit)
            .cloned()
            .collect())
    }

    async fn fetch(&self, _user_id: &str, resource_id: &str) -> Result<PlatformItem> {
        self.begin_call()?;
        self.items
            .lock()
            .get(resource_id)
            .cloned()
            .ok_or_else(|| StewardError::NotFound(format!("{} resource {}", self.platform, resource_id)))
    }

    async fn search(&self, _user_id: &str, query: &str, params: QueryParams) -> Result<Vec<PlatformItem>> {
        self.begin_call()?;
        let needle = query.to_lowercase();
        Ok(self
            .items
            .lock()
            .values()
            .filter(|item| item.content.to_lowercase().contains(&needle))
            .take(params.limit)
            .cloned()
            .collect())
    }

    async fn send(
        &self,
        _user_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.sent.lock().push((action.to_string(), payload));
        Ok(serde_json::json!({ "ok": true }))
    }
}
