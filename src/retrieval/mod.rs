//! Retrieval Layer
//!
//! Ranks stored memories against a query with a blended score:
//!
//! ```text
//! relevance = alpha * cosine(query, memory) + (1 - alpha) * importance
//! ```
//!
//! Scope resolution: user-wide memories are always visible, project memories
//! only to queries for the same project. Soft-deleted memories never appear.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Result, StewardError};
use crate::storage::queries;
use crate::storage::Storage;
use crate::types::*;

/// Score and order memories for one query embedding.
///
/// Sorted by non-increasing relevance; ties go to the more recently updated
/// memory, then the higher id.
pub fn rank(
    query_embedding: &[f32],
    memories: Vec<Memory>,
    alpha: f32,
    max_results: usize,
) -> Vec<ScoredMemory> {
    let mut scored: Vec<ScoredMemory> = memories
        .into_iter()
        .filter(|m| m.active)
        .map(|memory| {
            let similarity = cosine_similarity(query_embedding, &memory.embedding);
            let relevance = alpha * similarity + (1.0 - alpha) * memory.importance;
            ScoredMemory {
                memory,
                similarity,
                relevance,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
            .then_with(|| b.memory.id.cmp(&a.memory.id))
    });
    scored.truncate(max_results);
    scored
}

/// Outcome of storing a memory
#[derive(Debug, Clone)]
pub enum RememberOutcome {
    Created(Memory),
    /// An equivalent memory already existed in the same scope
    Merged(Memory),
}

impl RememberOutcome {
    pub fn memory(&self) -> &Memory {
        match self {
            RememberOutcome::Created(m) | RememberOutcome::Merged(m) => m,
        }
    }

    pub fn into_memory(self) -> Memory {
        match self {
            RememberOutcome::Created(m) | RememberOutcome::Merged(m) => m,
        }
    }
}

/// Memory retrieval and lifecycle
#[derive(Clone)]
pub struct Retriever {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(storage: Storage, embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self {
            storage,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Ranked memories for `query` under `scope`.
    ///
    /// Returns `EmptyScope` when nothing at all is visible, which callers
    /// should treat as "nothing known yet" rather than a failure.
    pub async fn retrieve(
        &self,
        user_id: &str,
        scope: &MemoryScope,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<ScoredMemory>> {
        let memories = self
            .storage
            .with_connection(|conn| queries::visible_memories(conn, user_id, scope))?;
        if memories.is_empty() {
            return Err(StewardError::EmptyScope);
        }

        let query_embedding = self.embedder.embed(query).await?;
        let ranked = rank(&query_embedding, memories, self.config.alpha, max_results);

        debug!(
            user_id,
            project = scope.project_id(),
            returned = ranked.len(),
            "retrieved memories"
        );

        // Advisory bookkeeping; never fails the read
        let ids: Vec<MemoryId> = ranked.iter().map(|s| s.memory.id).collect();
        if let Err(e) = self
            .storage
            .with_connection(|conn| queries::touch_references(conn, &ids, Utc::now()))
        {
            warn!(user_id, error = %e, "failed to record memory references");
        }

        Ok(ranked)
    }

    /// Store a memory, merging into an equivalent one in the same scope.
    ///
    /// Equivalent means identical normalized content, or cosine similarity at
    /// or above `match_threshold`. The surviving memory keeps the higher
    /// importance.
    pub async fn remember(&self, input: CreateMemoryInput) -> Result<RememberOutcome> {
        if input.content.trim().is_empty() {
            return Err(StewardError::InvalidInput(
                "memory content cannot be empty".to_string(),
            ));
        }
        let embedding = self.embedder.embed(&input.content).await?;
        let hash = queries::compute_content_hash(&input.content);
        let threshold = self.config.match_threshold;

        self.storage.with_transaction(|conn| {
            let existing = match queries::find_by_content_hash(conn, &input.user_id, &input.scope, &hash)? {
                Some(found) => Some(found),
                None => queries::visible_memories(conn, &input.user_id, &input.scope)?
                    .into_iter()
                    .filter(|m| m.scope == input.scope)
                    .map(|m| (cosine_similarity(&embedding, &m.embedding), m))
                    .filter(|(similarity, _)| *similarity >= threshold)
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
                    .map(|(_, m)| m),
            };

            match existing {
                Some(memory) => {
                    let incoming = input.importance.unwrap_or(0.5);
                    if incoming > memory.importance {
                        let merged = queries::update_memory(
                            conn,
                            &input.user_id,
                            memory.id,
                            &UpdateMemoryInput {
                                importance: Some(incoming),
                                tags: None,
                            },
                        )?;
                        return Ok(RememberOutcome::Merged(merged));
                    }
                    Ok(RememberOutcome::Merged(memory))
                }
                None => {
                    let created = queries::create_memory(conn, &input, &embedding)?;
                    Ok(RememberOutcome::Created(created))
                }
            }
        })
    }

    pub fn update(&self, user_id: &str, id: MemoryId, input: &UpdateMemoryInput) -> Result<Memory> {
        self.storage
            .with_connection(|conn| queries::update_memory(conn, user_id, id, input))
    }

    /// Soft delete
    pub fn forget(&self, user_id: &str, id: MemoryId) -> Result<()> {
        self.storage
            .with_connection(|conn| queries::soft_delete_memory(conn, user_id, id))
    }

    pub fn list(&self, user_id: &str, scope: &MemoryScope, limit: usize) -> Result<Vec<Memory>> {
        self.storage
            .with_connection(|conn| queries::list_memories(conn, user_id, scope, false, limit))
    }

    /// Maintenance pass: decay importance of memories idle for a half-life
    pub fn decay(&self, user_id: &str, half_life_days: f64, floor: f32) -> Result<usize> {
        let changed = self.storage.with_transaction(|conn| {
            queries::decay_importance(conn, user_id, half_life_days, floor, Utc::now())
        })?;
        if changed > 0 {
            debug!(user_id, changed, "decayed memory importance");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TfIdfEmbedder;
    use chrono::{Duration, TimeZone};

    fn retriever() -> Retriever {
        Retriever::new(
            Storage::open_in_memory().unwrap(),
            Arc::new(TfIdfEmbedder::new(256)),
            RetrievalConfig::default(),
        )
    }

    fn memory(id: MemoryId, embedding: Vec<f32>, importance: f32) -> Memory {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Memory {
            id,
            user_id: "u1".to_string(),
            scope: MemoryScope::User,
            content: format!("memory {}", id),
            embedding,
            tags: vec![],
            entities: Default::default(),
            importance,
            provenance: Provenance::default(),
            active: true,
            created_at: at,
            updated_at: at,
            last_referenced_at: None,
        }
    }

    #[test]
    fn test_blended_ranking_is_exact() {
        let query = vec![1.0, 0.0];
        // high importance, low similarity: 0.7 * 0.1 + 0.3 * 0.9 = 0.34
        let important = memory(1, vec![0.1, (1.0f32 - 0.01).sqrt()], 0.9);
        // low importance, high similarity: 0.7 * 0.95 + 0.3 * 0.1 = 0.695
        let similar = memory(2, vec![0.95, (1.0f32 - 0.9025).sqrt()], 0.1);

        let ranked = rank(&query, vec![important, similar], 0.7, 10);
        assert_eq!(ranked[0].memory.id, 2);
        assert!((ranked[0].relevance - 0.695).abs() < 1e-4);
        assert!((ranked[1].relevance - 0.34).abs() < 1e-4);
    }

    #[test]
    fn test_ties_prefer_recent_updates() {
        let mut older = memory(1, vec![1.0, 0.0], 0.5);
        older.updated_at = older.updated_at - Duration::days(1);
        let newer = memory(2, vec![1.0, 0.0], 0.5);

        let ranked = rank(&[1.0, 0.0], vec![older, newer], 0.7, 10);
        assert_eq!(ranked[0].memory.id, 2);
    }

    #[test]
    fn test_rank_truncates_and_skips_inactive() {
        let mut deleted = memory(1, vec![1.0, 0.0], 1.0);
        deleted.active = false;
        let a = memory(2, vec![1.0, 0.0], 0.2);
        let b = memory(3, vec![0.0, 1.0], 0.2);

        let ranked = rank(&[1.0, 0.0], vec![deleted, a, b], 0.7, 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].memory.id, 2);
    }

    #[tokio::test]
    async fn test_empty_scope() {
        let retriever = retriever();
        let result = retriever.retrieve("u1", &MemoryScope::User, "anything", 5).await;
        assert!(matches!(result, Err(StewardError::EmptyScope)));
    }

    #[tokio::test]
    async fn test_project_memories_hidden_from_user_scope() {
        let retriever = retriever();
        retriever
            .remember(CreateMemoryInput {
                user_id: "u1".to_string(),
                scope: MemoryScope::project("apollo"),
                content: "Apollo launch moved to June".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = retriever.retrieve("u1", &MemoryScope::User, "launch", 5).await;
        assert!(matches!(result, Err(StewardError::EmptyScope)));

        let in_project = retriever
            .retrieve("u1", &MemoryScope::project("apollo"), "launch", 5)
            .await
            .unwrap();
        assert_eq!(in_project.len(), 1);
    }

    #[tokio::test]
    async fn test_retrieve_records_references() {
        let retriever = retriever();
        let created = retriever
            .remember(CreateMemoryInput {
                user_id: "u1".to_string(),
                content: "Prefers status reports on Monday mornings".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_memory();
        assert!(created.last_referenced_at.is_none());

        retriever
            .retrieve("u1", &MemoryScope::User, "status reports", 5)
            .await
            .unwrap();
        let listed = retriever.list("u1", &MemoryScope::User, 10).unwrap();
        assert!(listed[0].last_referenced_at.is_some());
    }

    #[tokio::test]
    async fn test_remember_merges_duplicates() {
        let retriever = retriever();
        let first = retriever
            .remember(CreateMemoryInput {
                user_id: "u1".to_string(),
                content: "Dana owns the vendor contract renewal".to_string(),
                importance: Some(0.4),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(first, RememberOutcome::Created(_)));

        let second = retriever
            .remember(CreateMemoryInput {
                user_id: "u1".to_string(),
                content: "dana owns the vendor   contract renewal".to_string(),
                importance: Some(0.8),
                ..Default::default()
            })
            .await
            .unwrap();
        match second {
            RememberOutcome::Merged(m) => {
                assert_eq!(m.id, first.memory().id);
                assert!((m.importance - 0.8).abs() < 1e-6);
            }
            other => panic!("expected merge, got {:?}", other),
        }

        // Same content in a different scope is a separate memory
        let scoped = retriever
            .remember(CreateMemoryInput {
                user_id: "u1".to_string(),
                scope: MemoryScope::project("vendors"),
                content: "Dana owns the vendor contract renewal".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(scoped, RememberOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_forget_excludes_from_retrieval() {
        let retriever = retriever();
        let created = retriever
            .remember(CreateMemoryInput {
                user_id: "u1".to_string(),
                content: "Old office address".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_memory();
        retriever.forget("u1", created.id).unwrap();

        let result = retriever.retrieve("u1", &MemoryScope::User, "office", 5).await;
        assert!(matches!(result, Err(StewardError::EmptyScope)));
    }
}
