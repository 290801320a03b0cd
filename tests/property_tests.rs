//! Property-based tests for steward
//!
//! These tests verify invariants that must hold for all inputs:
//! - Ranking is ordered by the blended score and bounded
//! - Scope resolution never leaks another project's memories
//! - Soft-deleted memories are never retrieved
//!
//! Run with: cargo test --test property_tests

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;

use steward::embedding::TfIdfEmbedder;
use steward::retrieval::{rank, Retriever};
use steward::storage::{queries, Storage};
use steward::types::*;

fn memory(id: i64, embedding: Vec<f32>, importance: f32, active: bool) -> Memory {
    let now = Utc::now();
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
        active,
        created_at: now,
        updated_at: now,
        last_referenced_at: None,
    }
}

// ============================================================================
// RANKING TESTS
// ============================================================================

mod ranking_tests {
    use super::*;

    fn memories_strategy() -> impl Strategy<Value = Vec<(Vec<f32>, f32, bool)>> {
        prop::collection::vec(
            (
                prop::collection::vec(-1.0f32..1.0, 4),
                0.0f32..=1.0,
                prop::bool::weighted(0.8),
            ),
            0..30,
        )
    }

    proptest! {
        /// Invariant: results are sorted by non-increasing relevance
        #[test]
        fn sorted_by_relevance(
            query in prop::collection::vec(-1.0f32..1.0, 4),
            items in memories_strategy(),
            alpha in 0.0f32..=1.0,
        ) {
            let memories = items
                .into_iter()
                .enumerate()
                .map(|(i, (e, imp, active))| memory(i as i64 + 1, e, imp, active))
                .collect();
            let ranked = rank(&query, memories, alpha, 100);
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].relevance >= pair[1].relevance);
            }
        }

        /// Invariant: relevance is exactly alpha * similarity + (1 - alpha) * importance
        #[test]
        fn relevance_is_blended(
            query in prop::collection::vec(-1.0f32..1.0, 4),
            items in memories_strategy(),
            alpha in 0.0f32..=1.0,
        ) {
            let memories = items
                .into_iter()
                .enumerate()
                .map(|(i, (e, imp, active))| memory(i as i64 + 1, e, imp, active))
                .collect();
            for scored in rank(&query, memories, alpha, 100) {
                let expected = alpha * scored.similarity + (1.0 - alpha) * scored.memory.importance;
                prop_assert!((scored.relevance - expected).abs() < 1e-5);
            }
        }

        /// Invariant: inactive memories never rank, and the limit is respected
        #[test]
        fn inactive_excluded_and_bounded(
            query in prop::collection::vec(-1.0f32..1.0, 4),
            items in memories_strategy(),
            max_results in 0usize..10,
        ) {
            let memories: Vec<Memory> = items
                .into_iter()
                .enumerate()
                .map(|(i, (e, imp, active))| memory(i as i64 + 1, e, imp, active))
                .collect();
            let active = memories.iter().filter(|m| m.active).count();
            let ranked = rank(&query, memories, 0.7, max_results);
            prop_assert!(ranked.iter().all(|s| s.memory.active));
            prop_assert_eq!(ranked.len(), active.min(max_results));
        }
    }
}

// ============================================================================
// SCOPE TESTS
// ============================================================================

mod scope_tests {
    use super::*;

    fn scope_strategy() -> impl Strategy<Value = MemoryScope> {
        prop_oneof![
            Just(MemoryScope::User),
            Just(MemoryScope::project("alpha")),
            Just(MemoryScope::project("beta")),
        ]
    }

    proptest! {
        /// Invariant: a memory is visible iff it is user-wide or in the queried project
        #[test]
        fn admits_matches_resolution(query in scope_strategy(), stored in scope_strategy()) {
            let expected = match (&query, &stored) {
                (_, MemoryScope::User) => true,
                (MemoryScope::Project { project_id: a }, MemoryScope::Project { project_id: b }) => a == b,
                (MemoryScope::User, MemoryScope::Project { .. }) => false,
            };
            prop_assert_eq!(query.admits(&stored), expected);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Invariant: retrieval returns exactly the visible, active memories of the scope
        #[test]
        fn retrieve_respects_scope_and_deletes(
            stored in prop::collection::vec((scope_strategy(), prop::bool::weighted(0.75)), 1..12),
            query_scope in scope_strategy(),
        ) {
            let storage = Storage::open_in_memory().unwrap();
            let embedder = Arc::new(TfIdfEmbedder::new(64));
            let retriever = Retriever::new(storage.clone(), embedder, RetrievalConfig::default());

            let mut expected = HashSet::new();
            for (i, (scope, keep)) in stored.iter().enumerate() {
                let input = CreateMemoryInput {
                    user_id: "u1".to_string(),
                    scope: scope.clone(),
                    content: format!("fact number {} about topic {}", i, i * 7),
                    ..Default::default()
                };
                let created = storage
                    .with_connection(|conn| queries::create_memory(conn, &input, &vec![0.1; 64]))
                    .unwrap();
                if *keep {
                    if query_scope.admits(scope) {
                        expected.insert(created.id);
                    }
                } else {
                    retriever.forget("u1", created.id).unwrap();
                }
            }

            let result = tokio_test::block_on(retriever.retrieve("u1", &query_scope, "topic", 100));
            if expected.is_empty() {
                prop_assert!(matches!(result, Err(steward::StewardError::EmptyScope)));
            } else {
                let got: HashSet<i64> = result.unwrap().iter().map(|s| s.memory.id).collect();
                prop_assert_eq!(got, expected);
            }
        }
    }
}
