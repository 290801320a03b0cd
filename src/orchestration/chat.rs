//! Conversational entry point

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::agent::prompt::{chat_system_prompt, resolve_timezone};
use crate::agent::{AgentEvent, AgentRunner, ChatMessage, RunOutcome};
use crate::error::{Result, StewardError};
use crate::primitives::PrimitiveContext;
use crate::retrieval::Retriever;
use crate::storage::{deliverables, preferences, Storage};
use crate::types::*;

/// One user's conversation. History only grows with completed turns.
pub struct ChatSession {
    storage: Storage,
    retriever: Retriever,
    runner: AgentRunner,
    ctx: PrimitiveContext,
    memory_limit: usize,
    history: Vec<ChatMessage>,
}

impl ChatSession {
    pub(crate) fn new(
        storage: Storage,
        retriever: Retriever,
        runner: AgentRunner,
        user_id: UserId,
        scope: MemoryScope,
        memory_limit: usize,
    ) -> Self {
        Self {
            storage,
            retriever,
            runner,
            ctx: PrimitiveContext::new(user_id, scope),
            memory_limit,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Run one turn, streaming progress to `events`.
    ///
    /// On failure the turn is not added to the history and a `Failed` event
    /// carrying a specific explanation has already been emitted.
    pub async fn send(
        &mut self,
        message: &str,
        events: mpsc::Sender<AgentEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        let system_prompt = match self.system_prompt(message).await {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(user_id = %self.ctx.user_id, error = %e, "could not prepare chat turn");
                let _ = events
                    .send(AgentEvent::Failed {
                        message: e.user_message(),
                    })
                    .await;
                return Err(e);
            }
        };

        let mut seed = self.history.clone();
        seed.push(ChatMessage::user(message));

        let outcome = self
            .runner
            .run_streaming(
                &self.ctx,
                &system_prompt,
                seed,
                self.runner.config().chat_round_ceiling,
                events,
                cancel,
            )
            .await?;

        self.history.push(ChatMessage::user(message));
        self.history.push(ChatMessage::assistant(outcome.text.clone()));
        Ok(outcome)
    }

    async fn system_prompt(&self, message: &str) -> Result<String> {
        let user_id = &self.ctx.user_id;
        let (timezone, mut current) = self.storage.with_connection(|conn| {
            Ok((
                preferences::get_preference(conn, user_id, preferences::TIMEZONE)?,
                deliverables::list_deliverables(conn, user_id, None)?,
            ))
        })?;
        current.retain(|d| d.state != DeliverableState::Archived);

        let memories = match self
            .retriever
            .retrieve(user_id, &self.ctx.scope, message, self.memory_limit)
            .await
        {
            Ok(memories) => memories,
            Err(StewardError::EmptyScope) => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(chat_system_prompt(
            Utc::now(),
            resolve_timezone(timezone.as_deref()),
            &memories,
            &current,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ModelProvider, ModelRequest, ModelResponse};
    use crate::embedding::{Embedder, TfIdfEmbedder};
    use crate::orchestration::{DeliveryRegistry, Pipeline};
    use crate::platform::ConnectorRegistry;
    use crate::primitives::PrimitiveRegistry;
    use crate::reconcile::Reconciler;
    use crate::storage::queries;
    use crate::sync::SyncQueue;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Echoes the number of messages and remembers the last system prompt
    struct Echo {
        last_prompt: Mutex<String>,
    }

    #[async_trait]
    impl ModelProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
            *self.last_prompt.lock() = request.system_prompt.clone();
            Ok(ModelResponse::text(format!("seen {} messages", request.messages.len())))
        }
    }

    /// Fails every embedding call
    struct Unreachable;

    #[async_trait]
    impl Embedder for Unreachable {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(StewardError::Embedding("connection refused".to_string()))
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn model_name(&self) -> &str {
            "unreachable"
        }
    }

    fn session(storage: Storage, embedder: Arc<dyn Embedder>) -> (ChatSession, Retriever, Arc<Echo>) {
        let config = StewardConfig::default();
        let retriever = Retriever::new(storage.clone(), embedder, config.retrieval.clone());
        let (queue, _receiver) = SyncQueue::new(storage.clone(), 8);
        let reconciler = Reconciler::new(
            storage.clone(),
            ConnectorRegistry::new(),
            Arc::new(queue),
            config.reconcile.clone(),
        );
        let model = Arc::new(Echo {
            last_prompt: Mutex::new(String::new()),
        });
        let runner = AgentRunner::new(
            model.clone(),
            PrimitiveRegistry::new(storage.clone(), retriever.clone(), reconciler),
            config.agent.clone(),
        );
        let pipeline = Pipeline::new(storage, retriever.clone(), runner, DeliveryRegistry::new(), &config);
        (pipeline.chat("u1", MemoryScope::User), retriever, model)
    }

    #[tokio::test]
    async fn test_history_grows_per_turn_and_prompt_has_memories() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| preferences::set_preference(conn, "u1", preferences::TIMEZONE, "Asia/Tokyo"))
            .unwrap();
        let (mut session, retriever, model) = session(storage, Arc::new(TfIdfEmbedder::new(384)));
        retriever
            .remember(CreateMemoryInput {
                user_id: "u1".to_string(),
                content: "The Q3 launch owner is Priya".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let first = session
            .send("who owns the Q3 launch?", tx.clone(), cancel_rx.clone())
            .await
            .unwrap();
        assert_eq!(first.text, "seen 1 messages");
        let prompt = model.last_prompt.lock().clone();
        assert!(prompt.contains("The Q3 launch owner is Priya"));
        assert!(prompt.contains("Asia/Tokyo"));

        let second = session.send("thanks", tx, cancel_rx).await.unwrap();
        assert_eq!(second.text, "seen 3 messages");
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_scope_is_not_a_failure() {
        let (mut session, _retriever, _model) =
            session(Storage::open_in_memory().unwrap(), Arc::new(Unreachable));

        let (tx, _rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = session.send("hello", tx, cancel_rx).await.unwrap();
        assert_eq!(outcome.text, "seen 1 messages");
    }

    #[tokio::test]
    async fn test_retrieval_failure_fails_turn_with_event() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                queries::create_memory(
                    conn,
                    &CreateMemoryInput {
                        user_id: "u1".to_string(),
                        content: "Standup moved to 10:00".to_string(),
                        ..Default::default()
                    },
                    &[0.5; 4],
                )
            })
            .unwrap();
        let (mut session, _retriever, model) = session(storage, Arc::new(Unreachable));

        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let result = session.send("when is standup?", tx, cancel_rx).await;

        assert!(matches!(result, Err(StewardError::Embedding(_))));
        assert!(matches!(rx.recv().await, Some(AgentEvent::Failed { .. })));
        assert!(session.history().is_empty());
        assert!(model.last_prompt.lock().is_empty());
    }
}
