//! The round loop
//!
//! `Awaiting-Model -> Executing-Tools -> Awaiting-Model ... -> Done`, bounded
//! by a round ceiling. When the ceiling is reached the model gets one last
//! call with no tools and whatever it writes is the answer, flagged
//! `ceiling_truncated`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{AgentEvent, ChatMessage, ModelProvider, ModelRequest, ModelResponse};
use crate::error::{Result, StewardError};
use crate::primitives::{PrimitiveContext, PrimitiveRegistry};
use crate::types::{AgentConfig, ExecutionMode, ToolInvocation};

const FORCED_COMPLETION_NOTE: &str = "You have used every tool round available for this task. \
No more tools can be called. Write your final answer now from what you have gathered, \
and say plainly what you could not verify.";

/// Result of one run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub text: String,
    /// Model rounds that requested tools or answered, excluding forced completion
    pub rounds: u32,
    pub ceiling_truncated: bool,
    pub invocations: Vec<ToolInvocation>,
}

/// Observer side of a streaming chat run
struct Observer {
    events: mpsc::Sender<AgentEvent>,
    cancel: watch::Receiver<bool>,
}

impl Observer {
    async fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event).await;
    }

    /// Resolves when the caller cancels or stops listening
    async fn cancelled(&mut self) {
        tokio::select! {
            dropped = async { self.cancel.wait_for(|c| *c).await.is_err() } => {
                if dropped {
                    // Cancel handle dropped; only a closed event stream cancels now
                    self.events.closed().await;
                }
            }
            _ = self.events.closed() => {}
        }
    }
}

#[derive(Clone)]
pub struct AgentRunner {
    provider: Arc<dyn ModelProvider>,
    primitives: PrimitiveRegistry,
    config: AgentConfig,
}

impl AgentRunner {
    pub fn new(provider: Arc<dyn ModelProvider>, primitives: PrimitiveRegistry, config: AgentConfig) -> Self {
        Self {
            provider,
            primitives,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run to a final answer.
    ///
    /// Headless runs are additionally bounded by `headless_timeout_secs` as a
    /// whole. Model call failures and timeouts are returned as errors; tool
    /// failures never are.
    pub async fn run(
        &self,
        mode: ExecutionMode,
        ctx: &PrimitiveContext,
        system_prompt: &str,
        seed_messages: Vec<ChatMessage>,
        round_ceiling: u32,
    ) -> Result<RunOutcome> {
        let drive = self.drive(mode, ctx, system_prompt, seed_messages, round_ceiling, None);

        match mode {
            ExecutionMode::Headless => {
                let limit = Duration::from_secs(self.config.headless_timeout_secs);
                timeout(limit, drive)
                    .await
                    .map_err(|_| StewardError::ModelTimeout(self.config.headless_timeout_secs))?
            }
            ExecutionMode::Chat => drive.await,
        }
    }

    /// Chat-mode run that reports progress on `events`.
    ///
    /// Cancelled when `cancel` flips to `true` or the event receiver is
    /// dropped; tool calls already completed keep their effects.
    pub async fn run_streaming(
        &self,
        ctx: &PrimitiveContext,
        system_prompt: &str,
        seed_messages: Vec<ChatMessage>,
        round_ceiling: u32,
        events: mpsc::Sender<AgentEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        let mut observer = Observer { events, cancel };
        let result = self
            .drive(
                ExecutionMode::Chat,
                ctx,
                system_prompt,
                seed_messages,
                round_ceiling,
                Some(&mut observer),
            )
            .await;

        match &result {
            Ok(outcome) => {
                observer
                    .emit(AgentEvent::Done {
                        text: outcome.text.clone(),
                        rounds: outcome.rounds,
                        ceiling_truncated: outcome.ceiling_truncated,
                    })
                    .await
            }
            Err(StewardError::Cancelled) => {
                info!(user_id = %ctx.user_id, "chat run cancelled");
            }
            Err(e) => {
                observer
                    .emit(AgentEvent::Failed {
                        message: e.user_message(),
                    })
                    .await
            }
        }
        result
    }

    async fn drive(
        &self,
        mode: ExecutionMode,
        ctx: &PrimitiveContext,
        system_prompt: &str,
        seed_messages: Vec<ChatMessage>,
        round_ceiling: u32,
        mut observer: Option<&mut Observer>,
    ) -> Result<RunOutcome> {
        let tools = self.primitives.tools_for_mode(mode);
        let ceiling = round_ceiling.max(1);
        let mut messages = seed_messages;
        let mut invocations = Vec::new();

        for round in 1..=ceiling {
            let request = ModelRequest {
                system_prompt: system_prompt.to_string(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: self.config.max_tokens,
            };
            let response = self.call_model(&request, observer.as_deref_mut()).await?;
            debug!(
                user_id = %ctx.user_id,
                %mode,
                round,
                tool_calls = response.tool_calls.len(),
                "model round"
            );

            if response.is_final() {
                return Ok(RunOutcome {
                    text: response.text,
                    rounds: round,
                    ceiling_truncated: false,
                    invocations,
                });
            }

            messages.push(ChatMessage::assistant_with_tools(
                response.text,
                response.tool_calls.clone(),
            ));

            for call in response.tool_calls {
                let output = match observer.as_deref_mut() {
                    None => {
                        self.primitives
                            .execute(mode, ctx, &call.name, &call.arguments)
                            .await
                    }
                    Some(obs) => {
                        obs.emit(AgentEvent::ToolStarted {
                            round,
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        })
                        .await;
                        let output = tokio::select! {
                            biased;
                            _ = obs.cancelled() => return Err(StewardError::Cancelled),
                            output = self.primitives.execute(mode, ctx, &call.name, &call.arguments) => output,
                        };
                        obs.emit(AgentEvent::ToolFinished {
                            round,
                            name: call.name.clone(),
                            is_error: output.is_error,
                        })
                        .await;
                        output
                    }
                };

                messages.push(ChatMessage::tool_result(&call.id, &output.content));
                invocations.push(ToolInvocation {
                    round,
                    primitive: call.name,
                    arguments: call.arguments,
                    output: output.content,
                    is_error: output.is_error,
                });
            }
        }

        warn!(
            user_id = %ctx.user_id,
            %mode,
            rounds = ceiling,
            ceiling_truncated = true,
            "round ceiling reached, forcing completion"
        );
        let request = ModelRequest {
            system_prompt: format!("{}\n\n{}", system_prompt, FORCED_COMPLETION_NOTE),
            messages,
            tools: Vec::new(),
            max_tokens: self.config.max_tokens,
        };
        let response = self.call_model(&request, observer).await?;

        Ok(RunOutcome {
            text: response.text,
            rounds: ceiling,
            ceiling_truncated: true,
            invocations,
        })
    }

    async fn call_model(
        &self,
        request: &ModelRequest,
        observer: Option<&mut Observer>,
    ) -> Result<ModelResponse> {
        let secs = self.config.model_timeout_secs;
        let limit = Duration::from_secs(secs);

        let Some(obs) = observer else {
            return timeout(limit, self.provider.complete(request))
                .await
                .map_err(|_| StewardError::ModelTimeout(secs))?;
        };

        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
        let call = timeout(limit, self.provider.complete_streaming(request, &delta_tx));
        tokio::pin!(call);

        let result = loop {
            tokio::select! {
                biased;
                _ = obs.cancelled() => return Err(StewardError::Cancelled),
                result = &mut call => break result,
                Some(text) = delta_rx.recv() => obs.emit(AgentEvent::TextDelta { text }).await,
            }
        };
        while let Ok(text) = delta_rx.try_recv() {
            obs.emit(AgentEvent::TextDelta { text }).await;
        }

        result.map_err(|_| StewardError::ModelTimeout(secs))?
    }
}
