// src/chat/orchestrator.rs
// Bounded multi-round loop: stream a model response, run the tools it asked
// for, feed the results back, repeat

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conversation::ConversationLog;
use super::events::ChatEvent;
use crate::config::{DeployMode, LimitsConfig};
use crate::error::{PilotError, Result};
use crate::llm::{
    ChatModel, ChatRequest, Completion, ContentBlock, CostAccountant, CostTracker, Effort,
    Message, ModelEvent, TokenUsage, ToolUse,
};
use crate::tools::{ChangeSet, FileChange, ToolCall, ToolExecutor, ToolResult, get_tools};

/// Stop reason of a call the upstream paused while server tools run
const PAUSE_TURN: &str = "pause_turn";

/// Inputs of one top-level turn, already normalised
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub system: Vec<ContentBlock>,
    pub messages: Vec<Message>,
    pub effort: Effort,
    pub thinking: bool,
    pub web_search: bool,
    /// Declare the repository tools
    pub repo_tools: bool,
    /// The user's request, used to title a pull request
    pub request_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A round finished without tool calls
    Completed,
    RoundLimit,
    /// Tools were requested but no repository backend is available
    NoRepository,
}

/// What a finished turn produced
#[derive(Debug, Clone)]
pub struct TurnSummary {
    pub rounds: u32,
    pub stop: StopReason,
    pub usage: TokenUsage,
    pub cost: f64,
    pub saved_percent: f64,
    pub file_changes: Vec<FileChange>,
    pub pr_url: Option<String>,
}

/// Drives one turn. Owns the conversation log and change set for its lifetime.
pub struct ConversationOrchestrator {
    model: Arc<dyn ChatModel>,
    executor: Option<ToolExecutor>,
    limits: LimitsConfig,
    deploy_mode: DeployMode,
    usage_sink: Option<Arc<Mutex<CostTracker>>>,
}

impl ConversationOrchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        executor: Option<ToolExecutor>,
        limits: LimitsConfig,
        deploy_mode: DeployMode,
    ) -> Self {
        Self {
            model,
            executor,
            limits,
            deploy_mode,
            usage_sink: None,
        }
    }

    /// Record the turn's usage here once the turn completes
    pub fn with_usage_sink(mut self, sink: Arc<Mutex<CostTracker>>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    /// Run the turn, forwarding every event to `events` as it happens.
    ///
    /// Failures other than cancellation are reported as one terminal `error`
    /// event before being returned. After cancellation nothing more is sent
    /// and no further network calls are made.
    pub async fn run(
        mut self,
        turn: TurnRequest,
        events: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnSummary> {
        let result = self.run_rounds(turn, &events, &cancel).await;
        if let Err(e) = &result {
            match e {
                PilotError::Cancelled => info!("Turn cancelled by client"),
                _ if cancel.is_cancelled() => info!(error = %e, "Turn cancelled by client"),
                _ => {
                    warn!(error = %e, "Turn failed");
                    let _ = events.send(ChatEvent::error(e.to_string())).await;
                }
            }
        }
        result
    }

    async fn run_rounds(
        &mut self,
        turn: TurnRequest,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnSummary> {
        let max_rounds = self.limits.max_rounds(turn.effort);
        let tools = if turn.repo_tools { get_tools() } else { Vec::new() };
        let mut log = ConversationLog::new(turn.messages)?;
        let mut changes = ChangeSet::new();
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        let mut rounds = 0;
        let mut stop = StopReason::Completed;

        info!(model = %turn.model, effort = %turn.effort, max_rounds, tools = tools.len(), "Starting turn");

        while rounds < max_rounds {
            rounds += 1;
            emit(
                events,
                cancel,
                ChatEvent::RoundStart {
                    message: format!("Round {rounds}/{max_rounds}"),
                },
            )
            .await?;

            let request = ChatRequest {
                model: turn.model.clone(),
                system: turn.system.clone(),
                messages: log.messages().to_vec(),
                tools: tools.clone(),
                web_search: turn.web_search,
                effort: turn.effort,
                thinking: turn.thinking,
            };
            let (completion, calls) = self.stream_round(request, events, cancel).await?;
            usage += completion.usage;
            cost += completion.cost;
            info!(
                round = rounds,
                tools = calls.len(),
                stop_reason = completion.stop_reason.as_deref().unwrap_or("none"),
                "Round streamed"
            );

            let paused = completion.stop_reason.as_deref() == Some(PAUSE_TURN);
            if calls.is_empty() && !paused {
                break;
            }

            if calls.is_empty() {
                debug!(round = rounds, "Upstream paused the turn, resuming");
                log.append_paused(completion.content)?;
                if rounds == max_rounds {
                    stop = round_limit(max_rounds, turn.effort, events, cancel).await?;
                }
                continue;
            }

            let Some(executor) = self.executor.as_mut() else {
                warn!(tools = calls.len(), "Tool calls requested without a repository backend");
                emit(
                    events,
                    cancel,
                    ChatEvent::text(format!(
                        "\n\nI can't run repository tools here: {}. Connect a repository and provide a GitHub token, then ask again.",
                        PilotError::NoRepository
                    )),
                )
                .await?;
                stop = StopReason::NoRepository;
                break;
            };

            log.append_assistant(completion.content, &calls)?;
            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let label = ToolCall::parse(&call.name, &call.input)
                    .map(|c| c.describe())
                    .unwrap_or_else(|_| format!("Running {}", call.name));
                emit(events, cancel, ChatEvent::ToolStart { message: label }).await?;

                let output = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                    output = executor.execute(call) => output,
                };
                if let Some(change) = output.change.clone() {
                    changes.record(change);
                }

                emit(
                    events,
                    cancel,
                    ChatEvent::ToolResult {
                        tool_use_id: call.id.clone(),
                        name: call.name.clone(),
                        result: output.content.clone(),
                    },
                )
                .await?;
                results.push(ToolResult {
                    tool_use_id: call.id.clone(),
                    name: call.name.clone(),
                    content: output.content,
                    truncated: output.truncated,
                    is_error: output.is_error,
                });
            }
            log.append_tool_results(&results)?;

            if rounds == max_rounds {
                stop = round_limit(max_rounds, turn.effort, events, cancel).await?;
            }
        }

        let pr_url = match self.deploy_mode {
            DeployMode::Safe if !changes.is_empty() => {
                self.propose_changes(&changes, &turn.request_text, events, cancel)
                    .await?
            }
            _ => None,
        };

        let saved_percent = CostAccountant::for_model(&turn.model).saved_percent(&usage);
        if let Some(sink) = &self.usage_sink {
            sink.lock().await.record(usage, cost);
        }

        let file_changes = changes.into_vec();
        info!(
            rounds,
            cost,
            saved_percent,
            changes = file_changes.len(),
            "Turn complete"
        );
        emit(
            events,
            cancel,
            ChatEvent::Done {
                cost,
                saved_percent,
                usage,
                file_changes: (!file_changes.is_empty()).then(|| file_changes.clone()),
                pr_url: pr_url.clone(),
            },
        )
        .await?;

        Ok(TurnSummary {
            rounds,
            stop,
            usage,
            cost,
            saved_percent,
            file_changes,
            pr_url,
        })
    }

    /// One inference call: forward deltas as they arrive and collect the
    /// completed tool calls in emission order
    async fn stream_round(
        &self,
        request: ChatRequest,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<(Completion, Vec<ToolUse>)> {
        let mut rx = self.model.stream(request, cancel.child_token());
        let mut calls = Vec::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                event = rx.recv() => event,
            };
            match event {
                Some(ModelEvent::Text(content)) => {
                    emit(events, cancel, ChatEvent::Text { content }).await?;
                }
                Some(ModelEvent::Thinking(content)) => {
                    emit(events, cancel, ChatEvent::Thinking { content }).await?;
                }
                Some(ModelEvent::ToolUse(call)) => {
                    debug!(id = %call.id, name = %call.name, "Tool call received");
                    emit(
                        events,
                        cancel,
                        ChatEvent::ToolUse {
                            tool_call: call.clone(),
                        },
                    )
                    .await?;
                    calls.push(call);
                }
                Some(ModelEvent::Done(completion)) => return Ok((completion, calls)),
                Some(ModelEvent::Error(e)) => return Err(e),
                None => {
                    return Err(PilotError::Stream(
                        "model stream ended without a completion".into(),
                    ));
                }
            }
        }
    }

    /// Open the pull request for safe mode. Repository failures here are
    /// reported as text and do not fail the turn.
    async fn propose_changes(
        &mut self,
        changes: &ChangeSet,
        request: &str,
        events: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let Some(executor) = self.executor.as_mut() else {
            return Ok(None);
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PilotError::Cancelled),
            result = executor.open_pull_request(changes, request) => result,
        };
        match result {
            Ok(Some(pr)) => {
                emit(
                    events,
                    cancel,
                    ChatEvent::text(format!("\n\nOpened pull request #{}: {}", pr.number, pr.url)),
                )
                .await?;
                Ok(Some(pr.url))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "Could not open pull request");
                emit(
                    events,
                    cancel,
                    ChatEvent::text(format!("\n\nCould not open a pull request: {e}")),
                )
                .await?;
                Ok(None)
            }
        }
    }
}

/// Tell the client the turn stopped at the round ceiling
async fn round_limit(
    max_rounds: u32,
    effort: Effort,
    events: &mpsc::Sender<ChatEvent>,
    cancel: &CancellationToken,
) -> Result<StopReason> {
    warn!(max_rounds, effort = %effort, "Round limit reached");
    emit(
        events,
        cancel,
        ChatEvent::text(format!(
            "\n\nStopped after {max_rounds} rounds, the limit for {effort} effort. Send another message to continue."
        )),
    )
    .await?;
    Ok(StopReason::RoundLimit)
}

/// Forward one event. A closed channel means the client went away.
async fn emit(
    events: &mpsc::Sender<ChatEvent>,
    cancel: &CancellationToken,
    event: ChatEvent,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(PilotError::Cancelled);
    }
    events.send(event).await.map_err(|_| {
        cancel.cancel();
        PilotError::Cancelled
    })
}
