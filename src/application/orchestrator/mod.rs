#[cfg(test)]
mod tests;

use crate::application::catalog::ToolCatalog;
use crate::application::discovery::{DiscoveryError, DiscoveryRouter};
use crate::application::dispatch::CapabilityDispatcher;
use crate::application::loading::LoadingTracker;
use crate::application::usage::UsageLedger;
use crate::model::{
    ExchangeReply, ExchangeRequest, ModelProvider, ToolDefinition, discovery_tool_definition,
};
use crate::types::{
    Block, BlockRole, ConversationTurn, DiscoveryResult, SearchStrategy, ToolFault, ToolOutcome,
    TurnUsage, UsageReport,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_EXCHANGE_ATTEMPTS: u32 = 3;
const DEFAULT_EXCHANGE_BACKOFF: Duration = Duration::from_millis(500);

/// Cooperative cancellation for one conversation. The loop checks the token
/// at the top of each turn and before each dispatcher call; in-flight
/// provider calls are abandoned, not awaited.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Token that never fires, for callers without a cancellation source.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: usize,
    pub default_strategy: SearchStrategy,
    pub exchange_attempts: u32,
    pub exchange_backoff: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            system_prompt: None,
            max_turns: 10,
            default_strategy: SearchStrategy::LexicalRanked,
            exchange_attempts: DEFAULT_EXCHANGE_ATTEMPTS,
            exchange_backoff: DEFAULT_EXCHANGE_BACKOFF,
        }
    }
}

/// Why a conversation ended without a final answer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    TurnLimitExceeded { max_turns: usize },
    ModelExchangeFailed { message: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ConversationEnd {
    Completed { response: String },
    Failed { reason: FailureReason },
}

/// One executed tool invocation, kept for auditing.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStep {
    pub tool: String,
    pub input: Value,
    pub success: bool,
    pub output: Value,
}

/// Final result of one conversation. Usage counters are present even when
/// the conversation failed.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationOutcome {
    pub conversation_id: String,
    pub end: ConversationEnd,
    pub steps: Vec<ToolStep>,
    pub usage: UsageReport,
}

/// Drives the multi-turn loop: model exchange, block processing, discovery
/// marking, verified dispatch. Single-threaded per conversation; one
/// outstanding model exchange at a time, because each turn's visible tool
/// set depends on the previous turn's discoveries.
pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    router: Arc<DiscoveryRouter>,
    dispatcher: Arc<CapabilityDispatcher>,
    catalog: Arc<ToolCatalog>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        router: Arc<DiscoveryRouter>,
        dispatcher: Arc<CapabilityDispatcher>,
        catalog: Arc<ToolCatalog>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            provider,
            router,
            dispatcher,
            catalog,
            options,
        }
    }

    pub async fn run(&self, prompt: String, cancel: CancelToken) -> ConversationOutcome {
        let conversation_id = Uuid::new_v4().to_string();
        info!(conversation = %conversation_id, "Conversation started");

        let tracker = LoadingTracker::new(&self.catalog);
        let ledger = UsageLedger::new();
        let mut steps = Vec::new();
        let mut turns = vec![ConversationTurn {
            role: BlockRole::User,
            blocks: vec![Block::Text { text: prompt }],
        }];

        for turn_index in 0..self.options.max_turns {
            if cancel.is_cancelled() {
                info!(conversation = %conversation_id, "Conversation cancelled before turn");
                return self.finish(
                    conversation_id,
                    ConversationEnd::Failed {
                        reason: FailureReason::Cancelled,
                    },
                    steps,
                    &ledger,
                );
            }

            debug!(conversation = %conversation_id, turn = turn_index, "Awaiting model");
            let reply = match self.exchange_with_retry(&turns, &tracker, &cancel).await {
                Ok(reply) => reply,
                Err(message) => {
                    warn!(conversation = %conversation_id, error = %message, "Model exchange failed");
                    return self.finish(
                        conversation_id,
                        ConversationEnd::Failed {
                            reason: FailureReason::ModelExchangeFailed { message },
                        },
                        steps,
                        &ledger,
                    );
                }
            };

            debug!(
                conversation = %conversation_id,
                turn = turn_index,
                blocks = reply.blocks.len(),
                "Processing model output"
            );
            let assistant_blocks = reply.blocks.clone();
            turns.push(ConversationTurn {
                role: BlockRole::Assistant,
                blocks: assistant_blocks.clone(),
            });

            let mut usage = reply.usage;
            let processed = self
                .process_blocks(&assistant_blocks, &tracker, &cancel, &mut usage, &mut steps)
                .await;
            ledger.record(usage);

            let result_blocks = match processed {
                Ok(blocks) => blocks,
                Err(()) => {
                    info!(conversation = %conversation_id, "Conversation cancelled mid-turn");
                    return self.finish(
                        conversation_id,
                        ConversationEnd::Failed {
                            reason: FailureReason::Cancelled,
                        },
                        steps,
                        &ledger,
                    );
                }
            };

            if result_blocks.is_empty() {
                // Pure text output with no pending actions: the model is done.
                let response = collect_text(&assistant_blocks);
                info!(conversation = %conversation_id, "Conversation completed");
                return self.finish(
                    conversation_id,
                    ConversationEnd::Completed { response },
                    steps,
                    &ledger,
                );
            }

            turns.push(ConversationTurn {
                role: BlockRole::User,
                blocks: result_blocks,
            });
        }

        warn!(
            conversation = %conversation_id,
            max_turns = self.options.max_turns,
            "Turn limit exceeded"
        );
        self.finish(
            conversation_id,
            ConversationEnd::Failed {
                reason: FailureReason::TurnLimitExceeded {
                    max_turns: self.options.max_turns,
                },
            },
            steps,
            &ledger,
        )
    }

    fn finish(
        &self,
        conversation_id: String,
        end: ConversationEnd,
        steps: Vec<ToolStep>,
        ledger: &UsageLedger,
    ) -> ConversationOutcome {
        ConversationOutcome {
            conversation_id,
            end,
            steps,
            usage: ledger.snapshot(),
        }
    }

    /// Process the model's output blocks in emission order. Consecutive
    /// invocation blocks are verified in order and then dispatched
    /// concurrently; their results keep the original order. Returns the
    /// result blocks to append, or `Err(())` when cancelled.
    async fn process_blocks(
        &self,
        blocks: &[Block],
        tracker: &LoadingTracker,
        cancel: &CancelToken,
        usage: &mut TurnUsage,
        steps: &mut Vec<ToolStep>,
    ) -> Result<Vec<Block>, ()> {
        let mut results = Vec::new();
        let mut batch: Vec<(String, String, Value)> = Vec::new();

        for block in blocks {
            match block {
                Block::Text { .. } => {}
                Block::Invocation {
                    id,
                    tool,
                    arguments,
                } => {
                    batch.push((id.clone(), tool.clone(), arguments.clone()));
                }
                Block::Discovery {
                    id,
                    query,
                    strategy,
                    k,
                } => {
                    // Flush earlier invocations first so ordering holds.
                    self.flush_batch(&mut batch, tracker, cancel, steps, &mut results)
                        .await?;
                    usage.discovery_requests += 1;
                    let matches = self.handle_discovery(query, *strategy, *k, tracker).await;
                    results.push(Block::DiscoveryResults {
                        request_id: id.clone(),
                        matches,
                    });
                }
                Block::DiscoveryResults { .. } | Block::ToolResult { .. } => {
                    debug!("Ignoring result block in model output");
                }
            }
        }
        self.flush_batch(&mut batch, tracker, cancel, steps, &mut results)
            .await?;
        Ok(results)
    }

    async fn flush_batch(
        &self,
        batch: &mut Vec<(String, String, Value)>,
        tracker: &LoadingTracker,
        cancel: &CancelToken,
        steps: &mut Vec<ToolStep>,
        results: &mut Vec<Block>,
    ) -> Result<(), ()> {
        if batch.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(());
        }

        // Verify in emission order; only verified calls are dispatched.
        let mut dispatchable = Vec::new();
        for (id, tool, arguments) in batch.drain(..) {
            if !self.catalog.contains(&tool) {
                warn!(tool = %tool, "Model invoked a tool absent from the catalog");
                results.push(Block::ToolResult {
                    invocation_id: id,
                    tool: tool.clone(),
                    outcome: ToolOutcome::Error {
                        kind: ToolFault::UnknownTool,
                        message: format!("tool '{tool}' does not exist"),
                    },
                });
                continue;
            }
            if !tracker.is_callable(&tool) {
                warn!(tool = %tool, "Model invoked a tool it has not discovered");
                results.push(Block::ToolResult {
                    invocation_id: id,
                    tool: tool.clone(),
                    outcome: ToolOutcome::Error {
                        kind: ToolFault::NotDiscovered,
                        message: format!(
                            "tool '{tool}' is not loaded; discover it first via search"
                        ),
                    },
                });
                continue;
            }
            if let Err(err) = tracker.mark_invoked(&tool) {
                warn!(tool = %tool, %err, "Failed to mark tool invoked");
                results.push(Block::ToolResult {
                    invocation_id: id,
                    tool: tool.clone(),
                    outcome: ToolOutcome::Error {
                        kind: ToolFault::NotDiscovered,
                        message: err.to_string(),
                    },
                });
                continue;
            }
            dispatchable.push((id, tool, arguments));
        }

        // Independent invocations from the same turn run concurrently; the
        // dispatcher owns no mutable engine state.
        let dispatcher = &self.dispatcher;
        let calls = dispatchable.into_iter().map(|(id, tool, arguments)| async move {
            let outcome = dispatcher.invoke(&tool, arguments.clone()).await;
            (id, tool, arguments, outcome)
        });
        for (id, tool, arguments, outcome) in join_all(calls).await {
            steps.push(ToolStep {
                tool: tool.clone(),
                input: arguments,
                success: outcome.is_ok(),
                output: serde_json::to_value(&outcome).unwrap_or(Value::Null),
            });
            results.push(Block::ToolResult {
                invocation_id: id,
                tool,
                outcome,
            });
        }
        Ok(())
    }

    /// Run one discovery search and mark every returned tool discovered.
    /// An empty result list is a valid outcome, not an error; a failed
    /// semantic backend degrades to lexical-ranked search.
    async fn handle_discovery(
        &self,
        query: &str,
        strategy: Option<SearchStrategy>,
        k: Option<usize>,
        tracker: &LoadingTracker,
    ) -> Vec<DiscoveryResult> {
        let strategy = strategy.unwrap_or(self.options.default_strategy);
        let k = k.unwrap_or(0);

        let matches = match self.router.search(query, strategy, k).await {
            Ok(matches) => matches,
            Err(err @ DiscoveryError::Unavailable { .. })
                if strategy != SearchStrategy::LexicalRanked =>
            {
                warn!(%err, "Discovery strategy unavailable; falling back to lexical-ranked");
                self.router
                    .search(query, SearchStrategy::LexicalRanked, k)
                    .await
                    .unwrap_or_default()
            }
            Err(err) => {
                warn!(%err, "Discovery search failed");
                Vec::new()
            }
        };

        let ids: Vec<String> = matches.iter().map(|hit| hit.tool_id.clone()).collect();
        tracker.mark_discovered(&ids);
        matches
    }

    /// Model exchange with bounded retry and backoff. The request carries
    /// the full history plus the currently visible tool definitions and the
    /// single discovery operation.
    async fn exchange_with_retry(
        &self,
        turns: &[ConversationTurn],
        tracker: &LoadingTracker,
        cancel: &CancelToken,
    ) -> Result<ExchangeReply, String> {
        let request = ExchangeRequest {
            model: self.options.model.clone(),
            system_prompt: self.options.system_prompt.clone(),
            turns: turns.to_vec(),
            tools: self.visible_tools(tracker),
        };

        let mut backoff = self.options.exchange_backoff;
        let mut last_error = String::from("no exchange attempted");
        for attempt in 1..=self.options.exchange_attempts.max(1) {
            if cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            match self.provider.exchange(request.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    warn!(attempt, %err, "Model exchange attempt failed");
                    last_error = err.to_string();
                    if attempt < self.options.exchange_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// The discovery operation plus every tool whose state is discovered or
    /// invoked. Undiscovered tools are withheld from the model entirely.
    fn visible_tools(&self, tracker: &LoadingTracker) -> Vec<ToolDefinition> {
        let mut tools = vec![discovery_tool_definition()];
        for id in tracker.visible_set() {
            if let Some(descriptor) = self.catalog.get(&id) {
                tools.push(ToolDefinition {
                    name: descriptor.id.clone(),
                    description: descriptor.description.clone(),
                    input_schema: descriptor.input_schema.clone(),
                });
            }
        }
        tools
    }
}

fn collect_text(blocks: &[Block]) -> String {
    let texts: Vec<&str> = blocks
        .iter()
        .filter_map(|block| match block {
            Block::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    texts.join("\n")
}
