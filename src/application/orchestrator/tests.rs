use super::*;
use crate::application::catalog::descriptor;
use crate::model::{ModelError, DISCOVERY_TOOL_NAME};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<ExchangeReply, ModelError>>>,
    requests: Mutex<Vec<ExchangeRequest>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Result<ExchangeReply, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn recorded_requests(&self) -> Vec<ExchangeRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeReply, ModelError> {
        self.requests.lock().expect("requests lock").push(request);
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::InvalidResponse("script exhausted".into())))
    }
}

fn reply(blocks: Vec<Block>) -> Result<ExchangeReply, ModelError> {
    Ok(ExchangeReply {
        blocks,
        usage: TurnUsage {
            input_units: 10,
            output_units: 5,
            discovery_requests: 0,
        },
    })
}

fn text(content: &str) -> Block {
    Block::Text {
        text: content.to_string(),
    }
}

fn discovery(id: &str, query: &str) -> Block {
    Block::Discovery {
        id: id.to_string(),
        query: query.to_string(),
        strategy: None,
        k: None,
    }
}

fn invocation(id: &str, tool: &str) -> Block {
    Block::Invocation {
        id: id.to_string(),
        tool: tool.to_string(),
        arguments: json!({ "location": "Tokyo" }),
    }
}

fn test_catalog() -> Arc<ToolCatalog> {
    Arc::new(
        ToolCatalog::new(vec![
            descriptor("get_weather", "Get the current weather in a location", true),
            descriptor("convert_currency", "Convert amounts between currencies", false),
            descriptor("get_stock_price", "Get the latest stock price", false),
        ])
        .expect("catalog builds"),
    )
}

fn engine(provider: Arc<dyn ModelProvider>, options: OrchestratorOptions) -> Orchestrator {
    let catalog = test_catalog();
    let router = Arc::new(DiscoveryRouter::new(
        crate::application::discovery::LexicalIndex::build(&catalog),
        None,
    ));
    let mut dispatcher =
        CapabilityDispatcher::new(catalog.clone(), std::time::Duration::from_secs(1));
    for id in ["get_weather", "convert_currency", "get_stock_price"] {
        dispatcher.register_local(
            id,
            Arc::new(move |arguments: &Value| Ok(json!({ "tool": id, "args": arguments }))),
        );
    }
    Orchestrator::new(
        provider,
        router,
        Arc::new(dispatcher),
        catalog,
        options,
    )
}

fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        max_turns: 6,
        exchange_attempts: 1,
        exchange_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn discover_then_invoke_then_answer() {
    let provider = ScriptedProvider::new(vec![
        reply(vec![discovery("d1", "currency conversion")]),
        reply(vec![invocation("i1", "convert_currency")]),
        reply(vec![text("100 USD is about 92 EUR.")]),
    ]);
    let engine = engine(provider.clone(), fast_options());

    let outcome = engine
        .run("convert 100 usd to eur".into(), CancelToken::never())
        .await;

    match outcome.end {
        ConversationEnd::Completed { response } => {
            assert_eq!(response, "100 USD is about 92 EUR.")
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(outcome.steps[0].tool, "convert_currency");
    assert!(outcome.steps[0].success);
    assert_eq!(outcome.usage.per_turn.len(), 3);
    assert_eq!(outcome.usage.totals.discovery_requests, 1);
    assert_eq!(outcome.usage.totals.input_units, 30);

    // The second exchange must carry the discovery results back to the model.
    let requests = provider.recorded_requests();
    let results_turn = requests[1].turns.last().expect("result turn");
    assert!(matches!(
        results_turn.blocks[0],
        Block::DiscoveryResults { .. }
    ));
}

#[tokio::test]
async fn undiscovered_invocation_is_recovered_in_conversation() {
    let provider = ScriptedProvider::new(vec![
        reply(vec![invocation("i1", "convert_currency")]),
        reply(vec![text("I need to search for that tool first.")]),
    ]);
    let engine = engine(provider.clone(), fast_options());

    let outcome = engine.run("convert money".into(), CancelToken::never()).await;

    assert!(matches!(outcome.end, ConversationEnd::Completed { .. }));
    // Verification failed, so nothing was dispatched.
    assert!(outcome.steps.is_empty());

    let requests = provider.recorded_requests();
    let results_turn = requests[1].turns.last().expect("result turn");
    match &results_turn.blocks[0] {
        Block::ToolResult { outcome, .. } => match outcome {
            ToolOutcome::Error { kind, .. } => assert_eq!(*kind, ToolFault::NotDiscovered),
            other => panic!("expected error outcome, got {other:?}"),
        },
        other => panic!("expected tool result block, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_tool_invocation_is_reported_not_fatal() {
    let provider = ScriptedProvider::new(vec![
        reply(vec![invocation("i1", "launch_rockets")]),
        reply(vec![text("That tool does not exist.")]),
    ]);
    let engine = engine(provider.clone(), fast_options());

    let outcome = engine.run("do something".into(), CancelToken::never()).await;
    assert!(matches!(outcome.end, ConversationEnd::Completed { .. }));

    let requests = provider.recorded_requests();
    let results_turn = requests[1].turns.last().expect("result turn");
    match &results_turn.blocks[0] {
        Block::ToolResult { outcome, .. } => match outcome {
            ToolOutcome::Error { kind, .. } => assert_eq!(*kind, ToolFault::UnknownTool),
            other => panic!("expected error outcome, got {other:?}"),
        },
        other => panic!("expected tool result block, got {other:?}"),
    }
}

#[tokio::test]
async fn eager_tools_are_visible_before_any_discovery() {
    let provider = ScriptedProvider::new(vec![reply(vec![text("done")])]);
    let engine = engine(provider.clone(), fast_options());

    engine.run("hello".into(), CancelToken::never()).await;

    let requests = provider.recorded_requests();
    let names: Vec<&str> = requests[0]
        .tools
        .iter()
        .map(|tool| tool.name.as_str())
        .collect();
    assert!(names.contains(&DISCOVERY_TOOL_NAME));
    assert!(names.contains(&"get_weather"));
    assert!(!names.contains(&"convert_currency"));
}

#[tokio::test]
async fn discovery_expands_the_visible_set_for_later_turns() {
    let provider = ScriptedProvider::new(vec![
        reply(vec![discovery("d1", "stock price")]),
        reply(vec![text("found it")]),
    ]);
    let engine = engine(provider.clone(), fast_options());

    engine.run("check stocks".into(), CancelToken::never()).await;

    let requests = provider.recorded_requests();
    let names: Vec<&str> = requests[1]
        .tools
        .iter()
        .map(|tool| tool.name.as_str())
        .collect();
    assert!(names.contains(&"get_stock_price"));
}

#[tokio::test]
async fn turn_limit_fails_with_usage_intact() {
    let mut options = fast_options();
    options.max_turns = 3;
    let provider = ScriptedProvider::new(vec![
        reply(vec![discovery("d1", "weather")]),
        reply(vec![discovery("d2", "weather")]),
        reply(vec![discovery("d3", "weather")]),
    ]);
    let engine = engine(provider, options);

    let outcome = engine.run("loop forever".into(), CancelToken::never()).await;

    match outcome.end {
        ConversationEnd::Failed {
            reason: FailureReason::TurnLimitExceeded { max_turns },
        } => assert_eq!(max_turns, 3),
        other => panic!("expected turn limit failure, got {other:?}"),
    }
    assert_eq!(outcome.usage.per_turn.len(), 3);
    assert_eq!(outcome.usage.totals.discovery_requests, 3);
}

#[tokio::test]
async fn exchange_failures_exhaust_retries_then_fail() {
    let mut options = fast_options();
    options.exchange_attempts = 2;
    let provider = ScriptedProvider::new(vec![
        Err(ModelError::InvalidResponse("flaky".into())),
        Err(ModelError::InvalidResponse("still flaky".into())),
    ]);
    let engine = engine(provider.clone(), options);

    let outcome = engine.run("hello".into(), CancelToken::never()).await;

    match outcome.end {
        ConversationEnd::Failed {
            reason: FailureReason::ModelExchangeFailed { message },
        } => assert!(message.contains("still flaky")),
        other => panic!("expected exchange failure, got {other:?}"),
    }
    assert_eq!(provider.recorded_requests().len(), 2);
}

#[tokio::test]
async fn transient_exchange_failure_is_retried() {
    let mut options = fast_options();
    options.exchange_attempts = 3;
    let provider = ScriptedProvider::new(vec![
        Err(ModelError::InvalidResponse("flaky".into())),
        reply(vec![text("recovered")]),
    ]);
    let engine = engine(provider, options);

    let outcome = engine.run("hello".into(), CancelToken::never()).await;
    assert!(matches!(outcome.end, ConversationEnd::Completed { .. }));
}

#[tokio::test]
async fn cancellation_short_circuits_the_loop() {
    let provider = ScriptedProvider::new(vec![reply(vec![text("never seen")])]);
    let engine = engine(provider.clone(), fast_options());
    let (handle, token) = cancel_pair();
    handle.cancel();

    let outcome = engine.run("hello".into(), token).await;

    assert!(matches!(
        outcome.end,
        ConversationEnd::Failed {
            reason: FailureReason::Cancelled,
        }
    ));
    assert!(provider.recorded_requests().is_empty());
}

/// Delegates to the script, then fires the cancel handle: cancellation
/// lands after the model reply but before anything is dispatched.
struct CancelAfterExchange {
    inner: Arc<ScriptedProvider>,
    handle: CancelHandle,
}

#[async_trait]
impl ModelProvider for CancelAfterExchange {
    async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeReply, ModelError> {
        let reply = self.inner.exchange(request).await;
        self.handle.cancel();
        reply
    }
}

#[tokio::test]
async fn cancellation_before_dispatch_skips_the_batch() {
    let scripted = ScriptedProvider::new(vec![reply(vec![invocation("i1", "get_weather")])]);
    let (handle, token) = cancel_pair();
    let engine = engine(
        Arc::new(CancelAfterExchange {
            inner: scripted.clone(),
            handle,
        }),
        fast_options(),
    );

    let outcome = engine.run("weather please".into(), token).await;

    assert!(matches!(
        outcome.end,
        ConversationEnd::Failed {
            reason: FailureReason::Cancelled,
        }
    ));
    // The eager tool was invocable, but nothing may be dispatched after
    // cancellation.
    assert!(outcome.steps.is_empty());
    // The exchange that did happen is still accounted for.
    assert_eq!(outcome.usage.per_turn.len(), 1);
    assert_eq!(scripted.recorded_requests().len(), 1);
}

#[tokio::test]
async fn parallel_invocations_keep_emission_order() {
    let provider = ScriptedProvider::new(vec![
        reply(vec![discovery("d1", "currency stock")]),
        reply(vec![
            invocation("i1", "convert_currency"),
            invocation("i2", "get_stock_price"),
        ]),
        reply(vec![text("done")]),
    ]);
    let engine = engine(provider.clone(), fast_options());

    let outcome = engine.run("two things".into(), CancelToken::never()).await;

    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[0].tool, "convert_currency");
    assert_eq!(outcome.steps[1].tool, "get_stock_price");

    let requests = provider.recorded_requests();
    let results_turn = requests[2].turns.last().expect("result turn");
    let ids: Vec<&str> = results_turn
        .blocks
        .iter()
        .map(|block| match block {
            Block::ToolResult { invocation_id, .. } => invocation_id.as_str(),
            other => panic!("expected tool result block, got {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec!["i1", "i2"]);
}

#[tokio::test]
async fn semantic_request_degrades_to_lexical_without_an_index() {
    let provider = ScriptedProvider::new(vec![
        reply(vec![Block::Discovery {
            id: "d1".into(),
            query: "currency".into(),
            strategy: Some(SearchStrategy::Semantic),
            k: None,
        }]),
        reply(vec![text("done")]),
    ]);
    let engine = engine(provider.clone(), fast_options());

    let outcome = engine.run("convert".into(), CancelToken::never()).await;
    assert!(matches!(outcome.end, ConversationEnd::Completed { .. }));

    let requests = provider.recorded_requests();
    let results_turn = requests[1].turns.last().expect("result turn");
    match &results_turn.blocks[0] {
        Block::DiscoveryResults { matches, .. } => {
            assert!(!matches.is_empty());
            assert_eq!(matches[0].strategy, SearchStrategy::LexicalRanked);
        }
        other => panic!("expected discovery results, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_discovery_results_still_produce_a_result_block() {
    let provider = ScriptedProvider::new(vec![
        reply(vec![discovery("d1", "quantum chromodynamics")]),
        reply(vec![text("nothing matched")]),
    ]);
    let engine = engine(provider.clone(), fast_options());

    let outcome = engine.run("search".into(), CancelToken::never()).await;
    assert!(matches!(outcome.end, ConversationEnd::Completed { .. }));

    let requests = provider.recorded_requests();
    let results_turn = requests[1].turns.last().expect("result turn");
    match &results_turn.blocks[0] {
        Block::DiscoveryResults { matches, request_id } => {
            assert_eq!(request_id, "d1");
            assert!(matches.is_empty());
        }
        other => panic!("expected discovery results, got {other:?}"),
    }
}
