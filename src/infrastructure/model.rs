use crate::application::discovery::{EmbedError, Embedder};
use crate::types::{Block, BlockRole, ConversationTurn, SearchStrategy, TurnUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Name under which the discovery operation is rendered to the model. An
/// invocation of this tool is lifted into a discovery-request block before
/// the engine core sees it.
pub const DISCOVERY_TOOL_NAME: &str = "search_tools";

const DEFAULT_MAX_OUTPUT_UNITS: u32 = 2048;

/// One tool definition as rendered to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Definition of the single discovery operation every conversation carries.
pub fn discovery_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: DISCOVERY_TOOL_NAME.to_string(),
        description: "Search for available tools that can help with a task. \
                      Use this when you need a capability you do not have yet."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural language description of the tool you need"
                },
                "strategy": {
                    "type": "string",
                    "enum": ["lexical-pattern", "lexical-ranked", "semantic"],
                    "description": "Search strategy to use (optional)"
                },
                "k": {
                    "type": "number",
                    "description": "Number of tools to return (default: 5)"
                }
            },
            "required": ["query"]
        }),
    }
}

/// One request/response cycle with the model: full history plus the
/// currently visible tool definitions.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub turns: Vec<ConversationTurn>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone)]
pub struct ExchangeReply {
    pub blocks: Vec<Block>,
    pub usage: TurnUsage,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("model returned invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeReply, ModelError>;
}

/// HTTP client for a messages-style completion API.
#[derive(Clone)]
pub struct MessagesClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl MessagesClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_client(base_url, api_key, Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        api_key: Option<String>,
        client: Client,
    ) -> Self {
        Self {
            http: client,
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn with_timeout(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self::with_client(base_url, api_key, client)
    }

    fn endpoint(&self, path: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{trimmed}/{path}")
    }
}

#[async_trait]
impl ModelProvider for MessagesClient {
    async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeReply, ModelError> {
        let url = self.endpoint("/v1/messages");
        let payload = WireRequest::from(&request);
        info!(
            model = request.model.as_str(),
            url = %url,
            turns = request.turns.len(),
            tools = request.tools.len(),
            "Sending exchange to model"
        );

        let mut call = self.http.post(url).json(&payload);
        if let Some(key) = &self.api_key {
            call = call.header("x-api-key", key);
        }
        let response: WireResponse = call
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Received model reply");

        let mut blocks = Vec::with_capacity(response.content.len());
        for block in response.content {
            blocks.push(parse_reply_block(block)?);
        }

        let usage = TurnUsage {
            input_units: response.usage.as_ref().map_or(0, |u| u.input_tokens),
            output_units: response.usage.as_ref().map_or(0, |u| u.output_tokens),
            discovery_requests: 0,
        };
        Ok(ExchangeReply { blocks, usage })
    }
}

fn parse_reply_block(block: WireReplyBlock) -> Result<Block, ModelError> {
    match block {
        WireReplyBlock::Text { text } => Ok(Block::Text { text }),
        WireReplyBlock::ToolUse { id, name, input } => {
            if name == DISCOVERY_TOOL_NAME {
                let query = input
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ModelError::InvalidResponse("discovery request missing query".into())
                    })?
                    .to_string();
                let strategy = input
                    .get("strategy")
                    .and_then(Value::as_str)
                    .and_then(SearchStrategy::parse);
                let k = input
                    .get("k")
                    .and_then(Value::as_u64)
                    .map(|value| value as usize);
                Ok(Block::Discovery {
                    id,
                    query,
                    strategy,
                    k,
                })
            } else {
                Ok(Block::Invocation {
                    id,
                    tool: name,
                    arguments: input,
                })
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl From<&ExchangeRequest> for WireRequest {
    fn from(value: &ExchangeRequest) -> Self {
        let messages = value
            .turns
            .iter()
            .map(|turn| WireMessage {
                role: match turn.role {
                    BlockRole::User => "user",
                    BlockRole::Assistant => "assistant",
                },
                content: turn.blocks.iter().map(wire_block).collect(),
            })
            .collect();
        Self {
            model: value.model.clone(),
            max_tokens: DEFAULT_MAX_OUTPUT_UNITS,
            system: value.system_prompt.clone(),
            messages,
            tools: value.tools.clone(),
        }
    }
}

fn wire_block(block: &Block) -> WireBlock {
    match block {
        Block::Text { text } => WireBlock::Text { text: text.clone() },
        Block::Discovery {
            id,
            query,
            strategy,
            k,
        } => {
            let mut input = json!({ "query": query });
            if let Some(strategy) = strategy {
                input["strategy"] = json!(strategy.as_str());
            }
            if let Some(k) = k {
                input["k"] = json!(k);
            }
            WireBlock::ToolUse {
                id: id.clone(),
                name: DISCOVERY_TOOL_NAME.to_string(),
                input,
            }
        }
        Block::Invocation {
            id,
            tool,
            arguments,
        } => WireBlock::ToolUse {
            id: id.clone(),
            name: tool.clone(),
            input: arguments.clone(),
        },
        Block::DiscoveryResults {
            request_id,
            matches,
        } => WireBlock::ToolResult {
            tool_use_id: request_id.clone(),
            content: serde_json::to_string(&json!({ "matches": matches }))
                .unwrap_or_else(|_| "{\"matches\":[]}".to_string()),
            is_error: false,
        },
        Block::ToolResult {
            invocation_id,
            outcome,
            ..
        } => WireBlock::ToolResult {
            tool_use_id: invocation_id.clone(),
            content: serde_json::to_string(outcome).unwrap_or_else(|_| "{}".to_string()),
            is_error: !outcome.is_ok(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireReplyBlock>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireReplyBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// HTTP client for an Ollama-style embeddings endpoint, used as the
/// black-box embedding function behind the semantic index.
#[derive(Clone)]
pub struct OllamaEmbeddings {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaEmbeddings {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        format!("{trimmed}/api/embeddings")
    }
}

#[async_trait]
impl Embedder for OllamaEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let payload = json!({ "model": self.model, "prompt": text });
        let response: EmbeddingResponse = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| EmbedError::Backend {
                message: err.to_string(),
            })?
            .json()
            .await
            .map_err(|err| EmbedError::Backend {
                message: err.to_string(),
            })?;

        if response.embedding.is_empty() {
            return Err(EmbedError::EmptyVector);
        }
        Ok(response.embedding)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}
