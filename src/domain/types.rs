use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Executor that fulfils an invocation: a registered local function or a
/// remote capability provider addressed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRef {
    Local,
    Remote(String),
}

/// Immutable description of one tool. Created once when the catalog is
/// assembled; identity is the `id`.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub id: String,
    pub description: String,
    pub input_schema: Value,
    pub examples: Vec<Value>,
    /// Eager tools are visible from the first turn without discovery.
    pub eager: bool,
    pub provider: ProviderRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchStrategy {
    LexicalPattern,
    LexicalRanked,
    Semantic,
}

impl SearchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchStrategy::LexicalPattern => "lexical-pattern",
            SearchStrategy::LexicalRanked => "lexical-ranked",
            SearchStrategy::Semantic => "semantic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "lexical-pattern" | "pattern" | "regex" => Some(SearchStrategy::LexicalPattern),
            "lexical-ranked" | "ranked" | "bm25" => Some(SearchStrategy::LexicalRanked),
            "semantic" | "embeddings" => Some(SearchStrategy::Semantic),
            _ => None,
        }
    }
}

/// One ranked hit from a discovery search. Produced fresh per call.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub tool_id: String,
    pub score: f32,
    pub strategy: SearchStrategy,
}

/// Error classes reported back into the conversation as tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFault {
    UnknownTool,
    NotDiscovered,
    ProviderUnavailable,
    ExecutionFailed,
}

/// Normalized result envelope every executor's output is wrapped into.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ToolOutcome {
    Ok { value: Value },
    Error { kind: ToolFault, message: String },
}

impl ToolOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    User,
    Assistant,
}

/// One content block of the conversation. The model emits `Text`,
/// `Discovery`, and `Invocation` blocks; the engine appends
/// `DiscoveryResults` and `ToolResult` blocks in the same order.
#[derive(Debug, Clone)]
pub enum Block {
    Text {
        text: String,
    },
    Discovery {
        id: String,
        query: String,
        strategy: Option<SearchStrategy>,
        k: Option<usize>,
    },
    Invocation {
        id: String,
        tool: String,
        arguments: Value,
    },
    DiscoveryResults {
        request_id: String,
        matches: Vec<DiscoveryResult>,
    },
    ToolResult {
        invocation_id: String,
        tool: String,
        outcome: ToolOutcome,
    },
}

/// One entry of the transcript kept by the orchestrator.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: BlockRole,
    pub blocks: Vec<Block>,
}

/// Consumption counters for one model exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnUsage {
    pub input_units: u64,
    pub output_units: u64,
    pub discovery_requests: u64,
}

impl TurnUsage {
    pub fn add(&mut self, other: TurnUsage) {
        self.input_units += other.input_units;
        self.output_units += other.output_units;
        self.discovery_requests += other.discovery_requests;
    }
}

/// Read-only usage snapshot exposed to callers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageReport {
    pub per_turn: Vec<TurnUsage>,
    pub totals: TurnUsage,
}
