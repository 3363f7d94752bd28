//! Anthropic-shaped wire types shared by the router, transformers, and the
//! SSE interceptor. These mirror the `/v1/messages` request/response schema
//! closely enough to round-trip unknown fields via `#[serde(flatten)]`,
//! the way `goose`'s `conversation::message` module keeps provider-agnostic
//! message shapes while tolerating provider-specific extensions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single tool-result's content: either a plain string or a list of
/// content blocks (Anthropic allows both on the wire).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    pub fn as_text(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// One content block inside a message. Deliberately a closed tagged union
/// (per SPEC_FULL §9 "represent variant payloads as tagged unions") rather
/// than the dynamically-typed objects the Node.js source mutates in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

/// Message content is either a bare string (shorthand for a single text
/// block) or an explicit list of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(t) => vec![ContentBlock::Text { text: t.clone() }],
            MessageContent::Blocks(b) => b.clone(),
        }
    }

    pub fn contains_tool_use_or_result(&self) -> bool {
        self.blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(content),
        }
    }

    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(content),
        }
    }
}

/// A single `system` text part, used when `system` is an array rather than
/// a bare string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemBlock {
    #[serde(rename = "type", default = "default_text_type")]
    pub block_type: String,
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_text_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Concatenated text across all blocks, used by the token counter and by
    /// directive scanning.
    pub fn joined_text(&self) -> String {
        match self {
            SystemPrompt::Text(t) => t.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Replace every occurrence of `from` with `to` across all text, used to
    /// strip routing directives (§4.1 step 4).
    pub fn replace_text(&mut self, from: &str, to: &str) {
        match self {
            SystemPrompt::Text(t) => *t = t.replace(from, to),
            SystemPrompt::Blocks(blocks) => {
                for b in blocks.iter_mut() {
                    b.text = b.text.replace(from, to);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(rename = "type", default)]
    pub tool_type: Option<String>,
}

impl ToolDefinition {
    pub fn is_web_search(&self) -> bool {
        self.tool_type
            .as_deref()
            .map(|t| t.starts_with("web_search"))
            .unwrap_or(false)
    }
}

/// The full `/v1/messages` request body. Unknown top-level fields (e.g.
/// `temperature`, `top_p`, `metadata`) round-trip via `extra` rather than
/// being dropped, matching the "closed request/response records" redesign
/// called for in SPEC_FULL §9 while still tolerating provider-specific
/// passthrough fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub thinking: Option<Value>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_max_tokens() -> u32 {
    4096
}

impl MessagesRequest {
    pub fn thinking_enabled(&self) -> bool {
        match &self.thinking {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Null) => false,
            Some(Value::Object(map)) => map
                .get("type")
                .and_then(|v| v.as_str())
                .map(|t| t != "disabled")
                .unwrap_or(true),
            Some(_) => true,
        }
    }

    pub fn has_web_search_tool(&self) -> bool {
        self.tools.iter().any(|t| t.is_web_search())
    }

    pub fn has_in_flight_tool_blocks(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.content.contains_tool_use_or_result())
    }

    pub fn system_text(&self) -> String {
        self.system
            .as_ref()
            .map(|s| s.joined_text())
            .unwrap_or_default()
    }
}
