//! Token counting used by the Routing Decider (§4.1) and the
//! `/v1/messages/count_tokens` endpoint. Grounded on `kaze`'s `tokens.rs`:
//! resolve a `tiktoken-rs` BPE by model name, falling back to `cl100k_base`
//! for models (Claude, DeepSeek, etc.) `tiktoken-rs` has no direct mapping
//! for, since SPEC_FULL only requires a consistent, monotonic approximation
//! rather than provider-exact counts.

use std::sync::Arc;
use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};

use crate::message::{ContentBlock, MessagesRequest, SystemPrompt};

#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TokenCounter {
    pub fn for_model(model: &str) -> Self {
        let bpe = get_bpe_from_model(model)
            .or_else(|_| cl100k_base())
            .expect("cl100k_base must always be constructible");
        Self { bpe: Arc::new(bpe) }
    }

    pub fn count_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn count_block(&self, block: &ContentBlock) -> usize {
        match block {
            ContentBlock::Text { text } => self.count_text(text),
            ContentBlock::ToolUse { name, input, .. } => {
                self.count_text(name) + self.count_text(&input.to_string())
            }
            ContentBlock::ToolResult { content, .. } => self.count_text(&content.as_text()),
            ContentBlock::Thinking { thinking, .. } => self.count_text(thinking),
            ContentBlock::RedactedThinking { data } => self.count_text(data),
        }
    }

    fn count_system(&self, system: &SystemPrompt) -> usize {
        self.count_text(&system.joined_text())
    }

    /// Approximate prompt token count across system, messages and tool
    /// definitions, used as the §4.1 long-context routing signal and as the
    /// `count_tokens` response body.
    pub fn count_request(&self, req: &MessagesRequest) -> usize {
        let mut total = 0usize;
        if let Some(system) = &req.system {
            total += self.count_system(system);
        }
        for message in &req.messages {
            for block in message.content.blocks() {
                total += self.count_block(&block);
            }
            // small per-message role/framing overhead, matching the fixed
            // per-message padding chat tokenizers commonly add.
            total += 4;
        }
        for tool in &req.tools {
            total += self.count_text(&tool.name);
            total += self.count_text(&tool.description);
            total += self.count_text(&tool.input_schema.to_string());
        }
        total
    }
}
