//! Anthropic → Google request translation (SPEC_FULL.md §4.D), with a
//! per-block-type mapping helper for each of the five content-block
//! variants this proxy models.

use ccrelay_protocol::claude::{ContentBlock, CreateMessageRequest, Message, MessageContent, Role, ThinkingMode};
use ccrelay_protocol::gemini::{
    ClaudeThinkingConfig, Content, ContentRole, FunctionCall, FunctionCallingConfig,
    FunctionCallingMode, FunctionDeclaration, FunctionResponse, GenerateContentRequestBody,
    GeminiThinkingConfig, GenerationConfig, Part, ThinkingConfig, Tool, ToolConfig,
};
use sha2::{Digest, Sha256};

use crate::schema::sanitize;
use crate::signature_cache::{model_family, ModelFamily, SignatureCache};

const DEFAULT_GEMINI_THINKING_BUDGET: u32 = 16_000;
const MAX_TOKENS_CEILING: u32 = 65_536;

/// Synthetic closing thought injected when a Claude-family thinking turn's
/// prior signature can't carry over from a Gemini-authored history (see
/// [`inject_thinking_recovery`]).
const THINKING_RECOVERY_TEXT: &str = "Continuing from prior context.";

/// Stable key used to look up a thinking block's signature in the cache
/// when the block itself arrived without one (SPEC_FULL.md §3, §4.B).
pub fn thinking_block_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("thinking:{:x}", hasher.finalize())
}

pub fn translate_request(req: &CreateMessageRequest, cache: &SignatureCache) -> GenerateContentRequestBody {
    let family = model_family(&req.model);
    let contents = req.messages.iter().filter_map(|m| translate_message(m, cache, family)).collect();

    let system_instruction = req.system.as_ref().map(|system| {
        let text = flatten_text(system);
        Content { parts: vec![Part::text(text)], role: None }
    });

    let tools = translate_tools(req.tools.as_deref());
    let tool_config = req.tool_choice.as_ref().map(translate_tool_choice);
    let generation_config = Some(translate_generation_config(req, family));

    GenerateContentRequestBody { contents, tools, tool_config, system_instruction, generation_config }
}

fn flatten_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn translate_message(message: &Message, cache: &SignatureCache, target_family: ModelFamily) -> Option<Content> {
    let role = match message.role {
        Role::User => ContentRole::User,
        Role::Assistant => ContentRole::Model,
    };

    let mut blocks = message.content.clone().into_blocks();
    if message.role == Role::Assistant {
        restore_missing_signatures(&mut blocks, cache);
        strip_trailing_unsigned_thinking(&mut blocks);
        inject_thinking_recovery(&mut blocks, cache, target_family);
        reorder_canonical(&mut blocks);
    }

    let mut parts: Vec<Part> = blocks.iter().map(|block| translate_block(block, target_family)).collect();
    if parts.is_empty() {
        parts.push(Part::text("."));
    }

    Some(Content { parts, role: Some(role) })
}

/// Pass 1: fill in a thinking block's signature from the cache when the
/// client stripped it before forwarding the conversation history.
fn restore_missing_signatures(blocks: &mut [ContentBlock], cache: &SignatureCache) {
    for block in blocks.iter_mut() {
        if let ContentBlock::Thinking { thinking, signature } = block
            && signature.is_none()
            && let Some((restored, _family)) = cache.get(&thinking_block_hash(thinking))
        {
            *signature = Some(restored);
        }
    }
}

/// Pass 2: a thinking block that is still unsigned after restoration cannot
/// be sent upstream; strip any run of them at the end of the turn.
fn strip_trailing_unsigned_thinking(blocks: &mut Vec<ContentBlock>) {
    while matches!(blocks.last(), Some(ContentBlock::Thinking { signature: None, .. })) {
        blocks.pop();
    }
}

/// Pass 3: a Claude-family target can't carry a signature a Gemini turn
/// issued earlier in the same history (the two upstreams don't share a
/// signature namespace). Detect that cross-family case by the thinking
/// block's content hash, drop the foreign signature, and replace the block
/// with synthetic closing content so the turn still ends in a thinking
/// block, satisfying Claude's tool-loop invariant.
fn inject_thinking_recovery(blocks: &mut [ContentBlock], cache: &SignatureCache, target_family: ModelFamily) {
    if target_family != ModelFamily::Claude {
        return;
    }
    for block in blocks.iter_mut() {
        if let ContentBlock::Thinking { thinking, signature } = block {
            let authored_family = cache.get(&thinking_block_hash(thinking)).map(|(_, family)| family);
            if authored_family == Some(ModelFamily::Gemini) {
                *thinking = THINKING_RECOVERY_TEXT.to_string();
                *signature = None;
            }
        }
    }
}

/// Pass 4: reorder into the upstream's required canonical order:
/// thinking, then text, then tool_use. `tool_result` blocks (which only
/// appear in user turns) are left untouched by this assistant-only pass.
fn reorder_canonical(blocks: &mut [ContentBlock]) {
    blocks.sort_by_key(|b| match b {
        ContentBlock::Thinking { .. } => 0,
        ContentBlock::Text { .. } => 1,
        ContentBlock::Image { .. } => 1,
        ContentBlock::ToolUse { .. } => 2,
        ContentBlock::ToolResult { .. } => 3,
    });
}

fn translate_block(block: &ContentBlock, target_family: ModelFamily) -> Part {
    match block {
        ContentBlock::Text { text } => Part::text(text.clone()),
        ContentBlock::Thinking { thinking, signature } => {
            let mut part = Part::thought(thinking.clone());
            part.thought_signature = signature.clone();
            part
        }
        ContentBlock::Image { source } => Part {
            inline_data: Some(ccrelay_protocol::gemini::Blob {
                mime_type: source.media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                data: source.data.clone().unwrap_or_default(),
            }),
            ..Default::default()
        },
        ContentBlock::ToolUse { id, name, input } => Part {
            function_call: Some(FunctionCall { id: Some(id.clone()), name: name.clone(), args: Some(input.clone()) }),
            ..Default::default()
        },
        ContentBlock::ToolResult { tool_use_id, content, is_error } => {
            let response = match target_family {
                // Claude expects its own tool_result back in its own form,
                // so the full shape is carried inside the response payload
                // rather than collapsed to a plain output/error string.
                ModelFamily::Claude => serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error.unwrap_or(false),
                }),
                ModelFamily::Gemini => {
                    let response_text = match content {
                        Some(ccrelay_protocol::claude::ToolResultContent::Text(text)) => text.clone(),
                        Some(ccrelay_protocol::claude::ToolResultContent::Blocks(blocks)) => blocks
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::Text { text } => Some(text.clone()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n"),
                        None => String::new(),
                    };
                    if is_error.unwrap_or(false) {
                        serde_json::json!({"error": response_text})
                    } else {
                        serde_json::json!({"output": response_text})
                    }
                }
            };
            Part {
                function_response: Some(FunctionResponse { id: Some(tool_use_id.clone()), name: tool_use_id.clone(), response }),
                ..Default::default()
            }
        }
    }
}

fn translate_tools(tools: Option<&[ccrelay_protocol::claude::ToolDefinition]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: sanitize_tool_name(&tool.name),
            description: tool.description.clone().unwrap_or_default(),
            parameters: Some(sanitize(&tool.input_schema)),
        })
        .collect();
    Some(vec![Tool { function_declarations: Some(declarations) }])
}

/// Upstream tool names must match `[A-Za-z0-9_-]{1,64}`.
fn sanitize_tool_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').collect();
    let cleaned = if cleaned.is_empty() { "tool".to_string() } else { cleaned };
    cleaned.chars().take(64).collect()
}

fn translate_tool_choice(choice: &ccrelay_protocol::claude::ToolChoice) -> ToolConfig {
    use ccrelay_protocol::claude::ToolChoice;
    let function_calling_config = match choice {
        ToolChoice::Auto => FunctionCallingConfig { mode: Some(FunctionCallingMode::Auto) },
        ToolChoice::Any => FunctionCallingConfig { mode: Some(FunctionCallingMode::Any) },
        ToolChoice::None => FunctionCallingConfig { mode: Some(FunctionCallingMode::None) },
        ToolChoice::Tool { .. } => FunctionCallingConfig { mode: Some(FunctionCallingMode::Any) },
    };
    ToolConfig { function_calling_config: Some(function_calling_config) }
}

fn translate_generation_config(req: &CreateMessageRequest, family: ModelFamily) -> GenerationConfig {
    let mut max_tokens = Some(req.max_tokens);

    let thinking_config = req.thinking.as_ref().map(|thinking| {
        let enabled = thinking.r#type == ThinkingMode::Enabled;
        match family {
            // Claude family: budget stays optional, snake_case on the wire.
            ModelFamily::Claude => {
                if enabled
                    && let Some(budget) = thinking.budget_tokens
                    && budget <= req.max_tokens
                {
                    max_tokens = Some(budget + 8192);
                }
                ThinkingConfig::Claude(ClaudeThinkingConfig { include_thoughts: enabled, thinking_budget: thinking.budget_tokens })
            }
            // Gemini family: budget is always present, camelCase on the wire.
            ModelFamily::Gemini => {
                let budget = thinking.budget_tokens.unwrap_or(DEFAULT_GEMINI_THINKING_BUDGET);
                if enabled && budget <= req.max_tokens {
                    max_tokens = Some(budget + 8192);
                }
                ThinkingConfig::Gemini(GeminiThinkingConfig { include_thoughts: enabled, thinking_budget: budget, thinking_level: None })
            }
        }
    });

    if let Some(tokens) = max_tokens {
        max_tokens = Some(tokens.min(MAX_TOKENS_CEILING));
    }

    GenerationConfig {
        stop_sequences: req.stop_sequences.clone(),
        max_output_tokens: max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        thinking_config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_protocol::claude::{CreateMessageRequest, Message, MessageContent, Role};

    fn request(messages: Vec<Message>) -> CreateMessageRequest {
        CreateMessageRequest {
            model: "gemini-thinking".to_string(),
            messages,
            max_tokens: 1024,
            stream: None,
            system: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
        }
    }

    #[test]
    fn empty_content_becomes_single_dot_part() {
        let cache = SignatureCache::new(8);
        let req = request(vec![Message { role: Role::User, content: MessageContent::Blocks(vec![]) }]);
        let body = translate_request(&req, &cache);
        assert_eq!(body.contents[0].parts.len(), 1);
        assert_eq!(body.contents[0].parts[0].text.as_deref(), Some("."));
    }

    #[test]
    fn trailing_unsigned_thinking_is_stripped() {
        let cache = SignatureCache::new(8);
        let req = request(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "answer".to_string() },
                ContentBlock::Thinking { thinking: "unsigned".to_string(), signature: None },
            ]),
        }]);
        let body = translate_request(&req, &cache);
        assert_eq!(body.contents[0].parts.len(), 1);
        assert_eq!(body.contents[0].parts[0].text.as_deref(), Some("answer"));
    }

    #[test]
    fn restores_signature_from_cache_by_thinking_hash() {
        let cache = SignatureCache::new(8);
        let text = "planning the answer".to_string();
        cache.insert(thinking_block_hash(&text), "sig-123", ModelFamily::Gemini);
        let req = request(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::Thinking { thinking: text, signature: None }]),
        }]);
        let body = translate_request(&req, &cache);
        assert_eq!(body.contents[0].parts[0].thought_signature.as_deref(), Some("sig-123"));
    }

    #[test]
    fn canonical_order_is_thinking_then_text_then_tool_use() {
        let cache = SignatureCache::new(8);
        let req = request(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::ToolUse { id: "t1".to_string(), name: "fn".to_string(), input: serde_json::json!({}) },
                ContentBlock::Text { text: "hi".to_string() },
                ContentBlock::Thinking { thinking: "plan".to_string(), signature: Some("sig".to_string()) },
            ]),
        }]);
        let body = translate_request(&req, &cache);
        let parts = &body.contents[0].parts;
        assert_eq!(parts[0].thought, Some(true));
        assert_eq!(parts[1].text.as_deref(), Some("hi"));
        assert!(parts[2].function_call.is_some());
    }

    #[test]
    fn thinking_budget_raises_max_tokens_when_not_above_it() {
        let cache = SignatureCache::new(8);
        let mut req = request(vec![Message { role: Role::User, content: MessageContent::Text("hi".to_string()) }]);
        req.max_tokens = 1000;
        req.thinking = Some(ccrelay_protocol::claude::ThinkingConfig { r#type: ThinkingMode::Enabled, budget_tokens: Some(1000) });
        let body = translate_request(&req, &cache);
        assert_eq!(body.generation_config.unwrap().max_output_tokens, Some(1000 + 8192));
    }

    #[test]
    fn gemini_family_thinking_config_has_a_default_budget() {
        let cache = SignatureCache::new(8);
        let mut req = request(vec![Message { role: Role::User, content: MessageContent::Text("hi".to_string()) }]);
        req.thinking = Some(ccrelay_protocol::claude::ThinkingConfig { r#type: ThinkingMode::Enabled, budget_tokens: None });
        let body = translate_request(&req, &cache);
        match body.generation_config.unwrap().thinking_config.unwrap() {
            ccrelay_protocol::gemini::ThinkingConfig::Gemini(config) => assert_eq!(config.thinking_budget, DEFAULT_GEMINI_THINKING_BUDGET),
            ccrelay_protocol::gemini::ThinkingConfig::Claude(_) => panic!("expected the Gemini-shaped variant"),
        }
    }

    #[test]
    fn claude_family_thinking_config_leaves_budget_optional() {
        let cache = SignatureCache::new(8);
        let mut req = request(vec![Message { role: Role::User, content: MessageContent::Text("hi".to_string()) }]);
        req.model = "claude-sonnet-4-5-20250929".to_string();
        req.thinking = Some(ccrelay_protocol::claude::ThinkingConfig { r#type: ThinkingMode::Enabled, budget_tokens: None });
        let body = translate_request(&req, &cache);
        match body.generation_config.unwrap().thinking_config.unwrap() {
            ccrelay_protocol::gemini::ThinkingConfig::Claude(config) => assert_eq!(config.thinking_budget, None),
            ccrelay_protocol::gemini::ThinkingConfig::Gemini(_) => panic!("expected the Claude-shaped variant"),
        }
    }

    #[test]
    fn claude_tool_result_preserves_anthropic_shape() {
        let cache = SignatureCache::new(8);
        let mut req = request(vec![Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: Some(ccrelay_protocol::claude::ToolResultContent::Text("42".to_string())),
                is_error: Some(false),
            }]),
        }]);
        req.model = "claude-sonnet-4-5-20250929".to_string();
        let body = translate_request(&req, &cache);
        let response = &body.contents[0].parts[0].function_response.as_ref().unwrap().response;
        assert_eq!(response["type"], "tool_result");
        assert_eq!(response["tool_use_id"], "toolu_1");
    }

    #[test]
    fn cross_family_thinking_signature_is_dropped_and_recovered() {
        let cache = SignatureCache::new(8);
        let text = "gemini authored this".to_string();
        cache.insert(thinking_block_hash(&text), "gemini-sig", ModelFamily::Gemini);

        let mut req = request(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Thinking { thinking: text, signature: Some("gemini-sig".to_string()) },
                ContentBlock::Text { text: "answer".to_string() },
            ]),
        }]);
        req.model = "claude-sonnet-4-5-20250929".to_string();

        let body = translate_request(&req, &cache);
        let thinking_part = body.contents[0].parts.iter().find(|p| p.thought == Some(true)).unwrap();
        assert_eq!(thinking_part.thought_signature, None);
        assert_eq!(thinking_part.text.as_deref(), Some(THINKING_RECOVERY_TEXT));
    }
}
