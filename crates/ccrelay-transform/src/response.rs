//! Google → Anthropic unary response translation (SPEC_FULL.md §4.D).
//! Grounded on `claude2gemini/response.rs::transform_response` and its
//! `map_content_to_blocks`/`map_finish_reason`/`map_usage` helpers.

use ccrelay_protocol::claude::{ContentBlock, CreateMessageResponse, StopReason, Usage};
use ccrelay_protocol::gemini::{FinishReason, GenerateContentResponse, Part};

use crate::request::thinking_block_hash;
use crate::signature_cache::{model_family, ModelFamily, SignatureCache};

pub fn translate_response(
    response: &GenerateContentResponse,
    id: String,
    model: String,
    cache: &SignatureCache,
) -> CreateMessageResponse {
    let family = model_family(&model);
    let candidate = response.candidates.first();

    let content = candidate.map(|c| map_parts_to_blocks(&c.content.parts, cache, family)).unwrap_or_default();
    let has_tool_use = content.iter().any(|block| matches!(block, ContentBlock::ToolUse { .. }));
    let stop_reason = if has_tool_use { Some(StopReason::ToolUse) } else { candidate.and_then(|c| c.finish_reason).map(map_finish_reason) };
    let usage = map_usage(response);

    let mut message = CreateMessageResponse::new(id, model, content, usage);
    message.stop_reason = stop_reason;
    message
}

fn map_parts_to_blocks(parts: &[Part], cache: &SignatureCache, family: ModelFamily) -> Vec<ContentBlock> {
    parts.iter().map(|part| map_part_to_block(part, cache, family)).collect()
}

fn map_part_to_block(part: &Part, cache: &SignatureCache, family: ModelFamily) -> ContentBlock {
    if let Some(call) = &part.function_call {
        return ContentBlock::ToolUse {
            id: call.id.clone().unwrap_or_else(|| call.name.clone()),
            name: call.name.clone(),
            input: call.args.clone().unwrap_or_else(|| serde_json::json!({})),
        };
    }

    if part.thought == Some(true) {
        let text = part.text.clone().unwrap_or_default();
        if let Some(signature) = &part.thought_signature {
            cache.insert(thinking_block_hash(&text), signature.clone(), family);
        }
        return ContentBlock::Thinking { thinking: text, signature: part.thought_signature.clone() };
    }

    if let Some(text) = &part.text {
        return ContentBlock::Text { text: text.clone() };
    }

    if let Some(blob) = &part.inline_data {
        return ContentBlock::Text { text: format!("[inline_data:{}]", blob.mime_type) };
    }

    ContentBlock::Text { text: String::new() }
}

/// Falls back to the raw finish reason only when no `tool_use` block was
/// produced — a real tool call finishes with `FinishReason::Stop`, so the
/// caller must check content first (SPEC_FULL.md §4.D).
fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::MaxTokens => StopReason::MaxTokens,
        FinishReason::MalformedFunctionCall => StopReason::ToolUse,
        FinishReason::Stop | FinishReason::Unspecified | FinishReason::Safety | FinishReason::Recitation | FinishReason::Other => {
            StopReason::EndTurn
        }
    }
}

fn map_usage(response: &GenerateContentResponse) -> Usage {
    let usage = response.usage_metadata.unwrap_or_default();
    let cached = usage.cached_content_token_count.unwrap_or(0);
    Usage {
        input_tokens: usage.prompt_token_count.unwrap_or(0).saturating_sub(cached),
        output_tokens: usage.candidates_token_count.unwrap_or(0),
        cache_read_input_tokens: usage.cached_content_token_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_protocol::gemini::{Candidate, Content, ContentRole, FunctionCall, UsageMetadata};

    fn gemini_response(parts: Vec<Part>, finish_reason: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { parts, role: Some(ContentRole::Model) },
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(10),
                candidates_token_count: Some(20),
                thoughts_token_count: Some(5),
                ..Default::default()
            }),
            model_version: None,
        }
    }

    #[test]
    fn maps_text_part_to_text_block() {
        let cache = SignatureCache::new(8);
        let response = gemini_response(vec![Part::text("hello")], Some(FinishReason::Stop));
        let message = translate_response(&response, "msg_1".to_string(), "gemini-2".to_string(), &cache);
        assert_eq!(message.content, vec![ContentBlock::Text { text: "hello".to_string() }]);
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn maps_function_call_to_tool_use_even_on_ordinary_stop() {
        // Successful tool calls finish with `Stop`, not `MalformedFunctionCall`.
        let cache = SignatureCache::new(8);
        let mut part = Part::default();
        part.function_call = Some(FunctionCall { id: Some("call_1".to_string()), name: "lookup".to_string(), args: Some(serde_json::json!({"q": "x"})) });
        let response = gemini_response(vec![part], Some(FinishReason::Stop));
        let message = translate_response(&response, "msg_2".to_string(), "gemini-2".to_string(), &cache);
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn usage_excludes_thoughts_and_subtracts_cached_tokens() {
        let cache = SignatureCache::new(8);
        let mut response = gemini_response(vec![Part::text("hi")], Some(FinishReason::Stop));
        response.usage_metadata = Some(UsageMetadata {
            prompt_token_count: Some(10),
            candidates_token_count: Some(20),
            thoughts_token_count: Some(5),
            cached_content_token_count: Some(4),
            ..Default::default()
        });
        let message = translate_response(&response, "msg_2b".to_string(), "gemini-2".to_string(), &cache);
        assert_eq!(message.usage.input_tokens, 6);
        assert_eq!(message.usage.output_tokens, 20);
    }

    #[test]
    fn thinking_part_with_signature_is_cached_for_later_restoration() {
        let cache = SignatureCache::new(8);
        let mut part = Part::thought("let me think");
        part.thought_signature = Some("sig-xyz".to_string());
        let response = gemini_response(vec![part], Some(FinishReason::Stop));
        translate_response(&response, "msg_3".to_string(), "gemini-2".to_string(), &cache);
        let restored = cache.get(&thinking_block_hash("let me think"));
        assert_eq!(restored, Some(("sig-xyz".to_string(), ModelFamily::Gemini)));
    }
}
