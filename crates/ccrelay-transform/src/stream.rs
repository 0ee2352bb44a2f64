//! Drives the Anthropic SSE event sequence from a series of upstream Google
//! `GenerateContentResponse` chunks (SPEC_FULL.md §4.E): id/model tracking,
//! `message_start` gating, per-part dispatch, running text/tool-argument
//! buffers, and the thinking/signature content-block transition table.

use ccrelay_protocol::claude::{
    ContentBlock, ContentBlockDelta, ContentBlockDeltaPayload, ContentBlockStartPayload,
    ContentBlockStopPayload, CreateMessageResponse, MessageDeltaFields, MessageDeltaPayload,
    MessageDeltaUsage, MessageStartPayload, StopReason, StreamEvent, Usage,
};
use ccrelay_protocol::gemini::{FinishReason, GenerateContentResponse, Part};

use crate::request::thinking_block_hash;
use crate::signature_cache::{model_family, ModelFamily, SignatureCache};

/// Signatures shorter than this are upstream sentinels, not real signatures;
/// they're emitted on the wire but never cached.
const SIGNATURE_SENTINEL_MAX_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    None,
    Thinking { buffered_signature: Option<String>, text: String },
    Text,
    ToolUse,
}

pub struct StreamTranslator<'a> {
    id: String,
    model: String,
    family: ModelFamily,
    cache: &'a SignatureCache,
    message_started: bool,
    emitted_any_block: bool,
    emitted_tool_use: bool,
    next_index: u32,
    open: OpenBlock,
    output_tokens: u32,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl<'a> StreamTranslator<'a> {
    pub fn new(id: impl Into<String>, model: impl Into<String>, cache: &'a SignatureCache) -> Self {
        let model = model.into();
        let family = model_family(&model);
        Self {
            id: id.into(),
            model,
            family,
            cache,
            message_started: false,
            emitted_any_block: false,
            emitted_tool_use: false,
            next_index: 0,
            open: OpenBlock::None,
            output_tokens: 0,
            stop_reason: None,
            finished: false,
        }
    }

    /// Feeds one upstream chunk, returning the Anthropic events it produces.
    pub fn push(&mut self, response: &GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_message_start(&mut events);

        if let Some(usage) = response.usage_metadata {
            self.output_tokens = usage.candidates_token_count.unwrap_or(self.output_tokens);
        }

        let Some(candidate) = response.candidates.first() else {
            return events;
        };

        for part in &candidate.content.parts {
            self.handle_part(part, &mut events);
        }

        if let Some(reason) = candidate.finish_reason {
            self.stop_reason = Some(if self.emitted_tool_use { StopReason::ToolUse } else { map_finish_reason(reason) });
        }

        events
    }

    /// Closes any open block and emits the trailing `message_delta` /
    /// `message_stop` pair. Call once after the upstream stream ends.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut events = Vec::new();
        self.ensure_message_start(&mut events);

        if !self.emitted_any_block {
            self.open_block(OpenBlock::Text, &mut events);
            events.push(StreamEvent::ContentBlockDelta(ContentBlockDeltaPayload {
                index: self.next_index - 1,
                delta: ContentBlockDelta::TextDelta { text: "[empty upstream response]".to_string() },
            }));
        }
        self.close_open_block(&mut events);

        let stop_reason = if self.emitted_tool_use { StopReason::ToolUse } else { self.stop_reason.unwrap_or(StopReason::EndTurn) };
        events.push(StreamEvent::MessageDelta(MessageDeltaPayload {
            delta: MessageDeltaFields { stop_reason: Some(stop_reason), stop_sequence: None },
            usage: MessageDeltaUsage { output_tokens: self.output_tokens },
        }));
        events.push(StreamEvent::MessageStop);
        events
    }

    fn ensure_message_start(&mut self, events: &mut Vec<StreamEvent>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        let message = CreateMessageResponse::new(self.id.clone(), self.model.clone(), Vec::new(), Usage { input_tokens: 0, output_tokens: 0, cache_read_input_tokens: None });
        events.push(StreamEvent::MessageStart(MessageStartPayload { message }));
    }

    fn handle_part(&mut self, part: &Part, events: &mut Vec<StreamEvent>) {
        if part.function_call.is_some() {
            self.emitted_tool_use = true;
            self.transition_to_tool_use(events);
            let call = part.function_call.as_ref().unwrap();
            let args = call.args.clone().unwrap_or_else(|| serde_json::json!({}));
            events.push(StreamEvent::ContentBlockDelta(ContentBlockDeltaPayload {
                index: self.next_index - 1,
                delta: ContentBlockDelta::InputJsonDelta { partial_json: args.to_string() },
            }));
            return;
        }

        if part.thought == Some(true) {
            self.transition_to_thinking(events);
            if let Some(text) = &part.text {
                if let OpenBlock::Thinking { text: buffer, .. } = &mut self.open {
                    buffer.push_str(text);
                }
                events.push(StreamEvent::ContentBlockDelta(ContentBlockDeltaPayload {
                    index: self.next_index - 1,
                    delta: ContentBlockDelta::ThinkingDelta { thinking: text.clone() },
                }));
            }
            if let Some(signature) = &part.thought_signature
                && let OpenBlock::Thinking { buffered_signature, .. } = &mut self.open
            {
                *buffered_signature = Some(signature.clone());
            }
            return;
        }

        if let Some(text) = &part.text {
            self.transition_to_text(events);
            events.push(StreamEvent::ContentBlockDelta(ContentBlockDeltaPayload {
                index: self.next_index - 1,
                delta: ContentBlockDelta::TextDelta { text: text.clone() },
            }));
        }
    }

    fn transition_to_thinking(&mut self, events: &mut Vec<StreamEvent>) {
        if matches!(self.open, OpenBlock::Thinking { .. }) {
            return;
        }
        self.close_open_block(events);
        self.open_block(OpenBlock::Thinking { buffered_signature: None, text: String::new() }, events);
    }

    fn transition_to_text(&mut self, events: &mut Vec<StreamEvent>) {
        if matches!(self.open, OpenBlock::Text) {
            return;
        }
        self.close_open_block(events);
        self.open_block(OpenBlock::Text, events);
    }

    fn transition_to_tool_use(&mut self, events: &mut Vec<StreamEvent>) {
        // A new functionCall part always closes a prior tool_use block and
        // opens a fresh one — the upstream never streams partial args for
        // the same call across chunks (§4.H: "upstream delivers complete
        // args").
        self.close_open_block(events);
        self.open_block(OpenBlock::ToolUse, events);
    }

    fn open_block(&mut self, block: OpenBlock, events: &mut Vec<StreamEvent>) {
        let index = self.next_index;
        self.next_index += 1;
        self.emitted_any_block = true;
        let placeholder = match &block {
            OpenBlock::Thinking { .. } => ContentBlock::Thinking { thinking: String::new(), signature: None },
            OpenBlock::Text => ContentBlock::Text { text: String::new() },
            OpenBlock::ToolUse => ContentBlock::ToolUse { id: format!("toolu_{index}"), name: String::new(), input: serde_json::json!({}) },
            OpenBlock::None => return,
        };
        events.push(StreamEvent::ContentBlockStart(ContentBlockStartPayload { index, content_block: placeholder }));
        self.open = block;
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        let index = self.next_index.saturating_sub(1);
        match std::mem::replace(&mut self.open, OpenBlock::None) {
            OpenBlock::None => return,
            OpenBlock::Thinking { buffered_signature, text } => {
                if let Some(signature) = buffered_signature {
                    if signature.len() >= SIGNATURE_SENTINEL_MAX_LEN {
                        self.cache.insert(thinking_block_hash(&text), signature.clone(), self.family);
                    }
                    events.push(StreamEvent::ContentBlockDelta(ContentBlockDeltaPayload {
                        index,
                        delta: ContentBlockDelta::SignatureDelta { signature },
                    }));
                }
            }
            OpenBlock::Text | OpenBlock::ToolUse => {}
        }
        events.push(StreamEvent::ContentBlockStop(ContentBlockStopPayload { index }));
    }
}

fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::MaxTokens => StopReason::MaxTokens,
        FinishReason::MalformedFunctionCall => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_protocol::gemini::{Candidate, Content, ContentRole};

    fn chunk(parts: Vec<Part>, finish_reason: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate { content: Content { parts, role: Some(ContentRole::Model) }, finish_reason, index: Some(0) }],
            usage_metadata: None,
            model_version: None,
        }
    }

    #[test]
    fn thinking_then_text_emits_signature_delta_before_close() {
        let cache = SignatureCache::new(8);
        let mut translator = StreamTranslator::new("msg_1", "gemini-2", &cache);

        let thinking_part = Part::thought("planning");
        let mut thinking_part_2 = Part::thought(" more");
        thinking_part_2.thought_signature = Some("x".repeat(60));
        let text_part = Part::text("answer");

        let mut events = translator.push(&chunk(vec![thinking_part, thinking_part_2], Some(FinishReason::Stop)));
        events.extend(translator.push(&chunk(vec![text_part], None)));
        events.extend(translator.finish());

        let names: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn short_signature_is_sentinel_and_not_cached() {
        let cache = SignatureCache::new(8);
        let mut translator = StreamTranslator::new("msg_2", "gemini-2", &cache);
        let mut part = Part::thought("short thought");
        part.thought_signature = Some("short".to_string());
        translator.push(&chunk(vec![part], Some(FinishReason::Stop)));
        translator.finish();
        assert!(cache.get(&thinking_block_hash("short thought")).is_none());
    }

    #[test]
    fn empty_stream_yields_placeholder_text_block() {
        let cache = SignatureCache::new(8);
        let mut translator = StreamTranslator::new("msg_3", "gemini-2", &cache);
        let events = translator.finish();
        let has_placeholder = events.iter().any(|e| {
            matches!(e, StreamEvent::ContentBlockDelta(payload) if matches!(&payload.delta, ContentBlockDelta::TextDelta { text } if text.contains("empty")))
        });
        assert!(has_placeholder);
    }

    #[test]
    fn tool_use_emits_single_input_json_delta() {
        let cache = SignatureCache::new(8);
        let mut translator = StreamTranslator::new("msg_4", "gemini-2", &cache);
        let mut part = Part::default();
        part.function_call = Some(ccrelay_protocol::gemini::FunctionCall {
            id: Some("call_1".to_string()),
            name: "lookup".to_string(),
            args: Some(serde_json::json!({"q": "x"})),
        });
        let events = translator.push(&chunk(vec![part], Some(FinishReason::Stop)));
        let deltas: Vec<&ContentBlockDelta> = events
            .iter()
            .filter_map(|e| if let StreamEvent::ContentBlockDelta(p) = e { Some(&p.delta) } else { None })
            .collect();
        assert_eq!(deltas.len(), 1);
        assert!(matches!(deltas[0], ContentBlockDelta::InputJsonDelta { .. }));

        let closing = translator.finish();
        let stop_reason = closing.iter().find_map(|e| match e {
            StreamEvent::MessageDelta(payload) => payload.delta.stop_reason,
            _ => None,
        });
        assert_eq!(stop_reason, Some(StopReason::ToolUse));
    }
}
