//! Gemini caller -> Claude provider.

use mproxy_protocol::claude;
use mproxy_protocol::gemini;

use crate::dispatch::{StreamEvent, StreamTranslator};

use super::{parse_arguments, DEFAULT_MAX_TOKENS};

pub fn request(model: &str, body: gemini::GenerateContentRequest) -> claude::MessagesRequest {
    let mut messages: Vec<claude::Message> = Vec::new();
    let mut call_seq = 0usize;

    for content in &body.contents {
        let role = if content.role.as_deref() == Some("model") {
            claude::Role::Assistant
        } else {
            claude::Role::User
        };
        let mut blocks: Vec<claude::ContentBlock> = Vec::new();
        for part in &content.parts {
            if let Some(text) = &part.text {
                if part.thought == Some(true) {
                    blocks.push(claude::ContentBlock::Thinking {
                        thinking: text.clone(),
                        signature: part.thought_signature.clone(),
                    });
                } else {
                    blocks.push(claude::ContentBlock::Text { text: text.clone() });
                }
            }
            if let Some(call) = &part.function_call {
                blocks.push(claude::ContentBlock::ToolUse {
                    id: format!("toolu_{call_seq}"),
                    name: call.name.clone(),
                    input: call
                        .args
                        .clone()
                        .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
                });
                call_seq += 1;
            }
            if let Some(resp) = &part.function_response {
                blocks.push(claude::ContentBlock::ToolResult {
                    tool_use_id: format!("toolu_{}", call_seq.saturating_sub(1)),
                    content: Some(resp.response.clone()),
                    is_error: None,
                });
            }
        }
        if !blocks.is_empty() {
            messages.push(claude::Message {
                role,
                content: claude::MessageContent::Blocks(blocks),
            });
        }
    }

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|tool| tool.function_declarations.iter().flatten())
            .map(|decl| claude::ToolDef {
                name: decl.name.clone(),
                description: decl.description.clone(),
                input_schema: decl
                    .parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect::<Vec<_>>()
    });

    let generation = body.generation_config.as_ref();
    let thinking = generation
        .and_then(|config| config.thinking_config.as_ref())
        .and_then(|thinking| thinking.thinking_budget)
        .filter(|budget| *budget > 0)
        .map(|budget| claude::ThinkingConfig {
            kind: claude::ThinkingKind::Enabled,
            budget_tokens: Some(budget as u32),
        });

    claude::MessagesRequest {
        model: model.to_string(),
        max_tokens: generation
            .and_then(|c| c.max_output_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: body.system_instruction.as_ref().map(|system| {
            claude::SystemPrompt::Text(system.joined_text())
        }),
        temperature: generation.and_then(|c| c.temperature),
        top_p: generation.and_then(|c| c.top_p),
        top_k: generation.and_then(|c| c.top_k),
        stop_sequences: generation.and_then(|c| c.stop_sequences.clone()),
        stream: None,
        tools,
        tool_choice: None,
        thinking,
        extra: Default::default(),
    }
}

pub fn response(resp: claude::MessagesResponse) -> gemini::GenerateContentResponse {
    let mut parts: Vec<gemini::Part> = Vec::new();
    for block in &resp.content {
        match block {
            claude::ContentBlock::Text { text } => parts.push(gemini::Part::text(text.clone())),
            claude::ContentBlock::Thinking {
                thinking,
                signature,
            } => parts.push(gemini::Part::thought_text(thinking.clone(), signature.clone())),
            claude::ContentBlock::ToolUse { name, input, .. } => {
                parts.push(gemini::Part {
                    function_call: Some(gemini::FunctionCall {
                        name: name.clone(),
                        args: Some(input.clone()),
                    }),
                    ..Default::default()
                });
            }
            _ => {}
        }
    }

    let usage_metadata = gemini::UsageMetadata {
        prompt_token_count: resp.usage.input_tokens,
        candidates_token_count: resp.usage.output_tokens,
        thoughts_token_count: None,
        total_token_count: Some(
            resp.usage.input_tokens.unwrap_or(0) + resp.usage.output_tokens.unwrap_or(0),
        ),
    };

    gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: Some(gemini::Content {
                role: Some("model".to_string()),
                parts,
            }),
            finish_reason: resp.stop_reason.map(map_stop_reason),
            index: Some(0),
        }],
        usage_metadata: Some(usage_metadata),
        model_version: Some(resp.model),
        response_id: Some(resp.id),
    }
}

pub(crate) fn map_stop_reason(reason: claude::StopReason) -> gemini::FinishReason {
    match reason {
        claude::StopReason::EndTurn
        | claude::StopReason::StopSequence
        | claude::StopReason::ToolUse => gemini::FinishReason::Stop,
        claude::StopReason::MaxTokens => gemini::FinishReason::MaxTokens,
        claude::StopReason::Refusal => gemini::FinishReason::Safety,
    }
}

#[derive(Debug, Default)]
struct OpenToolBlock {
    name: String,
    arguments: String,
}

/// Claude upstream events -> Gemini chunks.
///
/// Claude streams tool input as JSON fragments; they are buffered per block
/// and emitted as one complete functionCall part at block stop.
#[derive(Debug)]
pub struct ClaudeToGeminiStream {
    model: Option<String>,
    response_id: Option<String>,
    tool_blocks: std::collections::BTreeMap<u32, OpenToolBlock>,
    usage: Option<gemini::UsageMetadata>,
    pending_finish: Option<gemini::FinishReason>,
    finish_emitted: bool,
}

impl ClaudeToGeminiStream {
    pub fn new() -> Self {
        Self {
            model: None,
            response_id: None,
            tool_blocks: Default::default(),
            usage: None,
            pending_finish: None,
            finish_emitted: false,
        }
    }

    fn chunk_with_parts(
        &self,
        parts: Vec<gemini::Part>,
        finish_reason: Option<gemini::FinishReason>,
        usage: Option<gemini::UsageMetadata>,
    ) -> gemini::GenerateContentResponse {
        gemini::GenerateContentResponse {
            candidates: vec![gemini::Candidate {
                content: Some(gemini::Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: usage,
            model_version: self.model.clone(),
            response_id: self.response_id.clone(),
        }
    }

    fn final_chunk(&mut self) -> Option<gemini::GenerateContentResponse> {
        if self.finish_emitted {
            return None;
        }
        self.finish_emitted = true;
        // Any tool block still open at end of stream is flushed as-is.
        let leftovers: Vec<gemini::Part> = std::mem::take(&mut self.tool_blocks)
            .into_values()
            .map(|block| gemini::Part {
                function_call: Some(gemini::FunctionCall {
                    name: block.name,
                    args: Some(parse_arguments(&block.arguments)),
                }),
                ..Default::default()
            })
            .collect();
        let finish = self.pending_finish.take().unwrap_or(gemini::FinishReason::Stop);
        let usage = self.usage.take();
        Some(self.chunk_with_parts(leftovers, Some(finish), usage))
    }
}

impl Default for ClaudeToGeminiStream {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for ClaudeToGeminiStream {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let StreamEvent::Claude(event) = event else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.response_id = Some(message.id);
                self.model = Some(message.model);
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let claude::ContentBlock::ToolUse { name, .. } = content_block {
                    self.tool_blocks.insert(
                        index,
                        OpenToolBlock {
                            name,
                            arguments: String::new(),
                        },
                    );
                }
            }
            claude::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                claude::BlockDelta::TextDelta { text } => {
                    let chunk = self.chunk_with_parts(vec![gemini::Part::text(text)], None, None);
                    out.push(StreamEvent::Gemini(chunk));
                }
                claude::BlockDelta::ThinkingDelta { thinking } => {
                    let chunk = self.chunk_with_parts(
                        vec![gemini::Part::thought_text(thinking, None)],
                        None,
                        None,
                    );
                    out.push(StreamEvent::Gemini(chunk));
                }
                claude::BlockDelta::SignatureDelta { signature } => {
                    let chunk = self.chunk_with_parts(
                        vec![gemini::Part {
                            thought: Some(true),
                            thought_signature: Some(signature),
                            ..Default::default()
                        }],
                        None,
                        None,
                    );
                    out.push(StreamEvent::Gemini(chunk));
                }
                claude::BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(block) = self.tool_blocks.get_mut(&index) {
                        block.arguments.push_str(&partial_json);
                    }
                }
            },
            claude::StreamEvent::ContentBlockStop { index } => {
                if let Some(block) = self.tool_blocks.remove(&index) {
                    let chunk = self.chunk_with_parts(
                        vec![gemini::Part {
                            function_call: Some(gemini::FunctionCall {
                                name: block.name,
                                args: Some(parse_arguments(&block.arguments)),
                            }),
                            ..Default::default()
                        }],
                        None,
                        None,
                    );
                    out.push(StreamEvent::Gemini(chunk));
                }
            }
            claude::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage = Some(gemini::UsageMetadata {
                        prompt_token_count: usage.input_tokens,
                        candidates_token_count: usage.output_tokens,
                        thoughts_token_count: None,
                        total_token_count: Some(
                            usage.input_tokens.unwrap_or(0) + usage.output_tokens.unwrap_or(0),
                        ),
                    });
                }
                if let Some(reason) = delta.stop_reason {
                    self.pending_finish = Some(map_stop_reason(reason));
                }
            }
            claude::StreamEvent::MessageStop => {
                if let Some(chunk) = self.final_chunk() {
                    out.push(StreamEvent::Gemini(chunk));
                }
            }
            claude::StreamEvent::Ping | claude::StreamEvent::Error { .. } => {}
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        match self.final_chunk() {
            Some(chunk) => vec![StreamEvent::Gemini(chunk)],
            None => Vec::new(),
        }
    }
}
