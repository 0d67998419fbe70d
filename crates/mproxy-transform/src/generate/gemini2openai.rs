//! Gemini caller -> OpenAI provider.

use mproxy_protocol::gemini;
use mproxy_protocol::openai;

use crate::dispatch::{StreamEvent, StreamTranslator};

use super::{budget_to_effort, parse_arguments};

pub fn request(model: &str, body: gemini::GenerateContentRequest) -> openai::ChatCompletionRequest {
    let mut messages: Vec<openai::ChatMessage> = Vec::new();

    if let Some(system) = &body.system_instruction {
        let text = system.joined_text();
        if !text.is_empty() {
            messages.push(openai::ChatMessage::text(openai::ChatRole::System, text));
        }
    }

    let mut call_seq = 0usize;
    for content in &body.contents {
        let is_model = content.role.as_deref() == Some("model");
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
        for part in &content.parts {
            if let Some(part_text) = &part.text {
                if part.thought == Some(true) {
                    reasoning.push_str(part_text);
                } else {
                    text.push_str(part_text);
                }
            }
            if let Some(call) = &part.function_call {
                tool_calls.push(openai::ToolCall {
                    id: format!("call_{call_seq}"),
                    kind: "function".to_string(),
                    function: openai::FunctionCall {
                        name: call.name.clone(),
                        arguments: serde_json::to_string(
                            call.args.as_ref().unwrap_or(&serde_json::Value::Null),
                        )
                        .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
                call_seq += 1;
            }
            if let Some(resp) = &part.function_response {
                messages.push(openai::ChatMessage {
                    role: openai::ChatRole::Tool,
                    content: Some(openai::MessageContent::Text(
                        serde_json::to_string(&resp.response)
                            .unwrap_or_else(|_| "{}".to_string()),
                    )),
                    name: Some(resp.name.clone()),
                    reasoning: None,
                    tool_calls: None,
                    tool_call_id: Some(format!("call_{}", call_seq.saturating_sub(1))),
                });
            }
        }

        if is_model {
            if text.is_empty() && reasoning.is_empty() && tool_calls.is_empty() {
                continue;
            }
            messages.push(openai::ChatMessage {
                role: openai::ChatRole::Assistant,
                content: if text.is_empty() {
                    None
                } else {
                    Some(openai::MessageContent::Text(text))
                },
                name: None,
                reasoning: if reasoning.is_empty() {
                    None
                } else {
                    Some(reasoning)
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        } else if !text.is_empty() {
            messages.push(openai::ChatMessage::text(openai::ChatRole::User, text));
        }
    }

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|tool| tool.function_declarations.iter().flatten())
            .map(|decl| openai::Tool {
                kind: "function".to_string(),
                function: openai::FunctionDef {
                    name: decl.name.clone(),
                    description: decl.description.clone(),
                    parameters: decl.parameters.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    let generation = body.generation_config.as_ref();
    let reasoning_effort = generation
        .and_then(|config| config.thinking_config.as_ref())
        .and_then(|thinking| thinking.thinking_budget)
        .filter(|budget| *budget > 0)
        .map(|budget| budget_to_effort(budget).to_string());

    openai::ChatCompletionRequest {
        model: model.to_string(),
        messages,
        temperature: generation.and_then(|c| c.temperature),
        top_p: generation.and_then(|c| c.top_p),
        max_tokens: None,
        max_completion_tokens: generation.and_then(|c| c.max_output_tokens),
        stop: generation
            .and_then(|c| c.stop_sequences.clone())
            .map(openai::StopSequences::Many),
        stream: None,
        stream_options: None,
        tools,
        tool_choice: None,
        reasoning_effort,
        extra: Default::default(),
    }
}

pub fn response(resp: openai::ChatCompletionResponse) -> gemini::GenerateContentResponse {
    let mut parts: Vec<gemini::Part> = Vec::new();
    let mut finish_reason = None;

    if let Some(choice) = resp.choices.into_iter().next() {
        if let Some(reasoning) = choice.message.reasoning.filter(|r| !r.is_empty()) {
            parts.push(gemini::Part::thought_text(reasoning, None));
        }
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            parts.push(gemini::Part::text(text));
        }
        for call in choice.message.tool_calls.into_iter().flatten() {
            parts.push(gemini::Part {
                function_call: Some(gemini::FunctionCall {
                    name: call.function.name,
                    args: Some(parse_arguments(&call.function.arguments)),
                }),
                ..Default::default()
            });
        }
        finish_reason = choice.finish_reason.map(map_finish_reason);
    }

    let usage_metadata = resp.usage.map(|usage| gemini::UsageMetadata {
        prompt_token_count: Some(usage.prompt_tokens),
        candidates_token_count: Some(usage.completion_tokens),
        thoughts_token_count: None,
        total_token_count: Some(usage.total_tokens),
    });

    gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: Some(gemini::Content {
                role: Some("model".to_string()),
                parts,
            }),
            finish_reason,
            index: Some(0),
        }],
        usage_metadata,
        model_version: Some(resp.model),
        response_id: Some(resp.id),
    }
}

pub(crate) fn map_finish_reason(reason: openai::FinishReason) -> gemini::FinishReason {
    match reason {
        openai::FinishReason::Stop => gemini::FinishReason::Stop,
        openai::FinishReason::Length => gemini::FinishReason::MaxTokens,
        openai::FinishReason::ContentFilter => gemini::FinishReason::Safety,
        openai::FinishReason::ToolCalls | openai::FinishReason::FunctionCall => {
            gemini::FinishReason::Stop
        }
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// OpenAI upstream chunks -> Gemini chunks.
///
/// OpenAI streams tool-call arguments as JSON fragments; Gemini callers
/// expect a complete functionCall object, so fragments are buffered per call
/// index and flushed once the upstream closes the call.
#[derive(Debug)]
pub struct OpenAiToGeminiStream {
    model: Option<String>,
    response_id: Option<String>,
    pending_tools: std::collections::BTreeMap<i64, PendingToolCall>,
    usage: Option<gemini::UsageMetadata>,
    pending_finish: Option<gemini::FinishReason>,
    finish_emitted: bool,
}

impl OpenAiToGeminiStream {
    pub fn new() -> Self {
        Self {
            model: None,
            response_id: None,
            pending_tools: Default::default(),
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

    fn flush_tools(&mut self) -> Vec<gemini::Part> {
        let pending = std::mem::take(&mut self.pending_tools);
        pending
            .into_values()
            .map(|call| gemini::Part {
                function_call: Some(gemini::FunctionCall {
                    name: call.name,
                    args: Some(parse_arguments(&call.arguments)),
                }),
                ..Default::default()
            })
            .collect()
    }

    fn final_chunk(&mut self) -> Option<gemini::GenerateContentResponse> {
        if self.finish_emitted {
            return None;
        }
        self.finish_emitted = true;
        let parts = self.flush_tools();
        let finish = self.pending_finish.take().unwrap_or(gemini::FinishReason::Stop);
        let usage = self.usage.take();
        Some(self.chunk_with_parts(parts, Some(finish), usage))
    }
}

impl Default for OpenAiToGeminiStream {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for OpenAiToGeminiStream {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let StreamEvent::OpenAI(chunk) = event else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if self.model.is_none() && !chunk.model.is_empty() {
            self.model = Some(chunk.model.clone());
        }
        if self.response_id.is_none() && !chunk.id.is_empty() {
            self.response_id = Some(chunk.id.clone());
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(gemini::UsageMetadata {
                prompt_token_count: Some(usage.prompt_tokens),
                candidates_token_count: Some(usage.completion_tokens),
                thoughts_token_count: None,
                total_token_count: Some(usage.total_tokens),
            });
        }

        let mut finish_now = false;
        if let Some(choice) = chunk.choices.first() {
            let mut parts: Vec<gemini::Part> = Vec::new();
            if let Some(reasoning) = choice.delta.reasoning.as_deref().filter(|r| !r.is_empty()) {
                parts.push(gemini::Part::thought_text(reasoning, None));
            }
            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                parts.push(gemini::Part::text(text));
            }
            for call in choice.delta.tool_calls.iter().flatten() {
                let entry = self.pending_tools.entry(call.index).or_default();
                if let Some(function) = &call.function {
                    if let Some(name) = &function.name {
                        entry.name = name.clone();
                    }
                    if let Some(arguments) = &function.arguments {
                        entry.arguments.push_str(arguments);
                    }
                }
            }
            if !parts.is_empty() {
                out.push(StreamEvent::Gemini(self.chunk_with_parts(parts, None, None)));
            }
            if let Some(reason) = choice.finish_reason {
                self.pending_finish = Some(map_finish_reason(reason));
                // Hold the final chunk until a trailing usage chunk, if any,
                // has had a chance to arrive.
                finish_now = chunk.usage.is_some();
            }
        } else if self.pending_finish.is_some() {
            finish_now = true;
        }

        if finish_now && let Some(chunk) = self.final_chunk() {
            out.push(StreamEvent::Gemini(chunk));
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
