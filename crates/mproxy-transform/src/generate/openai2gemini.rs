//! OpenAI caller -> Gemini provider.

use std::collections::HashMap;

use mproxy_protocol::gemini;
use mproxy_protocol::openai;

use crate::dispatch::{StreamEvent, StreamTranslator};

use super::{arguments_string, effort_to_budget, parse_arguments, unix_now};

pub fn request(req: openai::ChatCompletionRequest) -> (String, gemini::GenerateContentRequest) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut contents: Vec<gemini::Content> = Vec::new();
    // Map assistant tool-call ids to function names for later tool replies.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for msg in &req.messages {
        match msg.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                let text = msg.content_text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            openai::ChatRole::User => {
                contents.push(gemini::Content::text("user", msg.content_text()));
            }
            openai::ChatRole::Assistant => {
                let mut parts: Vec<gemini::Part> = Vec::new();
                if let Some(reasoning) = msg.reasoning.as_deref().filter(|r| !r.is_empty()) {
                    parts.push(gemini::Part::thought_text(reasoning, None));
                }
                let text = msg.content_text();
                if !text.is_empty() {
                    parts.push(gemini::Part::text(text));
                }
                for call in msg.tool_calls.iter().flatten() {
                    call_names.insert(call.id.clone(), call.function.name.clone());
                    parts.push(gemini::Part {
                        function_call: Some(gemini::FunctionCall {
                            name: call.function.name.clone(),
                            args: Some(parse_arguments(&call.function.arguments)),
                        }),
                        ..Default::default()
                    });
                }
                contents.push(gemini::Content {
                    role: Some("model".to_string()),
                    parts,
                });
            }
            openai::ChatRole::Tool => {
                let name = msg
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
                    .or_else(|| msg.name.clone())
                    .unwrap_or_else(|| "tool".to_string());
                contents.push(gemini::Content {
                    role: Some("user".to_string()),
                    parts: vec![gemini::Part {
                        function_response: Some(gemini::FunctionResponse {
                            name,
                            response: serde_json::json!({
                                "result": msg.content_text(),
                            }),
                        }),
                        ..Default::default()
                    }],
                });
            }
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        vec![gemini::Tool {
            function_declarations: Some(
                tools
                    .iter()
                    .map(|tool| gemini::FunctionDeclaration {
                        name: tool.function.name.clone(),
                        description: tool.function.description.clone(),
                        parameters: tool.function.parameters.clone(),
                    })
                    .collect(),
            ),
            extra: Default::default(),
        }]
    });

    let thinking_config = req
        .reasoning_effort
        .as_deref()
        .and_then(effort_to_budget)
        .map(|budget| gemini::ThinkingConfig {
            thinking_budget: Some(budget as i64),
            include_thoughts: Some(true),
        });

    let generation_config = gemini::GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        stop_sequences: req.stop.map(|s| s.into_vec()),
        thinking_config,
        extra: Default::default(),
    };

    let body = gemini::GenerateContentRequest {
        contents,
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(gemini::Content {
                role: None,
                parts: vec![gemini::Part::text(system_parts.join("\n\n"))],
            })
        },
        tools,
        tool_config: None,
        generation_config: Some(generation_config),
        safety_settings: None,
        extra: Default::default(),
    };

    (req.model, body)
}

pub fn response(
    model: &str,
    resp: gemini::GenerateContentResponse,
) -> openai::ChatCompletionResponse {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
    let mut finish_reason = None;

    if let Some(candidate) = resp.candidates.first() {
        if let Some(candidate_content) = &candidate.content {
            for part in &candidate_content.parts {
                if let Some(text) = &part.text {
                    if part.thought == Some(true) {
                        reasoning.push_str(text);
                    } else {
                        content.push_str(text);
                    }
                }
                if let Some(call) = &part.function_call {
                    tool_calls.push(openai::ToolCall {
                        id: format!("call_{}", tool_calls.len()),
                        kind: "function".to_string(),
                        function: openai::FunctionCall {
                            name: call.name.clone(),
                            arguments: arguments_string(&call.args),
                        },
                    });
                }
            }
        }
        finish_reason = candidate.finish_reason.map(map_finish_reason);
    }
    if !tool_calls.is_empty() {
        finish_reason = Some(openai::FinishReason::ToolCalls);
    }

    let usage = resp.usage_metadata.as_ref().map(|usage| {
        let completion = usage.candidates_token_count.unwrap_or(0)
            + usage.thoughts_token_count.unwrap_or(0);
        openai::Usage {
            prompt_tokens: usage.prompt_token_count.unwrap_or(0),
            completion_tokens: completion,
            total_tokens: usage
                .total_token_count
                .unwrap_or_else(|| usage.prompt_token_count.unwrap_or(0) + completion),
        }
    });

    openai::ChatCompletionResponse {
        id: resp
            .response_id
            .map(|id| format!("chatcmpl-{id}"))
            .unwrap_or_else(|| format!("chatcmpl-{:x}", unix_now())),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::AssistantMessage {
                role: openai::ChatRole::Assistant,
                content: if content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(content)
                },
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
            },
            finish_reason,
        }],
        usage,
    }
}

pub(crate) fn map_finish_reason(reason: gemini::FinishReason) -> openai::FinishReason {
    match reason {
        gemini::FinishReason::Stop => openai::FinishReason::Stop,
        gemini::FinishReason::MaxTokens => openai::FinishReason::Length,
        gemini::FinishReason::Safety | gemini::FinishReason::Recitation => {
            openai::FinishReason::ContentFilter
        }
        gemini::FinishReason::MalformedFunctionCall | gemini::FinishReason::Other => {
            openai::FinishReason::Stop
        }
    }
}

/// Gemini upstream chunks -> OpenAI chat chunks.
#[derive(Debug)]
pub struct GeminiToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    next_tool_index: i64,
    finish_emitted: bool,
    pending_finish: Option<openai::FinishReason>,
    usage: Option<openai::Usage>,
}

impl GeminiToOpenAiStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{:x}", unix_now()),
            model: model.to_string(),
            created: unix_now(),
            role_sent: false,
            next_tool_index: 0,
            finish_emitted: false,
            pending_finish: None,
            usage: None,
        }
    }

    fn delta_chunk(&mut self, delta: openai::ChatDelta) -> openai::ChatCompletionChunk {
        let mut delta = delta;
        if !self.role_sent {
            delta.role = Some(openai::ChatRole::Assistant);
            self.role_sent = true;
        }
        let mut chunk =
            openai::ChatCompletionChunk::new(self.id.clone(), self.created, self.model.clone());
        chunk.choices.push(openai::ChunkChoice {
            index: 0,
            delta,
            finish_reason: None,
        });
        chunk
    }

    fn finish_chunk(&mut self) -> Option<openai::ChatCompletionChunk> {
        if self.finish_emitted {
            return None;
        }
        self.finish_emitted = true;
        let mut chunk =
            openai::ChatCompletionChunk::new(self.id.clone(), self.created, self.model.clone());
        chunk.choices.push(openai::ChunkChoice {
            index: 0,
            delta: openai::ChatDelta::default(),
            finish_reason: Some(self.pending_finish.take().unwrap_or(openai::FinishReason::Stop)),
        });
        chunk.usage = self.usage.take();
        Some(chunk)
    }
}

impl StreamTranslator for GeminiToOpenAiStream {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let StreamEvent::Gemini(resp) = event else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if let Some(id) = &resp.response_id {
            self.id = format!("chatcmpl-{id}");
        }
        if let Some(version) = &resp.model_version {
            self.model = version.clone();
        }
        if let Some(usage) = &resp.usage_metadata {
            let completion = usage.candidates_token_count.unwrap_or(0)
                + usage.thoughts_token_count.unwrap_or(0);
            self.usage = Some(openai::Usage {
                prompt_tokens: usage.prompt_token_count.unwrap_or(0),
                completion_tokens: completion,
                total_tokens: usage
                    .total_token_count
                    .unwrap_or_else(|| usage.prompt_token_count.unwrap_or(0) + completion),
            });
        }

        let mut saw_tool_call = false;
        if let Some(candidate) = resp.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = part.text.as_deref().filter(|t| !t.is_empty()) {
                        let delta = if part.thought == Some(true) {
                            openai::ChatDelta {
                                reasoning: Some(text.to_string()),
                                ..Default::default()
                            }
                        } else {
                            openai::ChatDelta {
                                content: Some(text.to_string()),
                                ..Default::default()
                            }
                        };
                        let chunk = self.delta_chunk(delta);
                        out.push(StreamEvent::OpenAI(chunk));
                    }
                    if let Some(call) = &part.function_call {
                        saw_tool_call = true;
                        let index = self.next_tool_index;
                        self.next_tool_index += 1;
                        let chunk = self.delta_chunk(openai::ChatDelta {
                            tool_calls: Some(vec![openai::ToolCallChunk {
                                index,
                                id: Some(format!("call_{index}")),
                                kind: Some("function".to_string()),
                                function: Some(openai::FunctionCallChunk {
                                    name: Some(call.name.clone()),
                                    arguments: Some(arguments_string(&call.args)),
                                }),
                            }]),
                            ..Default::default()
                        });
                        out.push(StreamEvent::OpenAI(chunk));
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.pending_finish = Some(if saw_tool_call || self.next_tool_index > 0 {
                    openai::FinishReason::ToolCalls
                } else {
                    map_finish_reason(reason)
                });
                if let Some(chunk) = self.finish_chunk() {
                    out.push(StreamEvent::OpenAI(chunk));
                }
            }
        }

        out
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        match self.finish_chunk() {
            Some(chunk) => vec![StreamEvent::OpenAI(chunk)],
            None => Vec::new(),
        }
    }
}
