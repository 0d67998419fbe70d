//! OpenAI caller -> Claude provider.

use mproxy_protocol::claude;
use mproxy_protocol::openai;

use crate::dispatch::{StreamEvent, StreamTranslator};

use super::{effort_to_budget, parse_arguments, unix_now, DEFAULT_MAX_TOKENS};

pub fn request(req: openai::ChatCompletionRequest) -> claude::MessagesRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<claude::Message> = Vec::new();

    for msg in &req.messages {
        match msg.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                let text = msg.content_text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            openai::ChatRole::User => {
                messages.push(claude::Message {
                    role: claude::Role::User,
                    content: claude::MessageContent::Text(msg.content_text()),
                });
            }
            openai::ChatRole::Assistant => {
                let mut blocks: Vec<claude::ContentBlock> = Vec::new();
                if let Some(reasoning) = &msg.reasoning
                    && !reasoning.is_empty()
                {
                    blocks.push(claude::ContentBlock::Thinking {
                        thinking: reasoning.clone(),
                        signature: None,
                    });
                }
                let text = msg.content_text();
                if !text.is_empty() {
                    blocks.push(claude::ContentBlock::Text { text });
                }
                for call in msg.tool_calls.iter().flatten() {
                    blocks.push(claude::ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: parse_arguments(&call.function.arguments),
                    });
                }
                messages.push(claude::Message {
                    role: claude::Role::Assistant,
                    content: claude::MessageContent::Blocks(blocks),
                });
            }
            openai::ChatRole::Tool => {
                let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
                messages.push(claude::Message {
                    role: claude::Role::User,
                    content: claude::MessageContent::Blocks(vec![
                        claude::ContentBlock::ToolResult {
                            tool_use_id,
                            content: Some(serde_json::Value::String(msg.content_text())),
                            is_error: None,
                        },
                    ]),
                });
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(claude::SystemPrompt::Text(system_parts.join("\n\n")))
    };

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| claude::ToolDef {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect()
    });

    let thinking = req
        .reasoning_effort
        .as_deref()
        .and_then(effort_to_budget)
        .map(|budget| claude::ThinkingConfig {
            kind: claude::ThinkingKind::Enabled,
            budget_tokens: Some(budget),
        });

    claude::MessagesRequest {
        model: req.model,
        max_tokens: req
            .max_completion_tokens
            .or(req.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        stop_sequences: req.stop.map(|s| s.into_vec()),
        stream: req.stream,
        tools,
        tool_choice: req.tool_choice.as_ref().map(map_tool_choice),
        thinking,
        extra: Default::default(),
    }
}

fn map_tool_choice(choice: &serde_json::Value) -> serde_json::Value {
    match choice {
        serde_json::Value::String(s) => match s.as_str() {
            "required" => serde_json::json!({"type": "any"}),
            "none" => serde_json::json!({"type": "none"}),
            _ => serde_json::json!({"type": "auto"}),
        },
        serde_json::Value::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            serde_json::json!({"type": "tool", "name": name})
        }
        _ => serde_json::json!({"type": "auto"}),
    }
}

pub fn response(resp: claude::MessagesResponse) -> openai::ChatCompletionResponse {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();

    for block in &resp.content {
        match block {
            claude::ContentBlock::Text { text } => content.push_str(text),
            claude::ContentBlock::Thinking { thinking, .. } => reasoning.push_str(thinking),
            claude::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = resp.stop_reason.map(map_stop_reason);
    let usage = openai::Usage {
        prompt_tokens: resp.usage.input_tokens.unwrap_or(0),
        completion_tokens: resp.usage.output_tokens.unwrap_or(0),
        total_tokens: resp.usage.input_tokens.unwrap_or(0) + resp.usage.output_tokens.unwrap_or(0),
    };

    openai::ChatCompletionResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model,
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
        usage: Some(usage),
    }
}

fn map_stop_reason(reason: claude::StopReason) -> openai::FinishReason {
    match reason {
        claude::StopReason::EndTurn | claude::StopReason::StopSequence => {
            openai::FinishReason::Stop
        }
        claude::StopReason::MaxTokens => openai::FinishReason::Length,
        claude::StopReason::ToolUse => openai::FinishReason::ToolCalls,
        claude::StopReason::Refusal => openai::FinishReason::ContentFilter,
    }
}

/// Claude upstream events -> OpenAI chat chunks.
#[derive(Debug)]
pub struct ClaudeToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    /// Claude block index -> OpenAI tool-call index.
    tool_indices: std::collections::BTreeMap<u32, i64>,
    next_tool_index: i64,
    pending_finish: Option<openai::FinishReason>,
    finish_emitted: bool,
    usage: Option<openai::Usage>,
}

impl ClaudeToOpenAiStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{:x}", unix_now()),
            model: model.to_string(),
            created: unix_now(),
            role_sent: false,
            tool_indices: Default::default(),
            next_tool_index: 0,
            pending_finish: None,
            finish_emitted: false,
            usage: None,
        }
    }

    fn chunk(&self) -> openai::ChatCompletionChunk {
        openai::ChatCompletionChunk::new(self.id.clone(), self.created, self.model.clone())
    }

    fn delta_chunk(&mut self, delta: openai::ChatDelta) -> openai::ChatCompletionChunk {
        let mut chunk = self.chunk();
        let mut delta = delta;
        if !self.role_sent {
            delta.role = Some(openai::ChatRole::Assistant);
            self.role_sent = true;
        }
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
        let mut chunk = self.chunk();
        chunk.choices.push(openai::ChunkChoice {
            index: 0,
            delta: openai::ChatDelta::default(),
            finish_reason: Some(self.pending_finish.take().unwrap_or(openai::FinishReason::Stop)),
        });
        chunk.usage = self.usage.take();
        Some(chunk)
    }
}

impl StreamTranslator for ClaudeToOpenAiStream {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let StreamEvent::Claude(event) = event else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.id = message.id;
                if !message.model.is_empty() {
                    self.model = message.model;
                }
                let chunk = self.delta_chunk(openai::ChatDelta::default());
                out.push(StreamEvent::OpenAI(chunk));
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let claude::ContentBlock::ToolUse { id, name, .. } = content_block {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(index, tool_index);
                    let chunk = self.delta_chunk(openai::ChatDelta {
                        tool_calls: Some(vec![openai::ToolCallChunk {
                            index: tool_index,
                            id: Some(id),
                            kind: Some("function".to_string()),
                            function: Some(openai::FunctionCallChunk {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..Default::default()
                    });
                    out.push(StreamEvent::OpenAI(chunk));
                }
            }
            claude::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                claude::BlockDelta::TextDelta { text } => {
                    let chunk = self.delta_chunk(openai::ChatDelta {
                        content: Some(text),
                        ..Default::default()
                    });
                    out.push(StreamEvent::OpenAI(chunk));
                }
                claude::BlockDelta::ThinkingDelta { thinking } => {
                    let chunk = self.delta_chunk(openai::ChatDelta {
                        reasoning: Some(thinking),
                        ..Default::default()
                    });
                    out.push(StreamEvent::OpenAI(chunk));
                }
                claude::BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool_index) = self.tool_indices.get(&index).copied() {
                        let chunk = self.delta_chunk(openai::ChatDelta {
                            tool_calls: Some(vec![openai::ToolCallChunk {
                                index: tool_index,
                                id: None,
                                kind: None,
                                function: Some(openai::FunctionCallChunk {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                            }]),
                            ..Default::default()
                        });
                        out.push(StreamEvent::OpenAI(chunk));
                    }
                }
                claude::BlockDelta::SignatureDelta { .. } => {}
            },
            claude::StreamEvent::ContentBlockStop { .. } => {}
            claude::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    let prompt = usage.input_tokens.unwrap_or(0);
                    let completion = usage.output_tokens.unwrap_or(0);
                    self.usage = Some(openai::Usage {
                        prompt_tokens: prompt,
                        completion_tokens: completion,
                        total_tokens: prompt + completion,
                    });
                }
                if let Some(reason) = delta.stop_reason {
                    self.pending_finish = Some(map_stop_reason(reason));
                }
            }
            claude::StreamEvent::MessageStop => {
                if let Some(chunk) = self.finish_chunk() {
                    out.push(StreamEvent::OpenAI(chunk));
                }
            }
            claude::StreamEvent::Ping | claude::StreamEvent::Error { .. } => {}
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
