//! Claude caller -> OpenAI provider.

use mproxy_protocol::claude;
use mproxy_protocol::openai;

use crate::dispatch::{StreamEvent, StreamTranslator};

use super::{budget_to_effort, parse_arguments, unix_now};

pub fn request(req: claude::MessagesRequest) -> openai::ChatCompletionRequest {
    let mut messages: Vec<openai::ChatMessage> = Vec::new();

    if let Some(system) = &req.system {
        let text = system.joined_text();
        if !text.is_empty() {
            messages.push(openai::ChatMessage::text(openai::ChatRole::System, text));
        }
    }

    for msg in &req.messages {
        match msg.role {
            claude::Role::User => {
                let mut text = String::new();
                for block in msg.content.blocks() {
                    match block {
                        claude::ContentBlock::Text { text: t } => text.push_str(&t),
                        claude::ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            messages.push(openai::ChatMessage {
                                role: openai::ChatRole::Tool,
                                content: Some(openai::MessageContent::Text(
                                    tool_result_text(&content),
                                )),
                                name: None,
                                reasoning: None,
                                tool_calls: None,
                                tool_call_id: Some(tool_use_id),
                            });
                        }
                        _ => {}
                    }
                }
                if !text.is_empty() {
                    messages.push(openai::ChatMessage::text(openai::ChatRole::User, text));
                }
            }
            claude::Role::Assistant => {
                let mut text = String::new();
                let mut reasoning = String::new();
                let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
                for block in msg.content.blocks() {
                    match block {
                        claude::ContentBlock::Text { text: t } => text.push_str(&t),
                        claude::ContentBlock::Thinking { thinking, .. } => {
                            reasoning.push_str(&thinking)
                        }
                        claude::ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(openai::ToolCall {
                                id,
                                kind: "function".to_string(),
                                function: openai::FunctionCall {
                                    name,
                                    arguments: serde_json::to_string(&input)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            });
                        }
                        _ => {}
                    }
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
            }
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| openai::Tool {
                kind: "function".to_string(),
                function: openai::FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.input_schema.clone()),
                },
            })
            .collect()
    });

    let reasoning_effort = req.thinking.as_ref().and_then(|config| {
        if config.kind == claude::ThinkingKind::Enabled {
            Some(budget_to_effort(config.budget_tokens.unwrap_or(0) as i64).to_string())
        } else {
            None
        }
    });

    openai::ChatCompletionRequest {
        model: req.model,
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: None,
        max_completion_tokens: Some(req.max_tokens),
        stop: req.stop_sequences.map(openai::StopSequences::Many),
        stream: req.stream,
        stream_options: req.stream.filter(|s| *s).map(|_| openai::StreamOptions {
            include_usage: Some(true),
        }),
        tools,
        tool_choice: req.tool_choice.as_ref().map(map_tool_choice),
        reasoning_effort,
        extra: Default::default(),
    }
}

fn tool_result_text(content: &Option<serde_json::Value>) -> String {
    match content {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn map_tool_choice(choice: &serde_json::Value) -> serde_json::Value {
    match choice.get("type").and_then(|t| t.as_str()) {
        Some("any") => serde_json::json!("required"),
        Some("none") => serde_json::json!("none"),
        Some("tool") => {
            let name = choice.get("name").and_then(|n| n.as_str()).unwrap_or_default();
            serde_json::json!({"type": "function", "function": {"name": name}})
        }
        _ => serde_json::json!("auto"),
    }
}

pub fn response(resp: openai::ChatCompletionResponse) -> claude::MessagesResponse {
    let choice = resp.choices.into_iter().next();
    let mut content: Vec<claude::ContentBlock> = Vec::new();
    let mut stop_reason = None;

    if let Some(choice) = choice {
        if let Some(reasoning) = choice.message.reasoning.filter(|r| !r.is_empty()) {
            content.push(claude::ContentBlock::Thinking {
                thinking: reasoning,
                signature: None,
            });
        }
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            content.push(claude::ContentBlock::Text { text });
        }
        for call in choice.message.tool_calls.into_iter().flatten() {
            content.push(claude::ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_arguments(&call.function.arguments),
            });
        }
        stop_reason = choice.finish_reason.map(map_finish_reason);
    }

    let usage = resp.usage.unwrap_or_default();
    claude::MessagesResponse {
        id: resp.id,
        kind: "message".to_string(),
        role: claude::Role::Assistant,
        model: resp.model,
        content,
        stop_reason,
        stop_sequence: None,
        usage: claude::Usage {
            input_tokens: Some(usage.prompt_tokens),
            output_tokens: Some(usage.completion_tokens),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        },
    }
}

pub(crate) fn map_finish_reason(reason: openai::FinishReason) -> claude::StopReason {
    match reason {
        openai::FinishReason::Stop => claude::StopReason::EndTurn,
        openai::FinishReason::Length => claude::StopReason::MaxTokens,
        openai::FinishReason::ToolCalls | openai::FinishReason::FunctionCall => {
            claude::StopReason::ToolUse
        }
        openai::FinishReason::ContentFilter => claude::StopReason::Refusal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(u32),
    Thinking(u32),
}

/// OpenAI upstream chunks -> Claude events.
///
/// Mirrors the block-index bookkeeping Claude clients expect: one
/// message_start, content blocks opened lazily, tool-call chunks keyed by
/// their OpenAI index.
#[derive(Debug)]
pub struct OpenAiToClaudeStream {
    id: String,
    model: String,
    message_started: bool,
    finish_emitted: bool,
    pending_finish: Option<claude::StopReason>,
    next_block_index: u32,
    open_block: Option<OpenBlock>,
    tool_blocks: std::collections::BTreeMap<i64, u32>,
    usage: claude::Usage,
}

impl OpenAiToClaudeStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{:x}", unix_now()),
            model: model.to_string(),
            message_started: false,
            finish_emitted: false,
            pending_finish: None,
            next_block_index: 0,
            open_block: None,
            tool_blocks: Default::default(),
            usage: claude::Usage::default(),
        }
    }

    fn ensure_message_start(&mut self, events: &mut Vec<StreamEvent>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        events.push(StreamEvent::Claude(claude::StreamEvent::MessageStart {
            message: claude::StreamMessage {
                id: self.id.clone(),
                kind: "message".to_string(),
                role: claude::Role::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: claude::Usage::default(),
            },
        }));
    }

    fn open_text_block(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some(OpenBlock::Text(index)) = self.open_block {
            return index;
        }
        self.close_open_block(events);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some(OpenBlock::Text(index));
        events.push(StreamEvent::Claude(claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::ContentBlock::Text {
                text: String::new(),
            },
        }));
        index
    }

    fn open_thinking_block(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some(OpenBlock::Thinking(index)) = self.open_block {
            return index;
        }
        self.close_open_block(events);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some(OpenBlock::Thinking(index));
        events.push(StreamEvent::Claude(claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        }));
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(block) = self.open_block.take() {
            let index = match block {
                OpenBlock::Text(index) | OpenBlock::Thinking(index) => index,
            };
            events.push(StreamEvent::Claude(claude::StreamEvent::ContentBlockStop {
                index,
            }));
        }
    }

    fn close_all_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_open_block(events);
        let tool_blocks = std::mem::take(&mut self.tool_blocks);
        for (_, index) in tool_blocks {
            events.push(StreamEvent::Claude(claude::StreamEvent::ContentBlockStop {
                index,
            }));
        }
    }

    fn emit_finish(&mut self, events: &mut Vec<StreamEvent>) {
        if self.finish_emitted {
            return;
        }
        self.finish_emitted = true;
        self.close_all_blocks(events);
        events.push(StreamEvent::Claude(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(self.pending_finish.take().unwrap_or(claude::StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: Some(self.usage.clone()),
        }));
        events.push(StreamEvent::Claude(claude::StreamEvent::MessageStop));
    }
}

impl StreamTranslator for OpenAiToClaudeStream {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let StreamEvent::OpenAI(chunk) = event else {
            return Vec::new();
        };
        let mut events = Vec::new();

        if !self.message_started && !chunk.id.is_empty() {
            self.id = chunk.id.clone();
        }
        self.ensure_message_start(&mut events);

        if let Some(usage) = &chunk.usage {
            self.usage = claude::Usage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            };
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(reasoning) = choice.delta.reasoning.as_deref().filter(|r| !r.is_empty()) {
                let index = self.open_thinking_block(&mut events);
                events.push(StreamEvent::Claude(claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::BlockDelta::ThinkingDelta {
                        thinking: reasoning.to_string(),
                    },
                }));
            }
            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                let index = self.open_text_block(&mut events);
                events.push(StreamEvent::Claude(claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::BlockDelta::TextDelta {
                        text: text.to_string(),
                    },
                }));
            }
            for call in choice.delta.tool_calls.iter().flatten() {
                let block_index = match self.tool_blocks.get(&call.index).copied() {
                    Some(index) => index,
                    None => {
                        self.close_open_block(&mut events);
                        let index = self.next_block_index;
                        self.next_block_index += 1;
                        self.tool_blocks.insert(call.index, index);
                        let id = call
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("toolu_{}", call.index));
                        let name = call
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_else(|| "tool".to_string());
                        events.push(StreamEvent::Claude(
                            claude::StreamEvent::ContentBlockStart {
                                index,
                                content_block: claude::ContentBlock::ToolUse {
                                    id,
                                    name,
                                    input: serde_json::Value::Object(Default::default()),
                                },
                            },
                        ));
                        index
                    }
                };
                if let Some(arguments) = call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_deref())
                    .filter(|a| !a.is_empty())
                {
                    events.push(StreamEvent::Claude(
                        claude::StreamEvent::ContentBlockDelta {
                            index: block_index,
                            delta: claude::BlockDelta::InputJsonDelta {
                                partial_json: arguments.to_string(),
                            },
                        },
                    ));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.pending_finish = Some(map_finish_reason(reason));
            }
        }

        // A usage-only trailer (empty choices) follows the finish chunk when
        // stream_options.include_usage is set; emit the tail once both the
        // finish reason and usage have arrived.
        if self.pending_finish.is_some() && (chunk.usage.is_some() || chunk.choices.is_empty()) {
            self.emit_finish(&mut events);
        }

        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.message_started {
            self.emit_finish(&mut events);
        }
        events
    }
}
