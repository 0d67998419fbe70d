//! Claude caller -> Gemini provider.

use std::collections::HashMap;

use mproxy_protocol::claude;
use mproxy_protocol::gemini;

use crate::dispatch::{StreamEvent, StreamTranslator};

use super::unix_now;

pub fn request(req: claude::MessagesRequest) -> (String, gemini::GenerateContentRequest) {
    let mut contents: Vec<gemini::Content> = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    for msg in &req.messages {
        let role = match msg.role {
            claude::Role::User => "user",
            claude::Role::Assistant => "model",
        };
        let mut parts: Vec<gemini::Part> = Vec::new();
        for block in msg.content.blocks() {
            match block {
                claude::ContentBlock::Text { text } => parts.push(gemini::Part::text(text)),
                claude::ContentBlock::Thinking {
                    thinking,
                    signature,
                } => parts.push(gemini::Part::thought_text(thinking, signature)),
                claude::ContentBlock::RedactedThinking { .. } => {}
                claude::ContentBlock::ToolUse { id, name, input } => {
                    call_names.insert(id, name.clone());
                    parts.push(gemini::Part {
                        function_call: Some(gemini::FunctionCall {
                            name,
                            args: Some(input),
                        }),
                        ..Default::default()
                    });
                }
                claude::ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    let name = call_names
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| "tool".to_string());
                    parts.push(gemini::Part {
                        function_response: Some(gemini::FunctionResponse {
                            name,
                            response: serde_json::json!({
                                "result": content.unwrap_or(serde_json::Value::Null),
                            }),
                        }),
                        ..Default::default()
                    });
                }
                claude::ContentBlock::Image { .. } => {}
            }
        }
        if !parts.is_empty() {
            contents.push(gemini::Content {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        vec![gemini::Tool {
            function_declarations: Some(
                tools
                    .iter()
                    .map(|tool| gemini::FunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(tool.input_schema.clone()),
                    })
                    .collect(),
            ),
            extra: Default::default(),
        }]
    });

    let thinking_config = req.thinking.as_ref().and_then(|config| {
        if config.kind == claude::ThinkingKind::Enabled {
            Some(gemini::ThinkingConfig {
                thinking_budget: config.budget_tokens.map(|b| b as i64),
                include_thoughts: Some(true),
            })
        } else {
            None
        }
    });

    let generation_config = gemini::GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_output_tokens: Some(req.max_tokens),
        stop_sequences: req.stop_sequences.clone(),
        thinking_config,
        extra: Default::default(),
    };

    let body = gemini::GenerateContentRequest {
        contents,
        system_instruction: req.system.as_ref().map(|system| gemini::Content {
            role: None,
            parts: vec![gemini::Part::text(system.joined_text())],
        }),
        tools,
        tool_config: None,
        generation_config: Some(generation_config),
        safety_settings: None,
        extra: Default::default(),
    };

    (req.model, body)
}

pub fn response(model: &str, resp: gemini::GenerateContentResponse) -> claude::MessagesResponse {
    let mut content: Vec<claude::ContentBlock> = Vec::new();
    let mut stop_reason = None;
    let mut tool_seq = 0usize;

    if let Some(candidate) = resp.candidates.first() {
        if let Some(candidate_content) = &candidate.content {
            for part in &candidate_content.parts {
                if let Some(text) = &part.text {
                    if part.thought == Some(true) {
                        content.push(claude::ContentBlock::Thinking {
                            thinking: text.clone(),
                            signature: part.thought_signature.clone(),
                        });
                    } else {
                        content.push(claude::ContentBlock::Text { text: text.clone() });
                    }
                }
                if let Some(call) = &part.function_call {
                    content.push(claude::ContentBlock::ToolUse {
                        id: format!("toolu_{tool_seq}"),
                        name: call.name.clone(),
                        input: call.args.clone().unwrap_or_else(|| {
                            serde_json::Value::Object(Default::default())
                        }),
                    });
                    tool_seq += 1;
                }
            }
        }
        stop_reason = candidate.finish_reason.map(map_finish_reason);
    }
    if tool_seq > 0 {
        stop_reason = Some(claude::StopReason::ToolUse);
    }

    let usage = resp
        .usage_metadata
        .as_ref()
        .map(|usage| claude::Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: Some(
                usage.candidates_token_count.unwrap_or(0)
                    + usage.thoughts_token_count.unwrap_or(0),
            ),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        })
        .unwrap_or_default();

    claude::MessagesResponse {
        id: resp
            .response_id
            .map(|id| format!("msg_{id}"))
            .unwrap_or_else(|| format!("msg_{:x}", unix_now())),
        kind: "message".to_string(),
        role: claude::Role::Assistant,
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        content,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

pub(crate) fn map_finish_reason(reason: gemini::FinishReason) -> claude::StopReason {
    match reason {
        gemini::FinishReason::Stop => claude::StopReason::EndTurn,
        gemini::FinishReason::MaxTokens => claude::StopReason::MaxTokens,
        gemini::FinishReason::Safety | gemini::FinishReason::Recitation => {
            claude::StopReason::Refusal
        }
        gemini::FinishReason::MalformedFunctionCall | gemini::FinishReason::Other => {
            claude::StopReason::EndTurn
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Text,
    Thinking,
}

/// Gemini upstream chunks -> Claude events.
///
/// Gemini delivers complete function calls in one part; they are surfaced in
/// Claude's convention: an empty tool_use block start, one input_json_delta
/// carrying the whole argument object, then the block stop.
#[derive(Debug)]
pub struct GeminiToClaudeStream {
    id: String,
    model: String,
    message_started: bool,
    finish_emitted: bool,
    pending_finish: Option<claude::StopReason>,
    next_block_index: u32,
    open_block: Option<(u32, OpenKind)>,
    saw_tool_use: bool,
    usage: claude::Usage,
}

impl GeminiToClaudeStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{:x}", unix_now()),
            model: model.to_string(),
            message_started: false,
            finish_emitted: false,
            pending_finish: None,
            next_block_index: 0,
            open_block: None,
            saw_tool_use: false,
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

    fn open_block(&mut self, kind: OpenKind, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some((index, open_kind)) = self.open_block
            && open_kind == kind
        {
            return index;
        }
        self.close_block(events);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some((index, kind));
        let content_block = match kind {
            OpenKind::Text => claude::ContentBlock::Text {
                text: String::new(),
            },
            OpenKind::Thinking => claude::ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        };
        events.push(StreamEvent::Claude(claude::StreamEvent::ContentBlockStart {
            index,
            content_block,
        }));
        index
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some((index, _)) = self.open_block.take() {
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
        self.close_block(events);
        let stop_reason = if self.saw_tool_use {
            claude::StopReason::ToolUse
        } else {
            self.pending_finish.take().unwrap_or(claude::StopReason::EndTurn)
        };
        events.push(StreamEvent::Claude(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: Some(self.usage.clone()),
        }));
        events.push(StreamEvent::Claude(claude::StreamEvent::MessageStop));
    }
}

impl StreamTranslator for GeminiToClaudeStream {
    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let StreamEvent::Gemini(resp) = event else {
            return Vec::new();
        };
        let mut events = Vec::new();

        if !self.message_started {
            if let Some(id) = &resp.response_id {
                self.id = format!("msg_{id}");
            }
            if let Some(version) = &resp.model_version {
                self.model = version.clone();
            }
        }
        self.ensure_message_start(&mut events);

        if let Some(usage) = &resp.usage_metadata {
            self.usage = claude::Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: Some(
                    usage.candidates_token_count.unwrap_or(0)
                        + usage.thoughts_token_count.unwrap_or(0),
                ),
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            };
        }

        if let Some(candidate) = resp.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = part.text.as_deref().filter(|t| !t.is_empty()) {
                        if part.thought == Some(true) {
                            let index = self.open_block(OpenKind::Thinking, &mut events);
                            events.push(StreamEvent::Claude(
                                claude::StreamEvent::ContentBlockDelta {
                                    index,
                                    delta: claude::BlockDelta::ThinkingDelta {
                                        thinking: text.to_string(),
                                    },
                                },
                            ));
                            if let Some(signature) = &part.thought_signature {
                                events.push(StreamEvent::Claude(
                                    claude::StreamEvent::ContentBlockDelta {
                                        index,
                                        delta: claude::BlockDelta::SignatureDelta {
                                            signature: signature.clone(),
                                        },
                                    },
                                ));
                            }
                        } else {
                            let index = self.open_block(OpenKind::Text, &mut events);
                            events.push(StreamEvent::Claude(
                                claude::StreamEvent::ContentBlockDelta {
                                    index,
                                    delta: claude::BlockDelta::TextDelta {
                                        text: text.to_string(),
                                    },
                                },
                            ));
                        }
                    }
                    if let Some(call) = &part.function_call {
                        self.close_block(&mut events);
                        self.saw_tool_use = true;
                        let index = self.next_block_index;
                        self.next_block_index += 1;
                        events.push(StreamEvent::Claude(
                            claude::StreamEvent::ContentBlockStart {
                                index,
                                content_block: claude::ContentBlock::ToolUse {
                                    id: format!("toolu_{index}"),
                                    name: call.name.clone(),
                                    input: serde_json::Value::Object(Default::default()),
                                },
                            },
                        ));
                        let args = call
                            .args
                            .clone()
                            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
                        events.push(StreamEvent::Claude(
                            claude::StreamEvent::ContentBlockDelta {
                                index,
                                delta: claude::BlockDelta::InputJsonDelta {
                                    partial_json: serde_json::to_string(&args)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            },
                        ));
                        events.push(StreamEvent::Claude(
                            claude::StreamEvent::ContentBlockStop { index },
                        ));
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.pending_finish = Some(map_finish_reason(reason));
                self.emit_finish(&mut events);
            }
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
