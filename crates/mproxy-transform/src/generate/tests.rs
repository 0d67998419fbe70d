use mproxy_protocol::{claude, gemini, openai};
use serde_json::json;

use crate::dispatch::{
    stream_translator, transform_request, transform_response, GenerateRequest, GenerateResponse,
    Proto, StreamEvent,
};

fn openai_request_with_tools() -> openai::ChatCompletionRequest {
    serde_json::from_value(json!({
        "model": "claude-sonnet-4-5",
        "messages": [
            {"role": "system", "content": "be terse"},
            {"role": "user", "content": "what's the weather in Paris?"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "type": "function",
                 "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_1", "content": "18C, sunny"},
        ],
        "tools": [
            {"type": "function", "function": {
                "name": "get_weather",
                "description": "weather lookup",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            }}
        ],
        "max_tokens": 512
    }))
    .unwrap()
}

#[test]
fn openai_to_claude_request_maps_roles_tools_and_system() {
    let req = super::openai2claude::request(openai_request_with_tools());
    assert_eq!(req.model, "claude-sonnet-4-5");
    assert_eq!(req.max_tokens, 512);
    assert_eq!(
        req.system.as_ref().map(|s| s.joined_text()).as_deref(),
        Some("be terse")
    );
    assert_eq!(req.messages.len(), 3);

    let assistant_blocks = req.messages[1].content.blocks();
    match &assistant_blocks[0] {
        claude::ContentBlock::ToolUse { name, input, .. } => {
            assert_eq!(name, "get_weather");
            assert_eq!(input["city"], "Paris");
        }
        other => panic!("unexpected block: {other:?}"),
    }
    let result_blocks = req.messages[2].content.blocks();
    assert!(matches!(
        &result_blocks[0],
        claude::ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "call_1"
    ));
    assert_eq!(req.tools.as_ref().unwrap()[0].name, "get_weather");
}

#[test]
fn openai_claude_openai_round_trip_preserves_tool_calls() {
    // openai request -> claude and back; then a claude response -> openai.
    let original = openai_request_with_tools();
    let as_claude = super::openai2claude::request(original.clone());
    let back = super::claude2openai::request(as_claude);

    assert_eq!(back.model, original.model);
    let original_roles: Vec<_> = original.messages.iter().map(|m| m.role).collect();
    let back_roles: Vec<_> = back.messages.iter().map(|m| m.role).collect();
    assert_eq!(back_roles, original_roles);
    let call = &back.messages[2].tool_calls.as_ref().unwrap()[0];
    assert_eq!(call.function.name, "get_weather");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&call.function.arguments).unwrap()["city"],
        "Paris"
    );
    assert_eq!(back.messages[3].content_text(), "18C, sunny");
}

#[test]
fn claude_response_to_openai_maps_thinking_to_reasoning() {
    let resp = claude::MessagesResponse {
        id: "msg_1".to_string(),
        kind: "message".to_string(),
        role: claude::Role::Assistant,
        model: "claude-sonnet-4-5".to_string(),
        content: vec![
            claude::ContentBlock::Thinking {
                thinking: "considering".to_string(),
                signature: None,
            },
            claude::ContentBlock::Text {
                text: "hello".to_string(),
            },
        ],
        stop_reason: Some(claude::StopReason::EndTurn),
        stop_sequence: None,
        usage: claude::Usage {
            input_tokens: Some(10),
            output_tokens: Some(5),
            ..Default::default()
        },
    };
    let out = super::openai2claude::response(resp);
    let message = &out.choices[0].message;
    assert_eq!(message.content.as_deref(), Some("hello"));
    assert_eq!(message.reasoning.as_deref(), Some("considering"));
    assert_eq!(out.choices[0].finish_reason, Some(openai::FinishReason::Stop));
    assert_eq!(out.usage.as_ref().unwrap().total_tokens, 15);
}

#[test]
fn openai_to_gemini_request_carries_thinking_budget_from_effort() {
    let mut req = openai_request_with_tools();
    req.model = "gemini-2.5-pro".to_string();
    req.reasoning_effort = Some("medium".to_string());
    let (model, body) = super::openai2gemini::request(req);
    assert_eq!(model, "gemini-2.5-pro");
    let budget = body
        .generation_config
        .unwrap()
        .thinking_config
        .unwrap()
        .thinking_budget;
    assert_eq!(budget, Some(8192));
    let decls = body.tools.unwrap()[0]
        .function_declarations
        .clone()
        .unwrap();
    assert_eq!(decls[0].name, "get_weather");
}

#[test]
fn gemini_request_to_claude_preserves_thinking_blocks() {
    let body = gemini::GenerateContentRequest {
        contents: vec![gemini::Content {
            role: Some("model".to_string()),
            parts: vec![
                gemini::Part::thought_text("step one", Some("sig".to_string())),
                gemini::Part::text("done"),
            ],
        }],
        generation_config: Some(gemini::GenerationConfig {
            thinking_config: Some(gemini::ThinkingConfig {
                thinking_budget: Some(4096),
                include_thoughts: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let req = super::gemini2claude::request("claude-sonnet-4-5", body);
    let blocks = req.messages[0].content.blocks();
    assert!(matches!(
        &blocks[0],
        claude::ContentBlock::Thinking { signature, .. } if signature.as_deref() == Some("sig")
    ));
    assert_eq!(req.thinking.unwrap().budget_tokens, Some(4096));
}

#[test]
fn dispatch_rejects_nothing_on_diagonal() {
    let req = GenerateRequest::OpenAI(openai_request_with_tools());
    let out = transform_request(Proto::OpenAI, req).unwrap();
    assert!(matches!(out, GenerateRequest::OpenAI(_)));
}

#[test]
fn dispatch_translates_gemini_response_for_openai_caller() {
    let resp = gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: Some(gemini::Content::text("model", "bonjour")),
            finish_reason: Some(gemini::FinishReason::Stop),
            index: Some(0),
        }],
        ..Default::default()
    };
    let out = transform_response(Proto::OpenAI, "gemini-2.5-pro", GenerateResponse::Gemini(resp))
        .unwrap();
    match out {
        GenerateResponse::OpenAI(resp) => {
            assert_eq!(resp.choices[0].message.content.as_deref(), Some("bonjour"));
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

fn claude_text_stream() -> Vec<claude::StreamEvent> {
    vec![
        claude::StreamEvent::MessageStart {
            message: claude::StreamMessage {
                id: "msg_s".to_string(),
                kind: "message".to_string(),
                role: claude::Role::Assistant,
                model: "claude-sonnet-4-5".to_string(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: claude::Usage::default(),
            },
        },
        claude::StreamEvent::ContentBlockStart {
            index: 0,
            content_block: claude::ContentBlock::Text {
                text: String::new(),
            },
        },
        claude::StreamEvent::ContentBlockDelta {
            index: 0,
            delta: claude::BlockDelta::TextDelta {
                text: "hel".to_string(),
            },
        },
        claude::StreamEvent::ContentBlockDelta {
            index: 0,
            delta: claude::BlockDelta::TextDelta {
                text: "lo".to_string(),
            },
        },
        claude::StreamEvent::ContentBlockStop { index: 0 },
        claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(claude::StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(claude::Usage {
                input_tokens: Some(3),
                output_tokens: Some(2),
                ..Default::default()
            }),
        },
        claude::StreamEvent::MessageStop,
    ]
}

#[test]
fn claude_stream_to_openai_chunks_assembles_text_and_finish() {
    let mut translator = stream_translator(Proto::Claude, Proto::OpenAI, "claude-sonnet-4-5");
    let mut chunks: Vec<openai::ChatCompletionChunk> = Vec::new();
    for event in claude_text_stream() {
        for out in translator.on_event(StreamEvent::Claude(event)) {
            match out {
                StreamEvent::OpenAI(chunk) => chunks.push(chunk),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
    chunks.extend(translator.finish().into_iter().map(|e| match e {
        StreamEvent::OpenAI(chunk) => chunk,
        other => panic!("unexpected event: {other:?}"),
    }));

    let text: String = chunks
        .iter()
        .filter_map(|c| c.choices.first())
        .filter_map(|c| c.delta.content.clone())
        .collect();
    assert_eq!(text, "hello");

    let last = chunks.last().unwrap();
    assert_eq!(
        last.choices[0].finish_reason,
        Some(openai::FinishReason::Stop)
    );
    assert_eq!(last.usage.as_ref().unwrap().total_tokens, 5);
    // Exactly one finish chunk.
    let finish_count = chunks
        .iter()
        .filter(|c| c.choices.first().is_some_and(|ch| ch.finish_reason.is_some()))
        .count();
    assert_eq!(finish_count, 1);
}

#[test]
fn openai_stream_to_claude_buffers_tool_fragments() {
    let mut translator = stream_translator(Proto::OpenAI, Proto::Claude, "m");
    let mk = |delta: serde_json::Value, finish: Option<&str>| -> openai::ChatCompletionChunk {
        serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "m",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        }))
        .unwrap()
    };

    let mut events: Vec<claude::StreamEvent> = Vec::new();
    let inputs = vec![
        mk(json!({"role": "assistant"}), None),
        mk(
            json!({"tool_calls": [{"index": 0, "id": "call_9",
                "function": {"name": "lookup", "arguments": "{\"ci"}}]}),
            None,
        ),
        mk(
            json!({"tool_calls": [{"index": 0,
                "function": {"arguments": "ty\":\"Paris\"}"}}]}),
            None,
        ),
        mk(json!({}), Some("tool_calls")),
    ];
    for chunk in inputs {
        for out in translator.on_event(StreamEvent::OpenAI(chunk)) {
            match out {
                StreamEvent::Claude(ev) => events.push(ev),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
    for out in translator.finish() {
        match out {
            StreamEvent::Claude(ev) => events.push(ev),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    let started = events.iter().any(|e| {
        matches!(e, claude::StreamEvent::ContentBlockStart {
            content_block: claude::ContentBlock::ToolUse { id, name, .. }, ..
        } if id == "call_9" && name == "lookup")
    });
    assert!(started, "missing tool_use block start: {events:?}");

    let partials: String = events
        .iter()
        .filter_map(|e| match e {
            claude::StreamEvent::ContentBlockDelta {
                delta: claude::BlockDelta::InputJsonDelta { partial_json },
                ..
            } => Some(partial_json.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(partials, "{\"city\":\"Paris\"}");

    assert!(matches!(
        events.last(),
        Some(claude::StreamEvent::MessageStop)
    ));
    let stop_reason = events.iter().find_map(|e| match e {
        claude::StreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
        _ => None,
    });
    assert_eq!(stop_reason, Some(claude::StopReason::ToolUse));
}

#[test]
fn openai_stream_to_gemini_emits_complete_function_call() {
    let mut translator = stream_translator(Proto::OpenAI, Proto::Gemini, "m");
    let mk = |delta: serde_json::Value, finish: Option<&str>| -> openai::ChatCompletionChunk {
        serde_json::from_value(json!({
            "id": "chatcmpl-2",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "m",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        }))
        .unwrap()
    };

    let mut chunks: Vec<gemini::GenerateContentResponse> = Vec::new();
    let inputs = vec![
        mk(
            json!({"tool_calls": [{"index": 0, "id": "call_1",
                "function": {"name": "lookup", "arguments": "{\"q\":"}}]}),
            None,
        ),
        mk(
            json!({"tool_calls": [{"index": 0, "function": {"arguments": "\"x\"}"}}]}),
            None,
        ),
        mk(json!({}), Some("tool_calls")),
    ];
    for chunk in inputs {
        for out in translator.on_event(StreamEvent::OpenAI(chunk)) {
            match out {
                StreamEvent::Gemini(c) => chunks.push(c),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
    for out in translator.finish() {
        match out {
            StreamEvent::Gemini(c) => chunks.push(c),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    let call = chunks
        .iter()
        .flat_map(|c| c.candidates.iter())
        .flat_map(|c| c.content.iter())
        .flat_map(|c| c.parts.iter())
        .find_map(|p| p.function_call.as_ref())
        .expect("functionCall part missing");
    assert_eq!(call.name, "lookup");
    assert_eq!(call.args.as_ref().unwrap()["q"], "x");
}

#[test]
fn gemini_stream_to_claude_opens_and_closes_thinking_blocks() {
    let mut translator = stream_translator(Proto::Gemini, Proto::Claude, "gemini-2.5-pro");
    let thought = gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: Some(gemini::Content {
                role: Some("model".to_string()),
                parts: vec![gemini::Part::thought_text("mulling", None)],
            }),
            finish_reason: None,
            index: Some(0),
        }],
        ..Default::default()
    };
    let answer = gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: Some(gemini::Content::text("model", "result")),
            finish_reason: Some(gemini::FinishReason::Stop),
            index: Some(0),
        }],
        ..Default::default()
    };

    let mut events: Vec<claude::StreamEvent> = Vec::new();
    for chunk in [thought, answer] {
        for out in translator.on_event(StreamEvent::Gemini(chunk)) {
            match out {
                StreamEvent::Claude(ev) => events.push(ev),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    // thinking block start, delta, stop, then text block start, delta.
    let kinds: Vec<&'static str> = events
        .iter()
        .map(|e| e.event_name())
        .collect();
    assert_eq!(kinds[0], "message_start");
    assert!(kinds.contains(&"content_block_stop"));
    let thinking_delta = events.iter().any(|e| {
        matches!(
            e,
            claude::StreamEvent::ContentBlockDelta {
                delta: claude::BlockDelta::ThinkingDelta { .. },
                ..
            }
        )
    });
    assert!(thinking_delta);
    assert!(matches!(
        events.last(),
        Some(claude::StreamEvent::MessageStop)
    ));
}
