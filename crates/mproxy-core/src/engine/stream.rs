//! Streaming bootstrap and the producer/consumer pump.
//!
//! Nothing is handed to the caller until the upstream yields its first
//! decodable event; until then the engine is free to retry on a sibling
//! client. Once the first event is in, the stream belongs to that client.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use mproxy_provider_core::{
    ByteStream, InFlightGuard, SharedClient, UpstreamFailure, UpstreamTransportErrorKind,
};
use mproxy_transform::{
    content_type_for_stream, encode_openai_done, encode_stream_event, stream_translator, Proto,
    StreamDecoder, StreamEvent, StreamTranslator,
};

use crate::state::AppState;

use super::{GenerateOutcome, RouteBinding};

/// Output channel depth; the upstream read pauses when the caller lags this
/// far behind.
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[allow(clippy::too_many_arguments)]
pub(super) async fn bootstrap_stream(
    state: Arc<AppState>,
    caller: Proto,
    provider_proto: Proto,
    binding: RouteBinding,
    client: SharedClient,
    upstream_model: String,
    mut rx: ByteStream,
    in_flight: InFlightGuard,
) -> Result<GenerateOutcome, UpstreamFailure> {
    let mut decoder = StreamDecoder::new(provider_proto);
    let mut first_events: Vec<StreamEvent> = Vec::new();

    // Bootstrap window: no bytes have been flushed downstream yet.
    loop {
        match rx.recv().await {
            Some(chunk) => {
                first_events.extend(decoder.push_bytes(&chunk));
                if !first_events.is_empty() {
                    break;
                }
            }
            None => {
                first_events.extend(decoder.finish());
                if first_events.is_empty() {
                    return Err(UpstreamFailure::Transport {
                        kind: UpstreamTransportErrorKind::Other,
                        message: "upstream stream ended before the first event".to_string(),
                    });
                }
                break;
            }
        }
    }

    let translator = stream_translator(provider_proto, caller, &binding.model);
    let (tx, out_rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);

    let pump_binding = binding.clone();
    tokio::spawn(async move {
        // Holds the in-flight slot for the stream's whole lifetime.
        let _in_flight = in_flight;
        pump(
            state,
            caller,
            pump_binding,
            client,
            upstream_model,
            decoder,
            translator,
            first_events,
            rx,
            tx,
        )
        .await;
    });

    Ok(GenerateOutcome::Stream {
        binding,
        content_type: content_type_for_stream(caller),
        body: out_rx,
    })
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    state: Arc<AppState>,
    caller: Proto,
    binding: RouteBinding,
    client: SharedClient,
    upstream_model: String,
    mut decoder: StreamDecoder,
    mut translator: Box<dyn StreamTranslator>,
    first_events: Vec<StreamEvent>,
    mut rx: ByteStream,
    tx: mpsc::Sender<Bytes>,
) {
    let mut usage: (u64, u64) = (0, 0);
    let mut caller_gone = false;

    for event in first_events {
        if !forward(caller, &mut translator, event, &tx, &mut usage).await {
            caller_gone = true;
            break;
        }
    }

    if !caller_gone && !decoder.done() {
        while let Some(chunk) = rx.recv().await {
            let mut stop = false;
            for event in decoder.push_bytes(&chunk) {
                if !forward(caller, &mut translator, event, &tx, &mut usage).await {
                    caller_gone = true;
                    stop = true;
                    break;
                }
            }
            if stop || decoder.done() {
                break;
            }
        }
    }

    if !caller_gone {
        for event in decoder.finish() {
            if !forward(caller, &mut translator, event, &tx, &mut usage).await {
                caller_gone = true;
                break;
            }
        }
    }

    if !caller_gone {
        for event in translator.finish() {
            note_usage(&event, &mut usage);
            if let Some(bytes) = encode_stream_event(caller, &event)
                && tx.send(bytes).await.is_err()
            {
                caller_gone = true;
                break;
            }
        }
    }

    if !caller_gone && caller == Proto::OpenAI {
        let _ = tx.send(encode_openai_done()).await;
    }

    state.usage.record_success(
        &binding.provider,
        &client.client_id,
        &binding.model,
        usage.0,
        usage.1,
    );
    tracing::info!(
        provider = %binding.provider,
        client = %binding.client_label,
        model = %binding.model,
        upstream_model = %upstream_model,
        caller_gone,
        "stream completed"
    );
}

/// Translate one upstream event and flush the caller-dialect frames.
/// Returns false once the caller has gone away.
async fn forward(
    caller: Proto,
    translator: &mut Box<dyn StreamTranslator>,
    event: StreamEvent,
    tx: &mpsc::Sender<Bytes>,
    usage: &mut (u64, u64),
) -> bool {
    for out in translator.on_event(event) {
        note_usage(&out, usage);
        if let Some(bytes) = encode_stream_event(caller, &out)
            && tx.send(bytes).await.is_err()
        {
            return false;
        }
    }
    true
}

/// Usage carried on the translated caller events; the last value wins.
fn note_usage(event: &StreamEvent, usage: &mut (u64, u64)) {
    match event {
        StreamEvent::OpenAI(chunk) => {
            if let Some(u) = &chunk.usage {
                *usage = (u.prompt_tokens, u.completion_tokens);
            }
        }
        StreamEvent::Claude(mproxy_protocol::claude::StreamEvent::MessageDelta {
            usage: Some(u),
            ..
        }) => {
            *usage = (u.input_tokens.unwrap_or(0), u.output_tokens.unwrap_or(0));
        }
        StreamEvent::Gemini(resp) => {
            if let Some(u) = &resp.usage_metadata {
                *usage = (
                    u.prompt_token_count.unwrap_or(0),
                    u.candidates_token_count.unwrap_or(0) + u.thoughts_token_count.unwrap_or(0),
                );
            }
        }
        _ => {}
    }
}
