#![forbid(unsafe_code)]

//! Translation of an upstream OpenAI-style SSE token stream into the event
//! protocol served to the browser.
//!
//! The upstream body arrives in arbitrary byte chunks that routinely end
//! mid-line (and mid-UTF-8-sequence). [`SseLineDecoder`] buffers bytes and
//! yields the payload of each complete `data:` record; the relay extracts
//! the text delta, runs it through the think filter and forwards it. The
//! outbound stream always ends with exactly one [`OutboundEvent::Done`].

use anyhow::Result;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::think::ThinkFilter;

/// Raw byte chunks from an upstream streaming response.
pub type TokenStream = BoxStream<'static, Result<Bytes>>;

/// One unit of the outbound protocol: a text fragment or the terminal
/// sentinel. Serialized on the wire as `data: {"text": ...}` records
/// followed by a single `data: [DONE]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Text(String),
    Done,
}

#[derive(Serialize)]
struct TextPayload<'a> {
    text: &'a str,
}

impl OutboundEvent {
    /// The `data:` payload for this event.
    pub fn payload(&self) -> String {
        match self {
            OutboundEvent::Text(text) => serde_json::to_string(&TextPayload { text })
                .unwrap_or_else(|_| String::from("{\"text\":\"\"}")),
            OutboundEvent::Done => String::from("[DONE]"),
        }
    }
}

/// Incremental parser for newline-delimited `data:` records.
///
/// Bytes go in, complete record payloads come out; a trailing partial line
/// stays buffered for the next read. Splitting happens at the byte level so
/// a multi-byte character broken across reads is reassembled before any
/// string conversion.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one chunk and returns the payloads of every `data:` record
    /// completed by it. Non-data lines are ignored.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim();
            if let Some(payload) = line.strip_prefix("data:") {
                payloads.push(payload.trim().to_string());
            }
        }

        payloads
    }
}

/// Pulls `choices[0].delta.content` out of one record payload.
fn extract_delta(payload: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(payload).ok()?;
    parsed["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string)
}

/// Relays an upstream chat-completion stream to the client channel.
///
/// Runs until the upstream ends or errors, then always emits the single
/// terminal `Done`. A send failure means the client went away; the loop
/// stops pulling from upstream so the connection is released.
pub async fn relay_chat_stream(mut upstream: TokenStream, tx: mpsc::Sender<OutboundEvent>) {
    let mut decoder = SseLineDecoder::new();
    let mut filter = ThinkFilter::new();

    'read: while let Some(item) = upstream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                // Treated as end of stream; the response already committed
                // so the only valid move is a clean termination.
                warn!("upstream stream read failed: {err:#}");
                break;
            }
        };

        for payload in decoder.push(&chunk) {
            if payload == "[DONE]" {
                continue;
            }
            let Some(delta) = extract_delta(&payload) else {
                debug!("skipping unparseable stream record");
                continue;
            };
            if delta.is_empty() {
                continue;
            }
            let visible = filter.push(&delta);
            if visible.is_empty() {
                continue;
            }
            if tx.send(OutboundEvent::Text(visible)).await.is_err() {
                break 'read;
            }
        }
    }

    // A held-back suffix that never became a tag is still user text.
    let tail = filter.finish();
    if !tail.is_empty() {
        let _ = tx.send(OutboundEvent::Text(tail)).await;
    }
    let _ = tx.send(OutboundEvent::Done).await;
}

/// Character count per simulated chunk when replaying a complete result.
pub const REPLAY_CHUNK_CHARS: usize = 20;
/// Delay between simulated chunks, for the typing effect.
pub const REPLAY_CHUNK_DELAY_MS: u64 = 15;

/// Splits a string into fixed-size character chunks.
pub fn split_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Replays an already-complete result through the outbound protocol so both
/// engines look the same to the client: fixed-size chunks, a short delay
/// between them, one terminal `Done`.
pub async fn replay_complete_text(text: String, tx: mpsc::Sender<OutboundEvent>) {
    for chunk in split_chunks(&text, REPLAY_CHUNK_CHARS) {
        if tx.send(OutboundEvent::Text(chunk)).await.is_err() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(REPLAY_CHUNK_DELAY_MS)).await;
    }
    let _ = tx.send(OutboundEvent::Done).await;
}
