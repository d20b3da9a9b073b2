//! Server-sent events decoding for streamed chat completions.
//!
//! OpenAI-compatible endpoints stream `data: {json}` lines terminated by a
//! `data: [DONE]` sentinel. Tool calls arrive as fragments keyed by index and
//! are assembled here before being handed to the engine in one piece.

use serde::Deserialize;
use std::collections::BTreeMap;

use super::types::{StreamChunk, ToolCallRequest, Usage};

/// One line of an event stream, without its terminator.
enum Line<'a> {
    /// Blank line: dispatches the pending event.
    Blank,
    Data(&'a str),
    /// Comments (OpenRouter's ": OPENROUTER PROCESSING" keep-alives) and
    /// fields other than `data`.
    Ignored,
}

fn classify(raw: &[u8]) -> Result<Line<'_>, String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return Ok(Line::Blank);
    }
    let Some(value) = raw.strip_prefix(b"data:") else {
        return Ok(Line::Ignored);
    };
    let value = value.strip_prefix(b" ").unwrap_or(value);
    std::str::from_utf8(value)
        .map(Line::Data)
        .map_err(|e| format!("invalid UTF-8 in SSE data line: {}", e))
}

/// Reassembles `data:` payloads from arbitrarily split body chunks.
///
/// Multi-line payloads are joined with `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
}

impl SseDecoder {
    /// Feed raw bytes; returns every payload completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.accept(&line[..newline], &mut payloads)?;
        }
        Ok(payloads)
    }

    /// Flush a trailing unterminated line and any undispatched event.
    pub fn finish(mut self) -> Result<Vec<String>, String> {
        let mut payloads = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        if !rest.is_empty() {
            self.accept(&rest, &mut payloads)?;
        }
        payloads.extend(self.event.take());
        Ok(payloads)
    }

    fn accept(&mut self, raw: &[u8], payloads: &mut Vec<String>) -> Result<(), String> {
        match classify(raw)? {
            Line::Blank => payloads.extend(self.event.take()),
            Line::Data(value) => match self.event.as_mut() {
                Some(event) => {
                    event.push('\n');
                    event.push_str(value);
                }
                None => self.event = Some(value.to_owned()),
            },
            Line::Ignored => {}
        }
        Ok(())
    }
}

// ── Stream chunk wire types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChunkResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    message: String,
}

/// Result of decoding one SSE payload.
#[derive(Debug)]
pub(crate) enum Decoded {
    Chunk(StreamChunkResponse),
    Done,
}

pub(crate) fn parse_stream_payload(payload: &str) -> Result<Decoded, String> {
    let trimmed = payload.trim();
    if trimmed == "[DONE]" {
        return Ok(Decoded::Done);
    }
    if trimmed.is_empty() {
        return Ok(Decoded::Chunk(StreamChunkResponse {
            choices: Vec::new(),
            usage: None,
            error: None,
        }));
    }
    serde_json::from_str(trimmed)
        .map(Decoded::Chunk)
        .map_err(|e| format!("failed to parse streaming payload: {}", e))
}

/// In-band error reported inside a stream (OpenRouter does this after a 200).
pub(crate) fn stream_error(chunk: &StreamChunkResponse) -> Option<(u16, String)> {
    chunk.error.as_ref().map(|e| {
        let status = e
            .code
            .as_ref()
            .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500);
        (status, e.message.clone())
    })
}

/// Assembles tool-call fragments by their stream index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    by_index: BTreeMap<usize, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    fn merge(&mut self, delta: StreamToolCallDelta) {
        let entry = self.by_index.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            entry.id = Some(id);
        }
        let function = delta.function.unwrap_or_default();
        if let Some(name) = function.name.filter(|n| !n.is_empty()) {
            entry.name = Some(name);
        }
        if let Some(fragment) = function.arguments {
            entry.arguments.push_str(&fragment);
        }
    }

    /// Completed calls in index order. Calls that never received a name are dropped.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.by_index
            .into_iter()
            .filter_map(|(index, partial)| {
                let name = partial.name?;
                let id = partial.id.unwrap_or_else(|| format!("call_{}", index));
                Some(ToolCallRequest::new(id, name, partial.arguments))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

/// Turn one decoded chunk into engine-facing items.
///
/// Text and usage are emitted immediately; tool-call fragments are folded
/// into `accumulator` and only released by [`ToolCallAccumulator::finish`].
pub(crate) fn normalize_chunk(
    chunk: StreamChunkResponse,
    accumulator: &mut ToolCallAccumulator,
) -> Vec<StreamChunk> {
    let mut items = Vec::new();

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            items.push(StreamChunk::Text(content));
        }
        for delta in choice.delta.tool_calls {
            accumulator.merge(delta);
        }
        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            items.push(StreamChunk::Finished(reason));
        }
    }

    if let Some(usage) = chunk.usage {
        items.push(StreamChunk::Usage(Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }));
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_events_across_chunks() {
        let mut decoder = SseDecoder::default();
        let first = decoder.feed(b"data: {\"a\":").unwrap();
        assert!(first.is_empty());
        let second = decoder.feed(b"1}\n\n: keep-alive\n\ndata: [DONE]\n\n").unwrap();
        assert_eq!(second, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_decoder_handles_crlf_and_trailing_data() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder.feed(b"data: one\r\n\r\ndata: two").unwrap();
        assert_eq!(payloads, vec!["one".to_string()]);
        assert_eq!(decoder.finish().unwrap(), vec!["two".to_string()]);
    }

    #[test]
    fn test_multi_line_payloads_are_joined() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder
            .feed(b"event: message\ndata: first\ndata:second\n\ndata: x\n")
            .unwrap();
        assert_eq!(payloads, vec!["first\nsecond".to_string()]);
        assert_eq!(decoder.finish().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: \xff\xfe\n").is_err());
    }

    #[test]
    fn test_tool_call_fragments_are_assembled_in_index_order() {
        let mut acc = ToolCallAccumulator::default();
        let payloads = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"weather","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"calculator","arguments":"{\"expr"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ession\":\"1+1\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"{\"city\":\"Seoul\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
        ];

        let mut items = Vec::new();
        for p in payloads {
            match parse_stream_payload(p).unwrap() {
                Decoded::Chunk(chunk) => items.extend(normalize_chunk(chunk, &mut acc)),
                Decoded::Done => unreachable!(),
            }
        }

        assert_eq!(
            items,
            vec![
                StreamChunk::Finished("tool_calls".into()),
                StreamChunk::Usage(Usage {
                    prompt_tokens: 3,
                    completion_tokens: 4,
                    total_tokens: 7
                }),
            ]
        );

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].arguments().unwrap()["expression"], "1+1");
        assert_eq!(calls[1].name, "weather");
        assert_eq!(calls[1].arguments().unwrap()["city"], "Seoul");
    }

    #[test]
    fn test_text_deltas_and_done_sentinel() {
        let mut acc = ToolCallAccumulator::default();
        let Decoded::Chunk(chunk) =
            parse_stream_payload(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap()
        else {
            panic!("expected chunk");
        };
        assert_eq!(normalize_chunk(chunk, &mut acc), vec![StreamChunk::Text("Hel".into())]);
        assert!(matches!(parse_stream_payload(" [DONE] ").unwrap(), Decoded::Done));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_in_band_error_is_detected() {
        let Decoded::Chunk(chunk) =
            parse_stream_payload(r#"{"error":{"code":429,"message":"Rate limit exceeded"}}"#).unwrap()
        else {
            panic!("expected chunk");
        };
        assert_eq!(stream_error(&chunk), Some((429, "Rate limit exceeded".into())));
    }
}
