//! Line-level parsing of OpenAI-style `text/event-stream` bodies.

use serde::Deserialize;

use crate::errors::UpstreamError;

/// What one SSE line contributes to the generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Fragment(String),
    Done,
    /// Comments, blank lines, non-data fields, and chunks without text.
    Skip,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: String,
}

pub fn parse_line(line: &str) -> Result<SseLine, UpstreamError> {
    let line = line.trim_end_matches('\r');
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| UpstreamError::MalformedStream(format!("{}: {}", e, payload)))?;
    if let Some(error) = chunk.error {
        return Err(UpstreamError::MalformedStream(format!(
            "error event in stream: {}",
            error.message
        )));
    }

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .unwrap_or_default();
    if text.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Fragment(text))
    }
}

/// Reassembles lines from arbitrarily split byte chunks. Bytes are kept
/// until a newline arrives so multi-byte characters spanning chunk
/// boundaries decode intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    /// Whatever remains after the body ended without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta_becomes_fragment() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_line(line).unwrap(), SseLine::Fragment("Hel".into()));
    }

    #[test]
    fn role_only_and_empty_choices_are_skipped() {
        let role = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_line(role).unwrap(), SseLine::Skip);
        let usage = r#"data: {"choices":[],"usage":{"total_tokens":3}}"#;
        assert_eq!(parse_line(usage).unwrap(), SseLine::Skip);
    }

    #[test]
    fn done_marker_and_non_data_lines() {
        assert_eq!(parse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_line("").unwrap(), SseLine::Skip);
        assert_eq!(parse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_line("event: message").unwrap(), SseLine::Skip);
        assert_eq!(parse_line("data:[DONE]\r").unwrap(), SseLine::Done);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = parse_line("data: {not json").unwrap_err();
        assert!(matches!(err, UpstreamError::MalformedStream(_)));
    }

    #[test]
    fn inline_error_object_is_an_error() {
        let err = parse_line(r#"data: {"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn line_buffer_joins_split_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        let lines = buffer.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn line_buffer_keeps_multibyte_chars_across_chunks() {
        let text = "data: 知识\n".as_bytes();
        let mut buffer = LineBuffer::default();
        // Split inside the first CJK character.
        assert!(buffer.push(&text[..7]).is_empty());
        assert_eq!(buffer.push(&text[7..]), vec!["data: 知识"]);
    }

    #[test]
    fn line_buffer_finish_returns_unterminated_tail() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"data: [DONE]");
        assert_eq!(buffer.finish().as_deref(), Some("data: [DONE]"));
    }
}
