use crate::errors::ProviderError;
use crate::model::ProviderId;
use crate::provider::ProviderEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame splitter; partial frames stay buffered across chunks.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        if buf[i..].starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if buf[i..].starts_with(b"\n\n") {
            Some((i, 2))
        } else {
            None
        }
    })
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data_lines = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// What one chat-completions frame means for the attempt.
#[derive(Debug, PartialEq)]
pub(crate) enum FrameOutcome {
    Events(Vec<ProviderEvent>),
    /// `data: [DONE]`.
    Done,
}

pub(crate) fn map_chat_frame(
    provider: &ProviderId,
    frame: &SseFrame,
) -> Result<FrameOutcome, ProviderError> {
    let data = frame.data.trim();
    if data == "[DONE]" {
        return Ok(FrameOutcome::Done);
    }
    if data.is_empty() {
        return Ok(FrameOutcome::Events(Vec::new()));
    }
    if frame.event.as_deref() == Some("error") {
        return Err(ProviderError::provider(provider.clone(), data, None));
    }
    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| {
        ProviderError::protocol(provider.clone(), format!("invalid SSE JSON frame: {e}"))
    })?;
    map_chat_chunk(provider, &value).map(FrameOutcome::Events)
}

/// Maps one `chat.completion.chunk` object.
pub(crate) fn map_chat_chunk(
    provider: &ProviderId,
    value: &serde_json::Value,
) -> Result<Vec<ProviderEvent>, ProviderError> {
    if let Some(error) = value.get("error") {
        return Err(error_from_body(provider, error, None));
    }
    let Some(choice) = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    if let Some(content) = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
    {
        events.push(ProviderEvent::TextDelta {
            text: content.to_string(),
        });
    }
    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        events.push(ProviderEvent::Completed {
            text: None,
            finish_reason: Some(reason.to_string()),
        });
    }
    Ok(events)
}

/// Maps a complete (non-streaming) `chat.completion` body.
pub(crate) fn map_chat_completion(
    provider: &ProviderId,
    value: &serde_json::Value,
) -> Result<ProviderEvent, ProviderError> {
    if let Some(error) = value.get("error") {
        return Err(error_from_body(provider, error, None));
    }
    let choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::protocol(provider.clone(), "completion has no choices"))?;
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(ToOwned::to_owned);
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(ToOwned::to_owned);
    Ok(ProviderEvent::Completed {
        text,
        finish_reason,
    })
}

/// Builds an error from an OpenAI-style `{"error": {...}}` body.
pub(crate) fn error_from_body(
    provider: &ProviderId,
    error: &serde_json::Value,
    status: Option<u16>,
) -> ProviderError {
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .unwrap_or("provider returned an error");
    let code = error.get("code").and_then(|c| c.as_str());
    if code == Some("content_filter") || code == Some("data_inspection_failed") {
        return ProviderError::rejected(provider.clone(), message);
    }
    ProviderError::provider(provider.clone(), message, status)
}
