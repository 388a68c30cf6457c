use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::content::render_input_parts;
use crate::errors::{HarnessError, ProviderError};
use crate::model::ProviderId;
use crate::provider::{
    ProviderAdapter, ProviderEvent, ProviderRequest, ProviderResponseMeta, ProviderStreamHandle,
};

use super::config::{OpenAiCompatConfig, VendorPreset};
use super::options::OpenAiCompatOptions;
use super::transport::{
    FrameOutcome, SseDecoder, error_from_body, map_chat_completion, map_chat_frame,
};

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Provider adapter for OpenAI-compatible Chat Completions endpoints.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatProvider {
    /// Creates a provider from explicit client configuration.
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, HarnessError> {
        if config.api_key.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "{} client config api_key must not be empty",
                config.provider_id
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                HarnessError::Config(format!(
                    "failed to build {} client: {e}",
                    config.provider_id
                ))
            })?;
        Ok(Self { client, config })
    }

    /// Creates a preset provider using its API key variable.
    pub fn from_env(preset: VendorPreset) -> Result<Self, HarnessError> {
        Self::new(OpenAiCompatConfig::from_env(preset)?)
    }

    pub fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiCompatProvider {
    fn id(&self) -> ProviderId {
        self.config.provider_id.clone()
    }

    async fn start_stream(
        &self,
        req: ProviderRequest,
    ) -> Result<ProviderStreamHandle, ProviderError> {
        let provider_id = self.config.provider_id.clone();
        let options = read_options(&req, &provider_id)?;
        let body = build_request_body(&self.config, &req, &options)?;
        debug!(request_id = %req.request_id, attempt = req.attempt, provider = %provider_id, model = %req.model, stream = self.config.stream, "starting chat completion");

        let mut http_req = self
            .client
            .post(self.config.chat_completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body);
        if let Some(timeout) = req.timeout {
            http_req = http_req.timeout(timeout);
        }

        let response = http_req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::timeout(
                    provider_id.clone(),
                    req.timeout.map_or(0, |t| t.as_millis() as u64),
                )
            } else {
                ProviderError::transport(provider_id.clone(), format!("request failed: {e}"))
            }
        })?;
        let status = response.status();
        let vendor_request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            let error = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("error").cloned());
            return Err(match error {
                Some(error) => error_from_body(&provider_id, &error, Some(status.as_u16())),
                None => ProviderError::provider(
                    provider_id,
                    format!("request failed with status {status}: {text}"),
                    Some(status.as_u16()),
                ),
            });
        }

        let metadata = ProviderResponseMeta { vendor_request_id };
        if !self.config.stream {
            let value: serde_json::Value = response.json().await.map_err(|e| {
                ProviderError::protocol(provider_id.clone(), format!("invalid completion body: {e}"))
            })?;
            let event = map_chat_completion(&provider_id, &value)?;
            return Ok(ProviderStreamHandle {
                stream: Box::pin(stream::iter([Ok(event)])),
                metadata,
            });
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(ProviderStreamHandle {
            stream: Box::pin(chat_event_stream(provider_id, bytes_stream)),
            metadata,
        })
    }
}

fn read_options(
    req: &ProviderRequest,
    provider_id: &ProviderId,
) -> Result<OpenAiCompatOptions, ProviderError> {
    match req.vendor_options.get(provider_id) {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            ProviderError::protocol(provider_id.clone(), format!("invalid request options: {e}"))
        }),
        None => Ok(OpenAiCompatOptions::default()),
    }
}

pub(crate) fn build_request_body(
    config: &OpenAiCompatConfig,
    req: &ProviderRequest,
    options: &OpenAiCompatOptions,
) -> Result<serde_json::Value, ProviderError> {
    let user_payload = render_input_parts(&req.input_parts).map_err(|e| {
        ProviderError::protocol(
            config.provider_id.clone(),
            format!("failed to serialize input parts: {e}"),
        )
    })?;

    let mut messages = Vec::new();
    if let Some(system_prompt) = req
        .system_prompt
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        messages.push(serde_json::json!({
            "role": "system",
            "content": system_prompt,
        }));
    }
    messages.push(serde_json::json!({
        "role": "user",
        "content": user_payload,
    }));

    Ok(serde_json::json!({
        "model": req.model,
        "messages": messages,
        "stream": config.stream,
        "temperature": options.temperature.unwrap_or(config.temperature),
        "max_tokens": options.max_tokens.unwrap_or(config.max_tokens),
    }))
}

fn chat_event_stream(
    provider_id: ProviderId,
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<ProviderEvent, ProviderError>> + Send {
    struct State {
        provider_id: ProviderId,
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<ProviderEvent>,
        completed: bool,
        done: bool,
    }

    stream::try_unfold(
        State {
            provider_id,
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            completed: false,
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push_chunk(&chunk) {
                            match map_chat_frame(&state.provider_id, &frame)? {
                                FrameOutcome::Events(events) => {
                                    for event in events {
                                        if matches!(event, ProviderEvent::Completed { .. }) {
                                            state.completed = true;
                                        }
                                        state.pending.push_back(event);
                                    }
                                }
                                FrameOutcome::Done => {
                                    if !state.completed {
                                        state.pending.push_back(ProviderEvent::Completed {
                                            text: None,
                                            finish_reason: None,
                                        });
                                        state.completed = true;
                                    }
                                    state.done = true;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return Err(ProviderError::transport(
                            state.provider_id,
                            format!("streaming read failed: {e}"),
                        ));
                    }
                    None => state.done = true,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::InputPart;
    use std::collections::HashMap;

    fn request_with_parts(parts: Vec<InputPart>) -> ProviderRequest {
        ProviderRequest {
            request_id: uuid::Uuid::new_v4(),
            attempt: 1,
            model: "deepseek-chat".into(),
            system_prompt: Some("sys".into()),
            input_parts: parts,
            timeout: None,
            vendor_options: HashMap::new(),
        }
    }

    #[test]
    fn request_body_carries_messages_and_defaults() {
        let config = OpenAiCompatConfig::preset(VendorPreset::DeepSeek, "k");
        let req = request_with_parts(vec![InputPart::Text("hello".into())]);
        let body = build_request_body(&config, &req, &OpenAiCompatOptions::default()).expect("body");
        assert_eq!(body["stream"], serde_json::json!(true));
        assert_eq!(body["model"], serde_json::json!("deepseek-chat"));
        assert_eq!(body["max_tokens"], serde_json::json!(4000));
        assert_eq!(body["messages"][0]["role"], serde_json::json!("system"));
        assert_eq!(body["messages"][1]["content"], serde_json::json!("hello"));
    }

    #[test]
    fn run_options_override_client_defaults() {
        let config = OpenAiCompatConfig::preset(VendorPreset::OpenAi, "k");
        let req = request_with_parts(vec![InputPart::Json(serde_json::json!({"a":1}))]);
        let body = build_request_body(
            &config,
            &req,
            &OpenAiCompatOptions::default().max_tokens(256),
        )
        .expect("body");
        assert_eq!(body["max_tokens"], serde_json::json!(256));
        assert_eq!(body["messages"][1]["content"], serde_json::json!("{\"a\":1}"));
    }

    #[tokio::test]
    async fn done_without_finish_reason_still_completes() {
        let frames: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            )),
            Ok(bytes::Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let events: Vec<_> = chat_event_stream(ProviderId::new("qwen"), Box::pin(stream::iter(frames)))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            Ok(ProviderEvent::Completed { finish_reason: None, .. })
        ));
    }

    #[tokio::test]
    async fn env_gated_smoke_stream_if_key_present() {
        if std::env::var("DEEPSEEK_API_KEY")
            .unwrap_or_default()
            .trim()
            .is_empty()
        {
            eprintln!("skipping DeepSeek smoke test (DEEPSEEK_API_KEY missing)");
            return;
        }

        let provider = OpenAiCompatProvider::from_env(VendorPreset::DeepSeek).expect("provider");
        let harness = crate::Harness::builder()
            .register_provider(
                crate::ProviderSpec::new("deepseek", VendorPreset::DeepSeek.default_model()),
                std::sync::Arc::new(provider),
            )
            .build()
            .expect("harness");

        let result = harness
            .run()
            .deadline(std::time::Duration::from_secs(30))
            .system_prompt("Return exactly the word: ok")
            .user_text("ok")
            .collect_text()
            .await;
        assert!(result.is_ok(), "DeepSeek smoke failed: {result:?}");
    }
}
