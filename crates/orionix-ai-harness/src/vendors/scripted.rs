//! In-process provider that replays scripted output.
//!
//! Each call to `start_stream` consumes the next queued script; once the queue
//! is empty the last script is replayed. A script whose first step is a
//! failure fails at stream start, like a rejected HTTP request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::ProviderError;
use crate::model::ProviderId;
use crate::provider::{
    ProviderAdapter, ProviderEvent, ProviderRequest, ProviderResponseMeta, ProviderStreamHandle,
};

/// One step of a scripted provider response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptStep {
    /// Emits a text delta.
    Delta(String),
    /// Waits before the next step.
    Delay(Duration),
    /// Fails like an HTTP 503.
    FailTransient(String),
    /// Fails like an HTTP 400.
    FailTerminal(String),
    /// Finishes with a content-policy finish reason.
    Reject,
    /// Finishes normally.
    Complete,
    /// Finishes normally, delivering the whole body at once.
    CompleteWithBody(String),
    /// Never produces anything again.
    Hang,
}

#[derive(Default)]
struct ScriptQueue {
    pending: VecDeque<Vec<ScriptStep>>,
    last: Vec<ScriptStep>,
}

pub struct ScriptedProvider {
    id: ProviderId,
    scripts: Mutex<ScriptQueue>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self {
            id: id.into(),
            scripts: Mutex::new(ScriptQueue::default()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queues the response for the next unanswered call.
    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        self.push_script(steps);
        self
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().pending.push_back(steps);
    }

    pub fn provider_id(&self) -> ProviderId {
        self.id.clone()
    }

    /// Number of `start_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Vec<ScriptStep> {
        let mut scripts = self.scripts.lock();
        match scripts.pending.pop_front() {
            Some(script) => {
                scripts.last = script.clone();
                script
            }
            None => scripts.last.clone(),
        }
    }
}

fn step_error(id: &ProviderId, step: &ScriptStep) -> Option<ProviderError> {
    match step {
        ScriptStep::FailTransient(message) => {
            Some(ProviderError::provider(id.clone(), message.clone(), Some(503)))
        }
        ScriptStep::FailTerminal(message) => {
            Some(ProviderError::provider(id.clone(), message.clone(), Some(400)))
        }
        _ => None,
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    async fn start_stream(
        &self,
        _req: ProviderRequest,
    ) -> Result<ProviderStreamHandle, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.next_script();
        if let Some(err) = script.first().and_then(|step| step_error(&self.id, step)) {
            return Err(err);
        }

        let stream = futures::stream::unfold(
            (self.id.clone(), script.into_iter()),
            |(id, mut steps)| async move {
                loop {
                    let step = steps.next()?;
                    let item = match step {
                        ScriptStep::Delay(duration) => {
                            tokio::time::sleep(duration).await;
                            continue;
                        }
                        ScriptStep::Hang => std::future::pending().await,
                        ScriptStep::Delta(text) => Ok(ProviderEvent::TextDelta { text }),
                        ScriptStep::Reject => Ok(ProviderEvent::Completed {
                            text: None,
                            finish_reason: Some("content_filter".into()),
                        }),
                        ScriptStep::Complete => Ok(ProviderEvent::Completed {
                            text: None,
                            finish_reason: Some("stop".into()),
                        }),
                        ScriptStep::CompleteWithBody(body) => Ok(ProviderEvent::Completed {
                            text: Some(body),
                            finish_reason: Some("stop".into()),
                        }),
                        ref failure => match step_error(&id, failure) {
                            Some(err) => Err(err),
                            None => continue,
                        },
                    };
                    return Some((item, (id, steps)));
                }
            },
        );

        Ok(ProviderStreamHandle {
            stream: Box::pin(stream),
            metadata: ProviderResponseMeta::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use std::collections::HashMap;

    fn request() -> ProviderRequest {
        ProviderRequest {
            request_id: uuid::Uuid::new_v4(),
            attempt: 1,
            model: "scripted".into(),
            system_prompt: None,
            input_parts: Vec::new(),
            timeout: None,
            vendor_options: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn scripts_are_consumed_in_order_then_last_repeats() {
        let provider = ScriptedProvider::new("s")
            .with_script(vec![ScriptStep::FailTransient("busy".into())])
            .with_script(vec![ScriptStep::Delta("hi".into()), ScriptStep::Complete]);

        assert!(provider.start_stream(request()).await.is_err());
        for _ in 0..2 {
            let mut handle = provider.start_stream(request()).await.expect("stream");
            let first = handle.stream.next().await.expect("event").expect("ok");
            assert_eq!(first, ProviderEvent::TextDelta { text: "hi".into() });
        }
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn mid_stream_failure_follows_output() {
        let provider = ScriptedProvider::new("s").with_script(vec![
            ScriptStep::Delta("part".into()),
            ScriptStep::FailTerminal("nope".into()),
        ]);
        let mut handle = provider.start_stream(request()).await.expect("stream");
        assert!(handle.stream.next().await.expect("delta").is_ok());
        let err = handle.stream.next().await.expect("error").expect_err("failure");
        assert!(!err.is_transient());
    }
}
