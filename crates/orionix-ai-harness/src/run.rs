use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::content::{InputPart, OutputPart, RunOutput};
use crate::errors::{AttemptFailure, GenerationFailure, HarnessError, ProviderError};
use crate::harness::{HarnessInner, RegisteredProvider};
use crate::health::Outcome;
use crate::model::{ProviderId, RunOptions};
use crate::provider::{ProviderEvent, ProviderRequest};
use crate::stream::{FailoverEvent, OrchestrationState, StreamChunk};

/// Finish reason vendors use for content-policy blocks.
const CONTENT_FILTER: &str = "content_filter";

/// Handle used to request cancellation of a running request.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Cancellation is cooperative and becomes visible as a terminal
    /// `FailoverEvent::Failed` with `GenerationFailure::Cancelled`.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Builder for configuring and starting a single generation request.
///
/// This is the main user-facing API for providing prompts, inputs, and runtime
/// options before either streaming events or collecting a final result.
pub struct RunBuilder {
    harness: Arc<HarnessInner>,
    request_id: uuid::Uuid,
    system_prompt: Option<String>,
    input_parts: Vec<InputPart>,
    options: RunOptions,
    preferred: Option<ProviderId>,
    vendor_options: HashMap<ProviderId, serde_json::Value>,
}

impl RunBuilder {
    pub(crate) fn new(harness: Arc<HarnessInner>) -> Self {
        let options = harness.defaults.clone();
        Self {
            harness,
            request_id: uuid::Uuid::new_v4(),
            system_prompt: None,
            input_parts: Vec::new(),
            options,
            preferred: None,
            vendor_options: HashMap::new(),
        }
    }

    /// Uses a caller-chosen request id instead of a fresh one.
    pub fn request_id(mut self, request_id: uuid::Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    /// Sets the system prompt for the run.
    pub fn system_prompt(mut self, text: impl Into<String>) -> Self {
        self.system_prompt = Some(text.into());
        self
    }

    /// Appends a plain text user input part.
    pub fn user_text(mut self, text: impl Into<String>) -> Self {
        self.input_parts.push(InputPart::Text(text.into()));
        self
    }

    /// Appends a JSON user input part.
    pub fn user_json(mut self, value: serde_json::Value) -> Result<Self, HarnessError> {
        if value.is_null() {
            return Err(HarnessError::Validation(
                "json input must not be null".into(),
            ));
        }
        self.input_parts.push(InputPart::Json(value));
        Ok(self)
    }

    /// Replaces all input parts with the provided list.
    pub fn input_parts(mut self, parts: Vec<InputPart>) -> Result<Self, HarnessError> {
        self.input_parts = parts;
        Ok(self)
    }

    /// Wall-clock budget for the whole request, across all attempts.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.options.deadline = deadline;
        self
    }

    /// Minimum time that must remain for a new attempt to start.
    pub fn min_attempt_budget(mut self, budget: Duration) -> Self {
        self.options.min_attempt_budget = budget;
        self
    }

    /// Tries `provider` first when it is eligible; the rest follow by priority.
    pub fn preferred_provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.preferred = Some(provider.into());
        self
    }

    /// Sets the bounded stream buffer size used between the runtime task and
    /// the consumer.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.options.stream_buffer_capacity = capacity;
        self
    }

    pub(crate) fn set_vendor_options_json(
        mut self,
        provider: ProviderId,
        value: serde_json::Value,
    ) -> Self {
        self.vendor_options.insert(provider, value);
        self
    }

    #[cfg(test)]
    pub(crate) fn vendor_options_value(&self, provider: &ProviderId) -> Option<&serde_json::Value> {
        self.vendor_options.get(provider)
    }

    /// Validates the builder state and starts the request.
    ///
    /// The returned `RunStream` yields `AttemptStarted`, `Chunk` and
    /// `AttemptAbandoned` events followed by exactly one terminal
    /// `Succeeded`/`Failed` event.
    pub async fn start_stream(self) -> Result<RunStream, HarnessError> {
        self.validate()?;
        let candidates = self.harness.candidates(self.preferred.as_ref());

        let (tx, rx) = mpsc::channel(self.options.stream_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(OrchestrationState::Idle);

        let request_id = self.request_id;
        let task = FailoverTask {
            inner: self.harness,
            request_id,
            system_prompt: self.system_prompt.filter(|s| !s.trim().is_empty()),
            input_parts: self.input_parts,
            options: self.options,
            vendor_options: self.vendor_options,
            tx,
            state_tx,
            abort_rx,
        };
        tokio::spawn(async move {
            let result = task.run(candidates).await;
            let _ = final_tx.send(result);
        });

        Ok(RunStream {
            request_id,
            rx,
            final_rx,
            abort_handle: AbortHandle { tx: abort_tx },
            state_rx,
            saw_terminal: false,
        })
    }

    /// Runs to completion and returns the winning attempt's output.
    pub async fn collect_output(self) -> Result<RunOutput, HarnessError> {
        let stream = self.start_stream().await?;
        stream.finish().await
    }

    /// Runs to completion and returns concatenated text output.
    pub async fn collect_text(self) -> Result<String, HarnessError> {
        Ok(self.collect_output().await?.text())
    }

    fn validate(&self) -> Result<(), HarnessError> {
        if self.options.stream_buffer_capacity == 0 {
            return Err(HarnessError::Validation(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.options.deadline.is_zero() {
            return Err(HarnessError::Validation(
                "deadline must be greater than 0".into(),
            ));
        }
        if self.input_parts.is_empty() {
            return Err(HarnessError::Validation(
                "at least one input part is required".into(),
            ));
        }
        for part in &self.input_parts {
            if let InputPart::Text(text) = part
                && text.trim().is_empty()
            {
                return Err(HarnessError::Validation(
                    "text input must not be empty".into(),
                ));
            }
        }
        if let Some(preferred) = &self.preferred
            && self.harness.provider(preferred).is_none()
        {
            return Err(HarnessError::ProviderNotFound {
                provider: preferred.clone(),
            });
        }
        Ok(())
    }
}

/// Streaming handle returned by `RunBuilder::start_stream`.
///
/// Use `next_event()` to consume events as they arrive and `finish()` to obtain
/// the final result. Dropping the handle does not cancel the request; use the
/// abort handle for that.
pub struct RunStream {
    request_id: uuid::Uuid,
    rx: mpsc::Receiver<FailoverEvent>,
    final_rx: oneshot::Receiver<Result<RunOutput, GenerationFailure>>,
    abort_handle: AbortHandle,
    state_rx: watch::Receiver<OrchestrationState>,
    saw_terminal: bool,
}

impl RunStream {
    pub fn request_id(&self) -> uuid::Uuid {
        self.request_id
    }

    /// Returns a handle that can cancel the request.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Current orchestration state.
    pub fn state(&self) -> OrchestrationState {
        self.state_rx.borrow().clone()
    }

    /// Waits for and returns the next event.
    ///
    /// Returns `None` after the stream channel is closed.
    pub async fn next_event(&mut self) -> Option<FailoverEvent> {
        let event = self.rx.recv().await;
        if let Some(event) = &event
            && event.is_terminal()
        {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains the stream (if needed) and returns the terminal result.
    ///
    /// This is safe to call after consuming events manually with `next_event()`.
    pub async fn finish(mut self) -> Result<RunOutput, HarnessError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }

        match self.final_rx.await {
            Ok(result) => result.map_err(HarnessError::Generation),
            Err(_) => Err(HarnessError::protocol_msg(format!(
                "request task {} ended without final result",
                self.request_id
            ))),
        }
    }
}

enum AttemptOutcome {
    Completed(RunOutput),
    Failed(ProviderError),
    Cancelled,
}

enum Interrupted {
    Cancelled,
    Deadline,
}

/// Drives one request through the candidate list.
struct FailoverTask {
    inner: Arc<HarnessInner>,
    request_id: uuid::Uuid,
    system_prompt: Option<String>,
    input_parts: Vec<InputPart>,
    options: RunOptions,
    vendor_options: HashMap<ProviderId, serde_json::Value>,
    tx: mpsc::Sender<FailoverEvent>,
    state_tx: watch::Sender<OrchestrationState>,
    abort_rx: watch::Receiver<bool>,
}

impl FailoverTask {
    async fn run(
        mut self,
        candidates: Vec<Arc<RegisteredProvider>>,
    ) -> Result<RunOutput, GenerationFailure> {
        let request_id = self.request_id;
        let started = Instant::now();
        let deadline_at = started + self.options.deadline;
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut attempt = 0_u32;
        let mut out_of_time = false;

        for candidate in candidates {
            if *self.abort_rx.borrow() {
                return self.fail(GenerationFailure::Cancelled).await;
            }
            let provider = candidate.spec.id.clone();
            if !self.inner.is_eligible(&candidate) {
                debug!(request_id = %request_id, provider = %provider, "skipping ineligible provider");
                continue;
            }
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() || remaining < self.options.min_attempt_budget {
                out_of_time = true;
                break;
            }

            attempt += 1;
            self.state_tx.send_replace(OrchestrationState::Attempting {
                provider: provider.clone(),
                attempt,
            });
            info!(request_id = %request_id, attempt, provider = %provider, remaining_ms = remaining.as_millis() as u64, "attempt started");
            let started_event = FailoverEvent::AttemptStarted {
                request_id,
                attempt,
                provider: provider.clone(),
            };
            match self.deliver(started_event, deadline_at).await {
                Ok(()) => {}
                Err(Interrupted::Cancelled) => return self.fail(GenerationFailure::Cancelled).await,
                Err(Interrupted::Deadline) => {
                    out_of_time = true;
                    break;
                }
            }

            match self.attempt(&candidate, attempt, deadline_at, remaining).await {
                AttemptOutcome::Completed(output) => {
                    self.inner.health.record(&provider, Outcome::Success);
                    self.state_tx.send_replace(OrchestrationState::Succeeded {
                        provider: provider.clone(),
                        attempt,
                    });
                    info!(request_id = %request_id, attempt, provider = %provider, "request succeeded");
                    let _ = self
                        .tx
                        .send(FailoverEvent::Succeeded {
                            request_id,
                            output: output.clone(),
                        })
                        .await;
                    return Ok(output);
                }
                AttemptOutcome::Cancelled => {
                    return self.fail(GenerationFailure::Cancelled).await;
                }
                AttemptOutcome::Failed(err) => {
                    failures.push(AttemptFailure::new(attempt, &err));
                    if !err.is_transient() {
                        self.inner.health.record(&provider, Outcome::Terminal);
                        return self
                            .fail(GenerationFailure::TerminalProvider {
                                provider,
                                attempt,
                                message: err.message(),
                            })
                            .await;
                    }
                    self.inner
                        .health
                        .record(&provider, Outcome::Transient(err.message()));
                    warn!(request_id = %request_id, attempt, provider = %provider, error = %err, "attempt abandoned");
                    self.state_tx
                        .send_replace(OrchestrationState::Retrying { attempt });
                    let abandoned = FailoverEvent::AttemptAbandoned {
                        request_id,
                        attempt,
                        provider,
                        reason: err,
                    };
                    match self.deliver(abandoned, deadline_at).await {
                        Ok(()) => {}
                        Err(Interrupted::Cancelled) => {
                            return self.fail(GenerationFailure::Cancelled).await;
                        }
                        Err(Interrupted::Deadline) => {
                            out_of_time = true;
                            break;
                        }
                    }
                }
            }
        }

        let failure = if out_of_time || Instant::now() >= deadline_at {
            GenerationFailure::DeadlineExceeded {
                elapsed_ms: started.elapsed().as_millis() as u64,
                attempts: failures,
            }
        } else {
            GenerationFailure::ProviderExhausted { attempts: failures }
        };
        self.fail(failure).await
    }

    async fn attempt(
        &mut self,
        candidate: &RegisteredProvider,
        attempt: u32,
        deadline_at: Instant,
        remaining: Duration,
    ) -> AttemptOutcome {
        let request_id = self.request_id;
        let provider = candidate.spec.id.clone();
        let attempt_started = Instant::now();
        let request = ProviderRequest {
            request_id,
            attempt,
            model: candidate.spec.model.clone(),
            system_prompt: self.system_prompt.clone(),
            input_parts: self.input_parts.clone(),
            timeout: Some(remaining),
            vendor_options: self.vendor_options.clone(),
        };

        let mut handle = tokio::select! {
            biased;
            _ = aborted(&mut self.abort_rx) => return AttemptOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline_at) => {
                return AttemptOutcome::Failed(ProviderError::timeout(provider, elapsed_ms(attempt_started)));
            }
            started = candidate.adapter.start_stream(request) => match started {
                Ok(handle) => handle,
                Err(err) => return AttemptOutcome::Failed(err),
            },
        };

        let mut seq = 0_u64;
        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = aborted(&mut self.abort_rx) => return AttemptOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline_at) => {
                    return AttemptOutcome::Failed(ProviderError::timeout(provider, elapsed_ms(attempt_started)));
                }
                next = handle.stream.next() => next,
            };
            match next {
                Some(Ok(ProviderEvent::TextDelta { text: delta })) => {
                    if delta.is_empty() {
                        continue;
                    }
                    debug!(request_id = %request_id, attempt, provider = %provider, seq, "provider text delta");
                    text.push_str(&delta);
                    let chunk = StreamChunk {
                        provider: provider.clone(),
                        attempt,
                        seq,
                        text: delta,
                    };
                    seq = seq.saturating_add(1);
                    if let Some(reason) = self
                        .deliver(FailoverEvent::Chunk { request_id, chunk }, deadline_at)
                        .await
                        .err()
                    {
                        return interrupted(reason, provider, attempt_started);
                    }
                }
                Some(Ok(ProviderEvent::Completed {
                    text: body,
                    finish_reason,
                })) => {
                    if finish_reason.as_deref() == Some(CONTENT_FILTER) {
                        return AttemptOutcome::Failed(ProviderError::rejected(
                            provider,
                            "output blocked by content policy",
                        ));
                    }
                    // Non-streaming providers hand over the whole body at the end.
                    if text.is_empty()
                        && let Some(body) = body.filter(|b| !b.is_empty())
                    {
                        text = body.clone();
                        let chunk = StreamChunk {
                            provider: provider.clone(),
                            attempt,
                            seq,
                            text: body,
                        };
                        if let Some(reason) = self
                            .deliver(FailoverEvent::Chunk { request_id, chunk }, deadline_at)
                            .await
                            .err()
                        {
                            return interrupted(reason, provider, attempt_started);
                        }
                    }
                    let parts = if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![OutputPart::Text(text)]
                    };
                    return AttemptOutcome::Completed(RunOutput {
                        provider,
                        attempt,
                        parts,
                        finish_reason,
                    });
                }
                Some(Err(err)) => return AttemptOutcome::Failed(err),
                None => {
                    return AttemptOutcome::Failed(ProviderError::protocol(
                        provider,
                        "provider stream ended without completion",
                    ));
                }
            }
        }
    }

    /// Sends a non-terminal event, giving up if the request is cancelled or
    /// its deadline passes while the consumer applies backpressure. A dropped
    /// consumer is not an error.
    async fn deliver(&mut self, event: FailoverEvent, deadline_at: Instant) -> Result<(), Interrupted> {
        tokio::select! {
            biased;
            _ = aborted(&mut self.abort_rx) => Err(Interrupted::Cancelled),
            _ = self.tx.send(event) => Ok(()),
            _ = tokio::time::sleep_until(deadline_at) => Err(Interrupted::Deadline),
        }
    }

    async fn fail(&mut self, failure: GenerationFailure) -> Result<RunOutput, GenerationFailure> {
        self.state_tx
            .send_replace(OrchestrationState::ExhaustedFailed);
        warn!(request_id = %self.request_id, code = failure.code(), error = %failure, "request failed");
        let _ = self
            .tx
            .send(FailoverEvent::Failed {
                request_id: self.request_id,
                failure: failure.clone(),
            })
            .await;
        Err(failure)
    }
}

/// Resolves once an abort is requested; never resolves if every abort handle
/// is gone.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Outcome of an attempt whose chunk could not be delivered.
fn interrupted(reason: Interrupted, provider: ProviderId, attempt_started: Instant) -> AttemptOutcome {
    match reason {
        Interrupted::Cancelled => AttemptOutcome::Cancelled,
        Interrupted::Deadline => {
            AttemptOutcome::Failed(ProviderError::timeout(provider, elapsed_ms(attempt_started)))
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureClass;
    use crate::health::HealthPolicy;
    use crate::model::{HealthState, ProviderSpec};
    use crate::vendors::scripted::{ScriptStep, ScriptedProvider};
    use crate::{Harness, HarnessBuilder};

    fn delta(text: &str) -> ScriptStep {
        ScriptStep::Delta(text.to_string())
    }

    fn with(
        builder: HarnessBuilder,
        provider: &Arc<ScriptedProvider>,
        priority: u32,
    ) -> HarnessBuilder {
        builder.register_provider(
            ProviderSpec::new(provider.provider_id(), "scripted").priority(priority),
            provider.clone(),
        )
    }

    async fn drain(stream: &mut RunStream) -> Vec<FailoverEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn validation_rejects_missing_input_and_unknown_preferred_provider() {
        let p1 = Arc::new(ScriptedProvider::new("p1"));
        let harness = with(Harness::builder(), &p1, 1).build().expect("harness");

        let err = harness.run().start_stream().await;
        assert!(
            matches!(err, Err(HarnessError::Validation(msg)) if msg.contains("at least one input"))
        );

        let err = harness
            .run()
            .user_text("hello")
            .preferred_provider("missing")
            .start_stream()
            .await;
        assert!(matches!(err, Err(HarnessError::ProviderNotFound { .. })));
    }

    #[tokio::test]
    async fn transient_failure_fails_over_without_mixing_attempts() {
        let p1 = Arc::new(
            ScriptedProvider::new("p1")
                .with_script(vec![delta("p1-partial"), ScriptStep::FailTransient("503".into())]),
        );
        let p2 = Arc::new(ScriptedProvider::new("p2").with_script(vec![
            delta("hello "),
            delta("world"),
            ScriptStep::Complete,
        ]));
        let harness = with(with(Harness::builder(), &p1, 1), &p2, 2)
            .build()
            .expect("harness");

        let mut stream = harness.run().user_text("build").start_stream().await.expect("start");
        let events = drain(&mut stream).await;

        assert!(matches!(
            &events[0],
            FailoverEvent::AttemptStarted { attempt: 1, provider, .. } if provider.as_str() == "p1"
        ));
        assert!(matches!(
            &events[2],
            FailoverEvent::AttemptAbandoned { attempt: 1, reason, .. } if reason.class() == FailureClass::Transient
        ));
        let p2_seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                FailoverEvent::Chunk { chunk, .. } if chunk.attempt == 2 => Some(chunk.seq),
                _ => None,
            })
            .collect();
        assert_eq!(p2_seqs, vec![0, 1]);

        let output = stream.finish().await.expect("output");
        assert_eq!(output.provider.as_str(), "p2");
        assert_eq!(output.attempt, 2);
        assert_eq!(output.text(), "hello world");
        assert_eq!(harness.health(&ProviderId::new("p1")), Some(HealthState::Degraded));
        assert_eq!(harness.health(&ProviderId::new("p2")), Some(HealthState::Healthy));
    }

    #[tokio::test]
    async fn deadline_is_enforced_across_a_slow_attempt() {
        let slow = Arc::new(ScriptedProvider::new("slow").with_script(vec![
            ScriptStep::Delay(Duration::from_millis(500)),
            delta("too late"),
            ScriptStep::Complete,
        ]));
        let harness = with(Harness::builder(), &slow, 1).build().expect("harness");

        let started = std::time::Instant::now();
        let result = harness
            .run()
            .user_text("build")
            .deadline(Duration::from_millis(100))
            .collect_output()
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(HarnessError::Generation(GenerationFailure::DeadlineExceeded { ref attempts, .. }))
                if attempts.len() == 1
        ));
        assert!(elapsed >= Duration::from_millis(90), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn stalled_consumer_does_not_outlive_the_deadline() {
        let mut script: Vec<ScriptStep> = (0..10).map(|i| delta(&format!("part {i} "))).collect();
        script.push(ScriptStep::Complete);
        let chatty = Arc::new(ScriptedProvider::new("chatty").with_script(script));
        let harness = with(Harness::builder(), &chatty, 1).build().expect("harness");

        let mut stream = harness
            .run()
            .user_text("build")
            .deadline(Duration::from_millis(100))
            .stream_buffer_capacity(1)
            .start_stream()
            .await
            .expect("start");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(stream.state(), OrchestrationState::ExhaustedFailed);

        let events = drain(&mut stream).await;
        assert!(!events.iter().any(|e| matches!(e, FailoverEvent::Succeeded { .. })));
        assert!(matches!(
            events.last(),
            Some(FailoverEvent::Failed { failure: GenerationFailure::DeadlineExceeded { .. }, .. })
        ));
        assert!(matches!(
            stream.finish().await,
            Err(HarnessError::Generation(GenerationFailure::DeadlineExceeded { .. }))
        ));
    }

    #[tokio::test]
    async fn min_attempt_budget_prevents_starting_an_attempt() {
        let p1 = Arc::new(ScriptedProvider::new("p1").with_script(vec![ScriptStep::Complete]));
        let harness = with(Harness::builder(), &p1, 1).build().expect("harness");
        let result = harness
            .run()
            .user_text("build")
            .deadline(Duration::from_millis(50))
            .min_attempt_budget(Duration::from_millis(200))
            .collect_output()
            .await;
        assert!(matches!(
            result,
            Err(HarnessError::Generation(GenerationFailure::DeadlineExceeded { ref attempts, .. }))
                if attempts.is_empty()
        ));
        assert_eq!(p1.calls(), 0);
    }

    #[tokio::test]
    async fn three_transients_bench_a_provider_until_cooldown() {
        let flaky = Arc::new(
            ScriptedProvider::new("flaky").with_script(vec![ScriptStep::FailTransient("429".into())]),
        );
        let steady = Arc::new(ScriptedProvider::new("steady").with_script(vec![
            delta("ok"),
            ScriptStep::Complete,
        ]));
        let harness = with(with(Harness::builder(), &flaky, 1), &steady, 2)
            .health_policy(HealthPolicy {
                failure_threshold: 3,
                cooldown: Duration::from_millis(80),
            })
            .build()
            .expect("harness");

        for _ in 0..3 {
            let output = harness.run().user_text("x").collect_output().await.expect("ok");
            assert_eq!(output.provider.as_str(), "steady");
        }
        assert_eq!(flaky.calls(), 3);
        assert_eq!(
            harness.health(&ProviderId::new("flaky")),
            Some(HealthState::Unavailable)
        );

        let mut stream = harness.run().user_text("x").start_stream().await.expect("start");
        let events = drain(&mut stream).await;
        assert!(matches!(
            &events[0],
            FailoverEvent::AttemptStarted { attempt: 1, provider, .. } if provider.as_str() == "steady"
        ));
        assert_eq!(flaky.calls(), 3);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            harness.health(&ProviderId::new("flaky")),
            Some(HealthState::Degraded)
        );
        harness.run().user_text("x").collect_output().await.expect("ok");
        assert_eq!(flaky.calls(), 4);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let p1 = Arc::new(
            ScriptedProvider::new("p1").with_script(vec![ScriptStep::FailTerminal("bad request".into())]),
        );
        let p2 = Arc::new(ScriptedProvider::new("p2").with_script(vec![ScriptStep::Complete]));
        let harness = with(with(Harness::builder(), &p1, 1), &p2, 2)
            .build()
            .expect("harness");

        let result = harness.run().user_text("x").collect_output().await;
        let failure = match result {
            Err(HarnessError::Generation(failure)) => failure,
            other => panic!("expected terminal failure, got {other:?}"),
        };
        assert_eq!(failure.code(), "provider_rejected");
        assert_eq!(p2.calls(), 0);
        assert_eq!(harness.health(&ProviderId::new("p1")), Some(HealthState::Healthy));
    }

    #[tokio::test]
    async fn content_filter_finish_is_a_terminal_rejection() {
        let p1 = Arc::new(ScriptedProvider::new("p1").with_script(vec![ScriptStep::Reject]));
        let harness = with(Harness::builder(), &p1, 1).build().expect("harness");
        let result = harness.run().user_text("x").collect_output().await;
        assert!(matches!(
            result,
            Err(HarnessError::Generation(GenerationFailure::TerminalProvider { .. }))
        ));
    }

    #[tokio::test]
    async fn cancellation_emits_terminal_failure() {
        let p1 = Arc::new(ScriptedProvider::new("p1").with_script(vec![delta("a"), ScriptStep::Hang]));
        let harness = with(Harness::builder(), &p1, 1).build().expect("harness");
        let mut stream = harness.run().user_text("x").start_stream().await.expect("start");

        let abort = stream.abort_handle();
        assert!(matches!(
            stream.next_event().await,
            Some(FailoverEvent::AttemptStarted { .. })
        ));
        assert!(matches!(stream.next_event().await, Some(FailoverEvent::Chunk { .. })));
        abort.abort();

        let events = drain(&mut stream).await;
        assert!(matches!(
            events.last(),
            Some(FailoverEvent::Failed {
                failure: GenerationFailure::Cancelled,
                ..
            })
        ));
        assert_eq!(stream.state(), OrchestrationState::ExhaustedFailed);
        assert!(matches!(
            stream.finish().await,
            Err(HarnessError::Generation(GenerationFailure::Cancelled))
        ));
    }

    #[tokio::test]
    async fn preferred_provider_goes_first() {
        let p1 = Arc::new(ScriptedProvider::new("p1").with_script(vec![ScriptStep::Complete]));
        let p2 = Arc::new(ScriptedProvider::new("p2").with_script(vec![ScriptStep::Complete]));
        let harness = with(with(Harness::builder(), &p1, 1), &p2, 2)
            .build()
            .expect("harness");
        let output = harness
            .run()
            .user_text("x")
            .preferred_provider("p2")
            .collect_output()
            .await
            .expect("ok");
        assert_eq!(output.provider.as_str(), "p2");
        assert_eq!(p1.calls(), 0);
    }

    #[tokio::test]
    async fn no_eligible_provider_reports_exhaustion() {
        let p1 = Arc::new(ScriptedProvider::new("p1").with_script(vec![ScriptStep::Complete]));
        let harness = with(Harness::builder(), &p1, 1).build().expect("harness");
        harness
            .set_enabled(&ProviderId::new("p1"), false)
            .expect("toggle");
        let result = harness.run().user_text("x").collect_output().await;
        assert!(matches!(
            result,
            Err(HarnessError::Generation(GenerationFailure::ProviderExhausted { ref attempts }))
                if attempts.is_empty()
        ));
    }

    #[tokio::test]
    async fn non_streaming_body_arrives_as_single_chunk() {
        let p1 = Arc::new(
            ScriptedProvider::new("p1")
                .with_script(vec![ScriptStep::CompleteWithBody("whole page".into())]),
        );
        let harness = with(Harness::builder(), &p1, 1).build().expect("harness");
        let mut stream = harness.run().user_text("x").start_stream().await.expect("start");
        let events = drain(&mut stream).await;
        let chunks: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                FailoverEvent::Chunk { chunk, .. } => Some(chunk.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["whole page"]);
        assert_eq!(stream.finish().await.expect("ok").text(), "whole page");
    }

    #[tokio::test]
    async fn vendor_options_are_stored_per_provider() {
        let harness = Harness::builder().build().expect("harness");
        let builder = harness
            .run()
            .user_text("x")
            .set_vendor_options_json(ProviderId::new("fake"), serde_json::json!({"x":1}));
        assert_eq!(
            builder.vendor_options_value(&ProviderId::new("fake")),
            Some(&serde_json::json!({"x":1}))
        );
    }
}
