use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::errors::HarnessError;
use crate::health::{HealthPolicy, HealthRegistry};
use crate::model::{HealthState, ProviderId, ProviderSpec, RunOptions};
use crate::provider::ProviderAdapter;
use crate::run::RunBuilder;

pub(crate) struct RegisteredProvider {
    pub(crate) spec: ProviderSpec,
    pub(crate) adapter: Arc<dyn ProviderAdapter>,
    enabled: AtomicBool,
}

impl RegisteredProvider {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

pub(crate) struct HarnessInner {
    /// Sorted by priority, ties in registration order.
    providers: Vec<Arc<RegisteredProvider>>,
    pub(crate) health: HealthRegistry,
    pub(crate) defaults: RunOptions,
}

impl HarnessInner {
    pub(crate) fn provider(&self, id: &ProviderId) -> Option<Arc<RegisteredProvider>> {
        self.providers.iter().find(|p| &p.spec.id == id).cloned()
    }

    /// Attempt order for one request: the preferred provider first when given,
    /// then the rest by priority. Eligibility is checked per attempt.
    pub(crate) fn candidates(&self, preferred: Option<&ProviderId>) -> Vec<Arc<RegisteredProvider>> {
        let mut ordered: Vec<_> = self.providers.clone();
        if let Some(preferred) = preferred
            && let Some(pos) = ordered.iter().position(|p| &p.spec.id == preferred)
        {
            let first = ordered.remove(pos);
            ordered.insert(0, first);
        }
        ordered
    }

    pub(crate) fn is_eligible(&self, provider: &RegisteredProvider) -> bool {
        provider.is_enabled() && self.health.state(&provider.spec.id).is_eligible()
    }
}

/// Registered provider as reported by [`Harness::providers`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ProviderStatus {
    pub id: ProviderId,
    pub model: String,
    pub priority: u32,
    pub enabled: bool,
    pub streaming: bool,
    pub health: HealthState,
    pub consecutive_failures: u32,
}

/// Entry point for running generation requests across providers.
#[derive(Clone)]
pub struct Harness {
    pub(crate) inner: Arc<HarnessInner>,
}

impl Harness {
    /// Starts a builder for registering providers and creating a `Harness`.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Starts building one generation request with the harness defaults.
    pub fn run(&self) -> RunBuilder {
        RunBuilder::new(self.inner.clone())
    }

    /// Providers in attempt order with their current health.
    pub fn providers(&self) -> Vec<ProviderStatus> {
        self.inner
            .providers
            .iter()
            .map(|p| {
                let health = self.inner.health.snapshot(&p.spec.id);
                ProviderStatus {
                    id: p.spec.id.clone(),
                    model: p.spec.model.clone(),
                    priority: p.spec.priority,
                    enabled: p.is_enabled(),
                    streaming: p.spec.capabilities.streaming,
                    health: health.state,
                    consecutive_failures: health.consecutive_failures,
                }
            })
            .collect()
    }

    pub fn health(&self, provider: &ProviderId) -> Option<HealthState> {
        self.inner
            .provider(provider)
            .map(|_| self.inner.health.state(provider))
    }

    /// Enables or disables a provider at runtime. Providers are never removed.
    pub fn set_enabled(&self, provider: &ProviderId, enabled: bool) -> Result<(), HarnessError> {
        let registered =
            self.inner
                .provider(provider)
                .ok_or_else(|| HarnessError::ProviderNotFound {
                    provider: provider.clone(),
                })?;
        registered.enabled.store(enabled, Ordering::Release);
        info!(provider = %provider, enabled, "provider toggled");
        Ok(())
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<&str> = self
            .inner
            .providers
            .iter()
            .map(|p| p.spec.id.as_str())
            .collect();
        f.debug_struct("Harness")
            .field("providers", &providers)
            .field("defaults", &self.inner.defaults)
            .finish()
    }
}

/// Builder used to register provider adapters before creating a `Harness`.
#[derive(Default)]
pub struct HarnessBuilder {
    providers: Vec<(ProviderSpec, Arc<dyn ProviderAdapter>)>,
    policy: HealthPolicy,
    defaults: RunOptions,
}

impl HarnessBuilder {
    /// Registers a provider adapter under `spec`.
    ///
    /// `spec.id` must match the adapter's id.
    pub fn register_provider(mut self, spec: ProviderSpec, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.push((spec, adapter));
        self
    }

    pub fn health_policy(mut self, policy: HealthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Options every run starts from.
    pub fn default_run_options(mut self, options: RunOptions) -> Self {
        self.defaults = options;
        self
    }

    /// Builds the harness and validates provider registration (including duplicates).
    pub fn build(self) -> Result<Harness, HarnessError> {
        if self.policy.failure_threshold == 0 {
            return Err(HarnessError::Config(
                "health failure_threshold must be greater than 0".into(),
            ));
        }
        if self.defaults.stream_buffer_capacity == 0 {
            return Err(HarnessError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        let health = HealthRegistry::new(self.policy);
        let mut seen: HashSet<ProviderId> = HashSet::new();
        let mut providers = Vec::with_capacity(self.providers.len());
        for (spec, adapter) in self.providers {
            let adapter_id = adapter.id();
            if adapter_id != spec.id {
                return Err(HarnessError::Config(format!(
                    "provider spec {} registered with adapter {adapter_id}",
                    spec.id
                )));
            }
            if !seen.insert(spec.id.clone()) {
                return Err(HarnessError::Config(format!(
                    "duplicate provider registration: {}",
                    spec.id
                )));
            }
            health.register(spec.id.clone());
            providers.push(Arc::new(RegisteredProvider {
                enabled: AtomicBool::new(spec.enabled),
                spec,
                adapter,
            }));
        }
        // Stable sort keeps registration order among equal priorities.
        providers.sort_by_key(|p| p.spec.priority);
        Ok(Harness {
            inner: Arc::new(HarnessInner {
                providers,
                health,
                defaults: self.defaults,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::provider::{ProviderRequest, ProviderStreamHandle};

    struct DummyProvider(&'static str);

    #[async_trait::async_trait]
    impl ProviderAdapter for DummyProvider {
        fn id(&self) -> ProviderId {
            ProviderId::new(self.0)
        }

        async fn start_stream(
            &self,
            _req: ProviderRequest,
        ) -> Result<ProviderStreamHandle, ProviderError> {
            unreachable!("not used in this test")
        }
    }

    fn register(builder: HarnessBuilder, id: &'static str, priority: u32) -> HarnessBuilder {
        builder.register_provider(
            ProviderSpec::new(id, "m").priority(priority),
            Arc::new(DummyProvider(id)),
        )
    }

    #[test]
    fn build_rejects_duplicate_provider_ids() {
        let result = register(register(Harness::builder(), "dummy", 1), "dummy", 2).build();
        assert!(
            matches!(result, Err(HarnessError::Config(message)) if message.contains("duplicate provider"))
        );
    }

    #[test]
    fn debug_lists_providers_in_attempt_order() {
        let harness = register(register(Harness::builder(), "slow", 2), "fast", 1)
            .build()
            .expect("harness");
        let rendered = format!("{harness:?}");
        assert!(rendered.starts_with("Harness"), "{rendered}");
        assert!(rendered.contains(r#"providers: ["fast", "slow"]"#), "{rendered}");
    }

    #[test]
    fn build_rejects_mismatched_adapter() {
        let result = Harness::builder()
            .register_provider(ProviderSpec::new("a", "m"), Arc::new(DummyProvider("b")))
            .build();
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn candidates_follow_priority_with_preferred_first() {
        let harness = register(
            register(register(Harness::builder(), "c", 3), "a", 1),
            "b",
            2,
        )
        .build()
        .expect("harness");
        let order = |preferred: Option<&ProviderId>| {
            harness
                .inner
                .candidates(preferred)
                .iter()
                .map(|p| p.spec.id.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(order(None), vec!["a", "b", "c"]);
        assert_eq!(order(Some(&ProviderId::new("c"))), vec!["c", "a", "b"]);
    }

    #[test]
    fn disabled_providers_are_listed_but_ineligible() {
        let harness = register(Harness::builder(), "a", 1).build().expect("harness");
        let id = ProviderId::new("a");
        harness.set_enabled(&id, false).expect("toggle");
        let status = harness.providers();
        assert!(!status[0].enabled);
        let registered = harness.inner.provider(&id).expect("registered");
        assert!(!harness.inner.is_eligible(&registered));
        assert!(harness.set_enabled(&ProviderId::new("zzz"), true).is_err());
    }
}
