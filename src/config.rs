//! Runner configuration.
//!
//! Replaces the teacher's clap-derived, env-populated `Config`/`ConfigFile`
//! pair with a programmatic builder, grounded on `rivet-engine-runner`'s
//! `RunnerConfig::builder()`: this crate is embedded as a library, not run as
//! a standalone binary, so configuration arrives from the host application's
//! own argument/env parsing rather than from `clap` directly.

use crate::error::{Result, RunnerError};

/// Configuration for a single [`crate::Runner`] instance.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Control-channel WebSocket URL, e.g. `wss://engine.example.com/runners/connect`.
    pub endpoint: String,
    /// Runner name advertised in `ToServerInit` (used for routing/pool selection).
    pub name: String,
    /// Namespace the runner registers into; sent as a connect URL query param.
    pub namespace: String,
    /// Engine-issued runner key; sent as a connect URL query param.
    pub runner_key: String,
    /// Bearer token, if the engine requires one; carried as the
    /// `rivet_token.<token>` WebSocket subprotocol.
    pub token: Option<String>,
    /// Total actor slots this runner can host concurrently.
    pub total_slots: u32,
    /// Actor names to prepopulate/warm on connect.
    pub prepopulate_actor_names: Vec<String>,
    /// Opaque metadata forwarded to the engine at init.
    pub metadata: Option<Vec<u8>>,
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }
}

/// Builder for [`RunnerConfig`]. `endpoint`, `name`, and `total_slots` are
/// required; everything else defaults to empty.
#[derive(Debug, Default)]
pub struct RunnerConfigBuilder {
    endpoint: Option<String>,
    name: Option<String>,
    namespace: Option<String>,
    runner_key: Option<String>,
    token: Option<String>,
    total_slots: Option<u32>,
    prepopulate_actor_names: Vec<String>,
    metadata: Option<Vec<u8>>,
}

impl RunnerConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn runner_key(mut self, runner_key: impl Into<String>) -> Self {
        self.runner_key = Some(runner_key.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn total_slots(mut self, total_slots: u32) -> Self {
        self.total_slots = Some(total_slots);
        self
    }

    pub fn prepopulate_actor_names(mut self, names: Vec<String>) -> Self {
        self.prepopulate_actor_names = names;
        self
    }

    pub fn metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn build(self) -> Result<RunnerConfig> {
        let endpoint = self
            .endpoint
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RunnerError::InvalidConfig("endpoint is required".into()))?;
        let name = self
            .name
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RunnerError::InvalidConfig("name is required".into()))?;
        let namespace = self
            .namespace
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RunnerError::InvalidConfig("namespace is required".into()))?;
        let runner_key = self
            .runner_key
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RunnerError::InvalidConfig("runner_key is required".into()))?;
        let total_slots = self
            .total_slots
            .ok_or_else(|| RunnerError::InvalidConfig("total_slots is required".into()))?;
        if total_slots == 0 {
            return Err(RunnerError::InvalidConfig(
                "total_slots must be greater than zero".into(),
            ));
        }

        Ok(RunnerConfig {
            endpoint,
            name,
            namespace,
            runner_key,
            token: self.token,
            total_slots,
            prepopulate_actor_names: self.prepopulate_actor_names,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_valid_config() {
        let config = RunnerConfig::builder()
            .endpoint("wss://example.com/runner")
            .name("my-runner")
            .namespace("default")
            .runner_key("runner-abc")
            .total_slots(10)
            .build()
            .unwrap();
        assert_eq!(config.total_slots, 10);
        assert!(config.prepopulate_actor_names.is_empty());
        assert!(config.token.is_none());
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let err = RunnerConfig::builder()
            .name("my-runner")
            .namespace("default")
            .runner_key("runner-abc")
            .total_slots(10)
            .build()
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidConfig(_)));
    }

    #[test]
    fn missing_namespace_is_rejected() {
        let err = RunnerConfig::builder()
            .endpoint("wss://example.com")
            .name("r")
            .runner_key("runner-abc")
            .total_slots(10)
            .build()
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidConfig(_)));
    }

    #[test]
    fn zero_total_slots_is_rejected() {
        let err = RunnerConfig::builder()
            .endpoint("wss://example.com")
            .name("r")
            .namespace("default")
            .runner_key("runner-abc")
            .total_slots(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidConfig(_)));
    }

    #[test]
    fn token_is_carried_when_set() {
        let config = RunnerConfig::builder()
            .endpoint("wss://example.com")
            .name("r")
            .namespace("default")
            .runner_key("runner-abc")
            .token("shh")
            .total_slots(1)
            .build()
            .unwrap();
        assert_eq!(config.token.as_deref(), Some("shh"));
    }
}
