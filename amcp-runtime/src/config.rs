//! Runtime configuration passed at context creation.
//!
//! There are no process globals: every context receives an explicit
//! [`RuntimeConfig`] value.

use std::time::Duration;

use crate::context::{RuntimeError, RuntimeResult};
use crate::registry::RegistryConfig;

/// Broker backend selector.
///
/// Only the in-memory backend ships with the core; remote backends plug in
/// behind the same broker trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerKind {
    /// In-process reference broker.
    #[default]
    Memory,
    /// Kafka-backed broker (external integration).
    Kafka,
    /// NATS-backed broker (external integration).
    Nats,
    /// Solace-backed broker (external integration).
    Solace,
}

/// Mobility subsystem configuration.
#[derive(Debug, Clone)]
pub struct MobilityConfig {
    enabled: bool,
    timeout: Duration,
    auth_token: Option<String>,
}

impl MobilityConfig {
    /// Enables or disables the mobility subsystem for a context.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the end-to-end transfer timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Installs a bearer token required on inbound tickets.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Returns whether mobility is enabled.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the transfer timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the configured bearer token, if any.
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub(crate) fn validate(&self) -> RuntimeResult<()> {
        if self.enabled && self.timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "mobility timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for MobilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(10),
            auth_token: None,
        }
    }
}

/// Aggregate configuration for one agent context.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    broker: BrokerKind,
    mobility: MobilityConfig,
    registry: RegistryConfig,
    correlation_cleanup_interval: Duration,
    shutdown_grace: Duration,
}

impl RuntimeConfig {
    /// Selects the broker backend the context expects to be bound to.
    #[must_use]
    pub const fn with_broker(mut self, broker: BrokerKind) -> Self {
        self.broker = broker;
        self
    }

    /// Replaces the mobility configuration.
    #[must_use]
    pub fn with_mobility(mut self, mobility: MobilityConfig) -> Self {
        self.mobility = mobility;
        self
    }

    /// Replaces the registry configuration.
    #[must_use]
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the correlation expiry sweep interval.
    #[must_use]
    pub const fn with_correlation_cleanup_interval(mut self, interval: Duration) -> Self {
        self.correlation_cleanup_interval = interval;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Returns the broker backend selector.
    #[must_use]
    pub const fn broker(&self) -> BrokerKind {
        self.broker
    }

    /// Returns the mobility configuration.
    #[must_use]
    pub const fn mobility(&self) -> &MobilityConfig {
        &self.mobility
    }

    /// Returns the registry configuration.
    #[must_use]
    pub const fn registry(&self) -> &RegistryConfig {
        &self.registry
    }

    /// Returns the correlation sweep interval.
    #[must_use]
    pub const fn correlation_cleanup_interval(&self) -> Duration {
        self.correlation_cleanup_interval
    }

    /// Returns the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Validates the aggregate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] when any component
    /// configuration is inconsistent.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.correlation_cleanup_interval.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "correlation cleanup interval must be greater than zero",
            ));
        }
        if self.shutdown_grace.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "shutdown grace must be greater than zero",
            ));
        }
        self.mobility.validate()?;
        self.registry.validate()?;
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Memory,
            mobility: MobilityConfig::default(),
            registry: RegistryConfig::default(),
            correlation_cleanup_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_mobility_timeout_is_rejected() {
        let config = RuntimeConfig::default()
            .with_mobility(MobilityConfig::default().with_timeout(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_mobility_skips_timeout_check() {
        let config = RuntimeConfig::default().with_mobility(
            MobilityConfig::default()
                .with_enabled(false)
                .with_timeout(Duration::ZERO),
        );
        config.validate().unwrap();
    }
}
