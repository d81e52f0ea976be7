//! Worker configuration.
//!
//! A [`Config`] is built once at startup, validated, and then passed by
//! reference to every component. Nothing reads configuration from global
//! state.

use std::time::Duration;

use serde::Serialize;

use crate::{Error, Result, filter::Filter};

/// Margin added to the health-check interval to obtain the default staleness
/// threshold. Absorbs clock skew and slow renewals.
pub const STALE_MARGIN: Duration = Duration::from_secs(180);

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// The role being contended for. Shared by every worker in the fleet.
    pub owner_key: String,
    /// This process's identity in the lease record.
    pub host_name: String,
    /// How often the active worker renews and the passive worker re-checks.
    pub health_check_interval: Duration,
    /// Elapsed time since the last health check after which the lease counts
    /// as abandoned.
    pub lease_stale_interval: Duration,
    /// When false the worker consumes unconditionally, without a lease.
    pub coordination_enabled: bool,
    /// Idle wait between polls of the change feed.
    pub poll_interval: Duration,
    /// Subscription filter for the primary collection.
    pub filter: Filter,
}

impl Config {
    pub fn builder(owner_key: impl Into<String>, host_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            owner_key: owner_key.into(),
            host_name: host_name.into(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            lease_stale_interval: None,
            coordination_enabled: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            filter: Filter::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    owner_key: String,
    host_name: String,
    health_check_interval: Duration,
    lease_stale_interval: Option<Duration>,
    coordination_enabled: bool,
    poll_interval: Duration,
    filter: Filter,
}

impl ConfigBuilder {
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Overrides the default of health-check interval plus [`STALE_MARGIN`].
    pub fn lease_stale_interval(mut self, interval: Duration) -> Self {
        self.lease_stale_interval = Some(interval);
        self
    }

    pub fn coordination_enabled(mut self, enabled: bool) -> Self {
        self.coordination_enabled = enabled;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn build(self) -> Result<Config> {
        if self.owner_key.trim().is_empty() {
            return Err(Error::Configuration("owner key must not be empty".into()));
        }
        if self.host_name.trim().is_empty() {
            return Err(Error::Configuration("host name must not be empty".into()));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::Configuration(
                "health check interval must be positive".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Configuration("poll interval must be positive".into()));
        }
        let lease_stale_interval = self
            .lease_stale_interval
            .unwrap_or(self.health_check_interval + STALE_MARGIN);
        if lease_stale_interval < self.health_check_interval {
            return Err(Error::Configuration(format!(
                "lease stale interval {lease_stale_interval:?} is shorter than the health check interval {:?}",
                self.health_check_interval
            )));
        }
        Ok(Config {
            owner_key: self.owner_key,
            host_name: self.host_name,
            health_check_interval: self.health_check_interval,
            lease_stale_interval,
            coordination_enabled: self.coordination_enabled,
            poll_interval: self.poll_interval,
            filter: self.filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_interval_defaults_to_interval_plus_margin() {
        let config = Config::builder("orders-worker", "hostA").build().unwrap();
        assert_eq!(config.lease_stale_interval, Duration::from_secs(185));
        assert!(config.coordination_enabled);
    }

    #[test]
    fn rejects_missing_identity() {
        assert!(matches!(
            Config::builder("", "hostA").build(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Config::builder("orders-worker", "  ").build(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn rejects_stale_interval_below_health_check() {
        let err = Config::builder("orders-worker", "hostA")
            .health_check_interval(Duration::from_secs(30))
            .lease_stale_interval(Duration::from_secs(10))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_zero_intervals() {
        assert!(
            Config::builder("orders-worker", "hostA")
                .health_check_interval(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(
            Config::builder("orders-worker", "hostA")
                .poll_interval(Duration::ZERO)
                .build()
                .is_err()
        );
    }
}
