use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
}

/// Runtime tunables threaded through every component. Values here are the
/// `runtime.*` fields the component sections reference throughout; parsing
/// them out of a config file is a consumer's job, not this crate's.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub bootstrap_timeout: Duration,
    pub ping_interval: Duration,
    pub route_timeout: Duration,
    pub client_check_interval: Duration,
    pub client_inactive_timeout: Option<Duration>,
    pub tool_refresh_interval: Duration,
    pub tool_refresh_concurrency: usize,
    pub bootstrap_concurrency: usize,
    pub reload_mode: ReloadMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    Strict,
    Lenient,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            route_timeout: Duration::from_secs(30),
            client_check_interval: Duration::from_secs(10),
            client_inactive_timeout: None,
            tool_refresh_interval: Duration::from_secs(60),
            tool_refresh_concurrency: 4,
            bootstrap_concurrency: 4,
            reload_mode: ReloadMode::Lenient,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    inner: PartialConfig,
}

#[derive(Debug, Clone, Default)]
struct PartialConfig {
    bootstrap_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    route_timeout: Option<Duration>,
    client_check_interval: Option<Duration>,
    client_inactive_timeout: Option<Duration>,
    tool_refresh_interval: Option<Duration>,
    tool_refresh_concurrency: Option<usize>,
    bootstrap_concurrency: Option<usize>,
    reload_mode: Option<ReloadMode>,
}

impl RuntimeConfigBuilder {
    #[must_use]
    pub fn bootstrap_timeout(mut self, d: Duration) -> Self {
        self.inner.bootstrap_timeout = Some(d);
        self
    }

    #[must_use]
    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.inner.ping_interval = Some(d);
        self
    }

    #[must_use]
    pub fn route_timeout(mut self, d: Duration) -> Self {
        self.inner.route_timeout = Some(d);
        self
    }

    #[must_use]
    pub fn client_check_interval(mut self, d: Duration) -> Self {
        self.inner.client_check_interval = Some(d);
        self
    }

    #[must_use]
    pub fn client_inactive_timeout(mut self, d: Duration) -> Self {
        self.inner.client_inactive_timeout = Some(d);
        self
    }

    #[must_use]
    pub fn tool_refresh_interval(mut self, d: Duration) -> Self {
        self.inner.tool_refresh_interval = Some(d);
        self
    }

    #[must_use]
    pub fn tool_refresh_concurrency(mut self, n: usize) -> Self {
        self.inner.tool_refresh_concurrency = Some(n);
        self
    }

    #[must_use]
    pub fn bootstrap_concurrency(mut self, n: usize) -> Self {
        self.inner.bootstrap_concurrency = Some(n);
        self
    }

    #[must_use]
    pub fn reload_mode(mut self, mode: ReloadMode) -> Self {
        self.inner.reload_mode = Some(mode);
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let defaults = RuntimeConfig::default();
        let ping_interval = self.inner.ping_interval.unwrap_or(defaults.ping_interval);
        if ping_interval.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "ping_interval",
            });
        }
        let bootstrap_concurrency = self
            .inner
            .bootstrap_concurrency
            .unwrap_or(defaults.bootstrap_concurrency);
        if bootstrap_concurrency == 0 {
            return Err(ConfigError::MustBePositive {
                field: "bootstrap_concurrency",
            });
        }
        let tool_refresh_concurrency = self
            .inner
            .tool_refresh_concurrency
            .unwrap_or(defaults.tool_refresh_concurrency);
        if tool_refresh_concurrency == 0 {
            return Err(ConfigError::MustBePositive {
                field: "tool_refresh_concurrency",
            });
        }

        Ok(RuntimeConfig {
            bootstrap_timeout: self.inner.bootstrap_timeout.unwrap_or(defaults.bootstrap_timeout),
            ping_interval,
            route_timeout: self.inner.route_timeout.unwrap_or(defaults.route_timeout),
            client_check_interval: self
                .inner
                .client_check_interval
                .unwrap_or(defaults.client_check_interval),
            client_inactive_timeout: self.inner.client_inactive_timeout,
            tool_refresh_interval: self
                .inner
                .tool_refresh_interval
                .unwrap_or(defaults.tool_refresh_interval),
            tool_refresh_concurrency,
            bootstrap_concurrency,
            reload_mode: self.inner.reload_mode.unwrap_or(defaults.reload_mode),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_builder_matches_default_config() {
        let built = RuntimeConfig::builder().build().unwrap();
        let default = RuntimeConfig::default();
        assert_eq!(built.ping_interval, default.ping_interval);
        assert_eq!(built.reload_mode, default.reload_mode);
    }

    #[test]
    fn zero_ping_interval_rejected() {
        let err = RuntimeConfig::builder()
            .ping_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "ping_interval" }));
    }
}
