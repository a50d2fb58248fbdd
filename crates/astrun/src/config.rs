//! Engine configuration.
//!
//! Durations are plain milliseconds so a config file stays readable. Absent
//! optional fields disable the corresponding timer.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server: the name handed back on registration. Client: the name this
    /// client registers under.
    pub name: String,
    /// Server: the token clients must present; `None` accepts any client.
    /// Client: the token presented.
    pub token: Option<String>,
    /// Upper bound on waiting for a response to an outbound request.
    pub call_timeout_ms: Option<u64>,
    /// Connections that have not registered within this window are closed.
    pub handshake_timeout_ms: Option<u64>,
    /// Stored results untouched for this long are dropped by the sweeper.
    pub local_idle_ttl_ms: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "astrun".to_string(),
            token: None,
            call_timeout_ms: None,
            handshake_timeout_ms: None,
            local_idle_ttl_ms: None,
            sweep_interval_ms: 30_000,
        }
    }
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_local_idle_ttl(mut self, ttl: Duration) -> Self {
        self.local_idle_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn local_idle_ttl(&self) -> Option<Duration> {
        self.local_idle_ttl_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"name": "hub", "token": "s3cret"}"#).unwrap();
        assert_eq!(config.name, "hub");
        assert_eq!(config.token.as_deref(), Some("s3cret"));
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_builders() {
        let config = Config::new("peerA")
            .with_call_timeout(Duration::from_millis(250))
            .with_local_idle_ttl(Duration::from_secs(60));
        assert_eq!(config.call_timeout_ms, Some(250));
        assert_eq!(config.local_idle_ttl(), Some(Duration::from_secs(60)));
    }
}
