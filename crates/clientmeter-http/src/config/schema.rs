use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use clientmeter_core::error::{ClientMeterError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    pub version: u32,

    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub metrics: MetricsSection,

    #[serde(default)]
    pub observation: ObservationSection,

    #[serde(default)]
    pub probe: ProbeSection,
}

impl MeterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(ClientMeterError::UnsupportedVersion);
        }

        self.client.validate()?;
        self.metrics.validate()?;
        self.observation.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl ClientSection {
    pub fn validate(&self) -> Result<()> {
        if !(100..=600000).contains(&self.request_timeout_ms) {
            return Err(ClientMeterError::Config(
                "client.request_timeout_ms must be between 100 and 600000".into(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ClientMeterError::Config("client.user_agent must not be empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    30000
}
fn default_user_agent() -> String {
    concat!("clientmeter/", env!("CARGO_PKG_VERSION")).into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    #[serde(default = "default_requests_name")]
    pub requests_name: String,

    #[serde(default = "default_active_name")]
    pub active_name: String,

    #[serde(default = "default_max_uri_tags")]
    pub max_uri_tags: usize,

    #[serde(default)]
    pub extra_tags: BTreeMap<String, String>,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            requests_name: default_requests_name(),
            active_name: default_active_name(),
            max_uri_tags: default_max_uri_tags(),
            extra_tags: BTreeMap::new(),
        }
    }
}

impl MetricsSection {
    pub fn validate(&self) -> Result<()> {
        if self.requests_name.is_empty() || self.active_name.is_empty() {
            return Err(ClientMeterError::Config("metrics names must not be empty".into()));
        }
        if self.requests_name == self.active_name {
            return Err(ClientMeterError::Config(
                "metrics.requests_name and metrics.active_name must differ".into(),
            ));
        }
        if !(1..=10000).contains(&self.max_uri_tags) {
            return Err(ClientMeterError::Config(
                "metrics.max_uri_tags must be between 1 and 10000".into(),
            ));
        }
        Ok(())
    }
}

fn default_requests_name() -> String {
    "client.requests".into()
}
fn default_active_name() -> String {
    "client.requests.active".into()
}
fn default_max_uri_tags() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservationSection {
    #[serde(default)]
    pub enabled: bool,

    /// Observation name; unset means `metrics.requests_name`.
    #[serde(default)]
    pub name: Option<String>,

    /// Attach the tracing span handler.
    #[serde(default = "default_true")]
    pub tracing: bool,
}

impl Default for ObservationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            name: None,
            tracing: true,
        }
    }
}

impl ObservationSection {
    pub fn validate(&self) -> Result<()> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ClientMeterError::Config("observation.name must not be empty".into()));
        }
        if self.enabled && !self.tracing {
            tracing::warn!("observation.enabled without any handler is a no-op");
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSection {
    #[serde(default)]
    pub targets: Vec<String>,

    /// Serve `/metrics` on this address after probing.
    #[serde(default)]
    pub listen: Option<String>,
}
