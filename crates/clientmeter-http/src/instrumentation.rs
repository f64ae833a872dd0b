//! Wires a client, its metrics listener and the registries from config.

use std::sync::Arc;

use clientmeter_core::error::Result;

use crate::client::InstrumentedClient;
use crate::config::MeterConfig;
use crate::listener::{RequestMetricsListener, UriPath};
use crate::obs::metrics::MeterRegistry;
use crate::obs::observation::{ObservationRegistry, TracingObservationHandler};

#[derive(Clone)]
pub struct Instrumentation {
    registry: MeterRegistry,
    observations: ObservationRegistry,
    client: InstrumentedClient,
    listener: Arc<RequestMetricsListener>,
}

impl Instrumentation {
    /// Build with the default hyper transport.
    pub fn new(cfg: &MeterConfig) -> Result<Self> {
        Self::with_client(cfg, InstrumentedClient::new(&cfg.client))
    }

    /// Instrument an existing client.
    /// Returns Result so callers can surface a missing listener hook at setup.
    pub fn with_client(cfg: &MeterConfig, client: InstrumentedClient) -> Result<Self> {
        let registry = MeterRegistry::new();
        let observations = ObservationRegistry::new();
        if cfg.observation.enabled && cfg.observation.tracing {
            observations.add_handler(Arc::new(TracingObservationHandler));
        }

        let mut builder = RequestMetricsListener::builder(registry.clone(), UriPath)
            .configure(&cfg.metrics);
        if cfg.observation.enabled {
            builder = builder.observation_registry(observations.clone());
            if let Some(name) = &cfg.observation.name {
                builder = builder.observation_name(name.as_str());
            }
        }
        let listener = Arc::new(builder.build());
        listener.attach_to(&client)?;

        tracing::debug!(
            requests = %listener.names().requests,
            active = %listener.names().active,
            observation = cfg.observation.enabled,
            "request metrics listener attached"
        );

        Ok(Self {
            registry,
            observations,
            client,
            listener,
        })
    }

    pub fn registry(&self) -> &MeterRegistry {
        &self.registry
    }

    pub fn observations(&self) -> &ObservationRegistry {
        &self.observations
    }

    pub fn client(&self) -> &InstrumentedClient {
        &self.client
    }

    pub fn listener(&self) -> Arc<RequestMetricsListener> {
        Arc::clone(&self.listener)
    }
}
