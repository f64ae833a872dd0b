//! Observability building blocks: the meter registry and the observation
//! registry the request listener reports into.

pub mod metrics;
pub mod observation;

pub use metrics::{tags, LongTaskTimer, MeterRegistry, Tags, Timer};
pub use observation::{
    Observation, ObservationContext, ObservationHandler, ObservationRegistry,
    TracingObservationHandler,
};
