//! Instrumentation config loader (strict parsing).

pub mod schema;

use std::fs;

use clientmeter_core::error::{ClientMeterError, Result};

pub use schema::{ClientSection, MeterConfig, MetricsSection, ObservationSection, ProbeSection};

pub fn load_from_file(path: &str) -> Result<MeterConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| ClientMeterError::Config(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<MeterConfig> {
    let cfg: MeterConfig = serde_yaml::from_str(s)
        .map_err(|e| ClientMeterError::Config(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
