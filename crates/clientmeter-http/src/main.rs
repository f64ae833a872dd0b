//! clientmeter probe
//!
//! - Load config (strict YAML)
//! - GET every configured target through the instrumented client
//! - Print one JSON line per target, then the Prometheus rendering
//! - Optionally keep serving `/metrics`

use std::net::SocketAddr;

use futures_util::future::join_all;
use tracing_subscriber::{fmt, EnvFilter};

use clientmeter_core::error::{ClientMeterError, Result};
use clientmeter_http::{config, ops, Instrumentation};

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "clientmeter.yaml".to_string());

    if let Err(e) = run(&path).await {
        tracing::error!(error = %e, "clientmeter-probe failed");
        std::process::exit(1);
    }
}

async fn run(path: &str) -> Result<()> {
    let cfg = config::load_from_file(path)?;
    let inst = Instrumentation::new(&cfg)?;

    tracing::info!(targets = cfg.probe.targets.len(), "probing");
    let client = inst.client();
    let results = join_all(cfg.probe.targets.iter().map(|t| client.get(t))).await;

    for (target, result) in cfg.probe.targets.iter().zip(results) {
        let line = match result {
            Ok(resp) => serde_json::json!({
                "target": target,
                "status": resp.status,
                "bytes": resp.body.len(),
            }),
            Err(e) => serde_json::json!({
                "target": target,
                "error": e.kind().as_str(),
                "msg": e.to_string(),
            }),
        };
        println!("{line}");
    }
    print!("{}", inst.registry().render());

    if let Some(listen) = &cfg.probe.listen {
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| ClientMeterError::Config(format!("probe.listen must be a valid SocketAddr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ClientMeterError::Internal(format!("bind {addr} failed: {e}")))?;

        tracing::info!(%addr, "serving metrics");
        axum::serve(listener, ops::router(inst.registry().clone()))
            .await
            .map_err(|e| ClientMeterError::Internal(format!("server failed: {e}")))?;
    }

    client.stop();
    Ok(())
}
