//! Pulsegate agent
//!
//! Per-host DaemonSet agent that runs a deterministic GPU self-test when the
//! local node transitions to Ready and propagates the verdict as a
//! quarantine taint plus a status condition.

mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use pulsegate_core::{CudaKernel, GpuProbe, Pipeline, SmiProbe, Thresholds};
use pulsegate_k8s::{run_watch_loop, Controller, K8sClient, NodeLocks};

const METRICS_PORT: u16 = 9090;

/// Wire up tracing output: level from RUST_LOG or the CLI flag, structured
/// JSON lines when requested (the DaemonSet manifest sets PULSEGATE_LOG_JSON).
fn init_logging(log_level: &str, json_format: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json_format {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Run one pulse against the local hardware and exit. No cluster access;
/// useful as an image smoke test and for bring-up on new SKUs.
fn run_once() -> Result<()> {
    let kernel = CudaKernel::load().context("load pulse kernel")?;
    let probe = SmiProbe;

    let gpu = probe.product_name();
    let thresholds = Thresholds::from_env(&gpu);
    info!(
        gpu = %gpu,
        threshold_ms = thresholds.threshold_ms(),
        "running single pulse (--once mode)"
    );

    let pipeline = Pipeline::new(Arc::new(kernel), Arc::new(probe), thresholds);
    let (elapsed, verdict) = pipeline.run();
    verdict
        .map_err(anyhow::Error::new)
        .context("GPU pulse failed")?;

    info!(elapsed_ms = elapsed.as_millis() as u64, "GPU pulse passed");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let node_name = cli
        .node_name
        .context("NODE_NAME not set; mount the node name via the downward API")?;

    let client = K8sClient::try_default().await?;
    let kernel = CudaKernel::load().context("load pulse kernel")?;
    let probe = SmiProbe;

    let gpu = probe.product_name();
    let thresholds = Thresholds::from_env(&gpu);
    info!(
        gpu = %gpu,
        threshold_ms = thresholds.threshold_ms(),
        cv_max = thresholds.cv_max,
        p2p_min_gbs = thresholds.p2p_min_gbs,
        idle_temp_c = thresholds.idle_temp_c,
        "thresholds resolved"
    );

    let threshold_ms = thresholds.threshold_ms();
    let pipeline = Arc::new(Pipeline::new(Arc::new(kernel), Arc::new(probe), thresholds));
    let controller = Arc::new(Controller::new(client.clone(), pipeline, threshold_ms));
    let locks = Arc::new(NodeLocks::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!(signal, "initiating shutdown");
        let _ = shutdown_tx.send(true);
    });

    let metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(metrics_shutdown).await {
            error!(error = %e, "metrics server failed");
        }
    });

    info!(node = %node_name, "pulsegate starting watch loop");
    run_watch_loop(controller, client, node_name, locks, shutdown_rx).await;

    info!("pulsegate shutdown complete");
    Ok(())
}

/// Resolves once a termination signal arrives, naming which one. SIGTERM is
/// what the kubelet sends on pod deletion; Ctrl+C covers interactive runs.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
        "SIGINT"
    };

    #[cfg(unix)]
    let sigterm = async {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        term.recv().await;
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<&'static str>();

    tokio::select! {
        signal = interrupt => signal,
        signal = sigterm => signal,
    }
}

/// Serve the Prometheus textual exposition on /metrics until shutdown.
async fn serve_metrics(mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], METRICS_PORT));
    let listener = TcpListener::bind(addr).await?;
    info!(port = METRICS_PORT, "metrics server listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (mut socket, _) = accepted?;

                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("");

                    let response = if path == "/metrics" {
                        let body = prometheus::TextEncoder::new()
                            .encode_to_string(&prometheus::gather())
                            .unwrap_or_default();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
                    };

                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "pulsegate starting");

    if cli.once {
        return run_once();
    }

    run(cli).await
}
