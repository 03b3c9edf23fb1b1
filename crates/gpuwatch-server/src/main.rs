mod args;
mod caller;
mod error;
mod handlers;
mod metrics;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use gpuwatch_core::{FleetConfig, GpuWatch, RemoteExec, SshExec};

use crate::args::Args;
use crate::metrics::Metrics;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = gpuwatch_common::telemetry::init_tracing(
        "gpuwatch-server",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    let mut config = FleetConfig::load(&args.roster)
        .with_context(|| format!("loading roster {}", args.roster))?;
    args.apply(&mut config.settings);
    config.validate().context("invalid settings")?;

    tracing::info!(
        roster=%args.roster,
        hosts=config.hosts.len(),
        listen_addr=%args.listen_addr,
        "gpuwatch starting"
    );

    let exec: Arc<dyn RemoteExec> = Arc::new(
        SshExec::new()
            .with_program(args.ssh_program.clone())
            .with_options(args.ssh_options.clone()),
    );
    let watch = GpuWatch::new(config, exec);

    // Warm the cache so the first readers and /healthz see a snapshot.
    let warm = watch.clone();
    tokio::spawn(async move {
        let fleet = warm.cache().refresh().await;
        tracing::info!(
            online = fleet.online_hosts(),
            hosts = fleet.total_hosts(),
            "initial fleet scan committed"
        );
    });

    let st = AppState {
        watch,
        metrics: Arc::new(Metrics::default()),
    };
    let app = routes::router(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("binding {}", args.listen_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
