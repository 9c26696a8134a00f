use std::sync::Arc;

use clap::Parser;
use cmd_util::env::config_service;
use dispatcher::{
    Dispatcher,
    GrpcAgentRpc,
};
use front_door::{
    config::FrontDoorConfig,
    http::{
        FrontDoorHttpService,
        MainError,
    },
    invoke::FrontDoorState,
    knobs::{
        HTTP_SERVER_MAX_CONCURRENT_REQUESTS,
        RUNTIME_WORKER_THREADS,
    },
    router::router,
};
use futures::FutureExt;
use metrics::SERVER_VERSION_STR;
use tokio::{
    signal,
    sync::oneshot,
};

fn main() -> Result<(), MainError> {
    let _guard = config_service();
    let config = FrontDoorConfig::parse();
    tracing::info!("Starting the front door with {config:?}");
    let sentry = sentry::init(sentry::ClientOptions {
        release: Some(format!("front-door@{}", *SERVER_VERSION_STR).into()),
        ..Default::default()
    });
    if sentry.is_enabled() {
        tracing::info!(
            "Sentry is enabled. Errors will be reported to project with ID {}",
            sentry
                .dsn()
                .map(|dsn| dsn.project_id().to_string())
                .unwrap_or("unknown".to_string())
        );
    } else {
        tracing::info!("Sentry is not enabled.")
    }

    let mut tokio_builder = tokio::runtime::Builder::new_multi_thread();
    if *RUNTIME_WORKER_THREADS > 0 {
        tokio_builder.worker_threads(*RUNTIME_WORKER_THREADS);
    }
    let tokio = tokio_builder.enable_all().build()?;
    tokio.block_on(run_server(config))?;
    Ok(())
}

async fn run_server(config: FrontDoorConfig) -> anyhow::Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatcher_config(),
        Arc::new(GrpcAgentRpc::new()),
    )?);
    let http_service = FrontDoorHttpService::new(
        router(FrontDoorState::new(dispatcher)),
        SERVER_VERSION_STR.to_string(),
        *HTTP_SERVER_MAX_CONCURRENT_REQUESTS,
    );
    // Used to signal to the http service to stop.
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let serve_future = http_service
        .serve(config.http_bind_address().into(), async move {
            let _ = shutdown_rx.await;
        })
        .fuse();
    futures::pin_mut!(serve_future);

    // Start shutdown with the first ctrl-c.
    futures::select! {
        r = serve_future => {
            r?;
            anyhow::bail!("Serve future stopped unexpectedly!");
        },
        r = signal::ctrl_c().fuse() => {
            tracing::info!("Received Ctrl-C signal!");
            r?;
            let _ = shutdown_tx.send(());
        },
    }

    tracing::info!("Shutdown initiated, draining existing requests...");
    futures::select! {
        r = serve_future => {
            r?;
            tracing::info!("Server successfully shut down.");
        },
        // Forcibly shutdown with second ctrl-c.
        r = signal::ctrl_c().fuse() => {
            r?;
            tracing::warn!("Forcibly shutting down!");
        },
    }
    Ok(())
}
