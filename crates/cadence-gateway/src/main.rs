use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use cadence_core::config::CadenceConfig;
use cadence_gateway::{build_router, AppState, HeaderIdentity};
use cadence_scheduler::{build_notifier, HttpInvoker, Scheduler};
use cadence_store::{open_store, StoreAuditSink};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "cadence-gateway", version, about = "Cron workflow scheduler")]
struct Cli {
    /// Optional TOML config, layered under the environment.
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "cadence_gateway=info,cadence_scheduler=info,cadence_store=info,tower_http=debug"
                        .into()
                }),
        )
        .init();

    let cli = Cli::parse();
    let config = CadenceConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Err(e) = config.validate() {
        error!(error = %e, "refusing to start");
        return Err(e.into());
    }

    let store = open_store(&config.database)
        .await
        .context("connecting to the database")?;
    info!(backend = store.backend(), "store ready");

    let audit = Arc::new(StoreAuditSink::new(store.clone()));
    let invoker = Arc::new(HttpInvoker::new().context("building HTTP client")?);
    let scheduler = Scheduler::new(
        store.clone(),
        invoker,
        audit.clone(),
        build_notifier(&config.notify),
        &config,
    );
    scheduler.start().await.context("starting scheduler")?;

    let state = Arc::new(AppState::new(
        store,
        scheduler.clone(),
        audit,
        Arc::new(HeaderIdentity),
    ));
    let router = build_router(state);

    // validate() guarantees the port.
    let port = config.server.port.unwrap_or_default();
    let addr: SocketAddr = format!("{}:{}", config.server.bind, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, commit = env!("CADENCE_GIT_SHA"), "cadence gateway listening");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        })
        .await
    });

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = stop_tx.send(true);

    let budget = config.shutdown_budget();
    let (http, ()) = tokio::join!(
        tokio::time::timeout(budget, server),
        scheduler.shutdown()
    );
    match http {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "http server exited with error"),
        Ok(Err(e)) => warn!(error = %e, "http server task failed"),
        Err(_) => warn!("in-flight requests still running at shutdown budget"),
    }
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
