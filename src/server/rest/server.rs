use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ExecutorConfig, GatewayKind};
use crate::docker::DockerGateway;
use crate::executor::Executor;
use crate::gateway::{InMemoryGateway, SandboxGateway};
use crate::server::rest::create_router;

/// Never fails: an unreachable runtime is waited for by `Executor::start`.
pub fn build_gateway(config: &ExecutorConfig) -> Arc<dyn SandboxGateway> {
    match config.gateway {
        GatewayKind::Docker => {
            info!("Using Docker sandbox runtime");
            Arc::new(DockerGateway::new(config.docker.clone()))
        }
        GatewayKind::Memory => {
            warn!("Using the in-memory sandbox runtime; nothing will actually run");
            Arc::new(InMemoryGateway::default())
        }
    }
}

pub async fn run_rest_server(config: ExecutorConfig) -> Result<()> {
    info!(
        r#"
          _ _
  ___ ___| | | _____  _____  ___
 / __/ _ \ | |/ _ \ \/ / _ \/ __|
| (_|  __/ | |  __/>  <  __/ (__
 \___\___|_|_|\___/_/\_\___|\___|

Starting executor...
PID: {}
"#,
        std::process::id()
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let gateway = build_gateway(&config);
    let executor = Executor::start(&config, gateway, shutdown.clone()).await?;

    info!("Building REST API routes...");
    let app = create_router(executor.clone());

    info!("Binding to: {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    info!("REST API Endpoint: http://{}/api/v0", config.listen_addr);
    info!("Swagger UI: http://{}/swagger-ui/", config.listen_addr);
    info!("Ready to accept requests...");

    // Event streams only end once the executor closes them, so shut it down
    // before the server waits on open connections
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            executor.shutdown().await;
        })
        .await
        .context("REST server failed")?;

    info!("Executor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
