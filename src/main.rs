use devtunnel::config::GlobalConfig;
use devtunnel::ipc::IPCServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("devtunnel daemon starting");

    let config = GlobalConfig::load()?;
    let grace = config.daemon.grace_period();
    tracing::info!(
        "Working directory: {}, control API: {}",
        config.daemon.working_dir.display(),
        config.daemon.listen_addr
    );

    let ipc_server = IPCServer::new(config);
    let supervisor = ipc_server.supervisor.clone();

    // Graceful shutdown: Ctrl+C 시 모든 역할 정지
    let server = tokio::spawn(ipc_server.start());
    tokio::select! {
        res = server => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("IPC server error: {}", e),
                Err(e) => tracing::error!("IPC server task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping supervised processes...");
        }
    }

    for (role, outcome) in supervisor.stop_all(grace).await {
        tracing::info!("[Shutdown] {}: {:?}", role, outcome);
    }

    tracing::info!("devtunnel daemon shutting down");
    Ok(())
}
