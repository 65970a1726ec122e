//! Local HTTP control API consumed by the menu/CLI front-end.

pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::auth::TracingDisplay;
use crate::config::GlobalConfig;
use crate::extension::{CliInstaller, ExtensionResolver, SecondaryRegistry};
use crate::supervisor::{Role, Supervisor};
use crate::tunnel::TunnelController;

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub config: Arc<GlobalConfig>,
    pub supervisor: Arc<Supervisor>,
    pub tunnel: Arc<TunnelController>,
    pub extensions: Arc<ExtensionResolver>,
    pub listen_addr: String,
}

impl IPCServer {
    /// Wire every component from configuration.
    pub fn new(config: GlobalConfig) -> Self {
        let supervisor = Arc::new(config.build_supervisor());
        let tunnel = Arc::new(TunnelController::new(
            supervisor.clone(),
            config.auth.negotiator_config(),
            Arc::new(TracingDisplay),
        ));

        let ext = &config.extensions;
        let installer = CliInstaller::new(
            config.roles.get(Role::EditorServer).command.clone(),
            config.daemon.working_dir.clone(),
            config.launch_environment().build(),
            Duration::from_secs(ext.install_timeout_secs),
        );
        let secondary = SecondaryRegistry::new(
            &ext.secondary_url,
            Duration::from_secs(ext.http_timeout_secs),
            ext.download_dir.clone(),
        );
        let extensions = Arc::new(
            ExtensionResolver::new(Arc::new(installer), secondary)
                .with_platform(ext.platform.clone())
                .with_secondary_only_publishers(ext.secondary_only_publishers.clone()),
        );

        Self::from_parts(Arc::new(config), supervisor, tunnel, extensions)
    }

    pub fn from_parts(
        config: Arc<GlobalConfig>,
        supervisor: Arc<Supervisor>,
        tunnel: Arc<TunnelController>,
        extensions: Arc<ExtensionResolver>,
    ) -> Self {
        let listen_addr = config.daemon.listen_addr.clone();
        Self {
            config,
            supervisor,
            tunnel,
            extensions,
            listen_addr,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/roles", get(handlers::role::list_roles))
            .route("/api/role/:role/start", post(handlers::role::start_role))
            .route("/api/role/:role/stop", post(handlers::role::stop_role))
            .route("/api/role/:role/restart", post(handlers::role::restart_role))
            .route("/api/role/:role/console", get(handlers::role::console))
            .route("/api/tunnel/start", post(handlers::tunnel::start_tunnel))
            .route("/api/tunnel/session", get(handlers::tunnel::get_session))
            .route("/api/extensions", get(handlers::extension::list_extensions))
            .route("/api/extensions/update", post(handlers::extension::update_all))
            .route(
                "/api/extensions/:id",
                get(handlers::extension::get_extension).delete(handlers::extension::uninstall_extension),
            )
            .route("/api/extensions/:id/install", post(handlers::extension::install_extension))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}
