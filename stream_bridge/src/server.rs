use crate::{
    camera::CameraRegistry,
    config::{Config, SessionConfig},
    routes::api_routes,
    session::Bridge,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub bridge: Bridge,
    pub session_config: SessionConfig,
    pub metrics: Arc<Metrics>,
    pub cameras: Arc<CameraRegistry>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(bridge: Bridge, config: &Config) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.server.get_address()).await?;
        Self::with_listener(bridge, &config.session, listener)
    }

    pub fn with_listener(
        bridge: Bridge,
        session_config: &SessionConfig,
        listener: TcpListener,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState {
            bridge,
            session_config: session_config.clone(),
            metrics,
            cameras: Arc::new(CameraRegistry::new()),
        };

        // Base64 inflates payloads by a third; leave room above the gRPC limit.
        let body_limit = session_config.max_message_bytes() / 3 * 4 + 64 * 1024;

        let router = Router::new()
            .merge(api_routes())
            .with_state(app_state)
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(metrics_layer);

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
