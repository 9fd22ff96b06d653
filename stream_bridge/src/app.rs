use crate::{
    channel::ChannelManager,
    config::Config,
    resolver,
    server::HttpServer,
    session::{Bridge, BridgeSettings},
};
use tokio::{signal, sync::broadcast};

pub fn build_bridge(config: &Config) -> anyhow::Result<Bridge> {
    let resolver = resolver::from_config(&config.discovery.registry)?;
    let channels = ChannelManager::new(config.session.connect_timeout());
    let settings = BridgeSettings {
        service_name: config.discovery.service_name.clone(),
        group: config.discovery.group.clone(),
        max_message_bytes: config.session.max_message_bytes(),
        close_grace: config.session.close_grace(),
    };

    Ok(Bridge::new(resolver, channels, settings))
}

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let bridge = match build_bridge(&config) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!("Failed to initialize stream bridge: {:?}", e);
            return Err(e);
        }
    };
    tracing::info!(
        "Bridging sessions to {} ({})",
        config.discovery.service_name,
        config.discovery.group
    );

    let server = HttpServer::new(bridge, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
