#![allow(dead_code)]

use image::{ImageBuffer, ImageFormat, Rgb};
use inference_stub::{config::ModelConfig, FrameProcessor, GrpcServer, StubDetector};
use std::{io::Cursor, net::SocketAddr, time::Duration};
use stream_bridge::{
    channel::ChannelManager,
    config::SessionConfig,
    resolver::{Endpoint, StaticResolver},
    Bridge, BridgeSettings, HttpServer,
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, oneshot},
};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

pub struct Backend {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
    }
}

pub async fn spawn_backend<P: FrameProcessor>(processor: P) -> Result<Backend, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = GrpcServer::new(processor, MAX_MESSAGE_BYTES).await?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_on(listener, async {
        shutdown_rx.await.ok();
    }));

    Ok(Backend {
        addr,
        shutdown: Some(shutdown_tx),
    })
}

pub async fn spawn_stub() -> Result<Backend, Box<dyn std::error::Error>> {
    spawn_backend(StubDetector::new(&ModelConfig::default())).await
}

pub fn bridge_to(addr: SocketAddr) -> Bridge {
    Bridge::new(
        std::sync::Arc::new(StaticResolver::new(Endpoint::new(
            addr.ip().to_string(),
            addr.port(),
        ))),
        ChannelManager::new(Duration::from_secs(2)),
        bridge_settings(),
    )
}

pub fn bridge_settings() -> BridgeSettings {
    BridgeSettings {
        service_name: "yolo-inference-service".to_string(),
        group: "DEFAULT_GROUP".to_string(),
        max_message_bytes: MAX_MESSAGE_BYTES,
        close_grace: Duration::from_secs(2),
    }
}

pub struct App {
    pub base_url: String,
    shutdown: broadcast::Sender<()>,
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown.send(()).ok();
    }
}

pub async fn spawn_app(bridge: Bridge, session: SessionConfig) -> Result<App, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = HttpServer::with_listener(bridge, &session, listener)?;
    let base_url = format!("http://{}", server.local_addr()?);
    let (shutdown, rx) = broadcast::channel(1);
    server.run(rx).await?;

    Ok(App { base_url, shutdown })
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        max_message_mb: 8,
        one_shot_timeout_secs: 5,
        stream_timeout_secs: 10,
        long_stream_timeout_secs: 10,
        frame_interval_ms: 20,
        close_grace_ms: 2000,
        ..SessionConfig::default()
    }
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = ImageBuffer::from_pixel(width, height, Rgb([40u8, 80, 120]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// Polls until every channel lease has been returned.
pub async fn wait_for_idle(bridge: &Bridge) -> bool {
    for _ in 0..50 {
        if bridge.channels().active() == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
