use crate::{
    config::Config, frame_processor::FrameProcessor, inference_service::InferenceService,
    stub_detector::StubDetector,
};
use std::future::Future;
use stream_proto::inference_stream_service_server::InferenceStreamServiceServer;
use tokio::{net::TcpListener, signal};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;

pub struct GrpcServer {
    router: Router,
}

impl GrpcServer {
    pub async fn new(
        processor: impl FrameProcessor,
        max_message_bytes: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inference_service = InferenceStreamServiceServer::new(InferenceService::new(processor))
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes);

        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(stream_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_service_status("ai.InferenceStreamService", tonic_health::ServingStatus::Serving)
            .await;

        let router = Server::builder()
            .add_service(inference_service)
            .add_service(health_service)
            .add_service(reflection_service);

        Ok(Self { router })
    }

    pub async fn run(self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let addr: std::net::SocketAddr = addr.parse()?;

        tracing::info!("Inference stub listening on {}", addr);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn run_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), tonic::transport::Error> {
        self.router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let detector = StubDetector::new(&config.model);

    let addr = config.server.get_address();
    let grpc_server = GrpcServer::new(detector, config.grpc.max_message_bytes()).await?;

    grpc_server.run(&addr).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
