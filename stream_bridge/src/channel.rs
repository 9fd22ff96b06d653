use crate::{errors::BridgeError, resolver::Endpoint};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use stream_proto::inference_stream_service_client::InferenceStreamServiceClient;
use tonic::transport::Channel;

/// Hands out one transport connection per session and tracks how many are
/// still held.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    connect_timeout: Duration,
    active: Arc<AtomicUsize>,
}

/// A connected client leased to a single session. The lease is returned when
/// the value is dropped, on every exit path.
pub struct SessionChannel {
    pub client: InferenceStreamServiceClient<Channel>,
    endpoint: Endpoint,
    _lease: Lease,
}

#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChannelManager {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connects to `endpoint`. Failures are reported, never retried here.
    pub async fn open(
        &self,
        endpoint: &Endpoint,
        max_message_bytes: usize,
    ) -> Result<SessionChannel, BridgeError> {
        let unavailable = |reason: String| BridgeError::ChannelUnavailable {
            endpoint: endpoint.to_string(),
            reason,
        };

        let channel = tonic::transport::Endpoint::from_shared(endpoint.uri())
            .map_err(|e| unavailable(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to gRPC server {}: {:?}", endpoint, e);
                unavailable(e.to_string())
            })?;

        let client = InferenceStreamServiceClient::new(channel)
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes);

        self.active.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Channel opened to {}", endpoint);

        Ok(SessionChannel {
            client,
            endpoint: endpoint.clone(),
            _lease: Lease(self.active.clone()),
        })
    }

    pub fn close(&self, channel: SessionChannel) {
        tracing::debug!("Channel to {} released", channel.endpoint);
        drop(channel);
    }

    /// Number of channels currently leased to sessions.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}
