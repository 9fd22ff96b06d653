use crate::{
    config::{NacosConfig, RegistryConfig, StaticEndpointConfig},
    errors::BridgeError,
};
use serde::Deserialize;
use std::{fmt, sync::Arc};
use tonic::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps a logical service name to one live backend address. Implementations
/// are shared by every session and must not keep per-session state.
#[async_trait]
pub trait EndpointResolver: Send + Sync + 'static {
    async fn resolve(&self, service: &str, group: &str) -> Result<Endpoint, BridgeError>;
}

pub fn from_config(registry: &RegistryConfig) -> Result<Arc<dyn EndpointResolver>, BridgeError> {
    match registry {
        RegistryConfig::Nacos(nacos) => Ok(Arc::new(NacosResolver::new(nacos)?)),
        RegistryConfig::Static(endpoint) => Ok(Arc::new(StaticResolver::from(endpoint))),
    }
}

/// Always answers with the configured address.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    endpoint: Endpoint,
}

impl StaticResolver {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl From<&StaticEndpointConfig> for StaticResolver {
    fn from(config: &StaticEndpointConfig) -> Self {
        Self::new(Endpoint::new(config.host.clone(), config.port))
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, _service: &str, _group: &str) -> Result<Endpoint, BridgeError> {
        Ok(self.endpoint.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<Instance>,
}

#[derive(Debug, Clone, Deserialize)]
struct Instance {
    ip: String,
    port: u16,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

/// Looks up healthy instances in a Nacos registry over its open API. Every
/// call performs a fresh query; nothing is cached between sessions.
#[derive(Debug, Clone)]
pub struct NacosResolver {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    credentials: Option<(String, String)>,
}

impl NacosResolver {
    pub fn new(config: &NacosConfig) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BridgeError::Internal(format!("registry client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            namespace: config.namespace.clone(),
            credentials: config
                .credentials()
                .map(|(user, password)| (user.to_string(), password.to_string())),
        })
    }

    async fn login(&self) -> Result<Option<String>, reqwest::Error> {
        let Some((username, password)) = &self.credentials else {
            return Ok(None);
        };

        let response: LoginResponse = self
            .client
            .post(format!("{}/nacos/v1/auth/login", self.base_url))
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Some(response.access_token))
    }

    async fn list_instances(
        &self,
        service: &str,
        group: &str,
    ) -> Result<Vec<Instance>, reqwest::Error> {
        let token = self.login().await?;

        let mut request = self
            .client
            .get(format!("{}/nacos/v1/ns/instance/list", self.base_url))
            .query(&[
                ("serviceName", service),
                ("groupName", group),
                ("namespaceId", self.namespace.as_str()),
                ("healthyOnly", "true"),
            ]);
        if let Some(token) = token {
            request = request.query(&[("accessToken", token)]);
        }

        let list: InstanceList = request.send().await?.error_for_status()?.json().await?;
        Ok(list.hosts)
    }
}

#[async_trait]
impl EndpointResolver for NacosResolver {
    async fn resolve(&self, service: &str, group: &str) -> Result<Endpoint, BridgeError> {
        let instances = self.list_instances(service, group).await.map_err(|e| {
            tracing::error!("Registry lookup for {} failed: {}", service, e);
            BridgeError::no_healthy_instance(service, e)
        })?;

        let chosen = choose_weighted(&instances, rand::random::<f64>())
            .ok_or_else(|| BridgeError::no_healthy_instance(service, "empty instance list"))?;

        tracing::debug!(
            "Resolved {} to {}:{} among {} instances",
            service,
            chosen.ip,
            chosen.port,
            instances.len()
        );
        Ok(Endpoint::new(chosen.ip.clone(), chosen.port))
    }
}

/// Picks an instance with probability proportional to its weight. `roll` is
/// a uniform sample in `[0, 1)`.
fn choose_weighted(instances: &[Instance], roll: f64) -> Option<&Instance> {
    let candidates: Vec<&Instance> = instances
        .iter()
        .filter(|i| i.healthy && i.enabled && i.weight > 0.0)
        .collect();
    let total: f64 = candidates.iter().map(|i| i.weight).sum();

    let mut point = roll * total;
    for candidate in &candidates {
        if point < candidate.weight {
            return Some(*candidate);
        }
        point -= candidate.weight;
    }
    candidates.last().copied()
}
