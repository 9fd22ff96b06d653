use axum::{
    extract::Query,
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use stream_bridge::{
    config::NacosConfig,
    errors::BridgeError,
    resolver::{EndpointResolver, NacosResolver},
};
use tokio::net::TcpListener;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn login(Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    let token = if form.get("username").map(String::as_str) == Some("nacos")
        && form.get("password").map(String::as_str) == Some("secret")
    {
        "token-1"
    } else {
        "rejected"
    };
    Json(json!({ "accessToken": token, "tokenTtl": 18000 }))
}

async fn instances(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let authorized = query.get("accessToken").map(String::as_str) == Some("token-1");
    let service = query.get("serviceName").cloned().unwrap_or_default();
    if !authorized || service != "yolo-inference-service" {
        return Json(json!({ "name": service, "hosts": [] }));
    }
    Json(json!({
        "name": service,
        "hosts": [
            { "ip": "10.0.0.1", "port": 50051, "healthy": false, "enabled": true, "weight": 1.0 },
            { "ip": "10.0.0.2", "port": 50052, "healthy": true, "enabled": true, "weight": 1.0 }
        ]
    }))
}

async fn spawn_registry() -> Result<String, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = Router::new()
        .route("/nacos/v1/auth/login", post(login))
        .route("/nacos/v1/ns/instance/list", get(instances));
    tokio::spawn(async move { axum::serve(listener, router).await });
    Ok(addr.to_string())
}

fn nacos(address: String, username: &str, password: &str) -> NacosConfig {
    NacosConfig {
        address,
        namespace: String::new(),
        username: username.to_string(),
        password: password.to_string(),
        request_timeout_ms: 1000,
    }
}

#[tokio::test]
async fn test_resolves_healthy_instance_after_login() -> TestResult {
    let address = spawn_registry().await?;
    let resolver = NacosResolver::new(&nacos(address, "nacos", "secret"))?;

    let endpoint = resolver
        .resolve("yolo-inference-service", "DEFAULT_GROUP")
        .await?;

    assert_eq!(endpoint.to_string(), "10.0.0.2:50052");
    assert_eq!(endpoint.uri(), "http://10.0.0.2:50052");
    Ok(())
}

#[tokio::test]
async fn test_empty_instance_list_is_no_healthy_instance() -> TestResult {
    let address = spawn_registry().await?;
    let resolver = NacosResolver::new(&nacos(address, "nacos", "secret"))?;

    let result = resolver.resolve("unknown-service", "DEFAULT_GROUP").await;

    assert!(matches!(
        result,
        Err(BridgeError::NoHealthyInstance { ref service, .. }) if service == "unknown-service"
    ));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_registry_is_no_healthy_instance() -> TestResult {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let address = listener.local_addr()?.to_string();
    drop(listener);
    let resolver = NacosResolver::new(&nacos(address, "", ""))?;

    let result = resolver
        .resolve("yolo-inference-service", "DEFAULT_GROUP")
        .await;

    assert!(matches!(result, Err(BridgeError::NoHealthyInstance { .. })));
    Ok(())
}
