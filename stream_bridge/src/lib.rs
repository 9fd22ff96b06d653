mod routes;

pub mod adapters;
pub mod app;
pub mod camera;
pub mod channel;
pub mod config;
pub mod decoder;
pub mod dto;
pub mod errors;
pub mod model;
pub mod resolver;
pub mod server;
pub mod session;
pub mod telemetry;

pub use app::{build_bridge, start_app};
pub use errors::BridgeError;
pub use server::HttpServer;
pub use session::{Bridge, BridgeSettings, SessionEvent};
