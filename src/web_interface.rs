//! HTTP control surface over the session coordinator.

pub mod routes;
pub mod types;
pub mod web_server;

pub use types::ApiError;
pub use web_server::WebServer;
