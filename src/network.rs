pub mod bridge_config;
pub mod types;

pub use bridge_config::NetworkBridgeConfig;
pub use types::RoutePlan;
