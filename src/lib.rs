pub mod configuration;
pub mod controller;
pub mod data_capture;
pub mod environment;
pub mod error_handling;
pub mod network;
pub mod proxy;
pub mod screen_relay;
pub mod session_management;
pub mod web_interface;

#[cfg(test)]
pub mod testing;

pub use controller::Controller;
pub use session_management::{SessionCoordinator, SessionRequest, SessionState, StopReport};
