//! One-way mirroring of the environment screen to a local sink.

pub mod relay;
pub mod types;

pub use relay::ScreenRelay;
pub use types::{RelayStats, StreamHandle};
