//! Environment backends (VirtualBox guest or physical device) and their exclusive binding.

pub mod controller;
pub mod device_bridge;
pub mod hypervisor;
pub mod tool;
pub mod types;

pub use controller::{BackoffPolicy, EnvironmentController};
pub use device_bridge::{AdbBridge, DeviceBridge};
pub use hypervisor::{Hypervisor, VirtualBox};
pub use types::{EnvironmentHandle, EnvironmentKind, EnvironmentSpec};
