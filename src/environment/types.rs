//! Core types used by the environment subsystem.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// A VirtualBox guest reverted to a clean snapshot for every session.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualMachineSpec {
    /// VM UUID (or name) as understood by the hypervisor.
    pub identifier: String,
    /// Snapshot UUID restored on release.
    pub snapshot: String,
    /// Hypervisor control binary (e.g. `VBoxManage`).
    pub hypervisor: PathBuf,
    /// Guest address on the host-only network.
    pub ip: IpAddr,
    /// Device bridge (adb) port exposed by the guest.
    pub bridge_port: u16,
    pub headless: bool,
    pub timeout: Duration,
}

/// A physical device already attached to the device bridge. No power control.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalDeviceSpec {
    pub bridge_address: IpAddr,
    pub bridge_port: u16,
    pub serial: String,
    pub timeout: Duration,
}

/// Environment backend selected for a session.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvironmentSpec {
    VirtualMachine(VirtualMachineSpec),
    PhysicalDevice(PhysicalDeviceSpec),
}

impl EnvironmentSpec {
    /// Identifier used for exclusive binding (VM UUID or device serial).
    pub fn identifier(&self) -> &str {
        match self {
            EnvironmentSpec::VirtualMachine(vm) => &vm.identifier,
            EnvironmentSpec::PhysicalDevice(device) => &device.serial,
        }
    }

    /// Serial used to address the environment over the device bridge.
    pub fn bridge_serial(&self) -> String {
        match self {
            EnvironmentSpec::VirtualMachine(vm) => format!("{}:{}", vm.ip, vm.bridge_port),
            EnvironmentSpec::PhysicalDevice(device) => device.serial.clone(),
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            EnvironmentSpec::VirtualMachine(vm) => vm.ip,
            EnvironmentSpec::PhysicalDevice(device) => device.bridge_address,
        }
    }

    /// Reachability budget, also used as the default session deadline.
    pub fn timeout(&self) -> Duration {
        match self {
            EnvironmentSpec::VirtualMachine(vm) => vm.timeout,
            EnvironmentSpec::PhysicalDevice(device) => device.timeout,
        }
    }

    pub fn kind(&self) -> EnvironmentKind {
        match self {
            EnvironmentSpec::VirtualMachine(_) => EnvironmentKind::VirtualMachine,
            EnvironmentSpec::PhysicalDevice(_) => EnvironmentKind::PhysicalDevice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnvironmentKind {
    VirtualMachine,
    PhysicalDevice,
}

/// Lifecycle of a handle returned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandleState {
    Active,
    Released,
    /// Revert failed; the environment is unusable until an operator clears it.
    Leaked,
}

/// Exclusive binding of an environment to one session.
#[derive(Debug)]
pub struct EnvironmentHandle {
    pub spec: EnvironmentSpec,
    /// Serial used with the device bridge.
    pub serial: String,
    pub ip: IpAddr,
    pub acquired_at: DateTime<Utc>,
    /// Whether this acquisition powered the VM on (as opposed to reusing a running one).
    pub started_by_us: bool,
    pub(crate) state: HandleState,
}

impl EnvironmentHandle {
    pub fn identifier(&self) -> &str {
        self.spec.identifier()
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn kind(&self) -> EnvironmentKind {
        self.spec.kind()
    }
}
