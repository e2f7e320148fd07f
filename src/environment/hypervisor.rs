//! Hypervisor control surface.
//!
//! [`Hypervisor`] is the seam the controller is written against; [`VirtualBox`]
//! drives `VBoxManage`. Tool failures and unexpected output both become
//! [`EnvironmentError::HypervisorError`].

use async_trait::async_trait;
use log::{debug, info};
use regex::Regex;
use std::time::Duration;

use super::tool::run_tool;
use super::types::VirtualMachineSpec;
use crate::error_handling::types::EnvironmentError;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Whether the VM is currently powered on.
    async fn is_running(&self, vm: &VirtualMachineSpec) -> Result<bool, EnvironmentError>;
    /// Powers the VM on, headless when `vm.headless` is set.
    async fn start(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError>;
    /// Hard power off.
    async fn power_off(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError>;
    /// Restores `vm.snapshot`. The VM must be powered off.
    async fn restore_snapshot(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError>;
}

/// `VBoxManage` backed hypervisor.
pub struct VirtualBox {
    command_timeout: Duration,
}

impl VirtualBox {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn vboxmanage(
        &self,
        vm: &VirtualMachineSpec,
        args: &[&str],
    ) -> Result<String, EnvironmentError> {
        run_tool(&vm.hypervisor, args, self.command_timeout)
            .await
            .map_err(|e| EnvironmentError::HypervisorError(e.to_string()))
    }
}

/// Extracts `VMState` from `showvminfo --machinereadable` output.
pub fn parse_vm_state(output: &str) -> Result<String, EnvironmentError> {
    let re = Regex::new(r#"(?m)^VMState="([^"]+)""#)
        .map_err(|e| EnvironmentError::HypervisorError(e.to_string()))?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            EnvironmentError::HypervisorError("VMState missing from showvminfo output".to_string())
        })
}

#[async_trait]
impl Hypervisor for VirtualBox {
    async fn is_running(&self, vm: &VirtualMachineSpec) -> Result<bool, EnvironmentError> {
        let out = self
            .vboxmanage(vm, &["showvminfo", &vm.identifier, "--machinereadable"])
            .await?;
        let state = parse_vm_state(&out)?;
        debug!("VM {} state: {}", vm.identifier, state);
        Ok(matches!(state.as_str(), "running" | "paused" | "starting"))
    }

    async fn start(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError> {
        let mode = if vm.headless { "headless" } else { "gui" };
        info!("Starting VM {} ({})", vm.identifier, mode);
        self.vboxmanage(vm, &["startvm", &vm.identifier, "--type", mode])
            .await
            .map(|_| ())
    }

    async fn power_off(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError> {
        info!("Powering off VM {}", vm.identifier);
        self.vboxmanage(vm, &["controlvm", &vm.identifier, "poweroff"])
            .await
            .map(|_| ())
    }

    async fn restore_snapshot(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError> {
        info!("Restoring VM {} to snapshot {}", vm.identifier, vm.snapshot);
        self.vboxmanage(vm, &["snapshot", &vm.identifier, "restore", &vm.snapshot])
            .await
            .map(|_| ())
    }
}
