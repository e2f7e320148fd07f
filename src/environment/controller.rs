use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::device_bridge::DeviceBridge;
use super::hypervisor::Hypervisor;
use super::types::{EnvironmentHandle, EnvironmentSpec, HandleState, VirtualMachineSpec};
use crate::error_handling::types::EnvironmentError;

/// Reachability polling schedule: `initial`, doubled per attempt, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            cap: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Active,
    Leaked(String),
}

/// Exclusive access to analysis environments.
///
/// The controller keeps a registry of bound identifiers. An identifier stays bound
/// from `acquire` until a successful `release`; a failed VM revert leaves it bound
/// as leaked so no later session can pick up a dirty environment.
pub struct EnvironmentController {
    hypervisor: Arc<dyn Hypervisor>,
    bridge: Arc<dyn DeviceBridge>,
    backoff: BackoffPolicy,
    bound: Mutex<HashMap<String, Binding>>,
}

impl EnvironmentController {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        bridge: Arc<dyn DeviceBridge>,
        backoff: BackoffPolicy,
    ) -> Self {
        info!(
            "Initializing EnvironmentController (backoff {:?} -> {:?})",
            backoff.initial, backoff.cap
        );
        Self {
            hypervisor,
            bridge,
            backoff,
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// Binds the environment described by `spec` and waits for it to become reachable.
    pub async fn acquire(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, EnvironmentError> {
        let identifier = spec.identifier().to_string();
        {
            let mut bound = self.bound.lock().await;
            match bound.get(&identifier) {
                Some(Binding::Active) => {
                    return Err(EnvironmentError::EnvironmentUnavailable(format!(
                        "{} is bound to another session",
                        identifier
                    )));
                }
                Some(Binding::Leaked(reason)) => {
                    return Err(EnvironmentError::EnvironmentUnavailable(format!(
                        "{} is leaked and needs an operator: {}",
                        identifier, reason
                    )));
                }
                None => {
                    bound.insert(identifier.clone(), Binding::Active);
                }
            }
        }
        info!("Acquiring {:?} environment {}", spec.kind(), identifier);

        let started_by_us = match spec {
            EnvironmentSpec::VirtualMachine(vm) => match self.power_on(vm).await {
                Ok(started) => started,
                Err(e) => {
                    error!("Failed to power on VM {}: {}", identifier, e);
                    self.unbind(&identifier).await;
                    return Err(e);
                }
            },
            EnvironmentSpec::PhysicalDevice(_) => false,
        };

        let serial = spec.bridge_serial();
        let started = Instant::now();
        if !self.wait_reachable(&serial, spec.timeout()).await {
            let waited = started.elapsed();
            warn!(
                "Environment {} not reachable after {:.1}s",
                identifier,
                waited.as_secs_f64()
            );
            let mut leaked = None;
            if let (EnvironmentSpec::VirtualMachine(vm), true) = (spec, started_by_us) {
                if let Err(e) = self.revert(vm).await {
                    error!("Revert after failed boot of {} failed: {}", identifier, e);
                    leaked = Some(e.to_string());
                }
            }
            match leaked {
                Some(reason) => self.mark_leaked(&identifier, reason).await,
                None => self.unbind(&identifier).await,
            }
            return Err(EnvironmentError::DeviceUnreachable { identifier, waited });
        }

        info!("Environment {} reachable as {}", identifier, serial);
        Ok(EnvironmentHandle {
            spec: spec.clone(),
            serial,
            ip: spec.ip(),
            acquired_at: Utc::now(),
            started_by_us,
            state: HandleState::Active,
        })
    }

    /// Returns the environment to a clean state and unbinds it.
    pub async fn release(&self, handle: &mut EnvironmentHandle) -> Result<(), EnvironmentError> {
        let identifier = handle.identifier().to_string();
        match handle.state {
            HandleState::Released => {
                debug!("Environment {} already released", identifier);
                return Ok(());
            }
            HandleState::Leaked => {
                return Err(EnvironmentError::ResourceLeak(format!(
                    "{} was left dirty by a failed revert",
                    identifier
                )));
            }
            HandleState::Active => {}
        }

        if let EnvironmentSpec::VirtualMachine(vm) = &handle.spec {
            if let Err(e) = self.revert(vm).await {
                error!("Revert of {} failed, marking as leaked: {}", identifier, e);
                handle.state = HandleState::Leaked;
                let reason = e.to_string();
                self.mark_leaked(&identifier, reason.clone()).await;
                return Err(EnvironmentError::RevertFailed { identifier, reason });
            }
        }

        self.unbind(&identifier).await;
        handle.state = HandleState::Released;
        info!("Released environment {}", identifier);
        Ok(())
    }

    pub async fn is_reachable(&self, handle: &EnvironmentHandle, timeout: Duration) -> bool {
        self.wait_reachable(&handle.serial, timeout).await
    }

    /// Dumps the environment's system log.
    pub async fn collect_logs(&self, handle: &EnvironmentHandle) -> Result<String, EnvironmentError> {
        self.bridge.collect_logs(&handle.serial).await
    }

    /// Identifiers left dirty by a failed revert.
    pub async fn leaked(&self) -> Vec<String> {
        let bound = self.bound.lock().await;
        let mut ids: Vec<String> = bound
            .iter()
            .filter(|(_, b)| matches!(b, Binding::Leaked(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Operator acknowledgement that a leaked environment was cleaned by hand.
    pub async fn clear_leak(&self, identifier: &str) -> bool {
        let mut bound = self.bound.lock().await;
        match bound.get(identifier) {
            Some(Binding::Leaked(_)) => {
                bound.remove(identifier);
                info!("Leak on {} cleared", identifier);
                true
            }
            _ => false,
        }
    }

    pub async fn bound_count(&self) -> usize {
        self.bound.lock().await.len()
    }

    /// Powers the VM on from its snapshot unless it already runs.
    async fn power_on(&self, vm: &VirtualMachineSpec) -> Result<bool, EnvironmentError> {
        if self.hypervisor.is_running(vm).await? {
            debug!("VM {} already running", vm.identifier);
            return Ok(false);
        }
        self.hypervisor.restore_snapshot(vm).await?;
        self.hypervisor.start(vm).await?;
        Ok(true)
    }

    async fn revert(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError> {
        let running = match self.hypervisor.is_running(vm).await {
            Ok(running) => running,
            Err(e) => {
                warn!("Could not query {} state, powering off anyway: {}", vm.identifier, e);
                true
            }
        };
        if running {
            if let Err(e) = self.hypervisor.power_off(vm).await {
                warn!("Power off of {} failed: {}", vm.identifier, e);
            }
        }
        self.hypervisor.restore_snapshot(vm).await
    }

    async fn wait_reachable(&self, serial: &str, budget: Duration) -> bool {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            if let Err(e) = self.bridge.connect(serial).await {
                debug!("Bridge connect to {} failed: {}", serial, e);
            }
            if self.bridge.is_connected(serial).await {
                return true;
            }
            let elapsed = started.elapsed();
            if elapsed >= budget {
                return false;
            }
            let delay = self.backoff.delay(attempt).min(budget - elapsed);
            debug!(
                "{} not reachable (attempt {}), retrying in {:?}",
                serial,
                attempt + 1,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn unbind(&self, identifier: &str) {
        self.bound.lock().await.remove(identifier);
    }

    async fn mark_leaked(&self, identifier: &str, reason: String) {
        self.bound
            .lock()
            .await
            .insert(identifier.to_string(), Binding::Leaked(reason));
    }
}

impl Drop for EnvironmentController {
    fn drop(&mut self) {
        let bound = self.bound.get_mut();
        if !bound.is_empty() {
            warn!(
                "EnvironmentController dropped with {} bound environment(s): {:?}",
                bound.len(),
                bound.keys().collect::<Vec<_>>()
            );
        }
    }
}
