//! Listen port claims.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use uuid::Uuid;

use crate::error_handling::types::ProxyError;

/// Tracks which session holds which listen port.
///
/// A claim is taken before binding and dropped only after the release barrier
/// confirmed the socket is gone, so a port is never handed to a new session
/// while the previous listener may still hold it. The claim of a listener that
/// never released its port is kept.
#[derive(Debug, Default)]
pub struct PortRegistry {
    claims: Mutex<HashMap<u16, Uuid>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, port: u16, session_id: Uuid) -> Result<(), ProxyError> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(owner) = claims.get(&port) {
            debug!("Port {} already claimed by session {}", port, owner);
            return Err(ProxyError::PortInUse(port));
        }
        claims.insert(port, session_id);
        Ok(())
    }

    pub fn release(&self, port: u16) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.remove(&port);
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.contains_key(&port)
    }

    /// Currently claimed ports, ascending.
    pub fn claimed(&self) -> Vec<u16> {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<u16> = claims.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}
