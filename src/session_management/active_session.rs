use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, error};
use tokio::sync::{watch, OnceCell};
use uuid::Uuid;

use super::session::{Session, SessionState};
use super::types::StopReport;
use crate::environment::types::{EnvironmentHandle, HandleState};
use crate::error_handling::types::SessionError;
use crate::proxy::types::ListenerHandle;
use crate::screen_relay::StreamHandle;

/// Runtime resources a session owns between setup and teardown.
#[derive(Debug, Default)]
pub(crate) struct SessionResources {
    pub environment: Option<EnvironmentHandle>,
    pub listener: Option<ListenerHandle>,
    pub screen: Option<StreamHandle>,
    /// Attach failure kept for the stop report.
    pub screen_failure: Option<String>,
}

/// A session together with the resources it holds and its one-shot stop report.
pub struct ActiveSession {
    session: Mutex<Session>,
    pub(crate) resources: tokio::sync::Mutex<SessionResources>,
    pub(crate) report: OnceCell<StopReport>,
    /// Turned to `true` when the deadline watchdog must stand down.
    pub(crate) disarm: watch::Sender<bool>,
}

impl ActiveSession {
    pub fn new(session: Session) -> Self {
        let (disarm, _) = watch::channel(false);
        Self {
            session: Mutex::new(session),
            resources: tokio::sync::Mutex::new(SessionResources::default()),
            report: OnceCell::new(),
            disarm,
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.session().id
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    /// Copy of the session as it stands.
    pub fn snapshot(&self) -> Session {
        self.session().clone()
    }

    pub fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut session = self.session();
        let from = session.state;
        session.transition(next)?;
        debug!("[{}] {} -> {}", session.id, from, next);
        Ok(())
    }

    pub(crate) fn update<F: FnOnce(&mut Session)>(&self, f: F) {
        f(&mut self.session());
    }

    /// The stop report, once teardown or failed setup produced it.
    pub fn report(&self) -> Option<&StopReport> {
        self.report.get()
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        let id = self.id();
        if let Some(handle) = &self.resources.get_mut().environment {
            if handle.state() == HandleState::Active {
                error!(
                    "[{}] discarded while still bound to environment {}",
                    id,
                    handle.identifier()
                );
            }
        }
    }
}
