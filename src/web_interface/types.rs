use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_handling::types::FailureKind;
use crate::session_management::SessionState;

/// API error payload
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

/// `POST /sessions`
#[derive(Debug, Deserialize)]
pub struct StartSessionBody {
    pub app_target: String,
    /// Test budget in seconds; the environment timeout applies when absent.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub id: Uuid,
    pub state: SessionState,
}
