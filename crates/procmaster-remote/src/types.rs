//! Request and response bodies of the HTTP API.

use procmaster_common::SupervisorError;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/processes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGoBinRequest {
    pub source_path: String,
    pub name: String,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Acknowledgement of a lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResponse {
    /// Number of records written to the snapshot
    pub saved: usize,
}

/// Error body: the typed error plus its rendered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: SupervisorError,
    pub message: String,
}
