//! Request and response bodies of the HTTP API

use crate::registry::NodeRecord;
use serde::{Deserialize, Serialize};

/// API Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// `POST /api/login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub pwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Value for the `Authorization` header of later admin calls
    pub token: String,
}

/// `POST /api/nodes`; a missing uuid is generated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodeRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
}

/// Response for listing registered nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeRecord>,
    pub total: usize,
}

/// `GET /api/sub`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPathResponse {
    /// Relative subscription URL including the key
    pub path: String,
}
