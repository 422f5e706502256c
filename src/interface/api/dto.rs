//! API data transfer objects

use crate::application::CallSummary;
use serde::{Deserialize, Serialize};

/// Envelope of every JSON response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Active calls list response
#[derive(Debug, Serialize)]
pub struct ActiveCallsResponse {
    pub calls: Vec<CallSummary>,
    pub total: usize,
}
