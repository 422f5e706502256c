//! Read-only admin API handlers

use super::dto::{ActiveCallsResponse, ApiResponse};
use crate::application::{AccountSummary, AdminView, Registration};
use axum::{extract::State, Json};
use tracing::debug;

/// Health check endpoint
pub async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("OK"))
}

/// Configured SIP accounts
pub async fn list_accounts(State(view): State<AdminView>) -> Json<ApiResponse<Vec<AccountSummary>>> {
    debug!("API: Listing accounts");
    Json(ApiResponse::success(view.account_summaries().await))
}

/// Active A-leg/B-leg pairings
pub async fn list_calls(State(view): State<AdminView>) -> Json<ApiResponse<ActiveCallsResponse>> {
    debug!("API: Getting active calls");
    let calls = view.calls().await;
    let total = calls.len();
    Json(ApiResponse::success(ActiveCallsResponse { calls, total }))
}

/// Every AOR and its contact instances
pub async fn list_registrations(
    State(view): State<AdminView>,
) -> Json<ApiResponse<Vec<Registration>>> {
    debug!("API: Getting registrations");
    Json(ApiResponse::success(view.registrations().await))
}
