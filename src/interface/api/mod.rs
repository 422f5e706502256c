//! HTTP admin API

pub mod admin_handler;
pub mod dto;
pub mod metrics_handler;
pub mod router;

pub use dto::ApiResponse;
pub use metrics_handler::init_metrics;
pub use router::build_router;
