//! SIP message handlers

use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::transport::TransportProtocol;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Where a request came from
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Trait for handling SIP requests
#[async_trait]
pub trait SipHandler: Send + Sync {
    /// Handle a SIP request.
    ///
    /// `None` means the handler answers on its own, later or never (ACK).
    async fn handle_request(
        &self,
        request: SipRequest,
        ctx: &RequestContext,
    ) -> Result<Option<SipResponse>, SipError>;

    /// Check if this handler can handle the given method
    fn can_handle(&self, method: SipMethod) -> bool;
}

/// Receiver of responses to requests this process originated
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle_response(&self, response: SipResponse, ctx: &RequestContext);
}
