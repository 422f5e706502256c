//! Session-layer port consumed by the call bridge

use super::message::SipError;
use super::transport::TransportProtocol;
use crate::domain::shared::{SessionId, SipUri};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;

/// Identity presented on an originated leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerProfile {
    pub uri: SipUri,
    pub display_name: Option<String>,
}

impl CallerProfile {
    pub fn new(uri: SipUri, display_name: Option<String>) -> Self {
        Self { uri, display_name }
    }
}

/// Where an originated leg is actually sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Request-URI user part
    pub user: String,
    pub address: SocketAddr,
    pub transport: TransportProtocol,
}

impl Recipient {
    pub fn new(user: impl Into<String>, address: SocketAddr, transport: TransportProtocol) -> Self {
        Self {
            user: user.into(),
            address,
            transport,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sip:{}@{};transport={}",
            self.user,
            self.address,
            self.transport.network()
        )
    }
}

/// Operations the bridge needs from whatever owns the sessions.
///
/// Sessions are addressed by opaque `SessionId`s. The caller allocates the
/// id of an originated session, so events for it may arrive before
/// `invite` returns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionLayer: Send + Sync {
    /// Originate a new outbound session under `session`
    async fn invite(
        &self,
        session: SessionId,
        profile: &CallerProfile,
        target: &SipUri,
        recipient: &Recipient,
        offer: Option<String>,
    ) -> Result<(), SipError>;

    /// Session description last received from the remote party
    async fn remote_sdp(&self, session: SessionId) -> Option<String>;

    /// Answer to send with the next response on an inbound session
    async fn provide_answer(&self, session: SessionId, answer: Option<String>) -> Result<(), SipError>;

    async fn provisional(&self, session: SessionId, status_code: u16, reason: &str) -> Result<(), SipError>;

    async fn accept(&self, session: SessionId, status_code: u16) -> Result<(), SipError>;

    async fn reject(&self, session: SessionId, status_code: u16, reason: &str) -> Result<(), SipError>;

    /// Tear the session down by whatever means its state requires
    async fn end(&self, session: SessionId) -> Result<(), SipError>;

    /// Remote contact of the session, for display
    async fn contact(&self, session: SessionId) -> Option<String>;
}
