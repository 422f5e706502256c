//! SIP protocol implementation
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  CallBridge     Registrar    │
//! └──────┬──────────────┬────────┘
//!        │ SessionLayer │ Registry
//! ┌──────▼──────┐       │
//! │  UserAgent  │       │
//! └──────┬──────┘       │
//! ┌──────▼──────────────▼────────┐
//! │  SipServer (dispatch)        │
//! └──────────────┬───────────────┘
//! ┌──────────────▼───────────────┐
//! │  Transport (UDP, TCP)        │
//! └──────────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_bridge;
pub mod call_state;
pub mod connection;
pub mod handler;
pub mod message;
pub mod registrar;
pub mod server;
pub mod session;
pub mod transport;
pub mod user_agent;

pub use auth::{AuthChallenge, AuthOutcome, DigestAuth, SipAuthenticator};
pub use builder::ResponseBuilder;
pub use call_bridge::{B2bCall, CallBridge};
pub use call_state::{LegDirection, LegEvent, LegState};
pub use connection::{ConnectionError, ConnectionLossHandler};
pub use handler::{RequestContext, ResponseHandler, SipHandler};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registrar::Registrar;
pub use server::{SipServer, SipServerConfig};
pub use session::{CallerProfile, Recipient, SessionLayer};
pub use transport::{MessageSender, Transport, TransportProtocol, TransportSender};
pub use user_agent::{LegEventReceiver, UserAgent};
