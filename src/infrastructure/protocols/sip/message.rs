//! SIP message types and parsing

use bytes::Bytes;
use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Origination error: {0}")]
    Origination(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<crate::domain::DomainError> for SipError {
    fn from(err: crate::domain::DomainError) -> Self {
        match err {
            crate::domain::DomainError::AuthenticationFailure(msg) => SipError::Authentication(msg),
            other => SipError::InvalidMessage(other.to_string()),
        }
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// Body as text, `None` when empty
    pub fn body_text(&self) -> Option<String> {
        body_text(&self.inner.body)
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(cid.value().to_string()),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => cseq.typed().ok().map(|c| c.seq),
            _ => None,
        })
    }

    /// Raw value of the From header, tag included
    pub fn from_value(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => Some(from.value().to_string()),
            _ => None,
        })
    }

    /// Raw value of the To header, tag included
    pub fn to_value(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => Some(to.value().to_string()),
            _ => None,
        })
    }

    /// Display name of the From header, if any
    pub fn from_display_name(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => from
                .typed()
                .ok()
                .and_then(|typed| typed.display_name)
                .filter(|name| !name.is_empty()),
            _ => None,
        })
    }

    /// Raw value of the first Contact header
    pub fn contact_value(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => Some(contact.value().to_string()),
            _ => None,
        })
    }

    pub fn user_agent(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::UserAgent(ua) => Some(ua.value().to_string()),
            _ => None,
        })
    }

    /// Value of the Expires header
    pub fn expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Expires(exp) => exp.value().trim().parse().ok(),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
    /// Reason phrase replacing the canonical one on the wire
    reason: Option<String>,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner, reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    /// Reason phrase as it appears in the status line
    pub fn reason(&self) -> String {
        if let Some(reason) = &self.reason {
            return reason.clone();
        }
        let rendered = self.inner.to_string();
        rendered
            .lines()
            .next()
            .and_then(|line| line.splitn(3, ' ').nth(2))
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_text(&self) -> Option<String> {
        body_text(&self.inner.body)
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(cid.value().to_string()),
            _ => None,
        })
    }

    /// Method named in the CSeq header
    pub fn cseq_method(&self) -> Option<Method> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => cseq.typed().ok().map(|c| c.method),
            _ => None,
        })
    }

    /// Raw value of the To header, tag included
    pub fn to_value(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => Some(to.value().to_string()),
            _ => None,
        })
    }

    pub fn contact_value(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => Some(contact.value().to_string()),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let rendered = self.inner.to_string();
        match &self.reason {
            Some(reason) => {
                let (_, rest) = rendered.split_once("\r\n").unwrap_or((rendered.as_str(), ""));
                Bytes::from(format!(
                    "SIP/2.0 {} {}\r\n{}",
                    self.status_code(),
                    reason,
                    rest
                ))
            }
            None => Bytes::from(rendered),
        }
    }
}

/// URI part of a Contact (or From/To) header value
pub fn contact_uri(value: &str) -> String {
    let value = value.trim();
    if let Some(start) = value.find('<') {
        if let Some(end) = value[start..].find('>') {
            return value[start + 1..start + end].to_string();
        }
    }
    value.split(';').next().unwrap_or_default().trim().to_string()
}

fn body_text(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(body).into_owned())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        // Try parsing as response
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }
}
