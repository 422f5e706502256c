//! Shared value objects used across multiple bounded contexts

use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// B2B call identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a session owned by the session layer.
///
/// Only compared by identity and handed back to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UriScheme {
    Sip,
    Sips,
}

impl UriScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UriScheme::Sip => "sip",
            UriScheme::Sips => "sips",
        }
    }
}

/// SIP URI value object.
///
/// Used as the address-of-record key. Equality covers scheme, user, host
/// and port; URI parameters and headers are not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    scheme: UriScheme,
    user: String,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: UriScheme::Sip,
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse a URI in any of the forms found in SIP headers:
    /// `sip:alice@example.com`, `<sips:bob@host:5061;transport=tls>`,
    /// `"Alice" <sip:alice@example.com>;tag=123`.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let mut uri = input.trim();

        // Strip display name and angle brackets
        if let Some(start) = uri.find('<') {
            let end = uri[start..]
                .find('>')
                .map(|i| start + i)
                .ok_or_else(|| DomainError::ValidationError(format!("Unterminated URI: {}", input)))?;
            uri = &uri[start + 1..end];
        }

        let (scheme, rest) = if let Some(rest) = uri.strip_prefix("sips:") {
            (UriScheme::Sips, rest)
        } else if let Some(rest) = uri.strip_prefix("sip:") {
            (UriScheme::Sip, rest)
        } else {
            return Err(DomainError::ValidationError(format!(
                "URI must start with 'sip:' or 'sips:': {}",
                input
            )));
        };

        // Drop URI parameters and headers
        let rest = rest.split(|c: char| c == ';' || c == '?').next().unwrap_or_default();

        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, host_port)) => (user.split(':').next().unwrap_or_default(), host_port),
            None => ("", rest),
        };

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return Err(DomainError::ValidationError(format!("Missing host: {}", input)));
        }

        Ok(Self {
            scheme,
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn scheme(&self) -> UriScheme {
        self.scheme
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether both URIs name the same user, ignoring scheme and domain
    pub fn same_user(&self, other: &SipUri) -> bool {
        self.user == other.user
    }
}

fn split_host_port(host_port: &str) -> Result<(&str, Option<u16>), DomainError> {
    // IPv6 reference: [::1]:5060
    if let Some(stripped) = host_port.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or_else(|| DomainError::ValidationError(format!("Bad IPv6 host: {}", host_port)))?;
        let host = &host_port[..end + 2];
        let port = match stripped[end + 1..].strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host, port));
    }

    match host_port.split_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((host_port, None)),
    }
}

fn parse_port(port: &str) -> Result<u16, DomainError> {
    port.parse()
        .map_err(|_| DomainError::ValidationError(format!("Invalid port: {}", port)))
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_uri_parse() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(uri.user(), "alice");
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), None);

        let uri_with_port = SipUri::parse("sip:bob@example.com:5060").unwrap();
        assert_eq!(uri_with_port.user(), "bob");
        assert_eq!(uri_with_port.host(), "example.com");
        assert_eq!(uri_with_port.port(), Some(5060));
    }

    #[test]
    fn test_sip_uri_parse_header_forms() {
        let uri = SipUri::parse("\"Alice\" <sips:alice@example.com:5061;transport=tls>;tag=abc").unwrap();
        assert_eq!(uri.scheme(), UriScheme::Sips);
        assert_eq!(uri.user(), "alice");
        assert_eq!(uri.port(), Some(5061));

        let uri = SipUri::parse("sip:100@[::1]:5070").unwrap();
        assert_eq!(uri.host(), "[::1]");
        assert_eq!(uri.port(), Some(5070));

        let uri = SipUri::parse("sip:registrar.example.com").unwrap();
        assert_eq!(uri.user(), "");
        assert_eq!(uri.to_string(), "sip:registrar.example.com");
    }

    #[test]
    fn test_sip_uri_parse_errors() {
        assert!(SipUri::parse("tel:+15551234").is_err());
        assert!(SipUri::parse("sip:alice@").is_err());
        assert!(SipUri::parse("sip:alice@host:port").is_err());
        assert!(SipUri::parse("<sip:alice@host").is_err());
    }

    #[test]
    fn test_sip_uri_display() {
        let uri = SipUri::new("alice", "example.com", None);
        assert_eq!(uri.to_string(), "sip:alice@example.com");

        let uri_with_port = SipUri::new("bob", "example.com", Some(5060));
        assert_eq!(uri_with_port.to_string(), "sip:bob@example.com:5060");
    }

    #[test]
    fn test_full_uri_equality_vs_user_match() {
        let a = SipUri::parse("sip:100@x.example").unwrap();
        let b = SipUri::parse("sip:100@y.example").unwrap();
        let c = SipUri::parse("<sip:100@x.example;transport=tcp>").unwrap();

        assert_ne!(a, b);
        assert!(a.same_user(&b));
        assert_eq!(a, c);
    }
}
