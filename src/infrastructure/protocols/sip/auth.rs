//! SIP Digest Authentication (RFC 2617, RFC 3261)

use super::builder::ResponseBuilder;
use super::message::{SipError, SipRequest, SipResponse};
use crate::domain::account::CredentialStore;
use crate::domain::DomainError;
use async_trait::async_trait;
use rand::Rng;
use rsip::headers::UntypedHeader;
use rsip::Header;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// SIP authenticator trait
#[async_trait]
pub trait SipAuthenticator: Send + Sync {
    /// Generate an authentication challenge
    async fn create_challenge(&self) -> AuthChallenge;

    /// Verify authentication for a request, returning the username
    async fn verify_request(&self, request: &SipRequest, method: &str) -> Result<String, SipError>;
}

/// Authentication challenge
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
}

impl AuthChallenge {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: Self::generate_nonce(),
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
        }
    }

    fn generate_nonce() -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        hex::encode(random_bytes)
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        match &self.qop {
            Some(qop) => format!(
                r#"Digest realm="{}", nonce="{}", algorithm={}, qop="{}""#,
                self.realm, self.nonce, self.algorithm, qop
            ),
            None => format!(
                r#"Digest realm="{}", nonce="{}", algorithm={}"#,
                self.realm, self.nonce, self.algorithm
            ),
        }
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl AuthorizationHeader {
    /// Parse the Authorization header of a request, `None` when absent
    pub fn from_request(request: &SipRequest) -> Result<Option<Self>, SipError> {
        let auth_value = request.headers().iter().find_map(|h| match h {
            Header::Authorization(auth) => Some(auth.value().to_string()),
            Header::ProxyAuthorization(auth) => Some(auth.value().to_string()),
            _ => None,
        });

        let Some(auth_value) = auth_value else {
            return Ok(None);
        };
        debug!("Parsing Authorization header: {}", auth_value);

        let params = Self::parse_digest_params(&auth_value);
        let required = |name: &str| {
            params.get(name).cloned().ok_or_else(|| {
                SipError::Authentication(format!("Missing {} in Authorization", name))
            })
        };

        Ok(Some(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        }))
    }

    fn parse_digest_params(auth_value: &str) -> HashMap<String, String> {
        let digest_str = auth_value
            .trim()
            .strip_prefix("Digest")
            .unwrap_or(auth_value)
            .trim();

        digest_str
            .split(',')
            .filter_map(|part| part.trim().split_once('='))
            .map(|(key, value)| {
                (
                    key.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                )
            })
            .collect()
    }
}

/// Digest authentication against a credential store
pub struct DigestAuth {
    realm: String,
    credentials: Arc<dyn CredentialStore>,
    active_nonces: RwLock<HashMap<String, Instant>>,
}

impl DigestAuth {
    pub fn new(realm: &str, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            realm: realm.to_string(),
            credentials,
            active_nonces: RwLock::new(HashMap::new()),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Drop nonces older than their lifetime
    pub async fn cleanup_nonces(&self) {
        let mut nonces = self.active_nonces.write().await;
        nonces.retain(|_, issued| issued.elapsed() < NONCE_LIFETIME);
    }
}

/// HA1 = MD5(username:realm:password), response = MD5(HA1:nonce[:nc:cnonce:qop]:HA2)
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    match qop {
        Some(qop) => format!(
            "{:x}",
            md5::compute(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                nonce,
                nc.unwrap_or("00000001"),
                cnonce.unwrap_or(""),
                qop,
                ha2
            ))
        ),
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

#[async_trait]
impl SipAuthenticator for DigestAuth {
    async fn create_challenge(&self) -> AuthChallenge {
        let challenge = AuthChallenge::new(&self.realm);
        self.active_nonces
            .write()
            .await
            .insert(challenge.nonce.clone(), Instant::now());

        debug!("Created auth challenge with nonce: {}", challenge.nonce);
        challenge
    }

    async fn verify_request(&self, request: &SipRequest, method: &str) -> Result<String, SipError> {
        let auth = AuthorizationHeader::from_request(request)?
            .ok_or_else(|| SipError::Authentication("No Authorization header found".to_string()))?;

        {
            let nonces = self.active_nonces.read().await;
            let issued = nonces
                .get(&auth.nonce)
                .ok_or_else(|| SipError::Authentication("Invalid or expired nonce".to_string()))?;
            if issued.elapsed() > NONCE_LIFETIME {
                return Err(SipError::Authentication("Nonce expired".to_string()));
            }
        }

        if auth.realm != self.realm {
            warn!("Realm mismatch: expected {}, got {}", self.realm, auth.realm);
            return Err(SipError::Authentication("Realm mismatch".to_string()));
        }

        let secret = match self.credentials.lookup_secret(&auth.username).await {
            Ok(secret) => secret,
            Err(DomainError::AuthenticationFailure(msg)) => {
                return Err(SipError::AccountNotFound(msg))
            }
            Err(e) => return Err(SipError::from(e)),
        };

        let expected = calculate_response(
            &auth.username,
            &secret,
            &auth.realm,
            &auth.nonce,
            method,
            &auth.uri,
            auth.qop.as_deref(),
            auth.nc.as_deref(),
            auth.cnonce.as_deref(),
        );

        if auth.response != expected {
            warn!("Authentication failed for user {}: response mismatch", auth.username);
            return Err(SipError::Authentication("Invalid credentials".to_string()));
        }

        info!("Authentication successful for user: {}", auth.username);
        Ok(auth.username)
    }
}

/// Outcome of running a request through the authenticator
#[derive(Debug)]
pub enum AuthOutcome {
    Authorized(String),
    /// Response to send instead of processing the request
    Rejected(SipResponse),
}

/// Challenge or verify `request`.
///
/// Missing or wrong credentials yield a fresh 401 challenge; an unknown
/// account is refused with 403 and not challenged again.
pub async fn authenticate(
    auth: &dyn SipAuthenticator,
    request: &SipRequest,
    method: &str,
) -> Result<AuthOutcome, SipError> {
    let has_auth = request
        .headers()
        .iter()
        .any(|h| matches!(h, Header::Authorization(_) | Header::ProxyAuthorization(_)));

    if has_auth {
        match auth.verify_request(request, method).await {
            Ok(username) => return Ok(AuthOutcome::Authorized(username)),
            Err(SipError::AccountNotFound(msg)) => {
                warn!("{} rejected: {}", method, msg);
                let response = ResponseBuilder::new(403)
                    .reason("Forbidden")
                    .build_for_request(request)?;
                return Ok(AuthOutcome::Rejected(response));
            }
            Err(e) => warn!("{} authentication failed: {}", method, e),
        }
    } else {
        debug!("{} without credentials - sending challenge", method);
    }

    let challenge = auth.create_challenge().await;
    let response = ResponseBuilder::unauthorized()
        .header(Header::Other(
            "WWW-Authenticate".to_string(),
            challenge.to_header_value(),
        ))
        .build_for_request(request)?;
    Ok(AuthOutcome::Rejected(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountTable;

    async fn digest() -> DigestAuth {
        let accounts = Arc::new(AccountTable::new());
        accounts.add_account("100", "secret").await;
        DigestAuth::new("b2bua", accounts)
    }

    fn register(authorization: Option<String>) -> SipRequest {
        let mut raw = String::from(
            "REGISTER sip:10.0.0.254 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
             From: <sip:100@10.0.0.254>;tag=1\r\n\
             To: <sip:100@10.0.0.254>\r\n\
             Call-ID: reg-1\r\n\
             CSeq: 1 REGISTER\r\n",
        );
        if let Some(value) = authorization {
            raw.push_str(&format!("Authorization: {}\r\n", value));
        }
        raw.push_str("Content-Length: 0\r\n\r\n");
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    fn authorization(user: &str, password: &str, nonce: &str) -> String {
        let response = calculate_response(
            user,
            password,
            "b2bua",
            nonce,
            "REGISTER",
            "sip:10.0.0.254",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        format!(
            r#"Digest username="{}", realm="b2bua", nonce="{}", uri="sip:10.0.0.254", response="{}", qop=auth, nc=00000001, cnonce="0a4f113b""#,
            user, nonce, response
        )
    }

    #[tokio::test]
    async fn test_create_challenge() {
        let auth = digest().await;
        let challenge = auth.create_challenge().await;

        assert_eq!(challenge.realm, "b2bua");
        assert_eq!(challenge.algorithm, "MD5");
        assert_eq!(challenge.nonce.len(), 32);
        assert!(challenge.to_header_value().contains(r#"qop="auth""#));
    }

    #[test]
    fn test_parse_digest_params() {
        let auth_value = r#"Digest username="alice", realm="test.com", nonce="abc123", uri="sip:bob@test.com", response="def456""#;
        let params = AuthorizationHeader::parse_digest_params(auth_value);

        assert_eq!(params.get("username").unwrap(), "alice");
        assert_eq!(params.get("realm").unwrap(), "test.com");
        assert_eq!(params.get("nonce").unwrap(), "abc123");
    }

    #[test]
    fn test_calculate_response_rfc2617_vector() {
        let response = calculate_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[tokio::test]
    async fn test_missing_credentials_are_challenged() {
        let auth = digest().await;
        match authenticate(&auth, &register(None), "REGISTER").await.unwrap() {
            AuthOutcome::Rejected(response) => {
                assert_eq!(response.status_code(), 401);
                assert!(response
                    .headers()
                    .iter()
                    .any(|h| matches!(h, Header::Other(name, _) if name == "WWW-Authenticate")));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_valid_credentials_are_accepted() {
        let auth = digest().await;
        let nonce = auth.create_challenge().await.nonce;
        let request = register(Some(authorization("100", "secret", &nonce)));

        match authenticate(&auth, &request, "REGISTER").await.unwrap() {
            AuthOutcome::Authorized(username) => assert_eq!(username, "100"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_password_is_rechallenged() {
        let auth = digest().await;
        let nonce = auth.create_challenge().await.nonce;
        let request = register(Some(authorization("100", "wrong", &nonce)));

        match authenticate(&auth, &request, "REGISTER").await.unwrap() {
            AuthOutcome::Rejected(response) => assert_eq!(response.status_code(), 401),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_user_is_forbidden() {
        let auth = digest().await;
        let nonce = auth.create_challenge().await.nonce;
        let request = register(Some(authorization("999", "secret", &nonce)));

        assert!(matches!(
            auth.verify_request(&request, "REGISTER").await,
            Err(SipError::AccountNotFound(_))
        ));
        match authenticate(&auth, &request, "REGISTER").await.unwrap() {
            AuthOutcome::Rejected(response) => assert_eq!(response.status_code(), 403),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
