//! SIP Registrar - turns REGISTER requests into registry mutations

use super::auth::{authenticate, AuthOutcome, SipAuthenticator};
use super::builder::ResponseBuilder;
use super::handler::{RequestContext, SipHandler};
use super::message::{contact_uri, SipError, SipMethod, SipRequest, SipResponse};
use crate::domain::registry::{ContactInstance, Registry};
use crate::domain::shared::SipUri;
use async_trait::async_trait;
use rsip::Header;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// REGISTER handler backed by the contact registry
pub struct Registrar {
    registry: Arc<dyn Registry>,
    auth: Option<Arc<dyn SipAuthenticator>>,
}

impl Registrar {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            auth: None,
        }
    }

    /// Create registrar with authentication
    pub fn with_auth(registry: Arc<dyn Registry>, auth: Arc<dyn SipAuthenticator>) -> Self {
        Self {
            registry,
            auth: Some(auth),
        }
    }

    /// Apply a (pre-authenticated) REGISTER to the registry and build the reply
    pub async fn register(
        &self,
        request: &SipRequest,
        ctx: &RequestContext,
    ) -> Result<SipResponse, SipError> {
        let aor = match request.to_value().map(|to| SipUri::parse(&to)) {
            Some(Ok(aor)) => aor,
            Some(Err(e)) => {
                warn!("REGISTER from {} with bad To header: {}", ctx.source, e);
                return ResponseBuilder::bad_request().build_for_request(request);
            }
            None => {
                warn!("REGISTER from {} without To header", ctx.source);
                return ResponseBuilder::bad_request().build_for_request(request);
            }
        };

        let contact_value = request.contact_value();
        let expires = extract_expires(request.expires(), contact_value.as_deref());
        let contact = contact_value
            .as_deref()
            .map(contact_uri)
            .unwrap_or_else(|| aor.to_string());

        let instance = ContactInstance::new(
            contact.clone(),
            expires,
            ctx.source,
            request.user_agent().unwrap_or_default(),
            ctx.protocol.network(),
        );

        let reason = if expires > 0 {
            self.registry.add_or_update(&aor, instance).await;
            info!("Registered {} -> {} ({}s) from {}", aor, contact, expires, ctx.source);
            "Registered"
        } else if contact == "*" {
            self.registry.remove(&aor).await;
            info!("Unregistered all contacts of {}", aor);
            "Unregistered"
        } else {
            match self.registry.remove_contact(&aor, &instance).await {
                Ok(()) => info!("Unregistered {} from {}", aor, ctx.source),
                Err(e) => debug!("Unregister of {} ignored: {}", aor, e),
            }
            "Unregistered"
        };

        metrics::counter!("sip_registrations_total").increment(1);
        metrics::gauge!("sip_registered_aors").set(self.registry.aor_count().await as f64);

        ResponseBuilder::ok()
            .reason(reason)
            .header(Header::Expires(expires.to_string().into()))
            .header(Header::Contact(
                format!("<{}>;expires={}", contact, expires).into(),
            ))
            .build_for_request(request)
    }
}

/// Expiry from the Expires header, else the Contact `expires` parameter, else 0
fn extract_expires(header: Option<u32>, contact: Option<&str>) -> u32 {
    if let Some(expires) = header {
        return expires;
    }

    contact
        .and_then(|contact| {
            // Parameters after the closing bracket belong to the header
            let params = match contact.rfind('>') {
                Some(end) => &contact[end + 1..],
                None => contact,
            };
            params.split(';').find_map(|param| {
                let (name, value) = param.split_once('=')?;
                if name.trim().eq_ignore_ascii_case("expires") {
                    value.trim().parse().ok()
                } else {
                    None
                }
            })
        })
        .unwrap_or(0)
}

#[async_trait]
impl SipHandler for Registrar {
    async fn handle_request(
        &self,
        request: SipRequest,
        ctx: &RequestContext,
    ) -> Result<Option<SipResponse>, SipError> {
        debug!("Handling REGISTER request from {}", ctx.source);

        if let Some(auth) = &self.auth {
            match authenticate(auth.as_ref(), &request, "REGISTER").await? {
                AuthOutcome::Authorized(username) => {
                    debug!("REGISTER authenticated for user: {}", username);
                }
                AuthOutcome::Rejected(response) => return Ok(Some(response)),
            }
        }

        self.register(&request, ctx).await.map(Some)
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        matches!(method, SipMethod::Register)
    }
}
