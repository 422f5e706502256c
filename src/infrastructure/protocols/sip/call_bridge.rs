//! Call Bridge
//!
//! Pairs every inbound session (A-leg) with the outbound sessions (B-legs)
//! it originates toward the callee's registered contacts, and replays each
//! state change of one leg onto its partner.

use super::call_state::{LegDirection, LegEvent};
use super::message::{SipError, SipRequest};
use super::session::{CallerProfile, Recipient, SessionLayer};
use super::transport::TransportProtocol;
use crate::domain::registry::Registry;
use crate::domain::shared::{CallId, SessionId, SipUri};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// One A-leg/B-leg pairing
#[derive(Debug, Clone, Serialize)]
pub struct B2bCall {
    pub id: CallId,
    pub source: SessionId,
    pub destination: SessionId,
    pub source_contact: String,
    pub destination_contact: String,
    /// Set once the B-leg confirmed and the A-leg was accepted
    pub answered: bool,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for B2bCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.source_contact, self.destination_contact)
    }
}

/// Back-to-back call engine
pub struct CallBridge {
    registry: Arc<dyn Registry>,
    sessions: Arc<dyn SessionLayer>,
    calls: Mutex<Vec<B2bCall>>,
}

impl CallBridge {
    pub fn new(registry: Arc<dyn Registry>, sessions: Arc<dyn SessionLayer>) -> Self {
        Self {
            registry,
            sessions,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the active calls
    pub async fn calls(&self) -> Vec<B2bCall> {
        self.calls.lock().await.clone()
    }

    pub async fn active_call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Entry point for every leg state change
    pub async fn on_leg_event(&self, session: SessionId, event: LegEvent) {
        let state = event.state();
        info!("Leg {} => {}", session, state);

        match event {
            LegEvent::InviteReceived(request) => self.on_invite(session, &request).await,
            LegEvent::ReInviteReceived { direction } => self.on_reinvite(session, direction).await,
            LegEvent::Provisional {
                status_code,
                reason,
            }
            | LegEvent::EarlyMedia {
                status_code,
                reason,
            } => self.on_early(session, status_code, &reason).await,
            LegEvent::Confirmed => self.on_confirmed(session).await,
            LegEvent::Failure { .. } | LegEvent::Canceled | LegEvent::Terminated => {
                self.on_terminal(session).await
            }
        }
    }

    async fn on_invite(&self, session: SessionId, request: &SipRequest) {
        let caller = request.from_value().and_then(|from| SipUri::parse(&from).ok());
        let callee = request.to_value().and_then(|to| SipUri::parse(&to).ok());

        let (Some(caller), Some(callee)) = (caller, callee) else {
            warn!("INVITE on {} without usable From/To, rejecting", session);
            if let Err(e) = self.sessions.reject(session, 400, "Bad Request").await {
                error!("Failed to reject {}: {}", session, e);
            }
            return;
        };

        metrics::counter!("sip_calls_total").increment(1);

        // Registry lock is released before any origination
        let Some(contacts) = self.registry.get_contacts(&callee).await else {
            info!("{} has no registered contacts", callee);
            let reason = format!("{} Not found", callee);
            if let Err(e) = self.sessions.reject(session, 404, &reason).await {
                error!("Failed to reject {}: {}", session, e);
            }
            return;
        };

        if let Err(e) = self.sessions.provisional(session, 100, "Trying").await {
            error!("Failed to send 100 Trying on {}: {}", session, e);
        }

        let profile = CallerProfile::new(caller, request.from_display_name());
        let offer = self.sessions.remote_sdp(session).await;
        let source_contact = self
            .sessions
            .contact(session)
            .await
            .unwrap_or_else(|| profile.uri.to_string());

        // Every fork is recorded before it is originated, so a B-leg event
        // arriving ahead of `invite` returning still finds its call
        let forks: Vec<(B2bCall, Recipient)> = contacts
            .values()
            .map(|instance| {
                let transport = TransportProtocol::from_network(&instance.transport)
                    .unwrap_or(TransportProtocol::Udp);
                let call = B2bCall {
                    id: CallId::new(),
                    source: session,
                    destination: SessionId::new(),
                    source_contact: source_contact.clone(),
                    destination_contact: instance.contact.clone(),
                    answered: false,
                    created_at: Utc::now(),
                };
                (call, Recipient::new(callee.user(), instance.source, transport))
            })
            .collect();
        {
            let mut calls = self.calls.lock().await;
            calls.extend(forks.iter().map(|(call, _)| call.clone()));
            metrics::gauge!("sip_active_calls").set(calls.len() as f64);
        }

        for (call, recipient) in forks {
            if !self.is_active(call.id).await {
                debug!("Call {} torn down before origination toward {}", call.id, recipient);
                continue;
            }

            let result = self
                .sessions
                .invite(call.destination, &profile, &callee, &recipient, offer.clone())
                .await;
            if let Err(e) = result {
                error!("B-Leg session error toward {}: {}", recipient, e);
                metrics::counter!("sip_call_forks_failed").increment(1);
                self.discard(call.id).await;
                continue;
            }

            if self.is_active(call.id).await {
                info!("New B2B call {}: {}", call.id, call);
            } else {
                // Torn down while the INVITE was in flight
                self.end(call.destination).await;
            }
        }
    }

    async fn is_active(&self, id: CallId) -> bool {
        self.calls.lock().await.iter().any(|call| call.id == id)
    }

    async fn discard(&self, id: CallId) {
        let mut calls = self.calls.lock().await;
        calls.retain(|call| call.id != id);
        metrics::gauge!("sip_active_calls").set(calls.len() as f64);
    }

    async fn on_reinvite(&self, session: SessionId, direction: LegDirection) {
        match direction {
            LegDirection::Inbound => {
                if let Err(e) = self.sessions.accept(session, 200).await {
                    error!("Failed to accept re-INVITE on {}: {}", session, e);
                }
            }
            LegDirection::Outbound => {
                // Renegotiation toward the A-leg is not implemented
                debug!("Ignoring re-INVITE on outbound leg {}", session);
            }
        }
    }

    /// Unanswered call whose B-leg is `session`
    async fn find_ringing(&self, session: SessionId) -> Option<B2bCall> {
        self.calls
            .lock()
            .await
            .iter()
            .find(|call| call.destination == session && !call.answered)
            .cloned()
    }

    async fn on_early(&self, session: SessionId, status_code: u16, reason: &str) {
        let Some(call) = self.find_ringing(session).await else {
            debug!("Provisional on {} matches no ringing B-leg", session);
            return;
        };

        let answer = self.sessions.remote_sdp(call.destination).await;
        if let Err(e) = self.sessions.provide_answer(call.source, answer).await {
            error!("Failed to apply early answer on {}: {}", call.source, e);
        }
        if let Err(e) = self.sessions.provisional(call.source, status_code, reason).await {
            error!("Failed to forward {} on {}: {}", status_code, call.source, e);
        }
    }

    async fn on_confirmed(&self, session: SessionId) {
        // Claim the call and drop the other forks in one step
        let (call, forks) = {
            let mut calls = self.calls.lock().await;
            let Some(index) = calls
                .iter()
                .position(|call| call.destination == session && !call.answered)
            else {
                debug!("Confirmed on {} matches no ringing B-leg", session);
                return;
            };
            calls[index].answered = true;
            let call = calls[index].clone();

            let mut forks = Vec::new();
            calls.retain(|other| {
                let sibling = other.source == call.source && other.destination != session;
                if sibling {
                    forks.push(other.clone());
                }
                !sibling
            });
            metrics::gauge!("sip_active_calls").set(calls.len() as f64);
            (call, forks)
        };

        let answer = self.sessions.remote_sdp(call.destination).await;
        if let Err(e) = self.sessions.provide_answer(call.source, answer).await {
            error!("Failed to apply answer on {}: {}", call.source, e);
        }
        if let Err(e) = self.sessions.accept(call.source, 200).await {
            error!("Failed to accept {}: {}", call.source, e);
        }
        info!("B2B call {} answered", call.id);

        for fork in forks {
            debug!("Ending unanswered fork {}", fork);
            self.end(fork.destination).await;
        }
    }

    async fn on_terminal(&self, session: SessionId) {
        let mut ended = Vec::new();
        {
            let mut calls = self.calls.lock().await;

            let source = match calls.iter().position(|call| call.destination == session) {
                Some(index) => {
                    // A B-leg went away; its A-leg goes with it
                    let call = calls.remove(index);
                    info!("B2B call {} removed by B-leg", call.id);
                    ended.push(call.source);
                    call.source
                }
                None => session,
            };

            // Every other call sharing that A-leg is torn down too
            calls.retain(|call| {
                let owned = call.source == source;
                if owned {
                    info!("B2B call {} removed with A-leg {}", call.id, source);
                    ended.push(call.destination);
                }
                !owned
            });

            metrics::gauge!("sip_active_calls").set(calls.len() as f64);
        }

        if ended.is_empty() {
            debug!("Terminal event on {} matches nothing to tear down", session);
        }
        for other in ended {
            self.end(other).await;
        }
    }

    async fn end(&self, session: SessionId) {
        match self.sessions.end(session).await {
            Ok(()) => {}
            Err(SipError::SessionNotFound(_)) => debug!("{} already gone", session),
            Err(e) => warn!("Failed to end {}: {}", session, e),
        }
    }
}
