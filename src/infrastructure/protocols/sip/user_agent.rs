//! Minimal user agent
//!
//! Terminates inbound INVITE dialogs and originates outbound ones directly
//! over the transport, reporting every leg transition as a `LegEvent`.
//! There is no transaction layer: nothing is retransmitted and no timers run.

use super::auth::{authenticate, AuthOutcome, SipAuthenticator};
use super::builder::ResponseBuilder;
use super::call_state::{LegDirection, LegEvent, LegState};
use super::handler::{RequestContext, ResponseHandler, SipHandler};
use super::message::{contact_uri, SipError, SipMethod, SipRequest, SipResponse};
use super::session::{CallerProfile, Recipient, SessionLayer};
use super::transport::{MessageSender, OutgoingMessage, TransportProtocol};
use crate::domain::shared::{SessionId, SipUri};
use async_trait::async_trait;
use rsip::{Header, Method};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Leg events as produced by the user agent
pub type LegEventReceiver = mpsc::Receiver<(SessionId, LegEvent)>;

/// One dialog owned by the user agent
#[derive(Debug, Clone)]
struct UaSession {
    direction: LegDirection,
    state: LegState,
    call_id: String,
    peer: SocketAddr,
    protocol: TransportProtocol,
    local_tag: String,
    /// Our side of the dialog as a From header value
    local_uri: String,
    /// Their side of the dialog as a To header value, tag once known
    remote_uri: String,
    /// Request-URI for in-dialog requests
    request_uri: String,
    cseq: u32,
    invite_branch: String,
    /// Initial INVITE of an inbound session
    invite: Option<SipRequest>,
    pending_reinvite: Option<SipRequest>,
    remote_sdp: Option<String>,
    answer: Option<String>,
    remote_contact: Option<String>,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, UaSession>,
    by_call_id: HashMap<String, SessionId>,
}

impl SessionTable {
    fn insert(&mut self, id: SessionId, session: UaSession) {
        self.by_call_id.insert(session.call_id.clone(), id);
        self.sessions.insert(id, session);
    }

    fn remove(&mut self, id: SessionId) -> Option<UaSession> {
        let session = self.sessions.remove(&id)?;
        self.by_call_id.remove(&session.call_id);
        Some(session)
    }

    fn find(&self, call_id: &str) -> Option<SessionId> {
        self.by_call_id.get(call_id).copied()
    }
}

pub struct UserAgent {
    sender: Arc<dyn MessageSender>,
    /// Address advertised in Via and Contact
    local_addr: SocketAddr,
    user_agent: String,
    auth: Option<Arc<dyn SipAuthenticator>>,
    table: Mutex<SessionTable>,
    events: mpsc::Sender<(SessionId, LegEvent)>,
}

fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

fn new_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

impl UserAgent {
    pub fn new(
        sender: Arc<dyn MessageSender>,
        local_addr: SocketAddr,
        user_agent: impl Into<String>,
    ) -> (Self, LegEventReceiver) {
        let (events, rx) = mpsc::channel(1000);
        let ua = Self {
            sender,
            local_addr,
            user_agent: user_agent.into(),
            auth: None,
            table: Mutex::new(SessionTable::default()),
            events,
        };
        (ua, rx)
    }

    /// Challenge initial INVITEs with digest authentication
    pub fn with_auth(mut self, auth: Arc<dyn SipAuthenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub async fn session_count(&self) -> usize {
        self.table.lock().await.sessions.len()
    }

    async fn emit(&self, session: SessionId, event: LegEvent) {
        if self.events.send((session, event)).await.is_err() {
            warn!("Leg event receiver dropped, event for {} lost", session);
        }
    }

    async fn transmit(
        &self,
        data: bytes::Bytes,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<(), SipError> {
        self.sender
            .send(OutgoingMessage {
                data,
                destination,
                protocol,
            })
            .await
    }

    /// Build an in-dialog request from our side of `session`
    fn dialog_request(
        &self,
        session: &UaSession,
        method: Method,
        cseq: u32,
        branch: &str,
        remote_uri: &str,
        contact: Option<&str>,
        body: Option<&str>,
    ) -> Result<SipRequest, SipError> {
        let mut raw = format!(
            "{method} {uri} SIP/2.0\r\n\
             Via: SIP/2.0/{transport} {local};branch={branch};rport\r\n\
             Max-Forwards: 70\r\n\
             From: {from}\r\n\
             To: {to}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n\
             User-Agent: {ua}\r\n",
            method = method,
            uri = session.request_uri,
            transport = session.protocol.as_str(),
            local = self.local_addr,
            branch = branch,
            from = session.local_uri,
            to = remote_uri,
            call_id = session.call_id,
            cseq = cseq,
            ua = self.user_agent,
        );
        if let Some(contact) = contact {
            raw.push_str(&format!("Contact: {}\r\n", contact));
        }
        match body {
            Some(body) => {
                raw.push_str("Content-Type: application/sdp\r\n");
                raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
            }
            None => raw.push_str("Content-Length: 0\r\n\r\n"),
        }
        SipRequest::parse(raw.as_bytes())
    }

    /// Response to an inbound INVITE, carrying our tag
    fn invite_response(
        &self,
        session: &UaSession,
        request: &SipRequest,
        status_code: u16,
        reason: Option<&str>,
        body: Option<String>,
    ) -> Result<SipResponse, SipError> {
        let mut builder = ResponseBuilder::new(status_code).to_tag(session.local_tag.clone());
        if let Some(reason) = reason {
            builder = builder.reason(reason);
        }
        if status_code >= 200 && status_code < 300 {
            let user = SipUri::parse(&session.local_uri)
                .map(|uri| uri.user().to_string())
                .unwrap_or_default();
            builder = builder.header(Header::Contact(
                format!(
                    "<sip:{}@{};transport={}>",
                    user,
                    self.local_addr,
                    session.protocol.network()
                )
                .into(),
            ));
        }
        if let Some(body) = body {
            builder = builder.sdp(body);
        }
        builder.build_for_request(request)
    }

    async fn on_invite(
        &self,
        request: SipRequest,
        ctx: &RequestContext,
    ) -> Result<Option<SipResponse>, SipError> {
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("Missing Call-ID".to_string()))?;

        // In-dialog INVITE
        let reinvite = {
            let mut table = self.table.lock().await;
            match table.find(&call_id) {
                Some(id) => {
                    let session = table
                        .sessions
                        .get_mut(&id)
                        .ok_or_else(|| SipError::SessionNotFound(id.to_string()))?;
                    if !session.state.can_transition_to(LegState::ReInviteReceived) {
                        debug!("INVITE retransmission or glare on {}, ignoring", id);
                        return Ok(None);
                    }
                    session.state = LegState::ReInviteReceived;
                    if let Some(sdp) = request.body_text() {
                        session.remote_sdp = Some(sdp);
                    }
                    session.pending_reinvite = Some(request.clone());
                    Some((id, session.direction))
                }
                None => None,
            }
        };
        if let Some((id, direction)) = reinvite {
            info!("re-INVITE on {}", id);
            self.emit(id, LegEvent::ReInviteReceived { direction }).await;
            return Ok(None);
        }

        if let Some(auth) = &self.auth {
            match authenticate(auth.as_ref(), &request, "INVITE").await? {
                AuthOutcome::Authorized(username) => debug!("INVITE authenticated for {}", username),
                AuthOutcome::Rejected(response) => return Ok(Some(response)),
            }
        }

        let from = request
            .from_value()
            .ok_or_else(|| SipError::InvalidMessage("Missing From header".to_string()))?;
        let to = request
            .to_value()
            .ok_or_else(|| SipError::InvalidMessage("Missing To header".to_string()))?;
        let remote_contact = request.contact_value().map(|c| contact_uri(&c));
        let local_tag = new_tag();

        let id = SessionId::new();
        let session = UaSession {
            direction: LegDirection::Inbound,
            state: LegState::InviteReceived,
            call_id,
            peer: ctx.source,
            protocol: ctx.protocol,
            local_uri: format!("{};tag={}", to, local_tag),
            local_tag,
            remote_uri: from,
            request_uri: remote_contact
                .clone()
                .unwrap_or_else(|| format!("sip:{}", ctx.source)),
            cseq: 0,
            invite_branch: String::new(),
            invite: Some(request.clone()),
            pending_reinvite: None,
            remote_sdp: request.body_text(),
            answer: None,
            remote_contact,
        };
        self.table.lock().await.insert(id, session);

        info!("New inbound session {} from {}", id, ctx.source);
        self.emit(id, LegEvent::InviteReceived(request)).await;
        Ok(None)
    }

    async fn on_bye(&self, request: SipRequest) -> Result<Option<SipResponse>, SipError> {
        let removed = match request.call_id() {
            Some(call_id) => {
                let mut table = self.table.lock().await;
                table.find(&call_id).and_then(|id| table.remove(id).map(|_| id))
            }
            None => None,
        };

        match removed {
            Some(id) => {
                info!("BYE on {}", id);
                self.emit(id, LegEvent::Terminated).await;
                ResponseBuilder::ok().build_for_request(&request).map(Some)
            }
            None => ResponseBuilder::new(481)
                .reason("Call/Transaction Does Not Exist")
                .build_for_request(&request)
                .map(Some),
        }
    }

    async fn on_cancel(&self, request: SipRequest) -> Result<Option<SipResponse>, SipError> {
        let canceled = match request.call_id() {
            Some(call_id) => {
                let mut table = self.table.lock().await;
                match table.find(&call_id) {
                    Some(id)
                        if table.sessions.get(&id).map_or(false, |s| {
                            s.direction == LegDirection::Inbound && s.state.is_early()
                        }) =>
                    {
                        table.remove(id).map(|session| (id, session))
                    }
                    _ => None,
                }
            }
            None => None,
        };

        let Some((id, session)) = canceled else {
            return ResponseBuilder::new(481)
                .reason("Call/Transaction Does Not Exist")
                .build_for_request(&request)
                .map(Some);
        };

        if let Some(invite) = &session.invite {
            let terminated = self.invite_response(&session, invite, 487, Some("Request Terminated"), None)?;
            self.transmit(terminated.to_bytes(), session.peer, session.protocol)
                .await?;
        }

        info!("CANCEL on {}", id);
        self.emit(id, LegEvent::Canceled).await;
        ResponseBuilder::ok().build_for_request(&request).map(Some)
    }

    async fn send_ack(&self, session: &UaSession, cseq: u32, branch: &str) {
        let ack = match self.dialog_request(
            session,
            Method::Ack,
            cseq,
            branch,
            &session.remote_uri,
            None,
            None,
        ) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Failed to build ACK: {}", e);
                return;
            }
        };
        if let Err(e) = self.transmit(ack.to_bytes(), session.peer, session.protocol).await {
            warn!("Failed to send ACK to {}: {}", session.peer, e);
        }
    }
}

#[async_trait]
impl SipHandler for UserAgent {
    async fn handle_request(
        &self,
        request: SipRequest,
        ctx: &RequestContext,
    ) -> Result<Option<SipResponse>, SipError> {
        match request.method() {
            Some(SipMethod::Invite) => self.on_invite(request, ctx).await,
            Some(SipMethod::Ack) => {
                debug!("ACK from {}", ctx.source);
                Ok(None)
            }
            Some(SipMethod::Bye) => self.on_bye(request).await,
            Some(SipMethod::Cancel) => self.on_cancel(request).await,
            _ => ResponseBuilder::not_implemented()
                .build_for_request(&request)
                .map(Some),
        }
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        matches!(
            method,
            SipMethod::Invite | SipMethod::Ack | SipMethod::Bye | SipMethod::Cancel
        )
    }
}

#[async_trait]
impl ResponseHandler for UserAgent {
    async fn handle_response(&self, response: SipResponse, ctx: &RequestContext) {
        if response.cseq_method() != Some(Method::Invite) {
            debug!("{} to non-INVITE from {}", response.status_code(), ctx.source);
            return;
        }
        let Some(call_id) = response.call_id() else {
            return;
        };

        let status_code = response.status_code();
        let reason = response.reason();
        let body = response.body_text();

        let next = match status_code {
            100 => return,
            101..=199 if body.is_some() => LegState::EarlyMedia,
            101..=199 => LegState::Provisional,
            200..=299 => LegState::Confirmed,
            _ => LegState::Failure,
        };

        let (id, session) = {
            let mut table = self.table.lock().await;
            let Some(id) = table.find(&call_id) else {
                debug!("{} for unknown call {}", status_code, call_id);
                return;
            };
            let Some(session) = table.sessions.get_mut(&id) else {
                return;
            };
            if session.direction != LegDirection::Outbound {
                return;
            }

            if !session.state.can_transition_to(next) {
                // 2xx retransmission still needs an ACK
                let snapshot = session.clone();
                drop(table);
                if next == LegState::Confirmed {
                    self.send_ack(&snapshot, snapshot.cseq, &new_branch()).await;
                }
                debug!("{} on {} ignored in state {}", status_code, id, snapshot.state);
                return;
            }

            session.state = next;
            if let Some(to) = response.to_value() {
                session.remote_uri = to;
            }
            if let Some(sdp) = body {
                session.remote_sdp = Some(sdp);
            }
            if next == LegState::Confirmed {
                if let Some(contact) = response.contact_value() {
                    let contact = contact_uri(&contact);
                    session.request_uri = contact.clone();
                    session.remote_contact = Some(contact);
                }
            }

            let snapshot = session.clone();
            if next == LegState::Failure {
                table.remove(id);
            }
            (id, snapshot)
        };

        let event = match next {
            LegState::EarlyMedia => LegEvent::EarlyMedia {
                status_code,
                reason,
            },
            LegState::Provisional => LegEvent::Provisional {
                status_code,
                reason,
            },
            LegState::Confirmed => {
                self.send_ack(&session, session.cseq, &new_branch()).await;
                LegEvent::Confirmed
            }
            _ => {
                // ACK for a final failure reuses the INVITE branch
                self.send_ack(&session, session.cseq, &session.invite_branch).await;
                LegEvent::Failure {
                    status_code,
                    reason,
                }
            }
        };
        self.emit(id, event).await;
    }
}

#[async_trait]
impl SessionLayer for UserAgent {
    async fn invite(
        &self,
        id: SessionId,
        profile: &CallerProfile,
        target: &SipUri,
        recipient: &Recipient,
        offer: Option<String>,
    ) -> Result<(), SipError> {
        let local_tag = new_tag();
        let local_uri = match &profile.display_name {
            Some(name) => format!("\"{}\" <{}>;tag={}", name, profile.uri, local_tag),
            None => format!("<{}>;tag={}", profile.uri, local_tag),
        };

        let session = UaSession {
            direction: LegDirection::Outbound,
            state: LegState::InviteReceived,
            call_id: format!("{}@{}", Uuid::new_v4().simple(), self.local_addr.ip()),
            peer: recipient.address,
            protocol: recipient.transport,
            local_tag,
            local_uri,
            remote_uri: format!("<{}>", target),
            request_uri: recipient.to_string(),
            cseq: 1,
            invite_branch: new_branch(),
            invite: None,
            pending_reinvite: None,
            remote_sdp: None,
            answer: None,
            remote_contact: None,
        };

        let contact = format!(
            "<sip:{}@{};transport={}>",
            profile.uri.user(),
            self.local_addr,
            recipient.transport.network()
        );
        let request = self
            .dialog_request(
                &session,
                Method::Invite,
                session.cseq,
                &session.invite_branch,
                &session.remote_uri,
                Some(&contact),
                offer.as_deref(),
            )
            .map_err(|e| SipError::Origination(e.to_string()))?;

        // Registered before sending so the first response always finds it
        {
            let mut table = self.table.lock().await;
            if table.sessions.contains_key(&id) {
                return Err(SipError::Origination(format!("session {} already exists", id)));
            }
            table.insert(id, session);
        }

        if let Err(e) = self
            .transmit(request.to_bytes(), recipient.address, recipient.transport)
            .await
        {
            self.table.lock().await.remove(id);
            return Err(SipError::Origination(format!("{}: {}", recipient, e)));
        }

        info!("Originated {} toward {}", id, recipient);
        Ok(())
    }

    async fn remote_sdp(&self, session: SessionId) -> Option<String> {
        self.table
            .lock()
            .await
            .sessions
            .get(&session)
            .and_then(|s| s.remote_sdp.clone())
    }

    async fn provide_answer(&self, session: SessionId, answer: Option<String>) -> Result<(), SipError> {
        let mut table = self.table.lock().await;
        let entry = table
            .sessions
            .get_mut(&session)
            .ok_or_else(|| SipError::SessionNotFound(session.to_string()))?;
        entry.answer = answer;
        Ok(())
    }

    async fn provisional(&self, session: SessionId, status_code: u16, reason: &str) -> Result<(), SipError> {
        let (response, peer, protocol) = {
            let mut table = self.table.lock().await;
            let entry = table
                .sessions
                .get_mut(&session)
                .ok_or_else(|| SipError::SessionNotFound(session.to_string()))?;
            let invite = entry
                .invite
                .clone()
                .ok_or_else(|| SipError::InvalidMessage(format!("{} is not inbound", session)))?;
            if !entry.state.is_early() {
                return Err(SipError::InvalidMessage(format!(
                    "{} already answered",
                    session
                )));
            }

            // 100 Trying never carries a body
            let body = if status_code > 100 { entry.answer.clone() } else { None };
            if status_code > 100 {
                entry.state = if body.is_some() {
                    LegState::EarlyMedia
                } else {
                    LegState::Provisional
                };
            }
            let response = self.invite_response(entry, &invite, status_code, Some(reason), body)?;
            (response, entry.peer, entry.protocol)
        };

        self.transmit(response.to_bytes(), peer, protocol).await
    }

    async fn accept(&self, session: SessionId, status_code: u16) -> Result<(), SipError> {
        let (response, peer, protocol) = {
            let mut table = self.table.lock().await;
            let entry = table
                .sessions
                .get_mut(&session)
                .ok_or_else(|| SipError::SessionNotFound(session.to_string()))?;

            let request = match entry.pending_reinvite.take() {
                Some(reinvite) => reinvite,
                None if entry.state.is_early() => entry
                    .invite
                    .clone()
                    .ok_or_else(|| SipError::InvalidMessage(format!("{} is not inbound", session)))?,
                None => {
                    return Err(SipError::InvalidMessage(format!(
                        "nothing to accept on {}",
                        session
                    )))
                }
            };

            entry.state = LegState::Confirmed;
            let body = entry.answer.clone();
            let response = self.invite_response(entry, &request, status_code, None, body)?;
            (response, entry.peer, entry.protocol)
        };

        self.transmit(response.to_bytes(), peer, protocol).await
    }

    async fn reject(&self, session: SessionId, status_code: u16, reason: &str) -> Result<(), SipError> {
        let (response, peer, protocol) = {
            let mut table = self.table.lock().await;
            let entry = table
                .sessions
                .get(&session)
                .ok_or_else(|| SipError::SessionNotFound(session.to_string()))?;
            let invite = entry
                .invite
                .clone()
                .ok_or_else(|| SipError::InvalidMessage(format!("{} is not inbound", session)))?;
            if !entry.state.is_early() {
                return Err(SipError::InvalidMessage(format!(
                    "{} already answered",
                    session
                )));
            }
            let response = self.invite_response(entry, &invite, status_code, Some(reason), None)?;
            let (peer, protocol) = (entry.peer, entry.protocol);
            table.remove(session);
            (response, peer, protocol)
        };

        info!("Rejected {} with {} {}", session, status_code, reason);
        self.transmit(response.to_bytes(), peer, protocol).await
    }

    async fn end(&self, session: SessionId) -> Result<(), SipError> {
        let entry = self
            .table
            .lock()
            .await
            .remove(session)
            .ok_or_else(|| SipError::SessionNotFound(session.to_string()))?;

        let message = match (entry.direction, entry.state.is_early()) {
            (LegDirection::Inbound, true) => {
                let invite = entry
                    .invite
                    .as_ref()
                    .ok_or_else(|| SipError::Internal("inbound session without INVITE".to_string()))?;
                self.invite_response(&entry, invite, 487, Some("Request Terminated"), None)?
                    .to_bytes()
            }
            // CANCEL matches the INVITE transaction: same branch, same CSeq number
            (LegDirection::Outbound, true) => self
                .dialog_request(
                    &entry,
                    Method::Cancel,
                    entry.cseq,
                    &entry.invite_branch,
                    &entry.remote_uri,
                    None,
                    None,
                )?
                .to_bytes(),
            (_, false) => self
                .dialog_request(
                    &entry,
                    Method::Bye,
                    entry.cseq + 1,
                    &new_branch(),
                    &entry.remote_uri,
                    None,
                    None,
                )?
                .to_bytes(),
        };

        info!("Ending {} ({:?}, {})", session, entry.direction, entry.state);
        self.transmit(message, entry.peer, entry.protocol).await
    }

    async fn contact(&self, session: SessionId) -> Option<String> {
        self.table.lock().await.sessions.get(&session).map(|s| {
            s.remote_contact
                .clone()
                .unwrap_or_else(|| format!("sip:{}", s.peer))
        })
    }
}
