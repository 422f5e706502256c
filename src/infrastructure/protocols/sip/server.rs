//! SIP server: binds the transports and dispatches what they deliver

use super::builder::ResponseBuilder;
use super::connection::{ConnectionError, ConnectionLossHandler};
use super::handler::{RequestContext, ResponseHandler, SipHandler};
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{
    IncomingMessage, MessageSender, OutgoingMessage, TcpTransport, Transport, TransportEvent,
    TransportProtocol, TransportSender, UdpTransport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// SIP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipServerConfig {
    pub udp_bind: SocketAddr,
    pub tcp_bind: SocketAddr,
    pub domain: String,
    pub enable_tcp: bool,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            udp_bind: SocketAddr::from(([0, 0, 0, 0], 5060)),
            tcp_bind: SocketAddr::from(([0, 0, 0, 0], 5060)),
            domain: "localhost".to_string(),
            enable_tcp: true,
        }
    }
}

type HandlerMap = Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>;

/// Routes transport events to the registered handlers
#[derive(Clone)]
struct Dispatcher {
    handlers: HandlerMap,
    responses: Arc<RwLock<Option<Arc<dyn ResponseHandler>>>>,
    connection_loss: Arc<RwLock<Option<Arc<ConnectionLossHandler>>>>,
    sender: Arc<dyn MessageSender>,
}

impl Dispatcher {
    async fn dispatch(&self, event: TransportEvent) -> Result<(), SipError> {
        match event {
            TransportEvent::Message(incoming) => self.dispatch_message(incoming).await,
            TransportEvent::ConnectionLost(lost) => {
                self.connection_lost(lost).await;
                Ok(())
            }
        }
    }

    async fn dispatch_message(&self, incoming: IncomingMessage) -> Result<(), SipError> {
        let ctx = RequestContext {
            source: incoming.source,
            protocol: incoming.protocol,
        };

        match incoming.message {
            SipMessage::Request(request) => {
                if let Some(response) = self.handle_request(request, &ctx).await? {
                    self.reply(response, &ctx).await?;
                }
            }
            SipMessage::Response(response) => {
                debug!(
                    "Received SIP response {} from {} via {}",
                    response.status_code(),
                    ctx.source,
                    ctx.protocol.as_str()
                );
                let handler = self.responses.read().await.clone();
                match handler {
                    Some(handler) => handler.handle_response(response, &ctx).await,
                    None => debug!("No response handler, dropping response"),
                }
            }
        }

        Ok(())
    }

    async fn handle_request(
        &self,
        request: SipRequest,
        ctx: &RequestContext,
    ) -> Result<Option<SipResponse>, SipError> {
        let Some(method) = request.method() else {
            warn!("Unsupported method {} from {}", request.inner.method, ctx.source);
            return ResponseBuilder::not_implemented()
                .build_for_request(&request)
                .map(Some);
        };
        debug!("Processing SIP {} from {}", method, ctx.source);

        let handler = self.handlers.read().await.get(&method).cloned();
        match handler {
            Some(handler) => match handler.handle_request(request.clone(), ctx).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    error!("Handler error for {}: {}", method, e);
                    ResponseBuilder::server_internal_error()
                        .build_for_request(&request)
                        .map(Some)
                }
            },
            // Keep-alive probes get a plain 200
            None if method == SipMethod::Options => {
                ResponseBuilder::ok().build_for_request(&request).map(Some)
            }
            None if method == SipMethod::Ack => Ok(None),
            None => {
                warn!("No handler registered for method: {}", method);
                ResponseBuilder::not_implemented()
                    .build_for_request(&request)
                    .map(Some)
            }
        }
    }

    async fn reply(&self, response: SipResponse, ctx: &RequestContext) -> Result<(), SipError> {
        debug!("Sending {} to {}", response.status_code(), ctx.source);
        self.sender
            .send(OutgoingMessage {
                data: response.to_bytes(),
                destination: ctx.source,
                protocol: ctx.protocol,
            })
            .await
    }

    async fn connection_lost(&self, lost: ConnectionError) {
        warn!("Connection error: {}", lost);
        let handler = self.connection_loss.read().await.clone();
        if let Some(handler) = handler {
            handler.handle(&lost).await;
        }
    }

    fn spawn_loop(self, mut rx: mpsc::Receiver<TransportEvent>, protocol: TransportProtocol) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.dispatch(event).await {
                        error!("Error processing {} message: {}", protocol.as_str(), e);
                    }
                });
            }
            debug!("{} event loop finished", protocol.as_str());
        });
    }
}

/// SIP server
pub struct SipServer {
    config: SipServerConfig,
    udp_transport: Option<UdpTransport>,
    tcp_transport: Option<TcpTransport>,
    handlers: HandlerMap,
    responses: Arc<RwLock<Option<Arc<dyn ResponseHandler>>>>,
    connection_loss: Arc<RwLock<Option<Arc<ConnectionLossHandler>>>>,
    sender: TransportSender,
}

impl SipServer {
    pub fn new(config: SipServerConfig) -> Self {
        Self {
            udp_transport: Some(UdpTransport::new(config.udp_bind)),
            tcp_transport: if config.enable_tcp {
                Some(TcpTransport::new(config.tcp_bind))
            } else {
                None
            },
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            responses: Arc::new(RwLock::new(None)),
            connection_loss: Arc::new(RwLock::new(None)),
            sender: TransportSender::default(),
        }
    }

    pub fn config(&self) -> &SipServerConfig {
        &self.config
    }

    pub async fn register_handler(&self, method: SipMethod, handler: Arc<dyn SipHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(method, handler);
        info!("Registered handler for SIP method: {}", method);
    }

    /// Receiver of responses to requests we originated
    pub async fn set_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        *self.responses.write().await = Some(handler);
    }

    pub async fn set_connection_loss_handler(&self, handler: Arc<ConnectionLossHandler>) {
        *self.connection_loss.write().await = Some(handler);
    }

    /// Sender over the running transports; empty until `start` succeeds
    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp_transport.as_ref().and_then(|t| t.local_addr())
    }

    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp_transport.as_ref().and_then(|t| t.local_addr())
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            handlers: self.handlers.clone(),
            responses: self.responses.clone(),
            connection_loss: self.connection_loss.clone(),
            sender: Arc::new(self.sender.clone()),
        }
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting SIP server");
        info!("Domain: {}", self.config.domain);

        // Start UDP transport and get receiver
        let mut udp_rx = None;
        let mut udp_socket = None;
        if let Some(transport) = &mut self.udp_transport {
            transport.start().await?;
            udp_rx = Some(std::mem::replace(transport.receiver(), mpsc::channel(1).1));
            udp_socket = transport.socket.clone();
        }

        // Start TCP transport and get receiver
        let mut tcp_rx = None;
        let mut tcp_connections = None;
        if let Some(transport) = &mut self.tcp_transport {
            transport.start().await?;
            tcp_rx = Some(std::mem::replace(transport.receiver(), mpsc::channel(1).1));
            tcp_connections = transport.connections();
        }

        self.sender = TransportSender::new(udp_socket, tcp_connections);

        if let Some(rx) = udp_rx {
            self.dispatcher().spawn_loop(rx, TransportProtocol::Udp);
        }
        if let Some(rx) = tcp_rx {
            self.dispatcher().spawn_loop(rx, TransportProtocol::Tcp);
        }

        info!("SIP server started successfully");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), SipError> {
        info!("Stopping SIP server");

        if let Some(transport) = &mut self.udp_transport {
            transport.stop().await?;
        }

        if let Some(transport) = &mut self.tcp_transport {
            transport.stop().await?;
        }

        self.sender = TransportSender::default();
        info!("SIP server stopped");
        Ok(())
    }
}
