//! SIP transport layer - handles UDP and TCP

use super::connection::ConnectionError;
use super::message::{SipError, SipMessage};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Lowercase network name as used in `transport=` parameters
    pub fn network(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
        }
    }

    pub fn from_network(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Some(TransportProtocol::Udp),
            "tcp" => Some(TransportProtocol::Tcp),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        5060
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Everything a transport reports upwards
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(IncomingMessage),
    ConnectionLost(ConnectionError),
}

/// Transport layer trait
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport
    async fn start(&mut self) -> Result<(), SipError>;

    /// Stop the transport
    async fn stop(&mut self) -> Result<(), SipError>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Get the receiver for transport events
    fn receiver(&mut self) -> &mut mpsc::Receiver<TransportEvent>;
}

/// Outbound half of the transports, shared by everything that sends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    pub socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<TransportEvent>,
    rx: mpsc::Receiver<TransportEvent>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<TransportEvent>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLFs carry no message
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };

                            if let Err(e) = tx.send(TransportEvent::Message(incoming)).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        let local = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        info!("UDP transport listening on {}", local);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        // Start receive loop in background
        let tx = self.tx.clone();
        tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SipError> {
        info!("Stopping UDP transport");
        self.socket = None;
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;
        send_udp(socket, &message).await
    }

    fn receiver(&mut self) -> &mut mpsc::Receiver<TransportEvent> {
        &mut self.rx
    }
}

async fn send_udp(socket: &UdpSocket, message: &OutgoingMessage) -> Result<(), SipError> {
    debug!(
        "Sending {} bytes to {} via UDP",
        message.data.len(),
        message.destination
    );

    socket
        .send_to(&message.data, message.destination)
        .await
        .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

    Ok(())
}

type Writer = Arc<Mutex<OwnedWriteHalf>>;

/// Largest partial message a TCP peer may leave buffered
const MAX_TCP_BUFFER: usize = 64 * 1024;

/// Live TCP connections keyed by peer address.
///
/// Accepted and outbound connections are both tracked here, so a message to a
/// peer always reuses the connection it registered over.
#[derive(Clone)]
pub struct TcpConnections {
    local: SocketAddr,
    writers: Arc<Mutex<HashMap<SocketAddr, Writer>>>,
    tx: mpsc::Sender<TransportEvent>,
}

impl TcpConnections {
    fn new(local: SocketAddr, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            local,
            writers: Arc::new(Mutex::new(HashMap::new())),
            tx,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.writers.lock().await.len()
    }

    async fn attach(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        self.writers
            .lock()
            .await
            .insert(peer, Arc::new(Mutex::new(writer)));

        let connections = self.clone();
        tokio::spawn(async move {
            connections.read_loop(reader, peer).await;
        });
    }

    async fn read_loop(self, mut reader: OwnedReadHalf, peer: SocketAddr) {
        let mut buf = BytesMut::with_capacity(MAX_TCP_BUFFER);

        loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("TCP connection closed by {}", peer);
                    break;
                }
                Ok(size) => {
                    debug!("Received {} bytes from {} via TCP", size, peer);

                    while let Some(frame) = take_frame(&mut buf) {
                        match SipMessage::parse(&frame) {
                            Ok(message) => {
                                let incoming = IncomingMessage {
                                    message,
                                    source: peer,
                                    protocol: TransportProtocol::Tcp,
                                };
                                if self.tx.send(TransportEvent::Message(incoming)).await.is_err() {
                                    error!("Transport event channel closed");
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!("Failed to parse SIP message from {}: {}", peer, e);
                            }
                        }
                    }

                    if buf.len() >= MAX_TCP_BUFFER {
                        warn!(
                            "Dropping TCP connection {}: {} bytes without a complete message",
                            peer,
                            buf.len()
                        );
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read from TCP connection {}: {}", peer, e);
                    break;
                }
            }
        }

        self.writers.lock().await.remove(&peer);

        let lost = ConnectionError {
            source: peer,
            destination: self.local,
            network: TransportProtocol::Tcp.network().to_string(),
        };
        if self.tx.send(TransportEvent::ConnectionLost(lost)).await.is_err() {
            error!("Transport event channel closed");
        }
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via TCP",
            message.data.len(),
            message.destination
        );

        let existing = self.writers.lock().await.get(&message.destination).cloned();
        let writer = match existing {
            Some(writer) => writer,
            None => {
                let stream = TcpStream::connect(message.destination).await.map_err(|e| {
                    SipError::TransportError(format!(
                        "Failed to connect to {}: {}",
                        message.destination, e
                    ))
                })?;
                self.attach(stream, message.destination).await;
                self.writers
                    .lock()
                    .await
                    .get(&message.destination)
                    .cloned()
                    .ok_or_else(|| {
                        SipError::TransportError(format!(
                            "Connection to {} closed",
                            message.destination
                        ))
                    })?
            }
        };

        let mut writer = writer.lock().await;
        writer
            .write_all(&message.data)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send TCP data: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to flush TCP stream: {}", e)))?;

        Ok(())
    }
}

/// Split one complete message off the front of a stream buffer
fn take_frame(buf: &mut BytesMut) -> Option<Bytes> {
    // Drop keep-alive CRLFs between messages
    let leading = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
    if leading > 0 {
        let _ = buf.split_to(leading);
    }

    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&buf[..header_end]);
    let body_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| {
            let name = name.trim();
            name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l")
        })
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    if buf.len() < header_end + body_len {
        return None;
    }
    Some(buf.split_to(header_end + body_len).freeze())
}

/// TCP transport implementation
pub struct TcpTransport {
    bind_addr: SocketAddr,
    connections: Option<TcpConnections>,
    tx: mpsc::Sender<TransportEvent>,
    rx: mpsc::Receiver<TransportEvent>,
}

impl TcpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            connections: None,
            tx,
            rx,
        }
    }

    pub fn connections(&self) -> Option<TcpConnections> {
        self.connections.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connections.as_ref().map(|c| c.local)
    }

    async fn accept_loop(listener: TcpListener, connections: TcpConnections) {
        loop {
            match listener.accept().await {
                Ok((stream, source)) => {
                    info!("Accepted TCP connection from {}", source);
                    connections.attach(stream, source).await;
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting TCP transport on {}", self.bind_addr);

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind TCP socket: {}", e)))?;

        let local = listener
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        info!("TCP transport listening on {}", local);

        let connections = TcpConnections::new(local, self.tx.clone());
        self.connections = Some(connections.clone());

        // Start accept loop in background
        tokio::spawn(async move {
            Self::accept_loop(listener, connections).await;
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SipError> {
        info!("Stopping TCP transport");
        self.connections = None;
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let connections = self
            .connections
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Listener not initialized".to_string()))?;
        connections.send(&message).await
    }

    fn receiver(&mut self) -> &mut mpsc::Receiver<TransportEvent> {
        &mut self.rx
    }
}

/// Cloneable sender over whichever transports are running
#[derive(Clone, Default)]
pub struct TransportSender {
    udp: Option<Arc<UdpSocket>>,
    tcp: Option<TcpConnections>,
}

impl TransportSender {
    pub fn new(udp: Option<Arc<UdpSocket>>, tcp: Option<TcpConnections>) -> Self {
        Self { udp, tcp }
    }
}

#[async_trait]
impl MessageSender for TransportSender {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        match message.protocol {
            TransportProtocol::Udp => match &self.udp {
                Some(socket) => send_udp(socket, &message).await,
                None => Err(SipError::TransportError("UDP transport not running".to_string())),
            },
            TransportProtocol::Tcp => match &self.tcp {
                Some(connections) => connections.send(&message).await,
                None => Err(SipError::TransportError("TCP transport not running".to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OPTIONS: &[u8] = b"OPTIONS sip:100@127.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:5999;branch=z9hG4bK1\r\n\
        From: <sip:200@127.0.0.1>;tag=1\r\n\
        To: <sip:100@127.0.0.1>\r\n\
        Call-ID: opt-1\r\n\
        CSeq: 1 OPTIONS\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_udp_transport_start() {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let mut transport = UdpTransport::new(bind_addr);

        let result = transport.start().await;
        assert!(result.is_ok());
        assert!(transport.local_addr().is_some());

        // Clean up
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_transport_start() {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let mut transport = TcpTransport::new(bind_addr);

        let result = transport.start().await;
        assert!(result.is_ok());
        assert!(transport.local_addr().is_some());

        // Clean up
        transport.stop().await.unwrap();
    }

    #[test]
    fn test_take_frame_splits_pipelined_messages() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\n\r\n");
        buf.extend_from_slice(OPTIONS);
        buf.extend_from_slice(&OPTIONS[..20]);

        let frame = take_frame(&mut buf).unwrap();
        assert_eq!(&frame[..], OPTIONS);
        assert!(take_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn test_take_frame_waits_for_body() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"SIP/2.0 200 OK\r\nContent-Length: 4\r\n\r\nv=");
        assert!(take_frame(&mut buf).is_none());

        buf.extend_from_slice(b"0\n");
        let frame = take_frame(&mut buf).unwrap();
        assert!(frame.ends_with(b"v=0\n"));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_connection_loss_is_reported() {
        let mut transport = TcpTransport::new("127.0.0.1:0".parse().unwrap());
        transport.start().await.unwrap();
        let local = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(local).await.unwrap();
        let peer = client.local_addr().unwrap();
        client.write_all(OPTIONS).await.unwrap();

        let rx = transport.receiver();
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            TransportEvent::Message(incoming) => {
                assert_eq!(incoming.source, peer);
                assert_eq!(incoming.protocol, TransportProtocol::Tcp);
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(client);

        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            TransportEvent::ConnectionLost(lost) => {
                assert_eq!(lost.source, peer);
                assert_eq!(lost.destination, local);
                assert_eq!(lost.network, "tcp");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let connections = transport.connections().unwrap();
        assert_eq!(connections.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_tcp_oversized_partial_message_closes_connection() {
        let mut transport = TcpTransport::new("127.0.0.1:0".parse().unwrap());
        transport.start().await.unwrap();
        let local = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(local).await.unwrap();
        let peer = client.local_addr().unwrap();
        // Header block that never terminates
        let mut flood = b"OPTIONS sip:100@127.0.0.1 SIP/2.0\r\nX-Padding: ".to_vec();
        flood.resize(MAX_TCP_BUFFER + 1024, b'a');
        // The server may hang up before the whole flood is written
        let _ = client.write_all(&flood).await;

        let rx = transport.receiver();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::ConnectionLost(lost) => assert_eq!(lost.source, peer),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(transport.connections().unwrap().connection_count().await, 0);
    }
}
