//! End-to-end call flows over loopback UDP

use b2bua::domain::registry::{MemoryRegistry, Registry};
use b2bua::domain::shared::SipUri;
use b2bua::infrastructure::protocols::sip::{
    CallBridge, Registrar, ResponseBuilder, SipMessage, SipMethod, SipRequest, SipResponse,
    SipServer, SipServerConfig, UserAgent,
};
use rsip::Header;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const CALLER_SDP: &str = "v=0\r\no=alice 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\n";
const CALLEE_SDP: &str = "v=0\r\no=bob 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 5000 RTP/AVP 0\r\n";

struct Pbx {
    server: SipServer,
    addr: SocketAddr,
    registry: Arc<MemoryRegistry>,
    bridge: Arc<CallBridge>,
}

async fn start_pbx() -> Pbx {
    let registry = Arc::new(MemoryRegistry::new());
    let mut server = SipServer::new(SipServerConfig {
        udp_bind: "127.0.0.1:0".parse().unwrap(),
        tcp_bind: "127.0.0.1:0".parse().unwrap(),
        domain: "127.0.0.1".to_string(),
        enable_tcp: false,
    });
    server.start().await.unwrap();
    let addr = server.udp_local_addr().unwrap();

    let (user_agent, mut events) = UserAgent::new(Arc::new(server.sender()), addr, "Test B2BUA");
    let user_agent = Arc::new(user_agent);
    let bridge = Arc::new(CallBridge::new(registry.clone(), user_agent.clone()));

    server
        .register_handler(SipMethod::Register, Arc::new(Registrar::new(registry.clone())))
        .await;
    for method in [SipMethod::Invite, SipMethod::Ack, SipMethod::Bye, SipMethod::Cancel] {
        server.register_handler(method, user_agent.clone()).await;
    }
    server.set_response_handler(user_agent.clone()).await;

    // One task per leg event, as the binary dispatches them
    let engine = bridge.clone();
    tokio::spawn(async move {
        while let Some((session, event)) = events.recv().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.on_leg_event(session, event).await;
            });
        }
    });

    Pbx {
        server,
        addr,
        registry,
        bridge,
    }
}

struct Phone {
    socket: UdpSocket,
    addr: SocketAddr,
    pbx: SocketAddr,
}

impl Phone {
    async fn new(pbx: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        Self { socket, addr, pbx }
    }

    async fn send(&self, data: &[u8]) {
        self.socket.send_to(data, self.pbx).await.unwrap();
    }

    async fn recv(&self) -> SipMessage {
        let mut buf = vec![0u8; 65535];
        let (size, _) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for SIP message")
            .unwrap();
        SipMessage::parse(&buf[..size]).unwrap()
    }

    async fn recv_response(&self) -> SipResponse {
        match self.recv().await {
            SipMessage::Response(response) => response,
            SipMessage::Request(request) => panic!("expected response, got {:?}", request.method()),
        }
    }

    async fn recv_request(&self) -> SipRequest {
        match self.recv().await {
            SipMessage::Request(request) => request,
            SipMessage::Response(response) => {
                panic!("expected request, got {}", response.status_code())
            }
        }
    }

    async fn register(&self, user: &str) {
        let raw = format!(
            "REGISTER sip:127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch=z9hG4bKreg{user}\r\n\
             From: <sip:{user}@127.0.0.1>;tag=r{user}\r\n\
             To: <sip:{user}@127.0.0.1>\r\n\
             Call-ID: reg-{user}\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <sip:{user}@{addr}>\r\n\
             User-Agent: Phone/1.0\r\n\
             Expires: 60\r\n\
             Content-Length: 0\r\n\r\n",
            addr = self.addr,
            user = user,
        );
        self.send(raw.as_bytes()).await;
        let response = self.recv_response().await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.reason(), "Registered");
    }

    fn request(&self, method: &str, callee: &str, call_id: &str, to_tag: Option<&str>, body: Option<&str>) -> String {
        let to = match to_tag {
            Some(tag) => format!("<sip:{}@127.0.0.1>;tag={}", callee, tag),
            None => format!("<sip:{}@127.0.0.1>", callee),
        };
        let cseq = if method == "BYE" { 2 } else { 1 };
        let mut raw = format!(
            "{method} sip:{callee}@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch=z9hG4bK{method}{call_id}\r\n\
             Max-Forwards: 70\r\n\
             From: \"Alice\" <sip:100@127.0.0.1>;tag=caller\r\n\
             To: {to}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n\
             Contact: <sip:100@{addr}>\r\n",
            method = method,
            callee = callee,
            addr = self.addr,
            to = to,
            call_id = call_id,
            cseq = cseq,
        );
        match body {
            Some(body) => raw.push_str(&format!(
                "Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )),
            None => raw.push_str("Content-Length: 0\r\n\r\n"),
        }
        raw
    }
}

fn to_tag(response: &SipResponse) -> Option<String> {
    let to = response.to_value()?;
    to.split(';')
        .find_map(|param| param.trim().strip_prefix("tag=").map(str::to_string))
}

async fn wait_for_calls(bridge: &CallBridge, expected: usize) {
    for _ in 0..100 {
        if bridge.active_call_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("active calls never reached {}", expected);
}

#[tokio::test]
async fn test_basic_call() {
    let mut pbx = start_pbx().await;
    let caller = Phone::new(pbx.addr).await;
    let callee = Phone::new(pbx.addr).await;

    callee.register("200").await;
    assert!(pbx.registry.is_registered(&SipUri::parse("sip:200@127.0.0.1").unwrap()).await);

    caller
        .send(caller.request("INVITE", "200", "flow-1", None, Some(CALLER_SDP)).as_bytes())
        .await;
    assert_eq!(caller.recv_response().await.status_code(), 100);

    // B-leg toward the registered contact, carrying the caller's identity and offer
    let invite = callee.recv_request().await;
    assert_eq!(invite.method(), Some(SipMethod::Invite));
    assert_eq!(invite.from_display_name(), Some("Alice".to_string()));
    assert_eq!(invite.body_text(), Some(CALLER_SDP.to_string()));
    assert_ne!(invite.call_id(), Some("flow-1".to_string()));

    let ringing = ResponseBuilder::new(180)
        .to_tag("callee")
        .build_for_request(&invite)
        .unwrap();
    callee.send(&ringing.to_bytes()).await;
    let forwarded = caller.recv_response().await;
    assert_eq!(forwarded.status_code(), 180);
    assert_eq!(forwarded.reason(), "Ringing");

    let ok = ResponseBuilder::ok()
        .to_tag("callee")
        .header(Header::Contact(format!("<sip:200@{}>", callee.addr).into()))
        .sdp(CALLEE_SDP.to_string())
        .build_for_request(&invite)
        .unwrap();
    callee.send(&ok.to_bytes()).await;

    let ack = callee.recv_request().await;
    assert_eq!(ack.method(), Some(SipMethod::Ack));

    let answered = caller.recv_response().await;
    assert_eq!(answered.status_code(), 200);
    assert_eq!(answered.body_text(), Some(CALLEE_SDP.to_string()));
    let tag = to_tag(&answered).unwrap();
    assert!(pbx.bridge.calls().await[0].answered);

    caller
        .send(caller.request("ACK", "200", "flow-1", Some(&tag), None).as_bytes())
        .await;
    caller
        .send(caller.request("BYE", "200", "flow-1", Some(&tag), None).as_bytes())
        .await;
    assert_eq!(caller.recv_response().await.status_code(), 200);

    let bye = callee.recv_request().await;
    assert_eq!(bye.method(), Some(SipMethod::Bye));
    assert_eq!(bye.call_id(), invite.call_id());

    wait_for_calls(&pbx.bridge, 0).await;
    pbx.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_call_to_unregistered_user_is_rejected() {
    let mut pbx = start_pbx().await;
    let caller = Phone::new(pbx.addr).await;

    caller
        .send(caller.request("INVITE", "300", "flow-2", None, Some(CALLER_SDP)).as_bytes())
        .await;

    let rejected = caller.recv_response().await;
    assert_eq!(rejected.status_code(), 404);
    assert_eq!(rejected.reason(), "sip:300@127.0.0.1 Not found");
    assert_eq!(pbx.bridge.active_call_count().await, 0);

    pbx.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_caller_cancel_reaches_callee() {
    let mut pbx = start_pbx().await;
    let caller = Phone::new(pbx.addr).await;
    let callee = Phone::new(pbx.addr).await;
    callee.register("200").await;

    caller
        .send(caller.request("INVITE", "200", "flow-3", None, None).as_bytes())
        .await;
    assert_eq!(caller.recv_response().await.status_code(), 100);
    let invite = callee.recv_request().await;
    wait_for_calls(&pbx.bridge, 1).await;

    caller
        .send(caller.request("CANCEL", "200", "flow-3", None, None).as_bytes())
        .await;
    assert_eq!(caller.recv_response().await.status_code(), 487);
    assert_eq!(caller.recv_response().await.status_code(), 200);

    let cancel = callee.recv_request().await;
    assert_eq!(cancel.method(), Some(SipMethod::Cancel));
    assert_eq!(cancel.call_id(), invite.call_id());

    wait_for_calls(&pbx.bridge, 0).await;
    pbx.server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_busy_callee_ends_caller() {
    let mut pbx = start_pbx().await;
    let caller = Phone::new(pbx.addr).await;
    let callee = Phone::new(pbx.addr).await;
    callee.register("200").await;

    caller
        .send(caller.request("INVITE", "200", "flow-4", None, Some(CALLER_SDP)).as_bytes())
        .await;
    assert_eq!(caller.recv_response().await.status_code(), 100);

    // Answered as fast as the loopback allows
    let invite = callee.recv_request().await;
    let busy = ResponseBuilder::new(486)
        .to_tag("callee")
        .build_for_request(&invite)
        .unwrap();
    callee.send(&busy.to_bytes()).await;

    let ack = callee.recv_request().await;
    assert_eq!(ack.method(), Some(SipMethod::Ack));

    let terminated = caller.recv_response().await;
    assert_eq!(terminated.status_code(), 487);
    wait_for_calls(&pbx.bridge, 0).await;

    pbx.server.stop().await.unwrap();
}
