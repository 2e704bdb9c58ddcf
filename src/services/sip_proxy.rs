//! SIP proxy core
//!
//! A stateful transactional UDP proxy on the SIP port. Each datagram is
//! handled in isolation: classify as request or response, dispatch on
//! method or status code, advance the call-session table, and forward.
//! The proxy never touches message bodies; reliability is the SIP user
//! agents' problem, so there is no retransmission machinery here.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::core::state::{CallState, ProxyStats, SharedState};
use crate::protocols::sip::{
    self, SipMessage, SipMethod, StartLine, ALLOWED_METHODS,
};
use crate::services::phone_monitor::ResponseQueue;
use crate::utils::{discover_source_ip, MeshResolver};
use crate::{Error, Result};

/// From-header signature of quality-monitor probe traffic; datagrams
/// bearing it bypass the proxy and land in the monitor's response queue.
pub const MONITOR_SIGNATURE: &str = "<sip:test@";

pub struct SipProxy {
    listen_port: u16,
    max_message_bytes: usize,
    register_expires: u32,
    state: Arc<SharedState>,
    socket: Arc<UdpSocket>,
    queue: Arc<ResponseQueue>,
    resolver: Arc<dyn MeshResolver>,
    /// Port forwarded requests are addressed to. Always the SIP port in
    /// production; tests point it at loopback listeners.
    callee_port: u16,
}

impl SipProxy {
    /// Bind the SIP socket. Failure here is fatal to startup.
    pub async fn bind(
        config: &AgentConfig,
        state: Arc<SharedState>,
        queue: Arc<ResponseQueue>,
        resolver: Arc<dyn MeshResolver>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.sip.listen_port))
            .await
            .map_err(|e| {
                Error::network(format!(
                    "cannot bind SIP port {}: {}",
                    config.sip.listen_port, e
                ))
            })?;
        info!("SIP proxy listening on udp/{}", config.sip.listen_port);
        Ok(Self {
            listen_port: config.sip.listen_port,
            max_message_bytes: config.sip.max_message_bytes,
            register_expires: config.sip.register_expires,
            state,
            socket: Arc::new(socket),
            queue,
            resolver,
            callee_port: config.sip.listen_port,
        })
    }

    /// The bound socket, shared with the phone quality monitor so its
    /// probes originate from the SIP port.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Receive loop. Serialises all datagram handling, which is what
    /// preserves per-session ordering.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.max_message_bytes * 2 + 1];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            self.handle_datagram(&buf[..len], src).await;
                        }
                        Err(e) => {
                            error!("SIP socket receive error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("SIP proxy shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Handle one datagram. Every failure path logs and drops; nothing
    /// here can take the receive loop down.
    pub async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let stats = &self.state.proxy_stats;
        ProxyStats::bump(&stats.datagrams_received);

        if data.len() > self.max_message_bytes {
            ProxyStats::bump(&stats.oversize_dropped);
            warn!(
                "Dropping oversize SIP datagram from {} ({} bytes)",
                src,
                data.len()
            );
            return;
        }

        let msg = match SipMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                ProxyStats::bump(&stats.parse_failures);
                debug!("Dropping unparseable datagram from {}: {}", src, e);
                return;
            }
        };

        // Quality-monitor traffic is recognised by its From signature and
        // delivered to the monitor's queue instead of the proxy.
        if let Some(from) = msg.header("From") {
            if from.contains(MONITOR_SIGNATURE) {
                self.queue.push(data);
                return;
            }
        }

        match &msg.start {
            StartLine::Request { method, .. } => match method {
                SipMethod::Register => self.handle_register(&msg, src).await,
                SipMethod::Invite => self.handle_invite(&msg, src).await,
                SipMethod::Bye => self.handle_bye(&msg, src).await,
                SipMethod::Cancel => self.handle_cancel(&msg, src).await,
                SipMethod::Ack => self.handle_ack(&msg, src).await,
                SipMethod::Options => self.handle_options(&msg, src).await,
                SipMethod::Other(name) => {
                    debug!("Unsupported SIP method {} from {}", name, src);
                    self.reply(501, "Not Implemented", &msg, src).await;
                }
            },
            StartLine::Status { .. } => self.handle_response(&msg, data, src).await,
        }
    }

    async fn handle_register(&self, msg: &SipMessage, src: SocketAddr) {
        let Some(from) = msg.header("From") else {
            self.reply(400, "Bad Request", msg, src).await;
            return;
        };
        let Some(user_id) = sip::uri_user(from) else {
            self.reply(400, "Bad Request", msg, src).await;
            return;
        };
        let display_name = sip::display_name(from);
        let expires = msg.expires().unwrap_or(self.register_expires);
        let active = expires != 0;

        let result = self
            .state
            .users
            .register(
                &user_id,
                display_name.as_deref(),
                msg.header("Contact"),
                src,
                std::time::Duration::from_secs(expires as u64),
                active,
            )
            .await;
        if let Err(e) = result {
            warn!("REGISTER for {} rejected: {}", user_id, e);
            self.reply(503, "Service Unavailable", msg, src).await;
            return;
        }

        if active {
            info!("Registered user {} at {}", user_id, src);
        } else {
            info!("Deregistered user {}", user_id);
        }

        let mut response = SipMessage::new_response(200, "OK", msg);
        response.set_header("Expires", &self.register_expires.to_string());
        if let Some(contact) = msg.header("Contact") {
            response.set_header("Contact", contact);
        }
        self.send_response(&response, src).await;
    }

    async fn handle_invite(&self, msg: &SipMessage, src: SocketAddr) {
        let callee = msg.request_uri().and_then(sip::uri_user);
        let Some(callee) = callee else {
            self.reply(404, "Not Found", msg, src).await;
            return;
        };

        let known = self.state.users.get(&callee).await;
        if !known.map(|u| u.active).unwrap_or(false) {
            debug!("INVITE for unknown or inactive user {}", callee);
            self.reply(404, "Not Found", msg, src).await;
            return;
        }

        let callee_ip = match self.resolver.resolve(&callee).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!("INVITE target {} unresolvable: {}", callee, e);
                self.reply(404, "Not Found", msg, src).await;
                return;
            }
        };
        let callee_addr = SocketAddr::new(IpAddr::V4(callee_ip), self.callee_port);

        let Some(call_id) = msg.call_id().map(str::to_string) else {
            self.reply(400, "Bad Request", msg, src).await;
            return;
        };
        let from_tag = msg.header("From").and_then(|f| sip::tag_of(f));

        match self
            .state
            .calls
            .create(&call_id, src, callee_addr, from_tag)
            .await
        {
            Ok(true) => {
                info!("Call {} from {} to {} ({})", call_id, src, callee, callee_addr);
            }
            Ok(false) => {
                debug!("Retransmitted INVITE for call {}", call_id);
            }
            Err(e) => {
                warn!("No free call session for {}: {}", call_id, e);
                self.reply(503, "Service Unavailable", msg, src).await;
                return;
            }
        }

        self.reply(100, "Trying", msg, src).await;
        self.forward_request(msg, &callee, callee_addr).await;
    }

    async fn handle_bye(&self, msg: &SipMessage, src: SocketAddr) {
        let Some(session) = self.lookup_session(msg).await else {
            self.reply(481, "Call/Transaction Does Not Exist", msg, src)
                .await;
            return;
        };

        let other = if src == session.caller_addr {
            session.callee_addr
        } else if src == session.callee_addr {
            session.caller_addr
        } else {
            debug!(
                "BYE for call {} from stranger {}; parties are {} and {}",
                session.call_id, src, session.caller_addr, session.callee_addr
            );
            self.reply(481, "Call/Transaction Does Not Exist", msg, src)
                .await;
            return;
        };

        self.state
            .calls
            .set_state(&session.call_id, CallState::Terminating)
            .await;
        self.forward_in_dialog(msg, other).await;
        self.reply(200, "OK", msg, src).await;
        self.state.calls.remove(&session.call_id).await;
        info!("Call {} torn down by {}", session.call_id, src);
    }

    async fn handle_cancel(&self, msg: &SipMessage, src: SocketAddr) {
        let Some(session) = self.lookup_session(msg).await else {
            self.reply(481, "Call/Transaction Does Not Exist", msg, src)
                .await;
            return;
        };
        if !matches!(session.state, CallState::InviteSent | CallState::Ringing) {
            self.reply(481, "Call/Transaction Does Not Exist", msg, src)
                .await;
            return;
        }

        self.forward_in_dialog(msg, session.callee_addr).await;
        self.reply(200, "OK", msg, src).await;
        self.state.calls.remove(&session.call_id).await;
        info!("Call {} cancelled", session.call_id);
    }

    async fn handle_ack(&self, msg: &SipMessage, _src: SocketAddr) {
        let Some(session) = self.lookup_session(msg).await else {
            return;
        };
        if session.state == CallState::Established {
            self.forward_in_dialog(msg, session.callee_addr).await;
        }
    }

    async fn handle_options(&self, msg: &SipMessage, src: SocketAddr) {
        let mut response = SipMessage::new_response(200, "OK", msg);
        response.set_header("Allow", ALLOWED_METHODS);
        self.send_response(&response, src).await;
    }

    /// Route a response back to the session's caller, advancing the
    /// dialog state on INVITE transactions.
    async fn handle_response(&self, msg: &SipMessage, raw: &[u8], src: SocketAddr) {
        let Some(session) = self.lookup_session(msg).await else {
            debug!("Response from {} for unknown call; dropped", src);
            return;
        };
        let code = msg.status_code().unwrap_or(0);
        let to_invite = matches!(msg.cseq(), Some((_, SipMethod::Invite)));

        // Responses pass through byte-for-byte.
        if let Err(e) = self.socket.send_to(raw, session.caller_addr).await {
            warn!(
                "Failed to forward response for call {}: {}",
                session.call_id, e
            );
            return;
        }
        ProxyStats::bump(&self.state.proxy_stats.responses_forwarded);

        if to_invite {
            match code {
                180 | 183 => {
                    self.state
                        .calls
                        .set_state(&session.call_id, CallState::Ringing)
                        .await;
                }
                200..=299 => {
                    let to_tag = msg.header("To").and_then(|t| sip::tag_of(t));
                    self.state.calls.establish(&session.call_id, to_tag).await;
                    info!("Call {} established", session.call_id);
                }
                300..=699 => {
                    self.state.calls.remove(&session.call_id).await;
                    info!("Call {} failed with {}", session.call_id, code);
                }
                _ => {}
            }
        }
    }

    async fn lookup_session(&self, msg: &SipMessage) -> Option<crate::core::state::CallSession> {
        let call_id = msg.call_id()?;
        self.state.calls.get(call_id).await
    }

    /// Forward a request toward its resolved target: rewrite the
    /// Request-URI, stamp our Via on top, leave everything else alone.
    async fn forward_request(&self, msg: &SipMessage, callee: &str, target: SocketAddr) {
        let mut forwarded = msg.clone();
        let uri = format!("sip:{}@{}", callee, target);
        if forwarded.set_request_uri(&uri).is_err() {
            return;
        }
        forwarded.prepend_via(&self.local_via(target));
        self.send_forwarded(&forwarded, target).await;
    }

    /// Forward an in-dialog request (BYE, CANCEL, ACK) without touching
    /// its Request-URI.
    async fn forward_in_dialog(&self, msg: &SipMessage, target: SocketAddr) {
        let mut forwarded = msg.clone();
        forwarded.prepend_via(&self.local_via(target));
        self.send_forwarded(&forwarded, target).await;
    }

    async fn send_forwarded(&self, msg: &SipMessage, target: SocketAddr) {
        match self.socket.send_to(&msg.to_bytes(), target).await {
            Ok(_) => {
                ProxyStats::bump(&self.state.proxy_stats.requests_forwarded);
            }
            Err(e) => {
                warn!("Failed to forward request to {}: {}", target, e);
            }
        }
    }

    /// Via value naming the address this proxy is reachable at from the
    /// target's direction.
    fn local_via(&self, target: SocketAddr) -> String {
        let local_ip = match target {
            SocketAddr::V4(v4) => {
                discover_source_ip(*v4.ip()).unwrap_or(Ipv4Addr::UNSPECIFIED)
            }
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        format!(
            "SIP/2.0/UDP {}:{};branch={}",
            local_ip,
            self.listen_port,
            sip::generate_branch()
        )
    }

    async fn reply(&self, code: u16, reason: &str, request: &SipMessage, dst: SocketAddr) {
        if code >= 400 {
            ProxyStats::bump(&self.state.proxy_stats.rejects);
        }
        let response = SipMessage::new_response(code, reason, request);
        self.send_response(&response, dst).await;
    }

    async fn send_response(&self, response: &SipMessage, dst: SocketAddr) {
        if let Err(e) = self.socket.send_to(&response.to_bytes(), dst).await {
            warn!("Failed to send SIP response to {}: {}", dst, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::utils::StaticResolver;
    use std::time::Duration;

    struct Fixture {
        proxy: Arc<SipProxy>,
        caller: UdpSocket,
        callee: UdpSocket,
        proxy_addr: SocketAddr,
        _shutdown_tx: watch::Sender<bool>,
    }

    /// Proxy on an ephemeral loopback port, a caller socket, and a
    /// callee socket that `1234.local.mesh` resolves to.
    async fn fixture() -> Fixture {
        let callee = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let callee_port = callee.local_addr().unwrap().port();

        let mut config = AgentConfig::default_config();
        config.sip.listen_port = 0;

        let state = SharedState::new(&config);
        let queue = Arc::new(ResponseQueue::new());
        let resolver =
            Arc::new(StaticResolver::new().with("1234", Ipv4Addr::LOCALHOST));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = socket.local_addr().unwrap();
        let proxy = Arc::new(SipProxy {
            listen_port: proxy_addr.port(),
            max_message_bytes: config.sip.max_message_bytes,
            register_expires: config.sip.register_expires,
            state,
            socket: Arc::new(socket),
            queue,
            resolver,
            callee_port,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&proxy).run(shutdown_rx));

        let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Fixture {
            proxy,
            caller,
            callee,
            proxy_addr,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        String::from_utf8_lossy(&buf[..len]).to_string()
    }

    fn register(user: &str, expires: u32) -> String {
        format!(
            "REGISTER sip:local.mesh SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKreg{user}\r\n\
             From: \"Test Phone\" <sip:{user}@127.0.0.1>;tag=regtag\r\n\
             To: <sip:{user}@local.mesh>\r\n\
             Call-ID: reg-{user}@127.0.0.1\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <sip:{user}@127.0.0.1:5060>\r\n\
             Expires: {expires}\r\n\
             Content-Length: 0\r\n\r\n"
        )
    }

    fn invite(callee: &str, call_id: &str) -> String {
        format!(
            "INVITE sip:{callee}@local.mesh SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinv{call_id}\r\n\
             From: <sip:1000@127.0.0.1>;tag=callertag\r\n\
             To: <sip:{callee}@local.mesh>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 2 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: 4\r\n\r\nv=0\r\n"
        )
    }

    #[tokio::test]
    async fn test_registration_and_lookup() {
        let f = fixture().await;

        f.caller
            .send_to(register("1234", 3600).as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        let response = recv_text(&f.caller).await;
        assert!(response.starts_with("SIP/2.0 200 OK"));
        assert!(response.contains("Expires: 3600"));

        f.caller
            .send_to(invite("1234", "call-1").as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        let trying = recv_text(&f.caller).await;
        assert!(trying.starts_with("SIP/2.0 100 Trying"));

        let forwarded = recv_text(&f.callee).await;
        assert!(forwarded.starts_with("INVITE sip:1234@127.0.0.1:"));
        // Our Via sits on top of the caller's.
        let vias: Vec<&str> = forwarded
            .lines()
            .filter(|l| l.starts_with("Via:"))
            .collect();
        assert_eq!(vias.len(), 2);
        assert!(forwarded.ends_with("v=0\r\n"));

        let session = f.proxy.state.calls.get("call-1").await.unwrap();
        assert_eq!(session.state, CallState::InviteSent);
        assert_eq!(session.from_tag.as_deref(), Some("callertag"));
    }

    #[tokio::test]
    async fn test_register_expires_zero_deactivates() {
        let f = fixture().await;

        f.caller
            .send_to(register("1234", 3600).as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        recv_text(&f.caller).await;
        f.caller
            .send_to(register("1234", 0).as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        recv_text(&f.caller).await;

        let user = f.proxy.state.users.get("1234").await.unwrap();
        assert!(!user.active);

        // INVITE to the deactivated user yields exactly one 404.
        f.caller
            .send_to(invite("1234", "call-x").as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        let response = recv_text(&f.caller).await;
        assert!(response.starts_with("SIP/2.0 404 Not Found"));
        assert!(f.proxy.state.calls.get("call-x").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_callee_gets_404_no_session() {
        let f = fixture().await;
        f.caller
            .send_to(invite("9999", "call-404").as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        let response = recv_text(&f.caller).await;
        assert!(response.starts_with("SIP/2.0 404 Not Found"));
        assert_eq!(f.proxy.state.calls.len().await, 0);
    }

    #[tokio::test]
    async fn test_dialog_teardown() {
        let f = fixture().await;

        f.caller
            .send_to(register("1234", 3600).as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        recv_text(&f.caller).await;
        f.caller
            .send_to(invite("1234", "call-bye").as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        recv_text(&f.caller).await; // 100 Trying
        recv_text(&f.callee).await; // forwarded INVITE

        // Callee answers; the 200 is routed back and the session
        // transitions to established.
        let ok = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinvcall-bye\r\n\
            From: <sip:1000@127.0.0.1>;tag=callertag\r\n\
            To: <sip:1234@local.mesh>;tag=calleetag\r\n\
            Call-ID: call-bye\r\n\
            CSeq: 2 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        f.callee.send_to(ok.as_bytes(), f.proxy_addr).await.unwrap();
        let routed = recv_text(&f.caller).await;
        assert!(routed.starts_with("SIP/2.0 200 OK"));
        let session = f.proxy.state.calls.get("call-bye").await.unwrap();
        assert_eq!(session.state, CallState::Established);
        assert_eq!(session.to_tag.as_deref(), Some("calleetag"));

        // BYE from the caller: forwarded to callee, 200 back, session freed.
        let bye = "BYE sip:1234@127.0.0.1 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKbye1\r\n\
            From: <sip:1000@127.0.0.1>;tag=callertag\r\n\
            To: <sip:1234@local.mesh>;tag=calleetag\r\n\
            Call-ID: call-bye\r\n\
            CSeq: 3 BYE\r\n\
            Content-Length: 0\r\n\r\n";
        f.caller.send_to(bye.as_bytes(), f.proxy_addr).await.unwrap();
        let forwarded_bye = recv_text(&f.callee).await;
        assert!(forwarded_bye.starts_with("BYE sip:1234@127.0.0.1 SIP/2.0"));
        let ok_to_caller = recv_text(&f.caller).await;
        assert!(ok_to_caller.starts_with("SIP/2.0 200 OK"));
        assert!(f.proxy.state.calls.get("call-bye").await.is_none());
    }

    #[tokio::test]
    async fn test_bye_without_session_481() {
        let f = fixture().await;
        let bye = "BYE sip:1234@127.0.0.1 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKstray\r\n\
            From: <sip:1000@127.0.0.1>;tag=t\r\n\
            To: <sip:1234@local.mesh>\r\n\
            Call-ID: no-such-call\r\n\
            CSeq: 1 BYE\r\n\r\n";
        f.caller.send_to(bye.as_bytes(), f.proxy_addr).await.unwrap();
        let response = recv_text(&f.caller).await;
        assert!(response.starts_with("SIP/2.0 481"));
    }

    #[tokio::test]
    async fn test_options_lists_methods() {
        let f = fixture().await;
        let options = "OPTIONS sip:proxy@local.mesh SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKopt\r\n\
            From: <sip:1000@127.0.0.1>;tag=t\r\n\
            To: <sip:proxy@local.mesh>\r\n\
            Call-ID: opt-1\r\n\
            CSeq: 1 OPTIONS\r\n\r\n";
        f.caller
            .send_to(options.as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        let response = recv_text(&f.caller).await;
        assert!(response.starts_with("SIP/2.0 200 OK"));
        assert!(response.contains("Allow: REGISTER, INVITE, ACK, BYE, CANCEL, OPTIONS"));
    }

    #[tokio::test]
    async fn test_unknown_method_501() {
        let f = fixture().await;
        let subscribe = "SUBSCRIBE sip:1234@local.mesh SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKsub\r\n\
            From: <sip:1000@127.0.0.1>;tag=t\r\n\
            To: <sip:1234@local.mesh>\r\n\
            Call-ID: sub-1\r\n\
            CSeq: 1 SUBSCRIBE\r\n\r\n";
        f.caller
            .send_to(subscribe.as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        let response = recv_text(&f.caller).await;
        assert!(response.starts_with("SIP/2.0 501 Not Implemented"));
    }

    #[tokio::test]
    async fn test_oversize_datagram_dropped() {
        let f = fixture().await;
        let mut big = register("1234", 3600);
        big.push_str(&"x".repeat(3000));
        f.caller.send_to(big.as_bytes(), f.proxy_addr).await.unwrap();

        // No reply arrives; the counter moves instead.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            ProxyStats::read(&f.proxy.state.proxy_stats.oversize_dropped),
            1
        );
        let mut buf = [0u8; 64];
        let got =
            tokio::time::timeout(Duration::from_millis(200), f.caller.recv_from(&mut buf)).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_monitor_signature_demuxed() {
        let f = fixture().await;
        let probe_response = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKq\r\n\
            From: \"Quality Probe\" <sip:test@127.0.0.1>;tag=q1\r\n\
            To: <sip:1234@local.mesh>;tag=p1\r\n\
            Call-ID: probe-1\r\n\
            CSeq: 1 OPTIONS\r\n\r\n";
        f.caller
            .send_to(probe_response.as_bytes(), f.proxy_addr)
            .await
            .unwrap();

        let queued = f.proxy.queue.pop_timeout(Duration::from_secs(2)).await;
        let queued = queued.expect("monitor datagram should be queued");
        assert_eq!(queued, probe_response.as_bytes());

        // A regular message is not queued.
        f.caller
            .send_to(register("1234", 3600).as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        recv_text(&f.caller).await;
        assert!(f
            .proxy
            .queue
            .pop_timeout(Duration::from_millis(100))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_session_capacity_503() {
        let f = fixture().await;
        f.caller
            .send_to(register("1234", 3600).as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        recv_text(&f.caller).await;

        // Exhaust the table out-of-band.
        for i in 0..f.proxy.state.calls.len().await.max(32) {
            let _ = f
                .proxy
                .state
                .calls
                .create(
                    &format!("filler-{}", i),
                    f.proxy_addr,
                    f.proxy_addr,
                    None,
                )
                .await;
        }

        f.caller
            .send_to(invite("1234", "call-full").as_bytes(), f.proxy_addr)
            .await
            .unwrap();
        let response = recv_text(&f.caller).await;
        assert!(response.starts_with("SIP/2.0 503"));
    }
}
