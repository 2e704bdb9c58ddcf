//! VoIP phone quality monitor
//!
//! Mesh phones only answer SIP arriving at the SIP port from the SIP
//! port, so probe calls go out through the proxy's own socket. Replies
//! come back through the proxy's receive loop, which recognises the
//! monitor's From signature and hands the raw datagram over via the
//! bounded response queue.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::{PhoneMonitorConfig, SipConfig};
use crate::core::state::{unix_now, QualityRecord, QualityStatus, SharedState};
use crate::protocols::rtp::{
    encode_sender_report, pcmu_silence_payload, RtpPacket, RtpReceiverStats,
    PAYLOAD_TYPE_PCMU, PCMU_SAMPLES_PER_PACKET,
};
use crate::protocols::sip::{self, SipMessage, SipMethod};
use crate::services::health::Heartbeat;
use crate::utils::{discover_source_ip, sleep_or_shutdown, write_atomic, MeshResolver};
use crate::Result;

/// Response queue bounds.
pub const RESPONSE_QUEUE_CAPACITY: usize = 10;
pub const RESPONSE_QUEUE_MAX_ENTRY: usize = 4096;

/// Bounded FIFO from the SIP receive loop to the monitor. The producer
/// never blocks: overflow evicts the oldest entry with a warning.
pub struct ResponseQueue {
    inner: std::sync::Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, data: &[u8]) {
        if data.len() > RESPONSE_QUEUE_MAX_ENTRY {
            warn!(
                "Discarding {}-byte monitor datagram above the {} queue entry limit",
                data.len(),
                RESPONSE_QUEUE_MAX_ENTRY
            );
            return;
        }
        {
            let mut queue = self.inner.lock().expect("response queue poisoned");
            if queue.len() >= RESPONSE_QUEUE_CAPACITY {
                queue.pop_front();
                warn!("Response queue overflow; oldest entry dropped");
            }
            queue.push_back(data.to_vec());
        }
        self.notify.notify_one();
    }

    /// Dequeue with a timeout, condition-variable style.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self
                .inner
                .lock()
                .expect("response queue poisoned")
                .pop_front()
            {
                return Some(entry);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("response queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Document published to `phone_quality.json` after each cycle.
#[derive(Serialize)]
struct QualityDocument<'a> {
    schema: &'static str,
    generated_at: u64,
    phones: Vec<&'a QualityRecord>,
}

pub struct PhoneMonitor {
    config: PhoneMonitorConfig,
    sip_port: u16,
    state: Arc<SharedState>,
    socket: Arc<UdpSocket>,
    queue: Arc<ResponseQueue>,
    resolver: Arc<dyn MeshResolver>,
    heartbeat: Heartbeat,
}

impl PhoneMonitor {
    pub fn new(
        config: PhoneMonitorConfig,
        sip_config: &SipConfig,
        state: Arc<SharedState>,
        socket: Arc<UdpSocket>,
        queue: Arc<ResponseQueue>,
        resolver: Arc<dyn MeshResolver>,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            config,
            sip_port: sip_config.listen_port,
            state,
            socket,
            queue,
            resolver,
            heartbeat,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Phone quality monitor started (media test {})",
            if self.config.media_test { "on" } else { "off" }
        );
        loop {
            self.heartbeat.beat();
            let users = self.state.users.active_users().await;
            for user in users {
                if *shutdown.borrow() {
                    return;
                }
                self.heartbeat.beat();
                self.test_phone(&user.user_id).await;
                if sleep_or_shutdown(
                    Duration::from_secs(self.config.cycle_delay_sec),
                    &mut shutdown,
                )
                .await
                {
                    return;
                }
            }
            if let Err(e) = self.publish().await {
                warn!("Failed to publish phone quality document: {}", e);
            }
            if sleep_or_shutdown(Duration::from_secs(self.config.interval_s), &mut shutdown).await
            {
                info!("Phone quality monitor shutting down");
                return;
            }
        }
    }

    /// Probe one phone and overwrite its quality record.
    pub async fn test_phone(&self, user_id: &str) {
        let record = match self.resolver.resolve(user_id).await {
            Ok(ip) => self.probe_resolved(user_id, ip).await,
            Err(_) => {
                debug!("Quality test skipped, {} does not resolve", user_id);
                QualityRecord {
                    phone_number: user_id.to_string(),
                    phone_ip: String::new(),
                    last_test_time: unix_now(),
                    status: QualityStatus::ResolveFailed,
                    sip_rtt_ms: None,
                    media_jitter_ms: None,
                    media_loss_pct: None,
                }
            }
        };
        self.state.quality.insert(user_id.to_string(), record);
    }

    async fn probe_resolved(&self, user_id: &str, ip: Ipv4Addr) -> QualityRecord {
        let target = SocketAddr::new(IpAddr::V4(ip), self.sip_port);
        let local_ip = discover_source_ip(ip).unwrap_or(Ipv4Addr::UNSPECIFIED);

        let call_id = sip::generate_call_id(&local_ip.to_string());
        let request = self.build_probe(SipMethod::Options, user_id, ip, local_ip, &call_id, 1);

        let mut record = QualityRecord {
            phone_number: user_id.to_string(),
            phone_ip: ip.to_string(),
            last_test_time: unix_now(),
            status: QualityStatus::SipTimeout,
            sip_rtt_ms: None,
            media_jitter_ms: None,
            media_loss_pct: None,
        };

        let sent_at = Instant::now();
        if let Err(e) = self.socket.send_to(&request.to_bytes(), target).await {
            warn!("Quality probe to {} failed to send: {}", target, e);
            record.status = QualityStatus::SipError;
            return record;
        }

        match self
            .await_final_response(&call_id, Duration::from_millis(self.config.invite_timeout_ms))
            .await
        {
            Some(code) => {
                record.sip_rtt_ms = Some(sent_at.elapsed().as_secs_f64() * 1000.0);
                record.status = classify_status(code);
            }
            None => {
                debug!("Quality probe to {} timed out", user_id);
                record.status = QualityStatus::SipTimeout;
            }
        }

        if record.status == QualityStatus::Success && self.config.media_test {
            match self.media_test(user_id, ip, local_ip).await {
                Ok((jitter_ms, loss_pct)) => {
                    record.media_jitter_ms = Some(jitter_ms);
                    record.media_loss_pct = Some(loss_pct);
                }
                Err(e) => {
                    debug!("Media test against {} failed: {}", user_id, e);
                }
            }
        }

        record
    }

    /// Drain the response queue until a final (>= 200) response for
    /// `call_id` arrives or the timeout lapses. Stale entries for other
    /// probes are discarded.
    async fn await_final_response(&self, call_id: &str, timeout: Duration) -> Option<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let raw = self.queue.pop_timeout(remaining).await?;
            let Ok(msg) = SipMessage::parse(&raw) else {
                continue;
            };
            if msg.call_id() != Some(call_id) {
                continue;
            }
            match msg.status_code() {
                Some(code) if code >= 200 => return Some(code),
                _ => continue,
            }
        }
    }

    fn build_probe(
        &self,
        method: SipMethod,
        user_id: &str,
        ip: Ipv4Addr,
        local_ip: Ipv4Addr,
        call_id: &str,
        cseq: u32,
    ) -> SipMessage {
        let method_token = method.as_str().to_string();
        let mut msg = SipMessage::new_request(method, &format!("sip:{}@{}", user_id, ip));
        msg.push_header(
            "Via",
            &format!(
                "SIP/2.0/UDP {}:{};branch={}",
                local_ip,
                self.sip_port,
                sip::generate_branch()
            ),
        );
        msg.push_header(
            "From",
            &format!(
                "\"Quality Probe\" <sip:test@{}>;tag={}",
                local_ip,
                sip::generate_tag()
            ),
        );
        msg.push_header("To", &format!("<sip:{}@{}>", user_id, ip));
        msg.push_header("Call-ID", call_id);
        msg.push_header("CSeq", &format!("{} {}", cseq, method_token));
        msg.push_header("Max-Forwards", "70");
        msg.push_header(
            "Contact",
            &format!("<sip:test@{}:{}>", local_ip, self.sip_port),
        );
        msg
    }

    /// Full INVITE/RTP/RTCP media test: place an auto-answered call,
    /// push a 1.2 s PCMU burst at it, and measure what the phone sends
    /// back.
    async fn media_test(
        &self,
        user_id: &str,
        ip: Ipv4Addr,
        local_ip: Ipv4Addr,
    ) -> Result<(f64, f64)> {
        let rtp_socket = UdpSocket::bind((local_ip, 0)).await?;
        let rtp_port = rtp_socket.local_addr()?.port();

        let call_id = sip::generate_call_id(&local_ip.to_string());
        let mut invite = self.build_probe(SipMethod::Invite, user_id, ip, local_ip, &call_id, 1);
        invite.push_header("Call-Info", "<sip:broadsoft.com>;answer-after=0");
        invite.push_header("Alert-Info", "info=alert-autoanswer");
        invite.push_header("Content-Type", "application/sdp");
        invite.body = build_sdp_offer(local_ip, rtp_port).into_bytes();

        let target = SocketAddr::new(IpAddr::V4(ip), self.sip_port);
        self.socket.send_to(&invite.to_bytes(), target).await?;

        let answer = self
            .await_answer(&call_id, Duration::from_millis(self.config.invite_timeout_ms))
            .await
            .ok_or_else(|| crate::Error::timeout("media-test INVITE unanswered"))?;
        let (code, body) = answer;
        if !(200..300).contains(&code) {
            return Err(crate::Error::sip(format!(
                "media-test INVITE rejected with {}",
                code
            )));
        }
        let (remote_ip, remote_port) = parse_sdp_media_target(&body)
            .ok_or_else(|| crate::Error::sip("answer SDP carries no usable media line"))?;

        let ack = self.build_probe(SipMethod::Ack, user_id, ip, local_ip, &call_id, 1);
        self.socket.send_to(&ack.to_bytes(), target).await?;

        let metrics = run_media_burst(&rtp_socket, remote_ip, remote_port).await?;

        let bye = self.build_probe(SipMethod::Bye, user_id, ip, local_ip, &call_id, 2);
        self.socket.send_to(&bye.to_bytes(), target).await?;
        // The 200 to our BYE is drained as a stale entry by the next probe.

        Ok(metrics)
    }

    /// Like [`await_final_response`] but keeps the answer body for the
    /// SDP.
    async fn await_answer(&self, call_id: &str, timeout: Duration) -> Option<(u16, String)> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let raw = self.queue.pop_timeout(remaining).await?;
            let Ok(msg) = SipMessage::parse(&raw) else {
                continue;
            };
            if msg.call_id() != Some(call_id) {
                continue;
            }
            match msg.status_code() {
                Some(code) if code >= 200 => {
                    return Some((code, String::from_utf8_lossy(&msg.body).to_string()));
                }
                _ => continue,
            }
        }
    }

    async fn publish(&self) -> Result<()> {
        let records: Vec<QualityRecord> = self
            .state
            .quality
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let document = QualityDocument {
            schema: "meshmon.v1",
            generated_at: unix_now(),
            phones: records.iter().collect(),
        };
        let json = serde_json::to_vec_pretty(&document)?;
        write_atomic(&self.config.quality_json_path, &json)?;
        Ok(())
    }
}

fn classify_status(code: u16) -> QualityStatus {
    match code {
        200..=299 => QualityStatus::Success,
        486 => QualityStatus::Busy,
        _ => QualityStatus::SipError,
    }
}

fn build_sdp_offer(local_ip: Ipv4Addr, rtp_port: u16) -> String {
    format!(
        "v=0\r\n\
         o=test {0} {0} IN IP4 {1}\r\n\
         s=quality probe\r\n\
         c=IN IP4 {1}\r\n\
         t=0 0\r\n\
         m=audio {2} RTP/AVP 0\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=ptime:40\r\n",
        unix_now(),
        local_ip,
        rtp_port
    )
}

/// Pull the connection address and audio port out of an SDP answer.
fn parse_sdp_media_target(sdp: &str) -> Option<(Ipv4Addr, u16)> {
    let mut ip = None;
    let mut port = None;
    for line in sdp.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            ip = rest.split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            port = rest.split_whitespace().next()?.parse().ok();
        }
    }
    Some((ip?, port?))
}

/// 1.2 s of PCMU at ptime 40 ms toward the phone, RTCP SRs at the start
/// and at the one-second mark, receiver stats from whatever comes back.
async fn run_media_burst(
    rtp_socket: &UdpSocket,
    remote_ip: Ipv4Addr,
    remote_port: u16,
) -> Result<(f64, f64)> {
    const BURST_PACKETS: u32 = 30; // 1.2 s / 40 ms
    const PTIME: Duration = Duration::from_millis(40);

    let rtp_target = SocketAddr::new(IpAddr::V4(remote_ip), remote_port);
    let rtcp_target = SocketAddr::new(IpAddr::V4(remote_ip), remote_port.saturating_add(1));
    let rtcp_socket = UdpSocket::bind((rtp_socket.local_addr()?.ip(), 0)).await?;

    let ssrc: u32 = rand::random();
    let mut stats = RtpReceiverStats::new();
    let mut recv_buf = [0u8; 2048];
    let mut octets_sent: u32 = 0;
    let mut sr_at_second_sent = false;
    let start = Instant::now();

    for i in 0..BURST_PACKETS {
        let timestamp = i * PCMU_SAMPLES_PER_PACKET;
        let packet = RtpPacket::new(
            PAYLOAD_TYPE_PCMU,
            i as u16,
            timestamp,
            ssrc,
            pcmu_silence_payload(),
        );
        let bytes = packet.encode();
        octets_sent += (bytes.len() - 12) as u32;
        rtp_socket.send_to(&bytes, rtp_target).await?;

        if i == 0 || (!sr_at_second_sent && start.elapsed() >= Duration::from_secs(1)) {
            let sr = encode_sender_report(ssrc, timestamp, i + 1, octets_sent);
            let _ = rtcp_socket.send_to(&sr, rtcp_target).await;
            sr_at_second_sent = i != 0;
        }

        // Listen for returning media until the next packet is due.
        let slot_end = Instant::now() + PTIME;
        while let Some(remaining) = slot_end.checked_duration_since(Instant::now()) {
            match tokio::time::timeout(remaining, rtp_socket.recv_from(&mut recv_buf)).await {
                Ok(Ok((len, _))) => {
                    if let Ok(packet) =
                        RtpPacket::decode(bytes::Bytes::copy_from_slice(&recv_buf[..len]))
                    {
                        stats.record(&packet);
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }

    Ok((stats.jitter_ms(), stats.loss_pct()))
}
