//! Mesh probe engine
//!
//! Two sockets, deliberately: a long-lived sender socket on an ephemeral
//! port whose bound port is advertised as the probe return port, and a
//! fixed-port responder socket that echoes probes verbatim to the return
//! endpoint embedded in the payload. One socket cannot do both jobs in
//! an asymmetric-routing mesh, where the responder's apparent source
//! address is not necessarily reachable from the sender.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::protocols::probe::{now_timestamps, ProbePacket, PROBE_PACKET_SIZE};
use crate::utils::discover_source_ip;
use crate::{Error, Result};

/// Fixed capacity of the pending-probe list.
pub const PENDING_CAPACITY: usize = 64;
/// Echo collection: up to this many reads of at most this long each.
pub const READ_ATTEMPTS: u32 = 50;
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// RTT samples outside [0, 10000) ms are clock skew, not measurements.
pub const MAX_RTT_MS: f64 = 10_000.0;
/// DSCP EF in the TOS byte.
const TOS_DSCP_EF: u32 = 0xB8;

/// An outstanding probe awaiting its echo.
#[derive(Debug, Clone)]
pub struct PendingProbe {
    pub sequence: u32,
    pub sent_at: Instant,
    pub dst_ip: Ipv4Addr,
}

/// Metrics computed for one destination after an echo window.
#[derive(Debug, Clone)]
pub struct ProbeMetrics {
    pub dst_ip: Ipv4Addr,
    pub expected: u32,
    pub received: u32,
    pub rtt_ms_avg: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
}

/// Bind a UDP socket, optionally marked DSCP EF for queueing priority on
/// the RF links.
fn bind_udp(port: u16, dscp_ef: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if dscp_ef {
        if let Err(e) = socket.set_tos(TOS_DSCP_EF) {
            warn!("Cannot set DSCP EF on probe socket: {}", e);
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

pub struct ProbeEngine {
    node_name: String,
    /// Port probes are addressed to on the remote node.
    target_port: u16,
    socket: Arc<UdpSocket>,
    pending: Mutex<Vec<PendingProbe>>,
    sequence: AtomicU32,
    read_attempts: u32,
    read_timeout: Duration,
}

impl ProbeEngine {
    pub fn new(node_name: &str, target_port: u16, dscp_ef: bool) -> Result<Self> {
        let socket = bind_udp(0, dscp_ef)
            .map_err(|e| Error::probe(format!("cannot create probe sender socket: {}", e)))?;
        Ok(Self {
            node_name: node_name.to_string(),
            target_port,
            socket: Arc::new(socket),
            pending: Mutex::new(Vec::new()),
            sequence: AtomicU32::new(0),
            read_attempts: READ_ATTEMPTS,
            read_timeout: READ_TIMEOUT,
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Send `count` probes toward `dst_ip` at `interval` spacing. Each
    /// carries the source address the kernel would route back over and
    /// this engine's bound port as the return endpoint. Returns how many
    /// probes were actually dispatched.
    pub async fn send_probes(
        &self,
        dst_ip: Ipv4Addr,
        count: u32,
        interval: Duration,
    ) -> Result<u32> {
        let return_ip = discover_source_ip(dst_ip)?;
        let return_port = self.local_port()?;
        let target = SocketAddr::new(IpAddr::V4(dst_ip), self.target_port);

        let mut sent = 0;
        for i in 0..count {
            // Reserve the pending slot first; the send happens outside
            // the lock.
            let sequence = {
                let mut pending = self.pending.lock().await;
                if pending.len() >= PENDING_CAPACITY {
                    warn!(
                        "Pending-probe list full; rejecting further probes for {}",
                        dst_ip
                    );
                    break;
                }
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                pending.push(PendingProbe {
                    sequence,
                    sent_at: Instant::now(),
                    dst_ip,
                });
                sequence
            };

            let packet = ProbePacket::new(sequence, &self.node_name, return_ip, return_port);
            // A failed send keeps its pending entry: it is loss.
            if let Err(e) = self.socket.send_to(&packet.encode(), target).await {
                warn!("Probe send to {} failed: {}", target, e);
            }
            sent += 1;

            if i + 1 < count {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(sent)
    }

    pub async fn pending_count(&self, dst_ip: Ipv4Addr) -> usize {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|p| p.dst_ip == dst_ip)
            .count()
    }

    /// Collect echoes for `dst_ip` and compute loss, mean RTT and mean
    /// consecutive RTT delta. All pending entries for the destination
    /// are purged afterwards, echoed or not.
    pub async fn calculate_metrics(&self, dst_ip: Ipv4Addr) -> ProbeMetrics {
        let expected = self.pending_count(dst_ip).await as u32;
        let mut rtts: Vec<f64> = Vec::new();
        let mut buf = [0u8; 1024];

        if expected > 0 {
            for _ in 0..self.read_attempts {
                if rtts.len() as u32 >= expected {
                    break;
                }
                let Ok(result) =
                    tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut buf)).await
                else {
                    continue;
                };
                let Ok((len, _src)) = result else { continue };
                if len != PROBE_PACKET_SIZE {
                    continue;
                }
                let Ok(packet) = ProbePacket::decode(&buf[..len]) else {
                    continue;
                };

                let matched = {
                    let mut pending = self.pending.lock().await;
                    match pending
                        .iter()
                        .position(|p| p.sequence == packet.sequence && p.dst_ip == dst_ip)
                    {
                        Some(index) => {
                            pending.swap_remove(index);
                            true
                        }
                        None => false,
                    }
                };
                if !matched {
                    debug!("Unmatched probe echo seq {} dropped", packet.sequence);
                    continue;
                }

                let (now_sec, now_usec) = now_timestamps();
                let rtt = packet.rtt_ms_to(now_sec, now_usec);
                if (0.0..MAX_RTT_MS).contains(&rtt) {
                    rtts.push(rtt);
                }
            }
        }

        // Stuck entries die here so the next burst starts clean.
        self.purge(dst_ip).await;

        let received = rtts.len() as u32;
        let loss_pct = if expected == 0 {
            0.0
        } else {
            100.0 * (1.0 - received as f64 / expected as f64)
        };
        let rtt_ms_avg = if rtts.is_empty() {
            0.0
        } else {
            rtts.iter().sum::<f64>() / rtts.len() as f64
        };
        let jitter_ms = if rtts.len() < 2 {
            0.0
        } else {
            rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (rtts.len() - 1) as f64
        };

        ProbeMetrics {
            dst_ip,
            expected,
            received,
            rtt_ms_avg,
            jitter_ms,
            loss_pct,
        }
    }

    async fn purge(&self, dst_ip: Ipv4Addr) {
        self.pending.lock().await.retain(|p| p.dst_ip != dst_ip);
    }
}

/// The echo side: a dedicated task on the fixed probe port.
pub struct ProbeResponder {
    socket: Arc<UdpSocket>,
}

impl ProbeResponder {
    /// Bind the responder socket. Failure is fatal to startup.
    pub fn bind(port: u16, dscp_ef: bool) -> Result<Self> {
        let socket = bind_udp(port, dscp_ef)
            .map_err(|e| Error::probe(format!("cannot bind probe responder: {}", e)))?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Probe responder listening on udp/{}",
            self.local_port().unwrap_or(0)
        );
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.echo(&buf[..len], src).await,
                        Err(e) => warn!("Probe responder receive error: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Probe responder shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Echo a well-sized probe verbatim to its embedded return endpoint,
    /// not to the datagram source.
    async fn echo(&self, data: &[u8], src: SocketAddr) {
        if data.len() != PROBE_PACKET_SIZE {
            debug!("Discarding {}-byte datagram from {}", data.len(), src);
            return;
        }
        let packet = match ProbePacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Discarding malformed probe from {}: {}", src, e);
                return;
            }
        };
        let return_addr = SocketAddr::new(IpAddr::V4(packet.return_ip), packet.return_port);
        if let Err(e) = self.socket.send_to(data, return_addr).await {
            warn!("Probe echo to {} failed: {}", return_addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_engine(target_port: u16) -> ProbeEngine {
        let mut engine = ProbeEngine::new("test-node", target_port, false).unwrap();
        engine.read_attempts = 10;
        engine.read_timeout = Duration::from_millis(50);
        engine
    }

    #[tokio::test]
    async fn test_probe_round_trip_zero_loss() {
        let responder = ProbeResponder::bind(0, false).unwrap();
        let responder_port = responder.local_port().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(responder.run(shutdown_rx));

        let engine = fast_engine(responder_port);
        let sent = engine
            .send_probes(Ipv4Addr::LOCALHOST, 10, Duration::from_millis(2))
            .await
            .unwrap();
        assert_eq!(sent, 10);
        assert_eq!(engine.pending_count(Ipv4Addr::LOCALHOST).await, 10);

        let metrics = engine.calculate_metrics(Ipv4Addr::LOCALHOST).await;
        assert_eq!(metrics.expected, 10);
        assert_eq!(metrics.received, 10);
        assert_eq!(metrics.loss_pct, 0.0);
        assert!(metrics.rtt_ms_avg >= 0.0 && metrics.rtt_ms_avg < MAX_RTT_MS);
        assert!(metrics.jitter_ms >= 0.0);
        // Pending entries are purged after computation.
        assert_eq!(engine.pending_count(Ipv4Addr::LOCALHOST).await, 0);

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_total_loss_is_reportable() {
        // Probes aimed at a bound-but-silent socket never come back.
        let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let engine = fast_engine(blackhole.local_addr().unwrap().port());

        engine
            .send_probes(Ipv4Addr::LOCALHOST, 5, Duration::from_millis(1))
            .await
            .unwrap();
        let metrics = engine.calculate_metrics(Ipv4Addr::LOCALHOST).await;
        assert_eq!(metrics.expected, 5);
        assert_eq!(metrics.received, 0);
        assert_eq!(metrics.loss_pct, 100.0);
        assert_eq!(metrics.rtt_ms_avg, 0.0);
        assert_eq!(engine.pending_count(Ipv4Addr::LOCALHOST).await, 0);
    }

    #[tokio::test]
    async fn test_pending_capacity_rejects_sends() {
        let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let engine = fast_engine(blackhole.local_addr().unwrap().port());

        let sent = engine
            .send_probes(
                Ipv4Addr::LOCALHOST,
                PENDING_CAPACITY as u32 + 10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(sent, PENDING_CAPACITY as u32);
    }

    #[tokio::test]
    async fn test_responder_echoes_to_embedded_return_address() {
        let responder = ProbeResponder::bind(0, false).unwrap();
        let responder_addr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), responder.local_port().unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(responder.run(shutdown_rx));

        // The return endpoint is a third socket, distinct from the sender.
        let return_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let return_port = return_socket.local_addr().unwrap().port();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let packet = ProbePacket::new(99, "asym-node", Ipv4Addr::LOCALHOST, return_port);
        let bytes = packet.encode();
        sender.send_to(&bytes, responder_addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(
            Duration::from_secs(2),
            return_socket.recv_from(&mut buf),
        )
        .await
        .expect("echo should arrive at the return address")
        .unwrap();
        // Byte-identical echo.
        assert_eq!(&buf[..len], &bytes[..]);

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_responder_discards_other_sizes() {
        let responder = ProbeResponder::bind(0, false).unwrap();
        let responder_addr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), responder.local_port().unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(responder.run(shutdown_rx));

        let return_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&[0u8; 10], responder_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let got = tokio::time::timeout(
            Duration::from_millis(200),
            return_socket.recv_from(&mut buf),
        )
        .await;
        assert!(got.is_err());

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_sequences_are_globally_monotone() {
        let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let engine = fast_engine(blackhole.local_addr().unwrap().port());
        engine
            .send_probes(Ipv4Addr::LOCALHOST, 3, Duration::ZERO)
            .await
            .unwrap();
        let pending = engine.pending.lock().await;
        let sequences: Vec<u32> = pending.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }
}
