//! Mesh probe wire format
//!
//! A probe is a single fixed-size UDP packet that carries its own return
//! address. Mesh routing is frequently asymmetric and nodes have several
//! local interfaces, so the responder must not trust the datagram's
//! apparent source: it echoes the packet verbatim to the endpoint named
//! in the payload.
//!
//! Layout (network byte order):
//!
//! ```text
//! u32  sequence
//! u32  timestamp_sec
//! u32  timestamp_usec
//! [64] src_node      NUL-padded node name
//! [16] return_ip     NUL-padded dotted quad
//! u16  return_port
//! ```

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// NUL-padded node-name field width; names longer than 63 bytes are truncated.
pub const SRC_NODE_LEN: usize = 64;
/// NUL-padded dotted-quad field width.
pub const RETURN_IP_LEN: usize = 16;
/// Total packet size. The responder discards any other payload size.
pub const PROBE_PACKET_SIZE: usize = 4 + 4 + 4 + SRC_NODE_LEN + RETURN_IP_LEN + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePacket {
    pub sequence: u32,
    pub timestamp_sec: u32,
    pub timestamp_usec: u32,
    pub src_node: String,
    pub return_ip: Ipv4Addr,
    pub return_port: u16,
}

impl ProbePacket {
    /// Build a probe stamped with the current wall clock.
    pub fn new(sequence: u32, src_node: &str, return_ip: Ipv4Addr, return_port: u16) -> Self {
        let (timestamp_sec, timestamp_usec) = now_timestamps();
        Self {
            sequence,
            timestamp_sec,
            timestamp_usec,
            src_node: truncate_node_name(src_node),
            return_ip,
            return_port,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PROBE_PACKET_SIZE);
        buf.put_u32(self.sequence);
        buf.put_u32(self.timestamp_sec);
        buf.put_u32(self.timestamp_usec);
        put_padded(&mut buf, self.src_node.as_bytes(), SRC_NODE_LEN);
        put_padded(&mut buf, self.return_ip.to_string().as_bytes(), RETURN_IP_LEN);
        buf.put_u16(self.return_port);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != PROBE_PACKET_SIZE {
            return Err(Error::probe(format!(
                "probe packet size {} != {}",
                data.len(),
                PROBE_PACKET_SIZE
            )));
        }
        let mut buf = data;
        let sequence = buf.get_u32();
        let timestamp_sec = buf.get_u32();
        let timestamp_usec = buf.get_u32();
        let src_node = take_padded(&mut buf, SRC_NODE_LEN)?;
        let return_ip_text = take_padded(&mut buf, RETURN_IP_LEN)?;
        let return_ip: Ipv4Addr = return_ip_text
            .parse()
            .map_err(|_| Error::probe(format!("bad return_ip: {:?}", return_ip_text)))?;
        let return_port = buf.get_u16();
        Ok(Self {
            sequence,
            timestamp_sec,
            timestamp_usec,
            src_node,
            return_ip,
            return_port,
        })
    }

    /// RTT in milliseconds between this packet's embedded send stamp and
    /// `(recv_sec, recv_usec)`.
    pub fn rtt_ms_to(&self, recv_sec: u32, recv_usec: u32) -> f64 {
        let sent = self.timestamp_sec as f64 * 1000.0 + self.timestamp_usec as f64 / 1000.0;
        let recv = recv_sec as f64 * 1000.0 + recv_usec as f64 / 1000.0;
        recv - sent
    }
}

/// Current wall clock as (seconds, microseconds), the probe stamp format.
pub fn now_timestamps() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() as u32, now.subsec_micros())
}

fn truncate_node_name(name: &str) -> String {
    // Leave room for the NUL terminator the padded field implies.
    let mut out = String::new();
    for c in name.chars() {
        if out.len() + c.len_utf8() > SRC_NODE_LEN - 1 {
            break;
        }
        out.push(c);
    }
    out
}

fn put_padded(buf: &mut BytesMut, data: &[u8], width: usize) {
    let take = data.len().min(width - 1);
    buf.put_slice(&data[..take]);
    buf.put_bytes(0, width - take);
}

fn take_padded(buf: &mut &[u8], width: usize) -> Result<String> {
    let field = &buf[..width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    let text = std::str::from_utf8(&field[..end])
        .map_err(|_| Error::probe("non-UTF-8 text field in probe packet"))?
        .to_string();
    buf.advance(width);
    Ok(text)
}
