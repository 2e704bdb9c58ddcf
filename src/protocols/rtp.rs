//! Minimal RTP/RTCP support for the phone media test
//!
//! The quality monitor's optional media test sends a short PCMU burst to
//! an auto-answering phone and measures what comes back. Only the pieces
//! that test needs live here: an RTP packet codec, receiver-side RFC 3550
//! statistics, and an RTCP Sender Report encoder.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// PCMU payload type and clock.
pub const PAYLOAD_TYPE_PCMU: u8 = 0;
pub const PCMU_CLOCK_HZ: u32 = 8000;
/// Samples per packet at ptime 40 ms.
pub const PCMU_SAMPLES_PER_PACKET: u32 = PCMU_CLOCK_HZ / 25;
/// mu-law encoded silence.
pub const PCMU_SILENCE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.payload.len());
        // V=2, no padding, no extension, no CSRCs.
        buf.put_u8(0x80);
        buf.put_u8((if self.marker { 0x80 } else { 0 }) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::rtp("RTP packet too short"));
        }
        let first = data.get_u8();
        if (first >> 6) != 2 {
            return Err(Error::rtp("unsupported RTP version"));
        }
        let padding = first & 0x20 != 0;
        let extension = first & 0x10 != 0;
        let csrc_count = (first & 0x0F) as usize;
        let second = data.get_u8();
        let marker = second & 0x80 != 0;
        let payload_type = second & 0x7F;
        let sequence = data.get_u16();
        let timestamp = data.get_u32();
        let ssrc = data.get_u32();

        if data.remaining() < csrc_count * 4 {
            return Err(Error::rtp("truncated CSRC list"));
        }
        data.advance(csrc_count * 4);

        if extension {
            if data.remaining() < 4 {
                return Err(Error::rtp("truncated extension header"));
            }
            let _profile = data.get_u16();
            let words = data.get_u16() as usize * 4;
            if data.remaining() < words {
                return Err(Error::rtp("truncated extension body"));
            }
            data.advance(words);
        }

        let payload = if padding && !data.is_empty() {
            let pad = data[data.len() - 1] as usize;
            if pad == 0 || pad > data.len() {
                return Err(Error::rtp("bad padding length"));
            }
            data.slice(..data.len() - pad)
        } else {
            data
        };

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload,
        })
    }
}

/// A 40 ms PCMU silence payload.
pub fn pcmu_silence_payload() -> Bytes {
    Bytes::from(vec![PCMU_SILENCE; PCMU_SAMPLES_PER_PACKET as usize])
}

/// Receiver-side stream statistics per RFC 3550: interarrival jitter via
/// the 1/16 low-pass filter, loss from sequence-number gaps.
#[derive(Debug)]
pub struct RtpReceiverStats {
    packets_received: u64,
    packets_lost: u32,
    jitter_ms: f64,
    last_sequence: u16,
    last_timestamp: u32,
    last_arrival: Instant,
}

impl RtpReceiverStats {
    pub fn new() -> Self {
        Self {
            packets_received: 0,
            packets_lost: 0,
            jitter_ms: 0.0,
            last_sequence: 0,
            last_timestamp: 0,
            last_arrival: Instant::now(),
        }
    }

    pub fn record(&mut self, packet: &RtpPacket) {
        let now = Instant::now();
        if self.packets_received > 0 {
            let expected = self.last_sequence.wrapping_add(1);
            if packet.sequence != expected {
                let gap = packet.sequence.wrapping_sub(expected);
                // A huge gap is a reorder/restart, not loss.
                if gap < 0x8000 {
                    self.packets_lost += gap as u32;
                }
            }

            let arrival_ms = now.duration_since(self.last_arrival).as_secs_f64() * 1000.0;
            let ts_delta = packet.timestamp.wrapping_sub(self.last_timestamp) as f64;
            let expected_ms = ts_delta * 1000.0 / PCMU_CLOCK_HZ as f64;
            let d = arrival_ms - expected_ms;
            self.jitter_ms += (d.abs() - self.jitter_ms) / 16.0;
        }
        self.packets_received += 1;
        self.last_sequence = packet.sequence;
        self.last_timestamp = packet.timestamp;
        self.last_arrival = now;
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms
    }

    pub fn loss_pct(&self) -> f64 {
        let total = self.packets_received + self.packets_lost as u64;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64 * 100.0
        }
    }
}

impl Default for RtpReceiverStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an RTCP Sender Report (RFC 3550 section 6.4.1) with no report
/// blocks, which is all an echo-style media probe needs to emit.
pub fn encode_sender_report(
    ssrc: u32,
    rtp_timestamp: u32,
    packets_sent: u32,
    octets_sent: u32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(28);
    // V=2, no padding, RC=0; PT=200 (SR); length 6 32-bit words minus one.
    buf.put_u8(0x80);
    buf.put_u8(200);
    buf.put_u16(6);
    buf.put_u32(ssrc);
    let (ntp_sec, ntp_frac) = ntp_now();
    buf.put_u32(ntp_sec);
    buf.put_u32(ntp_frac);
    buf.put_u32(rtp_timestamp);
    buf.put_u32(packets_sent);
    buf.put_u32(octets_sent);
    buf.freeze()
}

/// Current time as an NTP timestamp (seconds since 1900, 32.32 fixed point).
fn ntp_now() -> (u32, u32) {
    const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let sec = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
    let frac = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (sec, frac as u32)
}
