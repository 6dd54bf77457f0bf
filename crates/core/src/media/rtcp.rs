//! RTCP sender-side packets (RFC 3550 §6).
//!
//! The output only ever acts as a single sender, so it never emits receiver
//! reports. Each destination keeps one cached SR+SDES compound and the SR
//! fields are refreshed in place before each transmission.

use crate::clock::ntp_now;
use crate::media::rtp::{self, RTP_HEADER_LEN};

/// Sender Report packet type.
pub const PT_SR: u8 = 200;
/// Source Description packet type.
pub const PT_SDES: u8 = 202;
/// Goodbye packet type.
pub const PT_BYE: u8 = 203;

/// SDES item: canonical end-point identifier.
pub const SDES_CNAME: u8 = 1;
/// SDES item: application name and version.
pub const SDES_TOOL: u8 = 6;

/// Length in bytes of a Sender Report without report blocks.
pub const SR_LEN: usize = 28;

/// Dynamic fields of a Sender Report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    /// Wall clock, NTP 32.32 fixed point.
    pub ntp: u64,
    /// RTP timestamp matching the last emitted packet.
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = 2 << 6;
        out[1] = PT_SR;
        // 7 words, minus one
        out[2..4].copy_from_slice(&6u16.to_be_bytes());
        out[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        out[8..16].copy_from_slice(&self.ntp.to_be_bytes());
        out[16..20].copy_from_slice(&self.rtp_timestamp.to_be_bytes());
        out[20..24].copy_from_slice(&self.packet_count.to_be_bytes());
        out[24..28].copy_from_slice(&self.octet_count.to_be_bytes());
    }
}

/// Cached SR + SDES compound packet.
#[derive(Debug, Clone)]
pub struct RtcpCompound {
    buf: Vec<u8>,
}

impl RtcpCompound {
    /// Build the compound for `ssrc`, with `cname` (the local address the
    /// RTP socket is bound to) and `tool` SDES items. Items longer than 255
    /// bytes are truncated.
    pub fn new(ssrc: u32, cname: &str, tool: &str) -> Self {
        let mut buf = vec![0u8; SR_LEN];
        SenderReport {
            ssrc,
            ..SenderReport::default()
        }
        .write_to(&mut buf);

        let sdes_start = buf.len();
        buf.extend_from_slice(&[(2 << 6) | 1, PT_SDES, 0, 0]);
        buf.extend_from_slice(&ssrc.to_be_bytes());
        push_item(&mut buf, SDES_CNAME, cname);
        push_item(&mut buf, SDES_TOOL, tool);
        // end of item list, then pad the chunk to 32 bits
        buf.push(0);
        while (buf.len() - sdes_start) % 4 != 0 {
            buf.push(0);
        }
        let words = ((buf.len() - sdes_start) / 4 - 1) as u16;
        buf[sdes_start + 2..sdes_start + 4].copy_from_slice(&words.to_be_bytes());

        Self { buf }
    }

    /// Total size of the compound in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Refresh the SR fields and return the packet to send.
    pub fn refresh(&mut self, report: &SenderReport) -> &[u8] {
        report.write_to(&mut self.buf[..SR_LEN]);
        &self.buf
    }

    /// Final report followed by a BYE for the same source.
    pub fn with_bye(&mut self, report: &SenderReport) -> Vec<u8> {
        let mut out = self.refresh(report).to_vec();
        out.extend_from_slice(&bye(report.ssrc));
        out
    }
}

fn push_item(buf: &mut Vec<u8>, kind: u8, text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(255);
    buf.push(kind);
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[..len]);
}

/// Per-destination reporting state: the cached compound plus the counters
/// it reports.
///
/// Reports are paced by a simple proportional trigger: once the RTP bytes
/// sent since the last report reach 80 times the compound size, the next
/// packet is followed by a report.
#[derive(Debug, Clone)]
pub struct ReportState {
    compound: RtcpCompound,
    ssrc: u32,
    packets: u32,
    octets: u32,
    last_timestamp: u32,
    counter: usize,
}

impl ReportState {
    pub fn new(ssrc: u32, cname: &str, tool: &str) -> Self {
        Self {
            compound: RtcpCompound::new(ssrc, cname, tool),
            ssrc,
            packets: 0,
            octets: 0,
            last_timestamp: 0,
            counter: 0,
        }
    }

    /// Account one transmitted RTP packet. Returns the SR+SDES compound
    /// when a report is due.
    pub fn on_sent(&mut self, packet: &[u8]) -> Option<&[u8]> {
        self.packets = self.packets.wrapping_add(1);
        self.octets = self
            .octets
            .wrapping_add(packet.len().saturating_sub(RTP_HEADER_LEN) as u32);
        if let Some(ts) = rtp::timestamp_of(packet) {
            self.last_timestamp = ts;
        }
        self.counter += packet.len();

        if self.counter / 80 < self.compound.len() {
            return None;
        }
        self.counter = 0;
        let report = self.report();
        Some(self.compound.refresh(&report))
    }

    /// Final SR+SDES+BYE compound.
    pub fn bye(&mut self) -> Vec<u8> {
        let report = self.report();
        self.compound.with_bye(&report)
    }

    pub fn packet_count(&self) -> u32 {
        self.packets
    }

    pub fn octet_count(&self) -> u32 {
        self.octets
    }

    fn report(&self) -> SenderReport {
        SenderReport {
            ssrc: self.ssrc,
            ntp: ntp_now(),
            rtp_timestamp: self.last_timestamp,
            packet_count: self.packets,
            octet_count: self.octets,
        }
    }
}

/// BYE packet for a single source, without reason text.
pub fn bye(ssrc: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = (2 << 6) | 1;
    out[1] = PT_BYE;
    out[2..4].copy_from_slice(&1u16.to_be_bytes());
    out[4..8].copy_from_slice(&ssrc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(buf: &[u8], at: usize) -> u32 {
        u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn sender_report_layout() {
        let mut rtcp = RtcpCompound::new(0x11223344, "192.0.2.1", "rtpcast");
        let pkt = rtcp
            .refresh(&SenderReport {
                ssrc: 0x11223344,
                ntp: 0x0102030405060708,
                rtp_timestamp: 90_000,
                packet_count: 7,
                octet_count: 9_212,
            })
            .to_vec();

        assert_eq!(&pkt[0..4], &[0x80, 200, 0, 6]);
        assert_eq!(word(&pkt, 4), 0x11223344);
        assert_eq!(&pkt[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(word(&pkt, 16), 90_000);
        assert_eq!(word(&pkt, 20), 7);
        assert_eq!(word(&pkt, 24), 9_212);
    }

    #[test]
    fn sdes_chunk_layout() {
        let rtcp = RtcpCompound::new(0xCAFEBABE, "10.0.0.1", "tool");
        let mut rtcp2 = rtcp.clone();
        let pkt = rtcp2.refresh(&SenderReport::default()).to_vec();
        let sdes = &pkt[SR_LEN..];

        assert_eq!(sdes[0], 0x81);
        assert_eq!(sdes[1], PT_SDES);
        assert_eq!(word(sdes, 4), 0xCAFEBABE);
        assert_eq!(sdes[8], SDES_CNAME);
        assert_eq!(sdes[9], 8);
        assert_eq!(&sdes[10..18], b"10.0.0.1");
        assert_eq!(sdes[18], SDES_TOOL);
        assert_eq!(sdes[19], 4);
        assert_eq!(&sdes[20..24], b"tool");
        // terminator + padding
        assert_eq!(sdes.len() % 4, 0);
        assert_eq!(sdes[24], 0);

        let words = u16::from_be_bytes([sdes[2], sdes[3]]) as usize;
        assert_eq!((words + 1) * 4, sdes.len());
        assert_eq!(rtcp.len(), pkt.len());
    }

    #[test]
    fn long_items_truncated() {
        let long = "x".repeat(400);
        let rtcp = RtcpCompound::new(1, &long, "t");
        let mut rtcp = rtcp;
        let pkt = rtcp.refresh(&SenderReport::default()).to_vec();
        assert_eq!(pkt[SR_LEN + 9], 255);
    }

    #[test]
    fn report_due_after_proportional_volume() {
        let mut state = ReportState::new(3, "127.0.0.1", "rtpcast");
        let threshold = state.compound.len() * 80;
        let mut packet = vec![0u8; 1328];
        packet[0] = 0x80;
        packet[4..8].copy_from_slice(&1234u32.to_be_bytes());

        let mut sent = 0;
        let mut reports = Vec::new();
        while reports.is_empty() {
            sent += 1;
            if let Some(pkt) = state.on_sent(&packet) {
                reports.push(pkt.to_vec());
            }
        }
        assert_eq!(sent, threshold.div_ceil(1328));
        let sr = &reports[0];
        assert_eq!(word(sr, 16), 1234);
        assert_eq!(word(sr, 20), sent as u32);
        assert_eq!(word(sr, 24), sent as u32 * 1316);
        assert_eq!(state.packet_count(), sent as u32);
        assert_eq!(state.octet_count(), sent as u32 * 1316);
    }

    #[test]
    fn bye_follows_report() {
        let mut rtcp = RtcpCompound::new(5, "h", "t");
        let sr = SenderReport {
            ssrc: 5,
            ..SenderReport::default()
        };
        let pkt = rtcp.with_bye(&sr);
        let tail = &pkt[pkt.len() - 8..];
        assert_eq!(&tail[0..4], &[0x81, PT_BYE, 0, 1]);
        assert_eq!(word(tail, 4), 5);
        assert_eq!(pkt.len(), rtcp.len() + 8);
    }
}
