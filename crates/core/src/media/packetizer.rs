use crate::clock::{Mtime, mdate};
use crate::media::block::{Block, BlockPool};
use crate::media::rtp::{self, RTP_HEADER_LEN, RtpHeader};

/// A complete RTP packet ready for the sender: 12-byte header followed by
/// payload.
#[derive(Debug, Clone, Default)]
pub struct RtpPacket {
    pub buf: Vec<u8>,
    /// Presentation time of the first payload byte.
    pub dts: Mtime,
    /// The payload contains a clock reference; send exactly at the deadline.
    pub clock: bool,
}

impl RtpPacket {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len().saturating_sub(RTP_HEADER_LEN)
    }

    pub fn sequence(&self) -> Option<u16> {
        rtp::sequence_of(&self.buf)
    }

    pub fn timestamp(&self) -> Option<u32> {
        rtp::timestamp_of(&self.buf)
    }
}

/// Turns input blocks into RTP packets for one track.
///
/// Implementations own the track's [`RtpHeader`], so sequence numbers and
/// timestamps advance in emission order.
pub trait Packetizer: Send {
    /// Consume one input block, returning the packets that are complete.
    fn packetize(&mut self, block: Block, pool: &BlockPool) -> Vec<RtpPacket>;

    /// Close the packet under construction, if any.
    fn flush(&mut self) -> Option<RtpPacket>;

    fn header(&self) -> &RtpHeader;

    fn ssrc(&self) -> u32 {
        self.header().ssrc
    }
}

/// Fills each packet up to the MTU with consecutive input bytes.
///
/// A block that does not fit in the packet under construction closes it
/// first; a block larger than one payload is split across several packets.
#[derive(Debug)]
pub struct AggregatingPacketizer {
    header: RtpHeader,
    mtu: usize,
    caching: Mtime,
    pending: Option<RtpPacket>,
    mtu_warned: bool,
}

impl AggregatingPacketizer {
    pub fn new(header: RtpHeader, mtu: usize, caching: Mtime) -> Self {
        Self {
            header,
            mtu,
            caching,
            pending: None,
            mtu_warned: false,
        }
    }

    fn close(&mut self) -> Option<RtpPacket> {
        let packet = self.pending.take()?;
        let late = mdate() - (packet.dts + self.caching);
        if late > 0 {
            tracing::debug!(
                ssrc = format_args!("{:#010X}", self.header.ssrc),
                seq = packet.sequence(),
                late_us = late,
                "late packet"
            );
        }
        Some(packet)
    }
}

impl Packetizer for AggregatingPacketizer {
    fn packetize(&mut self, block: Block, pool: &BlockPool) -> Vec<RtpPacket> {
        let mut out = Vec::new();

        if !self.mtu_warned && block.len() > self.mtu {
            tracing::warn!(
                size = block.len(),
                mtu = self.mtu,
                "packet size > MTU, you should probably increase the MTU"
            );
            self.mtu_warned = true;
        }

        if let Some(pending) = &self.pending
            && pending.len() + block.len() > self.mtu
        {
            out.extend(self.close());
        }

        let mut rest = block.data.as_slice();
        let mut chunks = 0;
        while !rest.is_empty() {
            chunks += 1;
            let packet = self.pending.get_or_insert_with(|| {
                let mut buf = pool.take();
                buf.extend_from_slice(&self.header.write(block.dts));
                RtpPacket {
                    buf,
                    dts: block.dts,
                    clock: false,
                }
            });

            let write = rest.len().min(self.mtu - packet.len());
            packet.buf.extend_from_slice(&rest[..write]);
            rest = &rest[write..];

            if block.clock {
                if packet.clock {
                    tracing::warn!(
                        ssrc = format_args!("{:#010X}", self.header.ssrc),
                        "two clock references in one packet"
                    );
                }
                packet.clock = true;
            }

            if packet.len() == self.mtu || chunks > 1 {
                out.extend(self.close());
            }
        }

        out
    }

    fn flush(&mut self) -> Option<RtpPacket> {
        self.close()
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

/// One input block per packet, no aggregation.
#[derive(Debug)]
pub struct RawPacketizer {
    header: RtpHeader,
}

impl RawPacketizer {
    pub fn new(header: RtpHeader) -> Self {
        Self { header }
    }
}

impl Packetizer for RawPacketizer {
    fn packetize(&mut self, block: Block, pool: &BlockPool) -> Vec<RtpPacket> {
        let released = pool.trim();
        if released > 0 {
            tracing::trace!(released, "free-list drained");
        }

        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + block.len());
        buf.extend_from_slice(&self.header.write(block.dts));
        buf.extend_from_slice(&block.data);
        vec![RtpPacket {
            buf,
            dts: block.dts,
            clock: block.clock,
        }]
    }

    fn flush(&mut self) -> Option<RtpPacket> {
        None
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::PT_MP2T;

    const TS: usize = 188;

    fn aggregating(mtu: usize) -> AggregatingPacketizer {
        // Far-future caching keeps "late" logging out of the way.
        AggregatingPacketizer::new(RtpHeader::new(PT_MP2T, 7, 0, 90_000), mtu, 1 << 40)
    }

    fn ts_block(count: usize, dts: Mtime) -> Block {
        Block::new(vec![0x47; TS * count], dts)
    }

    #[test]
    fn fills_packets_up_to_mtu() {
        let pool = BlockPool::new(1328);
        let mut p = aggregating(RTP_HEADER_LEN + 7 * TS);

        let mut out = Vec::new();
        for i in 0..14 {
            out.extend(p.packetize(ts_block(1, i * 1000), &pool));
        }
        assert_eq!(out.len(), 2);
        for pkt in &out {
            assert_eq!(pkt.len(), RTP_HEADER_LEN + 7 * TS);
        }
        assert_eq!(out[0].sequence(), Some(0));
        assert_eq!(out[1].sequence(), Some(1));
        assert!(p.flush().is_none());
    }

    #[test]
    fn block_that_does_not_fit_closes_pending() {
        let pool = BlockPool::new(1500);
        let mut p = aggregating(1500);

        assert!(p.packetize(ts_block(5, 0), &pool).is_empty());
        let out = p.packetize(ts_block(5, 1000), &pool);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload_len(), 5 * TS);
        assert_eq!(out[0].dts, 0);

        let rest = p.flush().unwrap();
        assert_eq!(rest.payload_len(), 5 * TS);
        assert_eq!(rest.dts, 1000);
    }

    #[test]
    fn large_block_is_split() {
        let pool = BlockPool::new(200);
        let mut p = aggregating(200);
        let out = p.packetize(Block::new(vec![1; 500], 0), &pool);
        let total: usize = out.iter().map(RtpPacket::payload_len).sum();
        assert_eq!(total, 500);
        assert!(out.iter().all(|pkt| pkt.len() <= 200));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn clock_flag_propagates() {
        let pool = BlockPool::new(1500);
        let mut p = aggregating(1500);
        p.packetize(ts_block(1, 0), &pool);
        p.packetize(ts_block(1, 0).with_clock(), &pool);
        let pkt = p.flush().unwrap();
        assert!(pkt.clock);
    }

    #[test]
    fn timestamp_follows_first_block() {
        let pool = BlockPool::new(1500);
        let mut p = aggregating(1500);
        p.packetize(ts_block(1, 1_000_000), &pool);
        p.packetize(ts_block(1, 2_000_000), &pool);
        let pkt = p.flush().unwrap();
        assert_eq!(pkt.timestamp(), Some(90_000));
    }

    #[test]
    fn sequence_is_contiguous_across_wrap() {
        let pool = BlockPool::new(200);
        let mut p =
            AggregatingPacketizer::new(RtpHeader::new(PT_MP2T, 1, 65530, 90_000), 200, 1 << 40);
        let mut seqs = Vec::new();
        for _ in 0..11 {
            let out = p.packetize(Block::new(vec![0; 188], 0), &pool);
            seqs.extend(out.iter().filter_map(RtpPacket::sequence));
        }
        seqs.extend(p.flush().and_then(|pkt| pkt.sequence()));
        assert_eq!(seqs.len(), 11);
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
        assert_eq!(seqs[10], 4);
    }

    #[test]
    fn raw_sends_one_packet_per_block() {
        let pool = BlockPool::new(1500);
        let mut p = RawPacketizer::new(RtpHeader::new(PT_MP2T, 9, 10, 90_000));
        let out = p.packetize(Block::new(vec![3; 40], 0).with_clock(), &pool);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload_len(), 40);
        assert!(out[0].clock);
        assert_eq!(out[0].sequence(), Some(10));
        assert!(p.flush().is_none());
        assert_eq!(p.ssrc(), 9);
    }
}
