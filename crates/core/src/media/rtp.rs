use rand::RngExt;

use crate::clock::Mtime;

/// Size of the fixed RTP header (no CSRC, no extension).
pub const RTP_HEADER_LEN: usize = 12;

/// Static payload type for MPEG2 transport streams (RFC 3551).
pub const PT_MP2T: u8 = 33;

/// RTP fixed header state for one outgoing stream (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// - **Sequence number**: 16-bit, wrapping, random initial value.
/// - **Timestamp**: derived from each packet's dts in the media clock
///   (`dts × clock_rate / 1 MHz`), truncated to 32 bits.
/// - **SSRC**: random and immutable for the lifetime of the stream.
///
/// Version is always 2. Padding, extension, CSRC count and marker are 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    clock_rate: u32,
    sequence: u16,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, initial_sequence: u16, clock_rate: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            seq = initial_sequence,
            clock_rate,
            "RTP header state created"
        );
        Self {
            pt: pt & 0x7f,
            ssrc,
            clock_rate,
            sequence: initial_sequence,
        }
    }

    /// Random SSRC and initial sequence number (RFC 3550 §5.1, §8.1).
    pub fn with_random_ssrc(pt: u8, clock_rate: u32) -> Self {
        let mut rng = rand::rng();
        let ssrc = rng.random::<u32>();
        let seq = rng.random::<u16>();
        Self::new(pt, ssrc, seq, clock_rate)
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// RTP timestamp for a presentation time in microseconds.
    pub fn timestamp_for(&self, dts: Mtime) -> u32 {
        (i128::from(dts) * i128::from(self.clock_rate) / 1_000_000) as u32
    }

    /// Serialize a 12-byte header for a packet presented at `dts` and
    /// advance the sequence number.
    pub fn write(&mut self, dts: Mtime) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = self.pt;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp_for(dts).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// Sequence number of a serialized RTP packet.
pub fn sequence_of(packet: &[u8]) -> Option<u16> {
    packet.get(2..4).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Timestamp of a serialized RTP packet.
pub fn timestamp_of(packet: &[u8]) -> Option<u32> {
    packet
        .get(4..8)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// SSRC of a serialized RTP packet.
pub fn ssrc_of(packet: &[u8]) -> Option<u32> {
    packet
        .get(8..12)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
