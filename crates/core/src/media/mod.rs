//! Media path: input blocks, RTP packetisation and RTCP.
//!
//! ## RTP overview (RFC 3550)
//!
//! A producer pushes [`block::Block`]s of elementary-stream bytes, each
//! stamped with a presentation time. A [`packetizer::Packetizer`] packs them
//! into RTP packets carrying a 12-byte fixed header ([`rtp::RtpHeader`]):
//!
//! - **Sequence number** (16-bit, wrapping): one per packet, random start.
//! - **Timestamp** (32-bit): the first block's dts in the media clock.
//! - **SSRC** (32-bit): random, constant for the stream.
//!
//! The sender periodically follows the RTP flow with an RTCP SR+SDES
//! compound ([`rtcp::RtcpCompound`]) on the companion port.
//!
//! | Payload | PT | Clock | RFC |
//! |---------|----|-------|-----|
//! | MPEG2-TS | 33 | 90 kHz | [RFC 2250](https://tools.ietf.org/html/rfc2250) |
//!
//! Other payloads can be carried by choosing the payload type, clock rate
//! and rtpmap in [`StreamParams`](crate::output::StreamParams).

pub mod block;
pub mod packetizer;
pub mod rtcp;
pub mod rtp;

pub use block::{Block, BlockPool};
pub use packetizer::{AggregatingPacketizer, Packetizer, RawPacketizer, RtpPacket};
