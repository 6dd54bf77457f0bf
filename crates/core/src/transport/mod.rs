//! Network transport for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): carries RTSP requests and responses. One thread per
//!   client connection.
//! - **UDP** ([`udp`]): one [`UdpSink`](udp::UdpSink) per destination, an
//!   RTP socket and its RTCP companion on the next port.
//! - **Sender** ([`sender`]): the thread that paces queued RTP packets onto
//!   the sinks of their stream.

pub mod sender;
pub mod tcp;
pub mod udp;

pub use sender::SenderStats;
pub use udp::{SinkOptions, UdpSink};
