//! Wire codecs for the RTSP control plane (RFC 2326) and SDP (RFC 4566).
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! SETUP rtsp://server/trackID=0 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Transport: RTP/AVP;unicast;client_port=5000-5001\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport (UDP ports or multicast group) |
//! | PLAY | §10.5 | Start media delivery |
//! | PAUSE | §10.6 | Refused with `405` |
//! | TEARDOWN | §10.7 | Destroy a track or the whole session |
//!
//! Routing of methods to URLs lives in [`crate::rtsp`].

pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;

pub use request::{Method, RtspRequest};
pub use response::RtspResponse;
