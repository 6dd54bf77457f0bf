//! Session descriptors and their announcement.
//!
//! A [`SessionDescriptor`] holds what a session says about itself: the
//! human-readable fields of the SDP session section and where the media
//! flows. The same descriptor feeds RTSP `DESCRIBE` bodies and the SAP
//! announcements of [`sap`].

pub mod sap;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use rand::RngExt;

use crate::clock;
use crate::config::ServerConfig;
use crate::error::{CastError, Result};
use crate::protocol::sdp::{MediaLine, SessionSdp};

pub use sap::SapAnnouncer;

/// Description of one published session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub name: String,
    pub group: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Multicast destination of the media, if any.
    pub destination: Option<SocketAddr>,
    pub ttl: Option<u8>,
    session_id: u64,
    version: u64,
}

impl SessionDescriptor {
    /// Descriptor for a new session. The `o=` identifier is the NTP time of
    /// creation (RFC 4566 §5.2).
    pub fn new(name: &str) -> Self {
        let id = clock::ntp_now() >> 32;
        Self {
            name: name.to_string(),
            group: None,
            description: None,
            url: None,
            email: None,
            phone: None,
            destination: None,
            ttl: None,
            session_id: id,
            version: id,
        }
    }

    pub fn from_config(config: &ServerConfig, destination: Option<SocketAddr>) -> Self {
        Self {
            group: config.group_name.clone(),
            description: config.description.clone(),
            url: config.url.clone(),
            email: config.email.clone(),
            phone: config.phone.clone(),
            destination,
            ttl: config.ttl,
            ..Self::new(&config.name)
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Mark the description as changed.
    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Session-level SDP section as sent from `origin`.
    pub fn session_sdp(&self, origin: IpAddr) -> SessionSdp {
        SessionSdp {
            session_id: self.session_id,
            version: self.version,
            origin,
            name: self.name.clone(),
            description: self.description.clone(),
            url: self.url.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            destination: self.destination.map(|d| d.ip()),
            ttl: self.ttl,
            group: self.group.clone(),
        }
    }

    /// Complete SDP: the session section followed by `media`.
    pub fn sdp(&self, origin: IpAddr, media: &[MediaLine]) -> Result<String> {
        let mut sdp = self.session_sdp(origin).build()?;
        for line in media {
            sdp.push_str(&line.build()?);
        }
        Ok(sdp)
    }
}

/// Pick a random source-specific multicast group: `232.0.0.0/8` for IPv4,
/// `ff38::8000:0/97` (site-local SSM with a dynamic group id) for IPv6.
pub fn random_multicast(ipv6: bool) -> IpAddr {
    let mut rng = rand::rng();
    if ipv6 {
        let group = rng.random::<u32>() | 0x8000_0000;
        let mut addr = Ipv6Addr::new(0xff38, 0, 0, 0, 0, 0, 0, 0).octets();
        addr[12..].copy_from_slice(&group.to_be_bytes());
        IpAddr::V6(Ipv6Addr::from(addr))
    } else {
        let rand24 = rng.random::<u32>() & 0x00ff_ffff;
        IpAddr::V4(Ipv4Addr::from(0xe800_0000 | rand24))
    }
}

/// Local address the host would send from to reach `dest`.
///
/// Nothing is sent: connecting a UDP socket only selects a route.
pub fn source_address(dest: SocketAddr) -> Result<IpAddr> {
    let bind: SocketAddr = match dest {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).map_err(|source| CastError::SinkOpen { dest, source })?;
    socket
        .connect(dest)
        .map_err(|source| CastError::SinkOpen { dest, source })?;
    Ok(socket.local_addr()?.ip())
}
