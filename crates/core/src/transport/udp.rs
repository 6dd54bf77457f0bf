use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{CastError, Result};
use crate::media::rtcp::ReportState;
use crate::protocol::response::SERVER_AGENT;

/// Attempts at finding a free RTCP port right above an ephemeral RTP port.
const PORT_PAIR_ATTEMPTS: usize = 16;

/// Socket options applied to every sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkOptions {
    /// Multicast TTL / hop limit. Only applied to multicast destinations.
    pub ttl: Option<u8>,
    /// DSCP code point, written into the IPv4 TOS byte.
    pub dscp: Option<u8>,
}

/// One RTP destination: a connected RTP socket and its RTCP companion on
/// the next port, on both ends.
///
/// Each sink carries its own RTCP reporting state, so a sender report
/// counts what this destination was actually sent.
///
/// Sinks are shared through `Arc` between the session registry and the
/// sender thread. [`close`](Self::close) only marks the sink; the sockets
/// are released when the last reference is dropped, so a send racing with
/// a teardown never hits a reused descriptor.
#[derive(Debug)]
pub struct UdpSink {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    dest: SocketAddr,
    local: SocketAddr,
    closed: AtomicBool,
    warned: AtomicBool,
    report: Mutex<Option<ReportState>>,
}

impl UdpSink {
    /// Open the RTP/RTCP socket pair towards `dest` (RTP) and `dest + 1` (RTCP).
    pub fn open(dest: SocketAddr, options: SinkOptions) -> Result<Self> {
        let rtcp_dest = SocketAddr::new(dest.ip(), dest.port().wrapping_add(1));
        let mut last_err = None;

        for _ in 0..PORT_PAIR_ATTEMPTS {
            let rtp = new_socket(dest, options)
                .and_then(|s| s.bind(&SockAddr::from(unspecified(dest, 0))).map(|()| s))
                .map_err(|source| CastError::SinkOpen { dest, source })?;
            let port = rtp
                .local_addr()
                .ok()
                .and_then(|a| a.as_socket())
                .map(|a| a.port())
                .unwrap_or(0);
            if port == 0 || port == u16::MAX {
                continue;
            }

            let rtcp = match new_socket(dest, options)
                .and_then(|s| s.bind(&SockAddr::from(unspecified(dest, port + 1))).map(|()| s))
            {
                Ok(rtcp) => rtcp,
                Err(e) => {
                    tracing::trace!(port = port + 1, error = %e, "RTCP port busy, retrying");
                    last_err = Some(e);
                    continue;
                }
            };

            rtp.connect(&SockAddr::from(dest))
                .map_err(|source| CastError::SinkOpen { dest, source })?;
            rtcp.connect(&SockAddr::from(rtcp_dest))
                .map_err(|source| CastError::SinkOpen { dest, source })?;

            let rtp: UdpSocket = rtp.into();
            let rtcp: UdpSocket = rtcp.into();
            let local = rtp.local_addr()?;

            tracing::debug!(%dest, %local, "UDP sink opened");
            return Ok(Self {
                rtp,
                rtcp,
                dest,
                local,
                closed: AtomicBool::new(false),
                warned: AtomicBool::new(false),
                report: Mutex::new(None),
            });
        }

        if let Some(e) = last_err {
            tracing::warn!(%dest, error = %e, "giving up on RTP/RTCP port pair");
        }
        Err(CastError::PortRangeExhausted)
    }

    /// Send one RTP packet of source `ssrc` and follow it with a sender
    /// report when one is due.
    pub fn deliver(&self, ssrc: u32, packet: &[u8]) -> io::Result<usize> {
        let sent = self.rtp.send(packet)?;

        let mut report = self.report.lock();
        let state =
            report.get_or_insert_with(|| ReportState::new(ssrc, &self.cname(), SERVER_AGENT));
        if let Some(compound) = state.on_sent(packet) {
            match self.rtcp.send(compound) {
                Ok(_) => tracing::trace!(dest = %self.dest, "RTCP sender report sent"),
                Err(e) => self.report_error(&e),
            }
        }
        Ok(sent)
    }

    /// Send a final report and BYE if anything was ever delivered.
    pub fn send_bye(&self) {
        let mut report = self.report.lock();
        if let Some(state) = report.as_mut() {
            let packet = state.bye();
            if let Err(e) = self.rtcp.send(&packet) {
                self.report_error(&e);
            }
        }
    }

    /// RTP packets delivered so far.
    pub fn packets_sent(&self) -> u32 {
        self.report.lock().as_ref().map_or(0, ReportState::packet_count)
    }

    /// Log a send failure: the first one per sink as a warning, later ones
    /// at debug level.
    pub fn report_error(&self, err: &io::Error) {
        if self.warned.swap(true, Ordering::Relaxed) {
            tracing::debug!(dest = %self.dest, error = %err, "send error");
        } else {
            tracing::warn!(dest = %self.dest, error = %err, "send error");
        }
    }

    /// Say goodbye and close. Does nothing on a sink already closed.
    pub fn retire(&self) {
        if !self.is_closed() {
            self.send_bye();
            self.close();
        }
    }

    /// Stop delivering to this sink.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(dest = %self.dest, "UDP sink closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remote RTP address.
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Local RTP address, as chosen by the routing table on connect.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Local RTP and RTCP ports.
    pub fn server_ports(&self) -> (u16, u16) {
        (self.local.port(), self.local.port().wrapping_add(1))
    }

    /// Local IP without IPv6 scope id, as used for RTCP CNAME.
    pub fn cname(&self) -> String {
        self.local.ip().to_string()
    }
}

fn new_socket(dest: SocketAddr, options: SinkOptions) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(dest), Type::DGRAM, Some(Protocol::UDP))?;

    if dest.ip().is_multicast() {
        let ttl = u32::from(options.ttl.unwrap_or(1));
        match dest {
            SocketAddr::V4(_) => socket.set_multicast_ttl_v4(ttl)?,
            SocketAddr::V6(_) => socket.set_multicast_hops_v6(ttl)?,
        }
    }

    if let (Some(dscp), SocketAddr::V4(_)) = (options.dscp, dest) {
        socket.set_tos(u32::from(dscp) << 2)?;
    }

    Ok(socket)
}

fn unspecified(dest: SocketAddr, port: u16) -> SocketAddr {
    let ip = match dest.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn opens_consecutive_port_pair() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink = UdpSink::open(receiver.local_addr().unwrap(), SinkOptions::default()).unwrap();
        let (rtp, rtcp) = sink.server_ports();
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(sink.cname(), "127.0.0.1");
    }

    #[test]
    fn delivers_to_destination() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let sink = UdpSink::open(receiver.local_addr().unwrap(), SinkOptions::default()).unwrap();

        sink.deliver(1, b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.port(), sink.server_ports().0);
    }

    #[test]
    fn reports_follow_rtp_on_next_port() {
        let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = rtp.local_addr().unwrap().port();
        let Ok(rtcp) = UdpSocket::bind(("127.0.0.1", port + 1)) else {
            return;
        };
        rtcp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let sink = UdpSink::open(rtp.local_addr().unwrap(), SinkOptions::default()).unwrap();

        let mut packet = vec![0u8; 1400];
        packet[0] = 0x80;
        packet[8..12].copy_from_slice(&77u32.to_be_bytes());
        // 80 bytes of RTP per RTCP byte: a few hundred kilobytes at most.
        for _ in 0..300 {
            sink.deliver(77, &packet).unwrap();
        }
        let mut buf = [0u8; 512];
        let n = rtcp.recv(&mut buf).unwrap();
        assert!(n > 28);
        assert_eq!(buf[1], 200);
        assert_eq!(&buf[4..8], &77u32.to_be_bytes());
        assert_eq!(sink.packets_sent(), 300);

        sink.send_bye();
        let mut found_bye = false;
        while let Ok(n) = rtcp.recv(&mut buf) {
            if buf[..n].windows(2).any(|w| w == [0x81, 203]) {
                found_bye = true;
                break;
            }
        }
        assert!(found_bye);
    }

    #[test]
    fn close_is_sticky() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink = UdpSink::open(receiver.local_addr().unwrap(), SinkOptions::default()).unwrap();
        assert!(!sink.is_closed());
        sink.close();
        sink.close();
        assert!(sink.is_closed());
    }
}
