use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Client ports assumed when a unicast choice names none (RFC 3551 §11).
pub const DEFAULT_CLIENT_PORTS: (u16, u16) = (5004, 5005);

/// Delivery requested by one transport choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    /// RFC 2326 §12.39 makes multicast the default.
    Multicast,
}

/// One acceptable alternative of a `Transport` request header
/// (RFC 2326 §12.39).
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP/TCP;interleaved=0-1, RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=40000-40001;mode=play
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportChoice {
    pub delivery: Delivery,
    /// Peer's RTP and RTCP ports; only meaningful for unicast.
    pub client_ports: (u16, u16),
}

/// Why a transport choice was passed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// Lower transport other than `RTP/AVP` or `RTP/AVP/UDP`.
    Protocol(String),
    /// A `mode` other than PLAY.
    Mode(String),
    /// A parameter the server does not honour (`destination`, `interleaved`,
    /// `ssrc`, ...), or a malformed one.
    Parameter(String),
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(p) => write!(f, "unsupported protocol {p}"),
            Self::Mode(m) => write!(f, "unsupported mode {m}"),
            Self::Parameter(p) => write!(f, "unsupported parameter {p}"),
        }
    }
}

/// Iterate over the choices of a `Transport` header in client preference
/// order, parsing each one.
///
/// ```
/// use rtpcast::protocol::transport::{choices, Delivery};
///
/// let parsed: Vec<_> = choices("RTP/AVP/TCP;unicast, RTP/AVP;unicast;client_port=7000-7001")
///     .map(|(_, choice)| choice)
///     .collect();
/// assert!(parsed[0].is_err());
/// let accepted = parsed[1].as_ref().unwrap();
/// assert_eq!(accepted.delivery, Delivery::Unicast);
/// assert_eq!(accepted.client_ports, (7000, 7001));
/// ```
pub fn choices(header: &str) -> impl Iterator<Item = (&str, Result<TransportChoice, Skip>)> {
    header
        .split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| (raw, parse_choice(raw)))
}

/// Parse a single transport choice.
pub fn parse_choice(raw: &str) -> Result<TransportChoice, Skip> {
    let mut params = raw.split(';').map(str::trim);
    let protocol = params.next().unwrap_or_default();
    if protocol != "RTP/AVP" && protocol != "RTP/AVP/UDP" {
        return Err(Skip::Protocol(protocol.to_string()));
    }

    let mut choice = TransportChoice {
        delivery: Delivery::Multicast,
        client_ports: DEFAULT_CLIENT_PORTS,
    };

    for param in params.filter(|p| !p.is_empty()) {
        match param.split_once('=') {
            None if param == "unicast" => choice.delivery = Delivery::Unicast,
            None if param == "multicast" => choice.delivery = Delivery::Multicast,
            Some(("client_port", ports)) => {
                choice.client_ports =
                    parse_port_pair(ports).ok_or_else(|| Skip::Parameter(param.to_string()))?;
            }
            Some(("mode", mode)) => {
                let mode = mode.trim_matches('"');
                if !mode.eq_ignore_ascii_case("play") {
                    return Err(Skip::Mode(mode.to_string()));
                }
            }
            _ => return Err(Skip::Parameter(param.to_string())),
        }
    }

    Ok(choice)
}

fn parse_port_pair(ports: &str) -> Option<(u16, u16)> {
    let (lo, hi) = ports.split_once('-')?;
    Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
}

/// `Transport` reply for an accepted unicast choice. `source` is only
/// given when media leaves from another address than the RTSP socket.
pub fn unicast_reply(client_port: u16, server_port: u16, source: Option<IpAddr>) -> String {
    let source = source.map(|ip| format!("source={ip};")).unwrap_or_default();
    format!(
        "RTP/AVP;unicast;{source}client_port={}-{};server_port={}-{};mode=play",
        client_port,
        client_port.wrapping_add(1),
        server_port,
        server_port.wrapping_add(1),
    )
}

/// `Transport` reply for an accepted multicast choice.
pub fn multicast_reply(dest: SocketAddr, ttl: u8) -> String {
    format!(
        "RTP/AVP;multicast;destination={};port={}-{};ttl={};mode=play",
        dest.ip(),
        dest.port(),
        dest.port().wrapping_add(1),
        ttl,
    )
}
