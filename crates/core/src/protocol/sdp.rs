//! SDP (Session Description Protocol) build and parse (RFC 4566).
//!
//! Produces the bodies of DESCRIBE responses and SAP announcements:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <sess-id> <sess-ver> IN IP4 <origin>     ← origin
//! s=<name>                                     ← session name
//! i=<description>                              ← optional
//! u=<url>                                      ← optional
//! e=<email>                                    ← optional
//! p=<phone>                                    ← optional
//! c=IN IP4 <dst>/<ttl>                         ← connection
//! t=0 0                                        ← timing (live stream)
//! a=tool:rtpcast/0.1.0                         ← server software
//! a=type:broadcast
//! a=charset:UTF-8
//! m=video 5004 RTP/AVP 33                      ← one block per stream
//! a=rtpmap:33 MP2T/90000
//! ```
//!
//! Lines end with CRLF. Field values are checked so that no value can
//! inject extra lines.

use std::fmt;
use std::net::IpAddr;

use crate::error::{CastError, Result};
use crate::protocol::response::SERVER_AGENT;

/// `IP4` or `IP6`, after the family of `ip`.
pub fn addr_type(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

/// Source-specific multicast range: 232.0.0.0/8 or FF3x::/32 (RFC 4607).
pub fn is_ssm(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 232,
        IpAddr::V6(v6) => {
            let o = v6.octets();
            o[0] == 0xff && (o[1] & 0xf0) == 0x30
        }
    }
}

/// Session-level section of a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSdp {
    pub session_id: u64,
    pub version: u64,
    /// Address the stream is sent from.
    pub origin: IpAddr,
    pub name: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Multicast destination; `None` for unicast-only sessions.
    pub destination: Option<IpAddr>,
    /// Multicast TTL, IPv4 only.
    pub ttl: Option<u8>,
    /// Playlist group (`a=x-plgroup:`).
    pub group: Option<String>,
}

impl SessionSdp {
    pub fn new(session_id: u64, origin: IpAddr, name: &str) -> Self {
        Self {
            session_id,
            version: session_id,
            origin,
            name: name.to_string(),
            description: None,
            url: None,
            email: None,
            phone: None,
            destination: None,
            ttl: None,
            group: None,
        }
    }

    /// Format the session-level lines.
    pub fn build(&self) -> Result<String> {
        let at = addr_type(self.origin);
        let mut sdp = String::new();

        push_line(&mut sdp, 'v', "0");
        push_line(
            &mut sdp,
            'o',
            &format!("- {} {} IN {} {}", self.session_id, self.version, at, self.origin),
        );
        push_line(&mut sdp, 's', checked("s", &self.name)?);
        for (kind, field, value) in [
            ('i', "i", &self.description),
            ('u', "u", &self.url),
            ('e', "e", &self.email),
            ('p', "p", &self.phone),
        ] {
            if let Some(value) = value {
                push_line(&mut sdp, kind, checked(field, value)?);
            }
        }
        push_line(&mut sdp, 'c', &self.connection());
        push_line(&mut sdp, 't', "0 0");
        push_line(&mut sdp, 'a', &format!("tool:{SERVER_AGENT}"));
        push_line(&mut sdp, 'a', "type:broadcast");
        push_line(&mut sdp, 'a', "charset:UTF-8");
        if let Some(group) = &self.group {
            push_line(&mut sdp, 'a', &format!("x-plgroup:{}", checked("a", group)?));
        }
        if let Some(dst) = self.destination
            && is_ssm(dst)
        {
            push_line(
                &mut sdp,
                'a',
                &format!("source-filter: incl IN {} * {}", addr_type(dst), self.origin),
            );
        }
        Ok(sdp)
    }

    fn connection(&self) -> String {
        match self.destination {
            Some(dst @ IpAddr::V4(_)) if dst.is_multicast() => {
                format!("IN IP4 {}/{}", dst, self.ttl.unwrap_or(1))
            }
            Some(dst) if dst.is_multicast() => format!("IN IP6 {dst}"),
            _ => match self.origin {
                IpAddr::V4(_) => "IN IP4 0.0.0.0".to_string(),
                IpAddr::V6(_) => "IN IP6 ::".to_string(),
            },
        }
    }
}

/// One `m=` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    pub media: String,
    pub port: u16,
    pub payload_type: u8,
    pub encoding: Option<String>,
    pub clock_rate: u32,
    pub fmtp: Option<String>,
    /// `a=control:` value, relative to the Content-Base.
    pub control: Option<String>,
}

impl MediaLine {
    pub fn build(&self) -> Result<String> {
        let mut sdp = String::new();
        push_line(
            &mut sdp,
            'm',
            &format!(
                "{} {} RTP/AVP {}",
                checked("m", &self.media)?,
                self.port,
                self.payload_type
            ),
        );
        if let Some(encoding) = &self.encoding {
            push_line(
                &mut sdp,
                'a',
                &format!(
                    "rtpmap:{} {}/{}",
                    self.payload_type,
                    checked("a", encoding)?,
                    self.clock_rate
                ),
            );
        }
        if let Some(fmtp) = &self.fmtp {
            push_line(
                &mut sdp,
                'a',
                &format!("fmtp:{} {}", self.payload_type, checked("a", fmtp)?),
            );
        }
        if let Some(control) = &self.control {
            push_line(&mut sdp, 'a', &format!("control:{}", checked("a", control)?));
        }
        Ok(sdp)
    }
}

fn push_line(sdp: &mut String, kind: char, value: &str) {
    sdp.push(kind);
    sdp.push('=');
    sdp.push_str(value);
    sdp.push_str("\r\n");
}

fn checked<'a>(field: &'static str, value: &'a str) -> Result<&'a str> {
    if value.contains(['\r', '\n', '\0']) {
        return Err(CastError::Sdp {
            field,
            reason: "contains a line break".to_string(),
        });
    }
    Ok(value)
}

/// A parsed description: session-level lines followed by media sections,
/// each kept in source order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    pub session: Vec<(char, String)>,
    pub media: Vec<Vec<(char, String)>>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self> {
        let mut desc = SessionDescription::default();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let mut chars = line.chars();
            let (Some(kind), Some('=')) = (chars.next(), chars.next()) else {
                return Err(CastError::Sdp {
                    field: "line",
                    reason: format!("malformed line {line:?}"),
                });
            };
            let value = chars.as_str().to_string();

            if kind == 'm' {
                desc.media.push(vec![(kind, value)]);
            } else if let Some(section) = desc.media.last_mut() {
                section.push((kind, value));
            } else {
                desc.session.push((kind, value));
            }
        }

        if desc.session.first().map(|(k, _)| *k) != Some('v') {
            return Err(CastError::Sdp {
                field: "v",
                reason: "description must start with v=".to_string(),
            });
        }
        Ok(desc)
    }

    /// First session-level value of the given type.
    pub fn get(&self, kind: char) -> Option<&str> {
        self.session
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.as_str())
    }

    /// Session-level `a=` values.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.session
            .iter()
            .filter(|(k, _)| *k == 'a')
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, value) in self.session.iter().chain(self.media.iter().flatten()) {
            write!(f, "{kind}={value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_media(port: u16) -> MediaLine {
        MediaLine {
            media: "video".to_string(),
            port,
            payload_type: 33,
            encoding: Some("MP2T".to_string()),
            clock_rate: 90_000,
            fmtp: None,
            control: None,
        }
    }

    #[test]
    fn unicast_session() {
        let session = SessionSdp::new(1234, "192.168.1.100".parse().unwrap(), "test");
        let sdp = session.build().unwrap() + &ts_media(0).build().unwrap();

        assert!(sdp.starts_with("v=0\r\no=- 1234 1234 IN IP4 192.168.1.100\r\ns=test\r\n"));
        assert!(sdp.contains("c=IN IP4 0.0.0.0\r\n"));
        assert!(sdp.contains("t=0 0\r\n"));
        assert!(sdp.contains(&format!("a=tool:{SERVER_AGENT}\r\n")));
        assert!(sdp.contains("a=type:broadcast\r\na=charset:UTF-8\r\n"));
        assert!(sdp.ends_with("m=video 0 RTP/AVP 33\r\na=rtpmap:33 MP2T/90000\r\n"));
        assert!(!sdp.contains("i="));
        assert!(!sdp.contains("source-filter"));
    }

    #[test]
    fn multicast_session_with_optional_fields() {
        let mut session = SessionSdp::new(1, "10.0.0.1".parse().unwrap(), "News");
        session.description = Some("Evening news".to_string());
        session.url = Some("http://example.com/".to_string());
        session.email = Some("ops@example.com".to_string());
        session.phone = Some("+1 555 0100".to_string());
        session.destination = Some("239.255.1.1".parse().unwrap());
        session.ttl = Some(4);
        session.group = Some("TV".to_string());
        let sdp = session.build().unwrap();

        let order = ["s=News", "i=Evening", "u=http", "e=ops", "p=+1", "c=IN", "t=0"];
        let positions: Vec<usize> = order.iter().map(|p| sdp.find(p).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(sdp.contains("c=IN IP4 239.255.1.1/4\r\n"));
        assert!(sdp.contains("a=x-plgroup:TV\r\n"));
    }

    #[test]
    fn ssm_adds_source_filter() {
        let mut session = SessionSdp::new(1, "10.0.0.1".parse().unwrap(), "s");
        session.destination = Some("232.1.2.3".parse().unwrap());
        let sdp = session.build().unwrap();
        assert!(sdp.contains("c=IN IP4 232.1.2.3/1\r\n"));
        assert!(sdp.contains("a=source-filter: incl IN IP4 * 10.0.0.1\r\n"));
    }

    #[test]
    fn ipv6_has_no_ttl() {
        let mut session = SessionSdp::new(1, "2001:db8::1".parse().unwrap(), "s");
        session.destination = Some("ff3e::8000:1".parse().unwrap());
        session.ttl = Some(8);
        let sdp = session.build().unwrap();
        assert!(sdp.contains("o=- 1 1 IN IP6 2001:db8::1\r\n"));
        assert!(sdp.contains("c=IN IP6 ff3e::8000:1\r\n"));
        assert!(sdp.contains("a=source-filter: incl IN IP6 * 2001:db8::1\r\n"));
    }

    #[test]
    fn line_breaks_rejected() {
        let session = SessionSdp::new(1, "10.0.0.1".parse().unwrap(), "bad\r\na=evil");
        assert!(matches!(
            session.build(),
            Err(CastError::Sdp { field: "s", .. })
        ));
    }

    #[test]
    fn media_attributes_in_order() {
        let mut media = ts_media(5004);
        media.fmtp = Some("x=1".to_string());
        media.control = Some("trackID=0".to_string());
        assert_eq!(
            media.build().unwrap(),
            "m=video 5004 RTP/AVP 33\r\na=rtpmap:33 MP2T/90000\r\na=fmtp:33 x=1\r\na=control:trackID=0\r\n"
        );
    }

    #[test]
    fn parse_then_serialize_is_identity() {
        let mut session = SessionSdp::new(99, "10.0.0.1".parse().unwrap(), "round trip");
        session.destination = Some("232.0.0.9".parse().unwrap());
        session.description = Some("with: colons = and spaces".to_string());
        let mut media = ts_media(5004);
        media.control = Some("trackID=0".to_string());
        let sdp = session.build().unwrap() + &media.build().unwrap() + &ts_media(5006).build().unwrap();

        let parsed = SessionDescription::parse(&sdp).unwrap();
        assert_eq!(parsed.media.len(), 2);
        assert_eq!(parsed.get('s'), Some("round trip"));
        assert!(parsed.attributes().any(|a| a == "charset:UTF-8"));
        assert_eq!(parsed.to_string(), sdp);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SessionDescription::parse("hello\r\n").is_err());
        assert!(SessionDescription::parse("s=no version\r\n").is_err());
    }
}
