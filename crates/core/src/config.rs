//! Server configuration.
//!
//! [`ServerConfig`] carries every recognised option of the streaming
//! output. It can be filled field by field, or from
//! `key=value` options through [`ServerConfig::set_option`].

use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{CastError, Result};
use crate::media::rtp::RTP_HEADER_LEN;

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_CACHING_MS: u64 = 300;
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum UDP payload size, RTP header included.
    pub mtu: usize,
    /// Added to each block's dts to compute its send deadline.
    pub caching_ms: u64,
    /// Number of back-to-back packets sent before the next wait.
    pub group: u32,
    /// Send one input block per packet instead of filling the MTU.
    pub raw: bool,
    /// Pick a random multicast destination when none is configured.
    pub auto_mcast: bool,
    /// Multicast TTL (IPv4) or hop limit (IPv6).
    pub ttl: Option<u8>,
    /// DSCP code point for egress sockets.
    pub dscp: Option<u8>,
    /// RTSP bind host.
    pub rtsp_host: String,
    /// RTSP bind port.
    pub rtsp_port: u16,
    /// Path of the aggregate URL.
    pub rtsp_path: String,
    /// Announce the session with SAP.
    pub sap: bool,
    /// Multicast media destination. Tracks use consecutive even ports from here.
    pub destination: Option<SocketAddr>,
    /// SDP `s=`.
    pub name: String,
    /// SDP `a=x-plgroup:`.
    pub group_name: Option<String>,
    /// SDP `i=`.
    pub description: Option<String>,
    /// SDP `u=`.
    pub url: Option<String>,
    /// SDP `e=`.
    pub email: Option<String>,
    /// SDP `p=`.
    pub phone: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            caching_ms: DEFAULT_CACHING_MS,
            group: 1,
            raw: false,
            auto_mcast: false,
            ttl: None,
            dscp: None,
            rtsp_host: "0.0.0.0".to_string(),
            rtsp_port: DEFAULT_RTSP_PORT,
            rtsp_path: "/".to_string(),
            sap: false,
            destination: None,
            name: "Stream".to_string(),
            group_name: None,
            description: None,
            url: None,
            email: None,
            phone: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` the RTSP listener binds to.
    pub fn rtsp_bind_addr(&self) -> String {
        if self.rtsp_host.contains(':') && !self.rtsp_host.starts_with('[') {
            format!("[{}]:{}", self.rtsp_host, self.rtsp_port)
        } else {
            format!("{}:{}", self.rtsp_host, self.rtsp_port)
        }
    }

    /// Send-deadline offset in microseconds.
    pub fn caching_us(&self) -> i64 {
        (self.caching_ms as i64).saturating_mul(1000)
    }

    /// Apply one `key=value` option. A bare `key` sets a boolean option.
    pub fn apply(&mut self, option: &str) -> Result<()> {
        match option.split_once('=') {
            Some((key, value)) => self.set_option(key.trim(), value.trim()),
            None => self.set_option(option.trim(), ""),
        }
    }

    /// Set one option by its configuration name.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "mtu" => self.mtu = parse(key, value)?,
            "caching" => self.caching_ms = parse(key, value)?,
            "group" => self.group = parse(key, value)?,
            "raw" => self.raw = parse_bool(key, value)?,
            "auto-mcast" => self.auto_mcast = parse_bool(key, value)?,
            "ttl" => self.ttl = Some(parse(key, value)?),
            "dscp" => self.dscp = Some(parse(key, value)?),
            "rtsp-host" => self.rtsp_host = value.to_string(),
            "rtsp-port" => self.rtsp_port = parse(key, value)?,
            "path" => self.rtsp_path = value.to_string(),
            "sap" => self.sap = parse_bool(key, value)?,
            "dst" => self.destination = Some(parse(key, value)?),
            "name" => self.name = value.to_string(),
            "sap-group" => self.group_name = non_empty(value),
            "description" => self.description = non_empty(value),
            "url" => self.url = non_empty(value),
            "email" => self.email = non_empty(value),
            "phone" => self.phone = non_empty(value),
            _ => {
                return Err(CastError::InvalidOption {
                    key: key.to_string(),
                    reason: "unknown option".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Reject values the output cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.mtu <= RTP_HEADER_LEN {
            return Err(invalid("mtu", format!("must exceed {RTP_HEADER_LEN}")));
        }
        if self.mtu > 65_507 {
            return Err(invalid("mtu", "larger than a UDP datagram".to_string()));
        }
        if self.group == 0 {
            return Err(invalid("group", "must be at least 1".to_string()));
        }
        if let Some(dscp) = self.dscp
            && dscp > 63
        {
            return Err(invalid("dscp", "must fit in 6 bits".to_string()));
        }
        if !self.rtsp_path.starts_with('/') {
            return Err(invalid("path", "must start with '/'".to_string()));
        }
        if let Some(dst) = self.destination
            && !dst.ip().is_multicast()
        {
            return Err(invalid("dst", format!("{} is not multicast", dst.ip())));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: String) -> CastError {
    CastError::InvalidOption {
        key: key.to_string(),
        reason,
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid(key, format!("bad value {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("bad boolean {value:?}"))),
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
