use std::fmt;

use crate::error::{CastError, ParseErrorKind};

/// RTSP methods the server dispatches on (RFC 2326 §10).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    /// Any other token; answered with `405 Method Not Allowed`.
    Other(String),
}

impl Method {
    /// Methods are case-sensitive tokens (RFC 2326 §6.1).
    pub fn parse(token: &str) -> Self {
        match token {
            "DESCRIBE" => Self::Describe,
            "SETUP" => Self::Setup,
            "PLAY" => Self::Play,
            "PAUSE" => Self::Pause,
            "TEARDOWN" => Self::Teardown,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
            Self::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2, and whitespace
/// around the colon is ignored.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: Method,
    /// Request-URI (e.g. `rtsp://host:port/stream/trackID=0`).
    pub uri: String,
    /// Protocol version (always `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Body of `Content-Length` bytes, empty when absent.
    pub body: String,
}

impl RtspRequest {
    /// Parse an RTSP request from its text representation.
    ///
    /// Expects a complete request: request line, headers, trailing blank
    /// line, then `Content-Length` bytes of body if the header is present.
    /// Returns [`CastError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, rest) = match raw.find("\r\n\r\n") {
            Some(pos) => (&raw[..pos], &raw[pos + 4..]),
            None => match raw.find("\n\n") {
                Some(pos) => (&raw[..pos], &raw[pos + 2..]),
                None => (raw, ""),
            },
        };

        let mut lines = head.lines().skip_while(|l| l.trim().is_empty());
        let request_line = lines.next().ok_or(parse_error(ParseErrorKind::EmptyRequest))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(parse_error(ParseErrorKind::InvalidRequestLine));
        }

        let method = Method::parse(parts[0]);
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
            return Err(parse_error(ParseErrorKind::UnsupportedVersion));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(parse_error(ParseErrorKind::InvalidHeader))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut request = RtspRequest {
            method,
            uri,
            version,
            headers,
            body: String::new(),
        };

        let length = request.content_length()?;
        if length > 0 {
            let body = rest
                .get(..length)
                .ok_or(parse_error(ParseErrorKind::InvalidContentLength))?;
            request.body = body.to_string();
        }

        Ok(request)
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, echoed verbatim in the response
    /// (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Body length announced by `Content-Length`, 0 when absent.
    pub fn content_length(&self) -> crate::error::Result<usize> {
        content_length_of(&self.headers)
    }

    /// Path component of the request URI, without query string.
    ///
    /// `rtsp://host:554/a/b?x` gives `/a/b`; a bare path is returned as is.
    pub fn path(&self) -> &str {
        let after_scheme = match self.uri.find("://") {
            Some(pos) => &self.uri[pos + 3..],
            None => return strip_query(&self.uri),
        };
        match after_scheme.find('/') {
            Some(pos) => strip_query(&after_scheme[pos..]),
            None => "/",
        }
    }

    /// `scheme://authority` part of the request URI, if absolute.
    pub fn base(&self) -> Option<&str> {
        let start = self.uri.find("://")? + 3;
        let end = self.uri[start..]
            .find('/')
            .map_or(self.uri.len(), |pos| start + pos);
        Some(&self.uri[..end])
    }
}

/// Content length from raw header pairs. Used by the connection reader
/// before the request is fully parsed.
pub fn content_length_of(headers: &[(String, String)]) -> crate::error::Result<usize> {
    match headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
    {
        Some((_, value)) => value
            .parse()
            .map_err(|_| parse_error(ParseErrorKind::InvalidContentLength)),
        None => Ok(0),
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

fn parse_error(kind: ParseErrorKind) -> CastError {
    CastError::Parse { kind }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_describe_request() {
        let raw = "DESCRIBE rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Describe);
        assert_eq!(req.uri, "rtsp://localhost:8554/test");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/test/trackID=0 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Setup);
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(
            req.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=8000-8001")
        );
        assert_eq!(req.path(), "/test/trackID=0");
    }

    #[test]
    fn whitespace_around_colon_is_ignored() {
        let raw = "PLAY rtsp://h/ RTSP/1.0\r\nCSeq :  7 \r\nSession:42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.cseq(), Some("7"));
        assert_eq!(req.get_header("session"), Some("42"));
    }

    #[test]
    fn unknown_method_kept_verbatim() {
        let raw = "OPTIONS rtsp://h/ RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Other("OPTIONS".to_string()));
        assert_eq!(req.method.to_string(), "OPTIONS");
    }

    #[test]
    fn body_uses_content_length() {
        let raw = "DESCRIBE rtsp://h/ RTSP/1.0\r\nContent-Length: 5\r\n\r\nhello world";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.body, "hello");
    }

    #[test]
    fn short_body_is_an_error() {
        let raw = "DESCRIBE rtsp://h/ RTSP/1.0\r\nContent-Length: 50\r\n\r\nhi";
        assert!(RtspRequest::parse(raw).is_err());
        let raw = "DESCRIBE rtsp://h/ RTSP/1.0\r\nContent-Length: x\r\n\r\n";
        assert!(RtspRequest::parse(raw).is_err());
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("").is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
    }

    #[test]
    fn http_version_rejected() {
        let err = RtspRequest::parse("GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(
            err,
            CastError::Parse {
                kind: ParseErrorKind::UnsupportedVersion
            }
        ));
    }

    #[test]
    fn header_without_colon_rejected() {
        assert!(RtspRequest::parse("PLAY rtsp://h/ RTSP/1.0\r\nbogus\r\n\r\n").is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "DESCRIBE rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("cseq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn path_and_base() {
        let raw = "DESCRIBE rtsp://[::1]:8554/live/cam?x=1 RTSP/1.0\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.path(), "/live/cam");
        assert_eq!(req.base(), Some("rtsp://[::1]:8554"));

        let raw = "DESCRIBE rtsp://localhost RTSP/1.0\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.path(), "/");
        assert_eq!(req.base(), Some("rtsp://localhost"));
    }
}
