//! RTSP request routing.
//!
//! A server publishes one *aggregate* URL (the SDP Content-Base) and one
//! *track* URL per stream, `<aggregate>/trackID=<n>`. Requests are routed
//! through a table keyed by `(path, method)`:
//!
//! | Method | Aggregate URL | Track URL |
//! |--------|---------------|-----------|
//! | DESCRIBE | SDP of every stream | `460` |
//! | SETUP | `459` | bind the stream to a sink |
//! | PLAY | start every sink of the session | `460` |
//! | PAUSE | `405` | `405` |
//! | TEARDOWN | delete the session | unbind the stream |
//!
//! Any other method gets `405` with the `Allow` list of the URL.

mod handler;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::announce::SessionDescriptor;
use crate::error::Result;
use crate::output::{RtpOutput, StreamId};
use crate::protocol::request::Method;
use crate::protocol::sdp::MediaLine;
use crate::protocol::{RtspRequest, RtspResponse};
use crate::session::SessionRegistry;

const AGGREGATE_ALLOW: &str = "DESCRIBE, PLAY, TEARDOWN";
const TRACK_ALLOW: &str = "SETUP, TEARDOWN";

/// Endpoints of the control connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Describe,
    Play,
    Teardown,
    TrackSetup(StreamId),
    TrackTeardown(StreamId),
    /// Answer with a fixed status and no side effect.
    Refuse(u16),
}

/// Result of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(Handler),
    MethodNotAllowed { allow: &'static str },
    NotFound,
}

/// `(path, method) → handler` table.
#[derive(Debug, Default)]
pub struct UrlTable {
    routes: HashMap<(String, Method), Handler>,
    allow: HashMap<String, &'static str>,
}

impl UrlTable {
    pub fn register_aggregate(&mut self, path: &str) {
        let path = normalize_path(path);
        for (method, handler) in [
            (Method::Describe, Handler::Describe),
            (Method::Setup, Handler::Refuse(459)),
            (Method::Play, Handler::Play),
            (Method::Pause, Handler::Refuse(405)),
            (Method::Teardown, Handler::Teardown),
        ] {
            self.routes.insert((path.clone(), method), handler);
        }
        self.allow.insert(path, AGGREGATE_ALLOW);
    }

    pub fn register_track(&mut self, path: &str, stream: StreamId) {
        let path = normalize_path(path);
        for (method, handler) in [
            (Method::Describe, Handler::Refuse(460)),
            (Method::Setup, Handler::TrackSetup(stream)),
            (Method::Play, Handler::Refuse(460)),
            (Method::Pause, Handler::Refuse(405)),
            (Method::Teardown, Handler::TrackTeardown(stream)),
        ] {
            self.routes.insert((path.clone(), method), handler);
        }
        self.allow.insert(path, TRACK_ALLOW);
    }

    pub fn unregister(&mut self, path: &str) {
        let path = normalize_path(path);
        self.routes.retain(|(p, _), _| *p != path);
        self.allow.remove(&path);
    }

    pub fn lookup(&self, path: &str, method: &Method) -> Lookup {
        let path = normalize_path(path);
        let Some(allow) = self.allow.get(&path) else {
            return Lookup::NotFound;
        };
        match self.routes.get(&(path, method.clone())) {
            Some(handler) => Lookup::Found(*handler),
            None => Lookup::MethodNotAllowed { allow },
        }
    }

    /// `Allow` list of a registered path.
    pub fn allow(&self, path: &str) -> Option<&'static str> {
        self.allow.get(&normalize_path(path)).copied()
    }
}

/// Leading slash, no trailing slash except for the root.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

/// Path of the track URL of `stream` under `aggregate`.
pub fn track_path(aggregate: &str, stream: StreamId) -> String {
    let aggregate = normalize_path(aggregate);
    if aggregate == "/" {
        format!("/trackID={stream}")
    } else {
        format!("{aggregate}/trackID={stream}")
    }
}

/// State shared by every control connection of a server.
pub struct RtspControl {
    path: String,
    urls: RwLock<UrlTable>,
    sessions: SessionRegistry,
    output: Arc<RtpOutput>,
    descriptor: RwLock<SessionDescriptor>,
    ttl: u8,
}

impl RtspControl {
    pub fn new(
        path: &str,
        output: Arc<RtpOutput>,
        sessions: SessionRegistry,
        descriptor: SessionDescriptor,
    ) -> Self {
        let path = normalize_path(path);
        let mut urls = UrlTable::default();
        urls.register_aggregate(&path);
        let ttl = descriptor.ttl.unwrap_or(1);
        Self {
            path,
            urls: RwLock::new(urls),
            sessions,
            output,
            descriptor: RwLock::new(descriptor),
            ttl,
        }
    }

    /// Path of the aggregate URL.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn output(&self) -> &Arc<RtpOutput> {
        &self.output
    }

    /// Publish the track URL of a stream.
    pub fn add_track(&self, stream: StreamId) {
        let path = track_path(&self.path, stream);
        tracing::debug!(track = %stream, %path, "track URL registered");
        self.urls.write().register_track(&path, stream);
        self.descriptor.write().bump_version();
    }

    /// Withdraw the track URL of a stream and unbind it from every session.
    /// The stream itself stays registered with the output.
    pub fn remove_track(&self, stream: StreamId) {
        self.urls.write().unregister(&track_path(&self.path, stream));
        self.descriptor.write().bump_version();

        let removed = self.sessions.lock().remove_stream(stream);
        for (session_id, track) in removed {
            if track.sink.is_unicast() {
                self.output.remove_sink(stream, track.sink.sink());
                track.sink.sink().retire();
            }
            tracing::debug!(session_id, track = %stream, "track unbound by stream removal");
        }
    }

    /// Full SDP of the published streams, as sent from `origin`. With
    /// `control`, media sections carry `a=control:trackID=<n>`.
    pub fn sdp(&self, origin: IpAddr, control: bool) -> Result<String> {
        let media: Vec<MediaLine> = self
            .output
            .stream_ids()
            .into_iter()
            .filter_map(|id| self.output.params(id).map(|params| (id, params)))
            .map(|(id, params)| MediaLine {
                media: params.media,
                port: params.multicast.map_or(0, |dest| dest.port()),
                payload_type: params.payload_type,
                encoding: params.encoding,
                clock_rate: params.clock_rate,
                fmtp: params.fmtp,
                control: control.then(|| format!("trackID={id}")),
            })
            .collect();
        self.descriptor.read().sdp(origin, &media)
    }

    /// Answer one request. Every response echoes `CSeq` and forbids caching.
    pub fn handle(&self, request: &RtspRequest, peer: &Peer) -> RtspResponse {
        let mut response = self.dispatch(request, peer);
        if let Some(cseq) = request.cseq() {
            let at = response.headers.len().min(1);
            response
                .headers
                .insert(at, ("CSeq".to_string(), cseq.to_string()));
        }
        response.add_header("Cache-Control", "no-cache")
    }

    fn dispatch(&self, request: &RtspRequest, peer: &Peer) -> RtspResponse {
        if let Some(require) = request.get_header("Require") {
            tracing::debug!(peer = %peer.remote, require, "unsupported Require");
            return RtspResponse::new(551).add_header("Unsupported", require);
        }

        let path = request.path();
        let handler = match self.urls.read().lookup(path, &request.method) {
            Lookup::Found(handler) => handler,
            Lookup::NotFound => {
                tracing::debug!(peer = %peer.remote, path, "unknown URL");
                return RtspResponse::not_found();
            }
            Lookup::MethodNotAllowed { allow } => {
                return RtspResponse::new(405).add_header("Allow", allow);
            }
        };

        match handler {
            Handler::Describe => self.describe(request, peer),
            Handler::Play => self.play(request),
            Handler::Teardown => self.teardown(request),
            Handler::TrackSetup(stream) => self.setup(request, peer, stream),
            Handler::TrackTeardown(stream) => self.track_teardown(request, stream),
            Handler::Refuse(405) => {
                let allow = self.urls.read().allow(path).unwrap_or(AGGREGATE_ALLOW);
                RtspResponse::new(405).add_header("Allow", allow)
            }
            Handler::Refuse(status) => RtspResponse::new(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/live/"), "/live");
        assert_eq!(normalize_path("live"), "/live");
        assert_eq!(track_path("/", StreamId(0)), "/trackID=0");
        assert_eq!(track_path("/live/", StreamId(2)), "/live/trackID=2");
    }

    #[test]
    fn aggregate_routes() {
        let mut table = UrlTable::default();
        table.register_aggregate("/live");
        assert_eq!(
            table.lookup("/live/", &Method::Describe),
            Lookup::Found(Handler::Describe)
        );
        assert_eq!(
            table.lookup("/live", &Method::Setup),
            Lookup::Found(Handler::Refuse(459))
        );
        assert_eq!(
            table.lookup("/live", &Method::Other("OPTIONS".to_string())),
            Lookup::MethodNotAllowed {
                allow: AGGREGATE_ALLOW
            }
        );
        assert_eq!(table.lookup("/other", &Method::Describe), Lookup::NotFound);
    }

    #[test]
    fn track_routes() {
        let mut table = UrlTable::default();
        table.register_aggregate("/");
        table.register_track("/trackID=3", StreamId(3));
        assert_eq!(
            table.lookup("/trackID=3", &Method::Setup),
            Lookup::Found(Handler::TrackSetup(StreamId(3)))
        );
        assert_eq!(
            table.lookup("/trackID=3", &Method::Play),
            Lookup::Found(Handler::Refuse(460))
        );
        assert_eq!(table.allow("/trackID=3"), Some(TRACK_ALLOW));

        table.unregister("/trackID=3");
        assert_eq!(table.lookup("/trackID=3", &Method::Setup), Lookup::NotFound);
        assert_eq!(
            table.lookup("/", &Method::Play),
            Lookup::Found(Handler::Play)
        );
    }
}
