use std::net::SocketAddr;
use std::sync::Arc;

use super::{Peer, RtspControl};
use crate::error::CastError;
use crate::output::StreamId;
use crate::protocol::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::transport::{self, Delivery};
use crate::session::{self, SessionTrack, TrackSink};
use crate::transport::udp::{SinkOptions, UdpSink};

/// What the `Session` request header says.
enum SessionRef {
    Absent,
    Known(u64),
    Unknown,
}

impl RtspControl {
    fn session_ref(&self, request: &RtspRequest) -> SessionRef {
        let Some(value) = request.get_header("Session") else {
            return SessionRef::Absent;
        };
        match session::parse_session_header(value) {
            Some(id) if self.sessions.lock().get(id).is_some() => SessionRef::Known(id),
            _ => SessionRef::Unknown,
        }
    }

    pub(super) fn describe(&self, request: &RtspRequest, peer: &Peer) -> RtspResponse {
        let sdp = match self.sdp(peer.local.ip(), true) {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::error!(error = %e, "cannot build SDP");
                return RtspResponse::new(500);
            }
        };

        let base = match request.base() {
            Some(base) => base.to_string(),
            None => format!("rtsp://{}", peer.local),
        };
        let mut content_base = format!("{base}{}", self.path);
        if !content_base.ends_with('/') {
            content_base.push('/');
        }

        RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &content_base)
            .with_body(sdp)
    }

    pub(super) fn play(&self, request: &RtspRequest) -> RtspResponse {
        let SessionRef::Known(id) = self.session_ref(request) else {
            return RtspResponse::ok();
        };

        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return RtspResponse::ok();
        };
        if !session.playing {
            session.playing = true;
            for track in session.tracks.iter().filter(|t| t.sink.is_unicast()) {
                if let Err(e) = self.output.add_sink(track.stream, track.sink.sink().clone()) {
                    tracing::warn!(session_id = id, track = %track.stream, error = %e, "cannot start track");
                }
            }
            tracing::info!(session_id = id, tracks = session.tracks.len(), "session playing");
        }
        RtspResponse::ok().add_header("Session", &session::header_value(id))
    }

    pub(super) fn teardown(&self, request: &RtspRequest) -> RtspResponse {
        let SessionRef::Known(id) = self.session_ref(request) else {
            return RtspResponse::ok();
        };

        let Some(session) = self.sessions.lock().remove(id) else {
            return RtspResponse::ok();
        };
        self.release(&session.tracks);
        tracing::info!(session_id = id, "session torn down");
        RtspResponse::ok().add_header("Session", &session::header_value(id))
    }

    pub(super) fn track_teardown(&self, request: &RtspRequest, stream: StreamId) -> RtspResponse {
        // Same as the aggregate URL: nothing to tear down is not an error.
        let SessionRef::Known(id) = self.session_ref(request) else {
            return RtspResponse::ok();
        };

        let removed = self.sessions.lock().remove_track(id, stream);
        if let Some(track) = removed {
            self.release(std::slice::from_ref(&track));
            tracing::info!(session_id = id, track = %stream, "track torn down");
        }
        RtspResponse::ok().add_header("Session", &session::header_value(id))
    }

    /// Unsubscribe and close the unicast sinks of `tracks`. Multicast sinks
    /// belong to the output and keep running.
    fn release(&self, tracks: &[SessionTrack]) {
        for track in tracks.iter().filter(|t| t.sink.is_unicast()) {
            self.output.remove_sink(track.stream, track.sink.sink());
            track.sink.sink().retire();
        }
    }

    pub(super) fn setup(&self, request: &RtspRequest, peer: &Peer, stream: StreamId) -> RtspResponse {
        let requested = match self.session_ref(request) {
            SessionRef::Absent => None,
            SessionRef::Known(id) => Some(id),
            SessionRef::Unknown => {
                let value = request.get_header("Session").unwrap_or_default();
                return RtspResponse::from_error(&CastError::SessionNotFound(value.to_string()));
            }
        };
        let Some(header) = request.get_header("Transport") else {
            return RtspResponse::from_error(&CastError::UnsupportedTransport(String::new()));
        };

        let mut failure = CastError::UnsupportedTransport(header.to_string());
        for (raw, choice) in transport::choices(header) {
            let choice = match choice {
                Ok(choice) => choice,
                Err(skip) => {
                    tracing::debug!(transport = raw, reason = %skip, "transport choice skipped");
                    continue;
                }
            };

            let (sink, reply) = match choice.delivery {
                Delivery::Multicast => {
                    let Some(sink) = self.output.multicast_sink(stream) else {
                        tracing::debug!(transport = raw, "no multicast destination, skipped");
                        continue;
                    };
                    let reply = transport::multicast_reply(sink.dest(), self.ttl);
                    (TrackSink::Multicast(sink), reply)
                }
                Delivery::Unicast => {
                    let dest = SocketAddr::new(peer.remote.ip(), choice.client_ports.0);
                    let options = SinkOptions {
                        ttl: None,
                        dscp: self.output.config().sink.dscp,
                    };
                    let sink = match UdpSink::open(dest, options) {
                        Ok(sink) => Arc::new(sink),
                        Err(e) => {
                            tracing::warn!(%dest, error = %e, "cannot open client sink, choice skipped");
                            failure = e;
                            continue;
                        }
                    };
                    let local = sink.local_addr().ip();
                    let source = (local != peer.local.ip()).then_some(local);
                    let reply =
                        transport::unicast_reply(choice.client_ports.0, sink.server_ports().0, source);
                    (TrackSink::Unicast(sink), reply)
                }
            };

            return self.bind(requested, stream, sink, &reply);
        }

        tracing::debug!(track = %stream, error = %failure, "no acceptable transport");
        RtspResponse::from_error(&failure)
    }

    /// Record `sink` as the track of `stream` in the requested (or a new)
    /// session.
    fn bind(
        &self,
        requested: Option<u64>,
        stream: StreamId,
        sink: TrackSink,
        reply: &str,
    ) -> RtspResponse {
        let mut sessions = self.sessions.lock();
        let id = match requested {
            Some(id) if sessions.get(id).is_some() => id,
            // Torn down by another connection since the lookup.
            Some(id) => {
                drop(sessions);
                if sink.is_unicast() {
                    sink.sink().close();
                }
                return RtspResponse::from_error(&CastError::SessionNotFound(id.to_string()));
            }
            None => sessions.create(),
        };

        let playing = sessions.get(id).is_some_and(|s| s.playing);
        let old = sessions.set_track(
            id,
            SessionTrack {
                stream,
                sink: sink.clone(),
            },
        );
        if let Some(old) = old.as_ref().filter(|t| t.sink.is_unicast()) {
            self.output.remove_sink(stream, old.sink.sink());
        }
        if playing
            && sink.is_unicast()
            && let Err(e) = self.output.add_sink(stream, sink.sink().clone())
        {
            tracing::warn!(session_id = id, track = %stream, error = %e, "cannot start track");
        }
        drop(sessions);

        if let Some(old) = old.filter(|t| t.sink.is_unicast()) {
            old.sink.sink().retire();
        }

        tracing::info!(
            session_id = id,
            track = %stream,
            dest = %sink.sink().dest(),
            unicast = sink.is_unicast(),
            "track set up"
        );
        RtspResponse::ok()
            .add_header("Transport", reply)
            .add_header("Session", &session::header_value(id))
    }
}
