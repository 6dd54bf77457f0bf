//! RTSP session registry (RFC 2326 §3, §12.37).
//!
//! An RTSP session is created by the first SETUP without a `Session` header
//! and binds stream ids of the [`RtpOutput`](crate::output::RtpOutput) to
//! sinks. It tracks:
//!
//! - A random 64-bit identifier, printed in decimal in the `Session` header.
//!   Identifiers are never reused during the life of a registry.
//! - Whether the client has issued PLAY.
//! - One [`SessionTrack`] per SETUP'd stream.
//!
//! ## Session lifecycle
//!
//! ```text
//! SETUP (no Session header)  -> created, not playing
//! PLAY                       -> playing, sinks subscribed
//! TEARDOWN (aggregate)       -> removed
//! TEARDOWN of last track     -> removed
//! stream deleted by producer -> its tracks removed; empty sessions removed
//! ```
//!
//! All mutations go through one mutex ([`SessionRegistry::lock`]). It only
//! guards memory: callers open and close sockets outside of it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rand::RngExt;

use crate::output::StreamId;
use crate::transport::udp::UdpSink;

/// Timeout advertised in the `Session` header, in seconds.
pub const SESSION_TIMEOUT_SECS: u64 = 5;

/// Where a session's track is delivered.
#[derive(Debug, Clone)]
pub enum TrackSink {
    /// A sink opened for this client only.
    Unicast(Arc<UdpSink>),
    /// The stream's shared multicast sink.
    Multicast(Arc<UdpSink>),
}

impl TrackSink {
    pub fn sink(&self) -> &Arc<UdpSink> {
        match self {
            Self::Unicast(sink) | Self::Multicast(sink) => sink,
        }
    }

    pub fn is_unicast(&self) -> bool {
        matches!(self, Self::Unicast(_))
    }
}

/// One stream bound to one sink within a session.
#[derive(Debug, Clone)]
pub struct SessionTrack {
    pub stream: StreamId,
    pub sink: TrackSink,
}

/// A single RTSP session.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub playing: bool,
    pub tracks: Vec<SessionTrack>,
}

impl Session {
    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"42;timeout=5"`
    pub fn header_value(&self) -> String {
        header_value(self.id)
    }

    pub fn track(&self, stream: StreamId) -> Option<&SessionTrack> {
        self.tracks.iter().find(|t| t.stream == stream)
    }
}

/// `Session` header value for `id`.
pub fn header_value(id: u64) -> String {
    format!("{id};timeout={SESSION_TIMEOUT_SECS}")
}

/// Extract the identifier from a `Session` request header, ignoring
/// parameters such as `;timeout=`.
pub fn parse_session_header(value: &str) -> Option<u64> {
    value.split(';').next()?.trim().parse().ok()
}

/// The sessions of one server, guarded by [`SessionRegistry`].
#[derive(Debug, Default)]
pub struct Sessions {
    sessions: Vec<Session>,
    /// Every identifier handed out, live or not.
    issued: HashSet<u64>,
}

impl Sessions {
    /// Create an empty session under a fresh identifier.
    pub fn create(&mut self) -> u64 {
        let mut rng = rand::rng();
        let id = loop {
            let candidate = rng.random::<u64>();
            if candidate != 0 && self.issued.insert(candidate) {
                break candidate;
            }
        };
        self.sessions.push(Session {
            id,
            playing: false,
            tracks: Vec::new(),
        });
        tracing::debug!(session_id = id, total_sessions = self.sessions.len(), "session created");
        id
    }

    pub fn get(&self, id: u64) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Remove a session (TEARDOWN of the aggregate URL).
    pub fn remove(&mut self, id: u64) -> Option<Session> {
        let pos = self.sessions.iter().position(|s| s.id == id)?;
        let session = self.sessions.swap_remove(pos);
        tracing::debug!(session_id = id, total_sessions = self.sessions.len(), "session removed");
        Some(session)
    }

    /// Bind `track` in session `id`, returning the track it replaces.
    pub fn set_track(&mut self, id: u64, track: SessionTrack) -> Option<SessionTrack> {
        let session = self.get_mut(id)?;
        match session.tracks.iter_mut().find(|t| t.stream == track.stream) {
            Some(existing) => Some(std::mem::replace(existing, track)),
            None => {
                session.tracks.push(track);
                None
            }
        }
    }

    /// Remove the track bound to `stream` from session `id`. A session left
    /// without tracks is removed too.
    pub fn remove_track(&mut self, id: u64, stream: StreamId) -> Option<SessionTrack> {
        let session = self.get_mut(id)?;
        let pos = session.tracks.iter().position(|t| t.stream == stream)?;
        let track = session.tracks.remove(pos);
        if session.tracks.is_empty() {
            self.remove(id);
        }
        Some(track)
    }

    /// Drop every reference to a deleted stream. Returns the removed tracks
    /// along with their session ids.
    pub fn remove_stream(&mut self, stream: StreamId) -> Vec<(u64, SessionTrack)> {
        let mut removed = Vec::new();
        for session in &mut self.sessions {
            let mut i = 0;
            while i < session.tracks.len() {
                if session.tracks[i].stream == stream {
                    removed.push((session.id, session.tracks.remove(i)));
                } else {
                    i += 1;
                }
            }
        }
        let before = self.sessions.len();
        self.sessions
            .retain(|s| !s.tracks.is_empty() || !removed.iter().any(|(id, _)| *id == s.id));
        if before != self.sessions.len() {
            tracing::debug!(
                stream = %stream,
                removed_sessions = before - self.sessions.len(),
                "sessions emptied by stream removal"
            );
        }
        removed
    }

    /// Remove every session.
    pub fn drain(&mut self) -> Vec<Session> {
        std::mem::take(&mut self.sessions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Thread-safe handle on the session registry.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry. Do not perform blocking I/O while holding it.
    pub fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::SinkOptions;
    use std::net::UdpSocket;

    fn sink() -> Arc<UdpSink> {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        Arc::new(UdpSink::open(socket.local_addr().unwrap(), SinkOptions::default()).unwrap())
    }

    fn unicast(stream: u32) -> SessionTrack {
        SessionTrack {
            stream: StreamId(stream),
            sink: TrackSink::Unicast(sink()),
        }
    }

    #[test]
    fn header_round_trip() {
        assert_eq!(header_value(42), "42;timeout=5");
        assert_eq!(parse_session_header("42;timeout=5"), Some(42));
        assert_eq!(parse_session_header(" 17 "), Some(17));
        assert_eq!(parse_session_header("abc"), None);
    }

    #[test]
    fn identifiers_are_unique() {
        let registry = SessionRegistry::new();
        let mut reg = registry.lock();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(reg.create()));
        }
        assert_eq!(reg.len(), 1000);
    }

    #[test]
    fn identifiers_not_reused_after_removal() {
        let mut sessions = Sessions::default();
        let id = sessions.create();
        sessions.remove(id).unwrap();
        assert!(sessions.issued.contains(&id));
        assert!(sessions.get(id).is_none());
    }

    #[test]
    fn setup_replaces_track_of_same_stream() {
        let mut sessions = Sessions::default();
        let id = sessions.create();
        assert!(sessions.set_track(id, unicast(0)).is_none());
        let old = sessions.set_track(id, unicast(0)).unwrap();
        assert_eq!(old.stream, StreamId(0));
        assert_eq!(sessions.get(id).unwrap().tracks.len(), 1);
    }

    #[test]
    fn setup_then_teardown_leaves_tracks_unchanged() {
        let mut sessions = Sessions::default();
        let id = sessions.create();
        sessions.set_track(id, unicast(0));
        let before: Vec<StreamId> = sessions.get(id).unwrap().tracks.iter().map(|t| t.stream).collect();

        sessions.set_track(id, unicast(1));
        sessions.remove_track(id, StreamId(1)).unwrap();

        let after: Vec<StreamId> = sessions.get(id).unwrap().tracks.iter().map(|t| t.stream).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn removing_last_track_removes_session() {
        let mut sessions = Sessions::default();
        let id = sessions.create();
        sessions.set_track(id, unicast(3));
        sessions.remove_track(id, StreamId(3)).unwrap();
        assert!(sessions.get(id).is_none());
        assert!(sessions.is_empty());
    }

    #[test]
    fn stream_removal_walks_every_session() {
        let mut sessions = Sessions::default();
        let a = sessions.create();
        let b = sessions.create();
        sessions.set_track(a, unicast(0));
        sessions.set_track(a, unicast(1));
        sessions.set_track(b, unicast(1));

        let removed = sessions.remove_stream(StreamId(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(sessions.get(a).unwrap().tracks.len(), 1);
        assert!(sessions.get(b).is_none());
    }
}
