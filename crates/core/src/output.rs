//! The RTP output.
//!
//! One [`RtpOutput`] owns every outgoing stream ("track") of a server: its
//! packetiser, its list of subscribed sinks and, for multicast streams, the
//! sink shared by every client. Streams are addressed by [`StreamId`]
//! handles; sessions refer to them by handle only.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use crate::clock::Mtime;
use crate::config::ServerConfig;
use crate::error::{CastError, Result};
use crate::media::block::Block;
use crate::media::packetizer::{AggregatingPacketizer, Packetizer, RawPacketizer};
use crate::media::rtp::{PT_MP2T, RtpHeader};
use crate::transport::sender::{self, Outgoing, Pacer, SenderShared, SenderStats};
use crate::transport::udp::{SinkOptions, UdpSink};

/// Handle of one outgoing stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Description of a stream, as advertised in SDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// SDP media type (`video`, `audio`, ...).
    pub media: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Encoding name for `a=rtpmap`; `None` for static payload types that
    /// need no mapping.
    pub encoding: Option<String>,
    /// Parameters for `a=fmtp`.
    pub fmtp: Option<String>,
    /// Fixed multicast destination. Such a stream is always sent there and
    /// clients only reference the shared sink.
    pub multicast: Option<SocketAddr>,
}

impl StreamParams {
    /// MPEG2 transport stream, payload type 33, 90 kHz.
    pub fn mpeg_ts() -> Self {
        Self {
            media: "video".to_string(),
            payload_type: PT_MP2T,
            clock_rate: 90_000,
            encoding: Some("MP2T".to_string()),
            fmtp: None,
            multicast: None,
        }
    }

    pub fn with_multicast(mut self, dest: SocketAddr) -> Self {
        self.multicast = Some(dest);
        self
    }
}

impl Default for StreamParams {
    fn default() -> Self {
        Self::mpeg_ts()
    }
}

/// Settings of an [`RtpOutput`], derived from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct OutputConfig {
    pub mtu: usize,
    /// Microseconds added to each dts to get its send deadline.
    pub caching: Mtime,
    pub group: u32,
    pub raw: bool,
    pub sink: SinkOptions,
}

impl From<&ServerConfig> for OutputConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            mtu: config.mtu,
            caching: config.caching_us(),
            group: config.group,
            raw: config.raw,
            sink: SinkOptions {
                ttl: config.ttl,
                dscp: config.dscp,
            },
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// One outgoing stream.
pub(crate) struct Track {
    params: StreamParams,
    ssrc: u32,
    packetizer: Mutex<Box<dyn Packetizer>>,
    sinks: Mutex<Vec<Arc<UdpSink>>>,
    multicast: Option<Arc<UdpSink>>,
}

impl Track {
    pub(crate) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Every sink the next packet goes to. The lock is only held for the copy.
    pub(crate) fn snapshot_sinks(&self) -> Vec<Arc<UdpSink>> {
        let sinks = self.sinks.lock();
        let mut out = Vec::with_capacity(sinks.len() + 1);
        out.extend(self.multicast.iter().cloned());
        out.extend(sinks.iter().cloned());
        out
    }

    fn close_all(&self) {
        let sinks = std::mem::take(&mut *self.sinks.lock());
        for sink in sinks.iter().chain(self.multicast.iter()) {
            sink.retire();
        }
    }
}

/// Arena of tracks keyed by [`StreamId`].
#[derive(Default)]
pub(crate) struct TrackTable {
    tracks: RwLock<HashMap<StreamId, Arc<Track>>>,
}

impl TrackTable {
    pub(crate) fn get(&self, id: StreamId) -> Option<Arc<Track>> {
        self.tracks.read().get(&id).cloned()
    }

    fn insert(&self, id: StreamId, track: Arc<Track>) {
        self.tracks.write().insert(id, track);
    }

    fn remove(&self, id: StreamId) -> Option<Arc<Track>> {
        self.tracks.write().remove(&id)
    }

    fn drain(&self) -> Vec<Arc<Track>> {
        self.tracks.write().drain().map(|(_, t)| t).collect()
    }

    fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.tracks.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Packetises the streams pushed by producers and hands them to one sender
/// thread.
pub struct RtpOutput {
    config: OutputConfig,
    tracks: Arc<TrackTable>,
    shared: Arc<SenderShared>,
    next_id: AtomicU32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RtpOutput {
    /// Create the output and start its sender thread.
    pub fn new(config: OutputConfig) -> Result<Self> {
        let tracks = Arc::new(TrackTable::default());
        let shared = Arc::new(SenderShared::new(config.mtu, tracks.clone()));
        let pacer = Pacer::new(config.caching, config.group);

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("rtp-sender".to_string())
                .spawn(move || sender::run(shared, pacer))
                .map_err(|source| CastError::Spawn {
                    name: "rtp-sender",
                    source,
                })?
        };

        tracing::debug!(
            mtu = config.mtu,
            caching_us = config.caching,
            group = config.group,
            raw = config.raw,
            "RTP output started"
        );

        Ok(Self {
            config,
            tracks,
            shared,
            next_id: AtomicU32::new(0),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Register a new stream. A multicast stream opens its shared sink now
    /// and starts sending there immediately.
    pub fn add_stream(&self, params: StreamParams) -> Result<StreamId> {
        if self.shared.die.load(Ordering::SeqCst) {
            return Err(CastError::ShuttingDown);
        }

        let header = RtpHeader::with_random_ssrc(params.payload_type, params.clock_rate);
        let ssrc = header.ssrc;
        let packetizer: Box<dyn Packetizer> = if self.config.raw {
            Box::new(RawPacketizer::new(header))
        } else {
            Box::new(AggregatingPacketizer::new(
                header,
                self.config.mtu,
                self.config.caching,
            ))
        };

        let multicast = match params.multicast {
            Some(dest) => Some(Arc::new(UdpSink::open(dest, self.config.sink)?)),
            None => None,
        };

        let id = StreamId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::info!(
            stream = %id,
            ssrc = format_args!("{:#010X}", ssrc),
            pt = params.payload_type,
            multicast = ?params.multicast,
            "stream added"
        );

        self.tracks.insert(
            id,
            Arc::new(Track {
                params,
                ssrc,
                packetizer: Mutex::new(packetizer),
                sinks: Mutex::new(Vec::new()),
                multicast,
            }),
        );
        Ok(id)
    }

    /// Delete a stream. Every sink gets a final RTCP BYE and is closed.
    pub fn remove_stream(&self, id: StreamId) -> Result<()> {
        let track = self.tracks.remove(id).ok_or(CastError::StreamNotFound(id.0))?;
        track.close_all();
        tracing::info!(stream = %id, "stream removed");
        Ok(())
    }

    /// Feed one block of the stream. Resulting packets are queued in order.
    pub fn push(&self, id: StreamId, block: Block) -> Result<()> {
        if self.shared.die.load(Ordering::SeqCst) {
            return Err(CastError::ShuttingDown);
        }
        let track = self.tracks.get(id).ok_or(CastError::StreamNotFound(id.0))?;

        // Enqueue under the packetiser lock to keep emission order.
        let mut packetizer = track.packetizer.lock();
        for packet in packetizer.packetize(block, &self.shared.pool) {
            self.shared.queue.push(Outgoing { stream: id, packet });
        }
        Ok(())
    }

    /// Queue the partially filled packet of the stream, if any.
    pub fn flush(&self, id: StreamId) -> Result<()> {
        let track = self.tracks.get(id).ok_or(CastError::StreamNotFound(id.0))?;
        let mut packetizer = track.packetizer.lock();
        if let Some(packet) = packetizer.flush() {
            self.shared.queue.push(Outgoing { stream: id, packet });
        }
        Ok(())
    }

    /// Subscribe a sink. Returns `false` if it was already subscribed.
    pub fn add_sink(&self, id: StreamId, sink: Arc<UdpSink>) -> Result<bool> {
        let track = self.tracks.get(id).ok_or(CastError::StreamNotFound(id.0))?;
        if track.multicast.as_ref().is_some_and(|m| Arc::ptr_eq(m, &sink)) {
            return Ok(false);
        }
        let mut sinks = track.sinks.lock();
        if sinks.iter().any(|s| Arc::ptr_eq(s, &sink)) {
            return Ok(false);
        }
        tracing::debug!(stream = %id, dest = %sink.dest(), "sink subscribed");
        sinks.push(sink);
        Ok(true)
    }

    /// Unsubscribe a sink. Returns `false` if it was not subscribed.
    pub fn remove_sink(&self, id: StreamId, sink: &Arc<UdpSink>) -> bool {
        let Some(track) = self.tracks.get(id) else {
            return false;
        };
        let mut sinks = track.sinks.lock();
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        let removed = sinks.len() != before;
        if removed {
            tracing::debug!(stream = %id, dest = %sink.dest(), "sink unsubscribed");
        }
        removed
    }

    /// Unicast sinks currently subscribed to the stream.
    pub fn sinks(&self, id: StreamId) -> Vec<Arc<UdpSink>> {
        self.tracks
            .get(id)
            .map(|t| t.sinks.lock().clone())
            .unwrap_or_default()
    }

    /// Shared sink of a multicast stream.
    pub fn multicast_sink(&self, id: StreamId) -> Option<Arc<UdpSink>> {
        self.tracks.get(id).and_then(|t| t.multicast.clone())
    }

    pub fn params(&self, id: StreamId) -> Option<StreamParams> {
        self.tracks.get(id).map(|t| t.params.clone())
    }

    pub fn ssrc(&self, id: StreamId) -> Option<u32> {
        self.tracks.get(id).map(|t| t.ssrc)
    }

    /// Registered streams in creation order.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.tracks.ids()
    }

    pub fn stats(&self) -> SenderStats {
        self.shared.counters.snapshot()
    }

    /// Stop the sender thread, then say goodbye on and close every sink.
    pub fn shutdown(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.shared.wake_for_exit();
        if handle.join().is_err() {
            tracing::error!("sender thread panicked");
        }
        for track in self.tracks.drain() {
            track.close_all();
        }
        tracing::debug!("RTP output stopped");
    }
}

impl Drop for RtpOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mdate;
    use crate::media::rtp;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn output() -> RtpOutput {
        RtpOutput::new(OutputConfig {
            caching: 0,
            ..OutputConfig::default()
        })
        .unwrap()
    }

    fn receiver() -> (UdpSocket, Arc<UdpSink>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let sink = UdpSink::open(socket.local_addr().unwrap(), SinkOptions::default()).unwrap();
        (socket, Arc::new(sink))
    }

    #[test]
    fn stream_ids_are_distinct() {
        let out = output();
        let a = out.add_stream(StreamParams::mpeg_ts()).unwrap();
        let b = out.add_stream(StreamParams::mpeg_ts()).unwrap();
        assert_ne!(a, b);
        assert_eq!(out.stream_ids(), vec![a, b]);
        assert_ne!(out.ssrc(a), out.ssrc(b));
    }

    #[test]
    fn packets_reach_subscribed_sink() {
        let out = output();
        let id = out.add_stream(StreamParams::mpeg_ts()).unwrap();
        let (socket, sink) = receiver();
        assert!(out.add_sink(id, sink.clone()).unwrap());
        assert!(!out.add_sink(id, sink.clone()).unwrap());

        let now = mdate();
        for i in 0..14 {
            out.push(id, Block::new(vec![0x47; 188], now + i * 1000)).unwrap();
        }
        out.flush(id).unwrap();

        let mut buf = [0u8; 2048];
        let mut seqs = Vec::new();
        for _ in 0..2 {
            let n = socket.recv(&mut buf).unwrap();
            assert_eq!(n, 12 + 7 * 188);
            assert_eq!(buf[0], 0x80);
            assert_eq!(buf[1], 33);
            assert_eq!(rtp::ssrc_of(&buf[..n]), out.ssrc(id));
            seqs.extend(rtp::sequence_of(&buf[..n]));
        }
        assert_eq!(seqs[1], seqs[0].wrapping_add(1));
    }

    #[test]
    fn removed_sink_gets_nothing() {
        let out = output();
        let id = out.add_stream(StreamParams::mpeg_ts()).unwrap();
        let (socket, sink) = receiver();
        out.add_sink(id, sink.clone()).unwrap();
        assert!(out.remove_sink(id, &sink));
        assert!(!out.remove_sink(id, &sink));
        assert!(out.sinks(id).is_empty());

        out.push(id, Block::new(vec![0x47; 1316], mdate())).unwrap();
        out.flush(id).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 2048];
        assert!(socket.recv(&mut buf).is_err());
    }

    #[test]
    fn unknown_stream_is_an_error() {
        let out = output();
        assert!(matches!(
            out.push(StreamId(99), Block::default()),
            Err(CastError::StreamNotFound(99))
        ));
        assert!(out.remove_stream(StreamId(99)).is_err());
    }

    #[test]
    fn remove_stream_closes_sinks() {
        let out = output();
        let id = out.add_stream(StreamParams::mpeg_ts()).unwrap();
        let (_socket, sink) = receiver();
        out.add_sink(id, sink.clone()).unwrap();
        out.remove_stream(id).unwrap();
        assert!(sink.is_closed());
        assert!(out.stream_ids().is_empty());
    }

    #[test]
    fn multicast_stream_has_shared_sink() {
        let out = output();
        let params =
            StreamParams::mpeg_ts().with_multicast("239.255.12.42:5004".parse().unwrap());
        let id = match out.add_stream(params) {
            Ok(id) => id,
            // no multicast route on this host
            Err(CastError::SinkOpen { .. }) => return,
            Err(e) => panic!("{e}"),
        };
        let sink = out.multicast_sink(id).unwrap();
        assert_eq!(sink.dest().port(), 5004);
        // The shared sink is implicit, never a unicast subscription.
        assert!(!out.add_sink(id, sink).unwrap());
        assert!(out.sinks(id).is_empty());
    }

    #[test]
    fn shutdown_does_not_wait_for_pending_deadline() {
        let out = output();
        let id = out.add_stream(StreamParams::mpeg_ts()).unwrap();
        out.push(id, Block::new(vec![0x47; 188], mdate() + 60_000_000))
            .unwrap();
        out.flush(id).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        out.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let out = output();
        let id = out.add_stream(StreamParams::mpeg_ts()).unwrap();
        out.shutdown();
        assert!(matches!(
            out.push(id, Block::default()),
            Err(CastError::ShuttingDown)
        ));
        out.shutdown();
    }
}
