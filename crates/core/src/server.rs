use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::announce::sap::{self, SapHandle};
use crate::announce::{self, SapAnnouncer, SessionDescriptor};
use crate::config::ServerConfig;
use crate::error::{CastError, Result};
use crate::media::Block;
use crate::output::{OutputConfig, RtpOutput, StreamId, StreamParams};
use crate::rtsp::RtspControl;
use crate::session::SessionRegistry;
use crate::transport::SenderStats;
use crate::transport::tcp::{self, Connections};

/// Media port used when the multicast destination names none (RFC 3551).
pub const DEFAULT_MEDIA_PORT: u16 = 5004;

/// Everything that only exists while the server runs.
struct Running {
    control: Arc<RtspControl>,
    output: Arc<RtpOutput>,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    sap: Option<SapAnnouncer>,
    sap_handle: Option<SapHandle>,
}

/// High-level streaming server orchestrator.
///
/// Owns the RTP output, the session registry, the RTSP listener and,
/// when enabled, the SAP announcer. Producers register streams with
/// [`add_stream`](Self::add_stream) and feed them with
/// [`push`](Self::push); clients reach them through RTSP, or directly on
/// the multicast destination.
pub struct Server {
    config: ServerConfig,
    destination: Option<SocketAddr>,
    sessions: SessionRegistry,
    connections: Connections,
    running: Arc<AtomicBool>,
    multicast_streams: u16,
    state: Option<Running>,
}

impl Server {
    /// Validate `config` and pick the multicast destination.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let destination = match config.destination {
            Some(dest) if dest.port() == 0 => Some(SocketAddr::new(dest.ip(), DEFAULT_MEDIA_PORT)),
            Some(dest) => Some(dest),
            None if config.auto_mcast => {
                let ipv6 = config.rtsp_host.contains(':');
                let ip = announce::random_multicast(ipv6);
                tracing::info!(destination = %ip, "picked random multicast destination");
                Some(SocketAddr::new(ip, DEFAULT_MEDIA_PORT))
            }
            None => None,
        };

        Ok(Self {
            config,
            destination,
            sessions: SessionRegistry::new(),
            connections: Connections::default(),
            running: Arc::new(AtomicBool::new(false)),
            multicast_streams: 0,
            state: None,
        })
    }

    /// Start the RTP output, the RTSP listener and, if enabled, SAP.
    ///
    /// Nothing is left running when this fails.
    pub fn start(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(CastError::AlreadyRunning);
        }

        let output = Arc::new(RtpOutput::new(OutputConfig::from(&self.config))?);
        let descriptor = SessionDescriptor::from_config(&self.config, self.destination);
        let control = Arc::new(RtspControl::new(
            &self.config.rtsp_path,
            output.clone(),
            self.sessions.clone(),
            descriptor,
        ));

        let addr = self.config.rtsp_bind_addr();
        let listener = TcpListener::bind(&addr).map_err(|source| CastError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let sap = match self.destination {
            Some(dest) if self.config.sap => {
                sap::sap_address(dest.ip())?;
                Some(SapAnnouncer::new(self.config.ttl)?)
            }
            _ => {
                if self.config.sap {
                    tracing::warn!("SAP requested without a multicast destination, not announcing");
                }
                None
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let accept = {
            let control = control.clone();
            let connections = self.connections.clone();
            let running = self.running.clone();
            thread::Builder::new()
                .name("rtsp-accept".to_string())
                .spawn(move || tcp::accept_loop(listener, control, connections, running))
        };
        let accept = match accept {
            Ok(handle) => handle,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(CastError::Spawn {
                    name: "rtsp-accept",
                    source,
                });
            }
        };

        tracing::info!(
            addr = %local_addr,
            path = control.path(),
            destination = ?self.destination,
            sap = sap.is_some(),
            "RTSP server listening"
        );

        self.state = Some(Running {
            control,
            output,
            local_addr,
            accept,
            sap,
            sap_handle: None,
        });
        Ok(())
    }

    /// Register a stream. With a multicast destination, stream `n` is sent
    /// to port `base + 2n` of that group.
    pub fn add_stream(&mut self, mut params: StreamParams) -> Result<StreamId> {
        let state = self.state.as_ref().ok_or(CastError::NotStarted)?;

        if params.multicast.is_none()
            && let Some(dest) = self.destination
        {
            let port = dest
                .port()
                .checked_add(self.multicast_streams.saturating_mul(2))
                .ok_or(CastError::PortRangeExhausted)?;
            params.multicast = Some(SocketAddr::new(dest.ip(), port));
        }
        let multicast = params.multicast.is_some();

        let id = state.output.add_stream(params)?;
        state.control.add_track(id);
        if multicast {
            self.multicast_streams = self.multicast_streams.saturating_add(1);
        }
        self.refresh_announcement();
        Ok(id)
    }

    /// Delete a stream: unbind it from every session, then close its sinks.
    pub fn remove_stream(&mut self, id: StreamId) -> Result<()> {
        let state = self.state.as_ref().ok_or(CastError::NotStarted)?;
        state.control.remove_track(id);
        state.output.remove_stream(id)?;
        self.refresh_announcement();
        Ok(())
    }

    /// Feed one block of stream `id`.
    pub fn push(&self, id: StreamId, block: Block) -> Result<()> {
        self.output().ok_or(CastError::NotStarted)?.push(id, block)
    }

    /// Send the partially filled packet of stream `id`.
    pub fn flush(&self, id: StreamId) -> Result<()> {
        self.output().ok_or(CastError::NotStarted)?.flush(id)
    }

    /// The RTP output, while running.
    pub fn output(&self) -> Option<&Arc<RtpOutput>> {
        self.state.as_ref().map(|s| &s.output)
    }

    /// Re-announce the SDP after the stream set changed. SAP is best
    /// effort once the server runs.
    fn refresh_announcement(&mut self) {
        if let Err(e) = self.announce() {
            tracing::warn!(error = %e, "SAP announcement not updated");
        }
    }

    fn announce(&mut self) -> Result<()> {
        let Some(dest) = self.destination else {
            return Ok(());
        };
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        let Some(sap) = state.sap.as_ref() else {
            return Ok(());
        };

        if let Some(handle) = state.sap_handle.take() {
            sap.unregister(handle);
        }
        if state.output.stream_ids().is_empty() {
            return Ok(());
        }

        let origin = announce::source_address(dest).unwrap_or(state.local_addr.ip());
        let sdp = state.control.sdp(origin, false)?;
        state.sap_handle = Some(sap.register(dest.ip(), &sdp)?);
        Ok(())
    }

    /// Stop accepting clients, tear down every session and stop sending.
    pub fn stop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        tracing::info!("server stopping");

        self.running.store(false, Ordering::SeqCst);
        self.connections.shutdown_all();
        if state.accept.join().is_err() {
            tracing::error!("accept thread panicked");
        }
        // A request already past its read may still bind a track.
        self.connections.join_all();

        let sessions = self.sessions.lock().drain();
        for session in &sessions {
            for track in session.tracks.iter().filter(|t| t.sink.is_unicast()) {
                state.output.remove_sink(track.stream, track.sink.sink());
                track.sink.sink().retire();
            }
        }
        tracing::debug!(sessions = sessions.len(), "sessions closed");

        if let Some(sap) = state.sap {
            sap.shutdown();
        }
        state.output.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// Address the RTSP listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|s| s.local_addr)
    }

    /// Aggregate RTSP URL, as reachable on `host`.
    pub fn url(&self, host: IpAddr) -> Option<String> {
        let state = self.state.as_ref()?;
        let authority = SocketAddr::new(host, state.local_addr.port());
        Some(format!("rtsp://{authority}{}", state.control.path()))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Multicast destination of the first stream, if any.
    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> Option<SenderStats> {
        self.state.as_ref().map(|s| s.output.stats())
    }

    /// Current SDP of the session, as sent from `origin`.
    pub fn sdp(&self, origin: IpAddr) -> Result<String> {
        let state = self.state.as_ref().ok_or(CastError::NotStarted)?;
        state.control.sdp(origin, true)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            rtsp_host: "127.0.0.1".to_string(),
            rtsp_port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn lifecycle() {
        let mut server = Server::new(loopback_config()).unwrap();
        assert!(matches!(
            server.add_stream(StreamParams::mpeg_ts()),
            Err(CastError::NotStarted)
        ));

        server.start().unwrap();
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(CastError::AlreadyRunning)));
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let id = server.add_stream(StreamParams::mpeg_ts()).unwrap();
        let sdp = server.sdp("127.0.0.1".parse().unwrap()).unwrap();
        assert!(sdp.contains("a=control:trackID=0\r\n"));

        server.remove_stream(id).unwrap();
        assert!(matches!(
            server.remove_stream(id),
            Err(CastError::StreamNotFound(0))
        ));

        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn stop_waits_for_connections_before_closing_sessions() {
        use std::io::{Read, Write};
        use std::net::TcpStream;
        use std::time::Duration;

        let mut server = Server::new(loopback_config()).unwrap();
        server.start().unwrap();
        let id = server.add_stream(StreamParams::mpeg_ts()).unwrap();
        let addr = server.local_addr().unwrap();

        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        conn.write_all(
            format!(
                "SETUP rtsp://{addr}/trackID={id} RTSP/1.0\r\nCSeq: 1\r\n\
                 Transport: RTP/AVP;unicast;client_port=6100-6101\r\n\r\n"
            )
            .as_bytes(),
        )
        .unwrap();
        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("RTSP/1.0 200 OK"));
        assert_eq!(server.sessions().len(), 1);

        server.stop();
        assert!(server.sessions().is_empty());
        assert_eq!(conn.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn invalid_config_refused() {
        let config = ServerConfig {
            group: 0,
            ..loopback_config()
        };
        assert!(matches!(
            Server::new(config),
            Err(CastError::InvalidOption { .. })
        ));
    }

    #[test]
    fn auto_mcast_picks_ssm_group() {
        let config = ServerConfig {
            auto_mcast: true,
            ..loopback_config()
        };
        let server = Server::new(config).unwrap();
        let dest = server.destination().unwrap();
        assert_eq!(dest.port(), DEFAULT_MEDIA_PORT);
        assert!(crate::protocol::sdp::is_ssm(dest.ip()));
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            rtsp_port: taken.local_addr().unwrap().port(),
            ..loopback_config()
        };
        let mut server = Server::new(config).unwrap();
        assert!(matches!(server.start(), Err(CastError::Bind { .. })));
        assert!(!server.is_running());
    }
}
