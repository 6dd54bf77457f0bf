use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use rtpcast::clock::{self, Mtime};
use rtpcast::{Block, Server, ServerConfig, StreamId, StreamParams};
use tracing_subscriber::EnvFilter;

/// Seven MPEG-TS packets: the usual payload of one RTP packet.
const TS_CHUNK: usize = 7 * 188;

#[derive(Parser)]
#[command(
    name = "rtpcast",
    about = "RTSP server with paced RTP/UDP output and SAP announcements"
)]
struct Args {
    /// RTSP bind host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// RTSP bind port
    #[arg(long, short, default_value_t = 554)]
    port: u16,

    /// Path of the aggregate RTSP URL
    #[arg(long, default_value = "/")]
    path: String,

    /// Maximum UDP payload size, RTP header included
    #[arg(long)]
    mtu: Option<usize>,

    /// Send delay added to every timestamp, in milliseconds
    #[arg(long)]
    caching: Option<u64>,

    /// Packets sent back to back before waiting
    #[arg(long)]
    group: Option<u32>,

    /// One input block per RTP packet
    #[arg(long)]
    raw: bool,

    /// Multicast destination (ip:port)
    #[arg(long)]
    dst: Option<SocketAddr>,

    /// Pick a random source-specific multicast destination
    #[arg(long)]
    auto_mcast: bool,

    /// Multicast TTL
    #[arg(long)]
    ttl: Option<u8>,

    /// DSCP code point of media packets
    #[arg(long)]
    dscp: Option<u8>,

    /// Announce the session with SAP
    #[arg(long)]
    sap: bool,

    /// Session name
    #[arg(long)]
    name: Option<String>,

    /// Session description
    #[arg(long)]
    description: Option<String>,

    /// Extra option as key=value, may be repeated
    #[arg(long = "option", short = 'o', value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// MPEG-TS file to stream; without it the server only waits for Enter
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Bit rate of the input file, in bits per second
    #[arg(long, default_value_t = 4_000_000)]
    bitrate: u64,

    /// Restart the input file at its end
    #[arg(long = "loop")]
    repeat: bool,
}

impl Args {
    fn config(&self) -> rtpcast::Result<ServerConfig> {
        let mut config = ServerConfig {
            rtsp_host: self.host.clone(),
            rtsp_port: self.port,
            rtsp_path: self.path.clone(),
            raw: self.raw,
            auto_mcast: self.auto_mcast,
            ttl: self.ttl,
            dscp: self.dscp,
            sap: self.sap,
            destination: self.dst,
            description: self.description.clone(),
            ..ServerConfig::default()
        };
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if let Some(caching) = self.caching {
            config.caching_ms = caching;
        }
        if let Some(group) = self.group {
            config.group = group;
        }
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        for option in &self.options {
            config.apply(option)?;
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.start() {
        tracing::error!(error = %e, "failed to start server");
        return ExitCode::FAILURE;
    }
    let stream = match server.add_stream(StreamParams::mpeg_ts()) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "failed to add stream");
            return ExitCode::FAILURE;
        }
    };

    if let Some(addr) = server.local_addr() {
        tracing::info!(%addr, path = %args.path, "serving");
    }

    let code = match &args.input {
        Some(path) => match stream_file(&server, stream, path, args.bitrate, args.repeat) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "input failed");
                ExitCode::FAILURE
            }
        },
        None => {
            tracing::info!("press Enter to stop");
            let mut input = String::new();
            match io::stdin().read_line(&mut input) {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "cannot read stdin");
                    ExitCode::FAILURE
                }
            }
        }
    };

    server.stop();
    code
}

/// Feed `path` at `bitrate`, stamping each chunk with the time its first
/// byte is due.
fn stream_file(
    server: &Server,
    stream: StreamId,
    path: &Path,
    bitrate: u64,
    repeat: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let bitrate = bitrate.max(1);
    let lead = server.config().caching_us() / 2;

    loop {
        let mut file = File::open(path)?;
        let start = clock::mdate();
        let mut offset: u64 = 0;

        loop {
            let mut chunk = vec![0u8; TS_CHUNK];
            let n = read_full(&mut file, &mut chunk)?;
            if n == 0 {
                break;
            }
            chunk.truncate(n);

            let dts = start + (offset * 8 * 1_000_000 / bitrate) as Mtime;
            // Stay ahead of the sender without filling its queue.
            clock::wait_until(dts - lead);
            server.push(stream, Block::new(chunk, dts))?;
            offset += n as u64;
        }

        server.flush(stream)?;
        if !repeat {
            return Ok(());
        }
        tracing::debug!(path = %path.display(), "input looped");
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
