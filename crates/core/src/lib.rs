pub mod announce;
pub mod clock;
pub mod config;
pub mod error;
pub mod media;
pub mod output;
pub mod protocol;
pub mod rtsp;
pub mod server;
pub mod session;
pub mod transport;

pub use config::ServerConfig;
pub use error::{CastError, Result};
pub use media::{Block, Packetizer};
pub use output::{RtpOutput, StreamId, StreamParams};
pub use server::Server;
