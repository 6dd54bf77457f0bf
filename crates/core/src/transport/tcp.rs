use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::request::content_length_of;
use crate::protocol::{RtspRequest, RtspResponse};
use crate::rtsp::{Peer, RtspControl};

/// Upper bound on a request head; longer heads are answered with 400.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Upper bound on a request body; larger `Content-Length` values are
/// answered with 400 before anything is allocated.
const MAX_BODY_LEN: usize = 64 * 1024;

/// Open control connections, so that shutdown can unblock their reads
/// and wait for their threads.
#[derive(Clone, Default)]
pub struct Connections {
    streams: Arc<Mutex<HashMap<u64, TcpStream>>>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl Connections {
    fn insert(&self, stream: &TcpStream) -> Option<u64> {
        let clone = stream.try_clone().ok()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(id, clone);
        Some(id)
    }

    fn remove(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut threads = self.threads.lock();
        threads.retain(|t| !t.is_finished());
        threads.push(handle);
    }

    /// Shut down every open connection.
    pub fn shutdown_all(&self) {
        for (_, stream) in self.streams.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Wait for every connection thread to return. Call after
    /// [`shutdown_all`](Self::shutdown_all) and after the accept loop has
    /// stopped, or this may block on a live client.
    pub fn join_all(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("connection thread panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    control: Arc<RtspControl>,
    connections: Connections,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let control = control.clone();
                let registry = connections.clone();
                let running = running.clone();
                let spawned = thread::Builder::new()
                    .name("rtsp-conn".to_string())
                    .spawn(move || Connection::handle(stream, control, registry, running));
                match spawned {
                    Ok(handle) => connections.track(handle),
                    Err(e) => tracing::warn!(error = %e, "cannot spawn connection thread"),
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Outcome of reading one request off the wire.
enum Incoming {
    Request(String),
    Malformed(&'static str),
    Closed(&'static str),
}

/// A single RTSP client connection.
///
/// RTSP sessions are not bound to the connection that created them: a
/// client may SETUP on one connection and TEARDOWN on another.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: Peer,
}

impl Connection {
    fn handle(
        stream: TcpStream,
        control: Arc<RtspControl>,
        connections: Connections,
        running: Arc<AtomicBool>,
    ) {
        let (remote, local) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(remote), Ok(local)) => (unmapped(remote), unmapped(local)),
            _ => return,
        };
        let Ok(reader_stream) = stream.try_clone() else {
            return;
        };
        let Some(id) = connections.insert(&stream) else {
            return;
        };

        tracing::info!(peer = %remote, "client connected");

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer: stream,
            peer: Peer { remote, local },
        };
        let reason = conn.run(&control, &running);
        connections.remove(id);

        tracing::info!(peer = %remote, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, control: &RtspControl, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let text = match self.read_request() {
                Incoming::Request(text) => text,
                Incoming::Closed(reason) => return reason,
                Incoming::Malformed(reason) => {
                    tracing::warn!(peer = %self.peer.remote, reason, "malformed request");
                    self.reply(&RtspResponse::bad_request());
                    return "malformed request";
                }
            };

            match RtspRequest::parse(&text) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer.remote,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );

                    let response = control.handle(&request, &self.peer);

                    tracing::debug!(
                        peer = %self.peer.remote,
                        status = response.status_code,
                        "response"
                    );

                    if !self.reply(&response) {
                        return "write error";
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer.remote, error = %e, "parse error");
                    let mut response = RtspResponse::bad_request();
                    if let Some(cseq) = cseq_of(&text) {
                        response = response.add_header("CSeq", cseq);
                    }
                    self.reply(&response);
                    return "parse error";
                }
            }
        }

        "server shutting down"
    }

    /// Read a request head and its `Content-Length` body.
    fn read_request(&mut self) -> Incoming {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            let budget = (MAX_HEAD_LEN + 1 - head.len()) as u64;
            match (&mut self.reader).take(budget).read_line(&mut line) {
                Ok(0) => return Incoming::Closed("connection closed by client"),
                Ok(_) => {
                    if head.len() + line.len() > MAX_HEAD_LEN {
                        return Incoming::Malformed("request head too long");
                    }
                    let blank = line == "\r\n" || line == "\n";
                    // Leading blank lines between requests are tolerated.
                    if blank && head.trim().is_empty() {
                        head.clear();
                        continue;
                    }
                    head.push_str(&line);
                    if blank {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Incoming::Malformed("request head is not UTF-8");
                }
                Err(_) => return Incoming::Closed("read error"),
            }
        }

        let headers: Vec<(String, String)> = head
            .lines()
            .skip(1)
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let length = match content_length_of(&headers) {
            Ok(length) => length,
            Err(_) => return Incoming::Malformed("invalid Content-Length"),
        };
        if length > MAX_BODY_LEN {
            return Incoming::Malformed("Content-Length too large");
        }

        if length > 0 {
            let mut body = vec![0u8; length];
            if self.reader.read_exact(&mut body).is_err() {
                return Incoming::Closed("read error");
            }
            match String::from_utf8(body) {
                Ok(body) => head.push_str(&body),
                Err(_) => return Incoming::Malformed("request body is not UTF-8"),
            }
        }

        Incoming::Request(head)
    }

    fn reply(&mut self, response: &RtspResponse) -> bool {
        self.writer
            .write_all(response.serialize().as_bytes())
            .is_ok()
    }
}

fn cseq_of(text: &str) -> Option<&str> {
    text.lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("CSeq"))
        .map(|(_, v)| v.trim())
}

/// IPv4-mapped IPv6 addresses (dual-stack listeners) as plain IPv4.
pub fn unmapped(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cseq_recovered_from_unparsable_request() {
        assert_eq!(cseq_of("GARBAGE\r\ncseq : 9\r\n\r\n"), Some("9"));
        assert_eq!(cseq_of("GARBAGE\r\n\r\n"), None);
    }

    #[test]
    fn mapped_addresses_unwrapped() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:554".parse().unwrap();
        assert_eq!(unmapped(mapped), "10.0.0.1:554".parse().unwrap());
        let v6: SocketAddr = "[2001:db8::1]:554".parse().unwrap();
        assert_eq!(unmapped(v6), v6);
    }

    #[test]
    fn join_all_waits_for_connection_threads() {
        let connections = Connections::default();
        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let done = done.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                done.store(true, Ordering::SeqCst);
            })
        };
        connections.track(handle);
        connections.join_all();
        assert!(done.load(Ordering::SeqCst));
        connections.join_all();
    }

    #[test]
    fn overlong_head_line_is_malformed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let writer = thread::spawn(move || {
            // One line, no newline, longer than any acceptable head.
            let _ = client.write_all(&vec![b'A'; MAX_HEAD_LEN + 4096]);
            client
        });

        let mut conn = Connection {
            reader: BufReader::new(server_side.try_clone().unwrap()),
            writer: server_side,
            peer: Peer {
                remote: "127.0.0.1:1".parse().unwrap(),
                local: "127.0.0.1:2".parse().unwrap(),
            },
        };
        assert!(matches!(
            conn.read_request(),
            Incoming::Malformed("request head too long")
        ));
        drop(conn);
        drop(writer.join().unwrap());
    }

    #[test]
    fn connections_shut_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let connections = Connections::default();
        connections.insert(&server_side).unwrap();
        assert_eq!(connections.len(), 1);
        connections.shutdown_all();
        assert!(connections.is_empty());

        let mut buf = [0u8; 1];
        let mut reader = server_side;
        assert_eq!(reader.read(&mut buf).unwrap_or(0), 0);
        drop(client);
    }
}
