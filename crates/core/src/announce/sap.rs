//! Session Announcement Protocol (RFC 2974).
//!
//! Every announced SDP is multicast periodically to the SAP group of its
//! destination's scope, on UDP port 9875:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | V=1 |A|R|T|E|C|   auth len    |         msg id hash           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        originating source (32 or 128 bits)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  "application/sdp" NUL  |  SDP text ...                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Sessions sharing a SAP group share its bandwidth: the group is
//! announced round-robin, each session once per period, where the period
//! grows with the total SDP size so that announcements stay near 4 kbit/s
//! and never go below 5 seconds.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::RngExt;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::clock::{Mtime, mdate};
use crate::error::{CastError, Result};

pub const SAP_PORT: u16 = 9875;

/// Shortest announcement period, in microseconds.
pub const MIN_INTERVAL: Mtime = 5_000_000;

/// Bandwidth budget of one SAP group, in bits per second.
pub const SAP_BANDWIDTH: u64 = 4_000;

const SAP_VERSION_1: u8 = 0x20;
const SAP_ADDR_IPV6: u8 = 0x10;
const SAP_DELETION: u8 = 0x04;
const SAP_PAYLOAD_TYPE: &[u8] = b"application/sdp\0";

/// SAP group for sessions sent to `dest`.
///
/// | Destination | SAP group |
/// |-------------|-----------|
/// | `224.0.0.0/24` | `224.0.0.255` |
/// | `239.255.0.0/16` (local scope) | `239.255.255.255` |
/// | `239.192.0.0/14` (organisation scope) | `239.195.255.255` |
/// | other `239.0.0.0/8` | same prefix, last octet `.255` |
/// | other IPv4 multicast | `224.2.127.254` (global) |
/// | `ff0x::/16`, x ≥ 3 | `ff0x::2:7ffe` |
///
/// Interface- and link-local IPv6 scopes, reserved scopes and unicast
/// destinations are refused with [`CastError::Unannounceable`].
pub fn sap_address(dest: IpAddr) -> Result<IpAddr> {
    match dest {
        IpAddr::V4(v4) if v4.is_multicast() => {
            let o = v4.octets();
            let group = match o {
                [224, 0, 0, _] => Ipv4Addr::new(224, 0, 0, 255),
                [239, 255, _, _] => Ipv4Addr::new(239, 255, 255, 255),
                [239, b, _, _] if (b & 0xfc) == 192 => Ipv4Addr::new(239, 195, 255, 255),
                [239, b, c, _] => Ipv4Addr::new(239, b, c, 255),
                _ => Ipv4Addr::new(224, 2, 127, 254),
            };
            Ok(IpAddr::V4(group))
        }
        IpAddr::V6(v6) if v6.is_multicast() => {
            let scope = v6.octets()[1] & 0x0f;
            if scope < 3 || scope == 0x0f {
                return Err(CastError::Unannounceable(dest));
            }
            Ok(IpAddr::V6(Ipv6Addr::new(
                0xff00 | u16::from(scope),
                0,
                0,
                0,
                0,
                0,
                2,
                0x7ffe,
            )))
        }
        _ => Err(CastError::Unannounceable(dest)),
    }
}

/// Announcement period of a group whose SDPs total `sdp_bytes`.
///
/// Two 600-byte SDPs give `8 × 9600 / 4000 = 19.2 s`.
pub fn announce_interval(sdp_bytes: usize) -> Mtime {
    let bits = sdp_bytes as u64 * 8;
    let period = bits.saturating_mul(8 * 1_000_000) / SAP_BANDWIDTH;
    (period.min(i64::MAX as u64) as Mtime).max(MIN_INTERVAL)
}

/// Build one SAP datagram.
pub fn encode_sap(origin: IpAddr, msg_id: u16, sdp: &str, deletion: bool) -> Vec<u8> {
    let mut flags = SAP_VERSION_1;
    if origin.is_ipv6() {
        flags |= SAP_ADDR_IPV6;
    }
    if deletion {
        flags |= SAP_DELETION;
    }

    let mut packet = Vec::with_capacity(20 + SAP_PAYLOAD_TYPE.len() + sdp.len());
    packet.extend_from_slice(&[flags, 0]);
    packet.extend_from_slice(&msg_id.to_be_bytes());
    match origin {
        IpAddr::V4(v4) => packet.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => packet.extend_from_slice(&v6.octets()),
    }
    packet.extend_from_slice(SAP_PAYLOAD_TYPE);
    packet.extend_from_slice(sdp.as_bytes());
    packet
}

/// Handle of an announced session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SapHandle(u64);

#[derive(Debug)]
struct GroupState {
    group: IpAddr,
    /// Members in announcement order, with their SDP length.
    members: Vec<(SapHandle, usize)>,
    cursor: usize,
    next: Mtime,
}

impl GroupState {
    fn period(&self) -> Mtime {
        announce_interval(self.members.iter().map(|(_, len)| len).sum())
    }

    /// Gap between two sends of the group.
    fn step(&self) -> Mtime {
        (self.period() / self.members.len().max(1) as Mtime).max(1)
    }
}

/// When each announced session is due, independent of any socket.
#[derive(Debug, Default)]
pub struct SapSchedule {
    groups: Vec<GroupState>,
}

impl SapSchedule {
    /// Add a session to `group`. A new group is due at `now`.
    pub fn add(&mut self, handle: SapHandle, group: IpAddr, sdp_len: usize, now: Mtime) {
        match self.groups.iter_mut().find(|g| g.group == group) {
            Some(state) => state.members.push((handle, sdp_len)),
            None => self.groups.push(GroupState {
                group,
                members: vec![(handle, sdp_len)],
                cursor: 0,
                next: now,
            }),
        }
    }

    /// Remove a session. Returns `false` if it was not scheduled.
    pub fn remove(&mut self, handle: SapHandle) -> bool {
        for state in &mut self.groups {
            if let Some(pos) = state.members.iter().position(|(h, _)| *h == handle) {
                state.members.remove(pos);
                if pos < state.cursor {
                    state.cursor -= 1;
                }
                if state.cursor >= state.members.len() {
                    state.cursor = 0;
                }
                self.groups.retain(|g| !g.members.is_empty());
                return true;
            }
        }
        false
    }

    /// Current period of `group`.
    pub fn period(&self, group: IpAddr) -> Option<Mtime> {
        self.groups
            .iter()
            .find(|g| g.group == group)
            .map(GroupState::period)
    }

    /// Sessions due at `now`, in send order.
    pub fn poll(&mut self, now: Mtime) -> Vec<SapHandle> {
        let mut due = Vec::new();
        for state in &mut self.groups {
            let step = state.step();
            // After a long stall restart the cadence instead of bursting.
            if now - state.next > state.period() {
                state.next = now;
            }
            while state.next <= now {
                due.push(state.members[state.cursor].0);
                state.cursor = (state.cursor + 1) % state.members.len();
                state.next += step;
            }
        }
        due
    }

    /// Earliest time a session becomes due.
    pub fn next_deadline(&self) -> Option<Mtime> {
        self.groups.iter().map(|g| g.next).min()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

struct Announced {
    group: IpAddr,
    packet: Arc<[u8]>,
    bye: Arc<[u8]>,
}

/// A packet ready to go out, holding its own socket so it can be sent
/// after the state lock is released.
struct Datagram {
    group: IpAddr,
    socket: Arc<UdpSocket>,
    packet: Arc<[u8]>,
}

impl Datagram {
    fn send(&self) {
        if let Err(e) = self.socket.send(&self.packet) {
            tracing::warn!(group = %self.group, error = %e, "SAP send error");
        }
    }
}

#[derive(Default)]
struct SapState {
    schedule: SapSchedule,
    sessions: HashMap<SapHandle, Announced>,
    sockets: HashMap<IpAddr, Arc<UdpSocket>>,
    next_handle: u64,
}

impl SapState {
    fn datagram(&self, group: IpAddr, packet: &Arc<[u8]>) -> Option<Datagram> {
        let socket = self.sockets.get(&group)?.clone();
        Some(Datagram {
            group,
            socket,
            packet: packet.clone(),
        })
    }

    /// Announcements due at `now`.
    fn due(&mut self, now: Mtime) -> Vec<Datagram> {
        let handles = self.schedule.poll(now);
        handles
            .into_iter()
            .filter_map(|handle| {
                let session = self.sessions.get(&handle)?;
                self.datagram(session.group, &session.packet)
            })
            .collect()
    }
}

struct SapShared {
    state: Mutex<SapState>,
    wake: Condvar,
    die: AtomicBool,
}

/// Announces registered sessions from a dedicated thread.
pub struct SapAnnouncer {
    shared: Arc<SapShared>,
    ttl: Option<u8>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SapAnnouncer {
    /// Start the announcer thread. `ttl` bounds the multicast scope of
    /// announcements; `None` keeps the system default.
    pub fn new(ttl: Option<u8>) -> Result<Self> {
        let shared = Arc::new(SapShared {
            state: Mutex::new(SapState::default()),
            wake: Condvar::new(),
            die: AtomicBool::new(false),
        });
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("sap".to_string())
                .spawn(move || run(shared))
                .map_err(|source| CastError::Spawn { name: "sap", source })?
        };
        tracing::debug!("SAP announcer started");
        Ok(Self {
            shared,
            ttl,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Announce `sdp`, describing media sent to `dest`.
    pub fn register(&self, dest: IpAddr, sdp: &str) -> Result<SapHandle> {
        if self.shared.die.load(Ordering::SeqCst) {
            return Err(CastError::ShuttingDown);
        }
        let group = sap_address(dest)?;
        let target = SocketAddr::new(group, SAP_PORT);

        let mut state = self.shared.state.lock();
        if !state.sockets.contains_key(&group) {
            let socket = open_socket(target, self.ttl)?;
            state.sockets.insert(group, Arc::new(socket));
        }
        let origin = match state.sockets.get(&group).map(|s| s.local_addr()) {
            Some(Ok(local)) => local.ip(),
            _ => unspecified(group),
        };

        let msg_id = rand::rng().random::<u16>();
        let handle = SapHandle(state.next_handle);
        state.next_handle += 1;
        state.sessions.insert(
            handle,
            Announced {
                group,
                packet: encode_sap(origin, msg_id, sdp, false).into(),
                bye: encode_sap(origin, msg_id, sdp, true).into(),
            },
        );
        state.schedule.add(handle, group, sdp.len(), mdate());
        tracing::info!(
            %group,
            %dest,
            period_ms = state.schedule.period(group).unwrap_or(MIN_INTERVAL) / 1000,
            "SAP session registered"
        );
        drop(state);

        self.shared.wake.notify_one();
        Ok(handle)
    }

    /// Stop announcing a session and send its deletion message.
    pub fn unregister(&self, handle: SapHandle) -> bool {
        let mut state = self.shared.state.lock();
        let Some(session) = state.sessions.remove(&handle) else {
            return false;
        };
        state.schedule.remove(handle);
        let bye = state.datagram(session.group, &session.bye);
        if !state.sessions.values().any(|s| s.group == session.group) {
            state.sockets.remove(&session.group);
        }
        drop(state);

        if let Some(bye) = bye {
            bye.send();
        }
        tracing::info!(group = %session.group, "SAP session unregistered");

        self.shared.wake.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the thread and send a deletion message for every session.
    pub fn shutdown(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.shared.die.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            tracing::error!("SAP thread panicked");
        }

        let mut state = self.shared.state.lock();
        let sessions: Vec<Announced> = state.sessions.drain().map(|(_, s)| s).collect();
        let byes: Vec<Datagram> = sessions
            .iter()
            .filter_map(|s| state.datagram(s.group, &s.bye))
            .collect();
        state.sockets.clear();
        drop(state);

        for bye in &byes {
            bye.send();
        }
        tracing::debug!(sessions = sessions.len(), "SAP announcer stopped");
    }
}

impl Drop for SapAnnouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<SapShared>) {
    let mut state = shared.state.lock();
    while !shared.die.load(Ordering::SeqCst) {
        let due = state.due(mdate());
        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for datagram in &due {
                    datagram.send();
                }
            });
            continue;
        }

        match state.schedule.next_deadline() {
            Some(deadline) => {
                let wait = Duration::from_micros((deadline - mdate()).max(0) as u64);
                shared.wake.wait_for(&mut state, wait);
            }
            None => shared.wake.wait(&mut state),
        }
    }
}

fn open_socket(target: SocketAddr, ttl: Option<u8>) -> Result<UdpSocket> {
    let open = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(ttl) = ttl {
            match target {
                SocketAddr::V4(_) => socket.set_multicast_ttl_v4(u32::from(ttl))?,
                SocketAddr::V6(_) => socket.set_multicast_hops_v6(u32::from(ttl))?,
            }
        }
        socket.bind(&SockAddr::from(SocketAddr::new(unspecified(target.ip()), 0)))?;
        socket.connect(&SockAddr::from(target))?;
        Ok(socket.into())
    };
    open().map_err(|source| CastError::SinkOpen {
        dest: target,
        source,
    })
}

fn unspecified(like: IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    }
}
