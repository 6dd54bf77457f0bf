//! The sender thread.
//!
//! Packets produced by the packetisers are queued in emission order and
//! transmitted by a single thread, each at `dts + caching`. The thread owns
//! the free-list the packetisers draw their buffers from.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::{Mtime, mdate};
use crate::media::block::BlockPool;
use crate::media::packetizer::RtpPacket;
use crate::output::{StreamId, TrackTable};

/// A deadline further than this from the previous one is a hole.
pub const HOLE_THRESHOLD: Mtime = 2_000_000;
/// A deadline this far behind the previous one is logged as "in the past".
pub const PAST_THRESHOLD: Mtime = 1_000;
/// Sends this long after their deadline are reported.
pub const LATE_SEND_THRESHOLD: Mtime = 20_000;
/// Sentinels pushed on shutdown to wake the sender.
pub const WAKE_SENTINELS: usize = 10;

/// One queued packet and the track it belongs to.
#[derive(Debug)]
pub struct Outgoing {
    pub stream: StreamId,
    pub packet: RtpPacket,
}

impl Outgoing {
    /// Zero-length packet used only to wake the sender.
    pub fn sentinel() -> Self {
        Self {
            stream: StreamId(u32::MAX),
            packet: RtpPacket::default(),
        }
    }
}

/// FIFO between the packetisers and the sender thread.
#[derive(Debug, Default)]
pub struct PacketQueue {
    items: Mutex<VecDeque<Outgoing>>,
    ready: Condvar,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: Outgoing) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Block until a packet is available.
    pub fn pop(&self) -> Outgoing {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.ready.wait(&mut items);
        }
    }

    /// Sleep until `deadline` unless `die` is raised first. Returns `false`
    /// when woken for exit.
    ///
    /// Producers notify the same condvar, so the wait is re-armed after
    /// every push.
    pub fn sleep_until(&self, deadline: Mtime, die: &AtomicBool) -> bool {
        let mut items = self.items.lock();
        loop {
            if die.load(Ordering::SeqCst) {
                return false;
            }
            let now = mdate();
            if now >= deadline {
                return true;
            }
            let timeout = Duration::from_micros((deadline - now) as u64);
            self.ready.wait_for(&mut items, timeout);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// What to do with the packet at the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Discard: its deadline is more than [`HOLE_THRESHOLD`] away from the
    /// previous one.
    Drop,
    /// Send, after sleeping until `deadline` if `wait` is set.
    Send { deadline: Mtime, wait: bool },
}

/// Deadline bookkeeping of the sender loop, free of any I/O so it can be
/// driven with synthetic timestamps.
///
/// Packets are sent in groups of `group` back to back; the sender sleeps
/// until the deadline of the last packet of each group, or of any packet
/// carrying a clock reference.
#[derive(Debug)]
pub struct Pacer {
    caching: Mtime,
    group: u32,
    to_send: u32,
    last_deadline: Option<Mtime>,
    dropped: u32,
    holes: u64,
}

impl Pacer {
    pub fn new(caching: Mtime, group: u32) -> Self {
        let group = group.max(1);
        Self {
            caching,
            group,
            to_send: group,
            last_deadline: None,
            dropped: 0,
            holes: 0,
        }
    }

    pub fn admit(&mut self, dts: Mtime, clock: bool) -> Verdict {
        let deadline = dts + self.caching;

        if let Some(last) = self.last_deadline {
            let delta = deadline - last;
            if delta.abs() > HOLE_THRESHOLD {
                if self.dropped == 0 {
                    self.holes += 1;
                    tracing::warn!(delta_us = delta, "hole (> 2s), dropping");
                }
                self.dropped += 1;
                self.last_deadline = Some(deadline);
                return Verdict::Drop;
            }
            if delta < -PAST_THRESHOLD && self.dropped == 0 {
                tracing::debug!(behind_us = -delta, "packet in the past");
            }
        }
        self.last_deadline = Some(deadline);

        self.to_send -= 1;
        let wait = self.to_send == 0 || clock;
        if wait {
            self.to_send = self.group;
        }
        Verdict::Send { deadline, wait }
    }

    /// Number of packets dropped since the last call; resets the run.
    pub fn take_dropped(&mut self) -> u32 {
        std::mem::take(&mut self.dropped)
    }

    /// Runs of dropped packets seen so far.
    pub fn holes(&self) -> u64 {
        self.holes
    }
}

/// Snapshot of the sender counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Packets delivered to at least one sink.
    pub packets_sent: u64,
    /// Bytes handed to the network, summed over sinks.
    pub bytes_sent: u64,
    /// Packets discarded by the hole check.
    pub dropped: u64,
    /// Failed send calls.
    pub send_errors: u64,
    /// Packets sent more than 20 ms after their deadline.
    pub late: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SenderCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    dropped: AtomicU64,
    send_errors: AtomicU64,
    late: AtomicU64,
}

impl SenderCounters {
    pub(crate) fn snapshot(&self) -> SenderStats {
        SenderStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the output handle and its sender thread.
pub(crate) struct SenderShared {
    pub(crate) queue: PacketQueue,
    pub(crate) pool: BlockPool,
    pub(crate) tracks: Arc<TrackTable>,
    pub(crate) die: AtomicBool,
    pub(crate) counters: SenderCounters,
}

impl SenderShared {
    pub(crate) fn new(mtu: usize, tracks: Arc<TrackTable>) -> Self {
        Self {
            queue: PacketQueue::new(),
            pool: BlockPool::new(mtu),
            tracks,
            die: AtomicBool::new(false),
            counters: SenderCounters::default(),
        }
    }

    /// Raise the die flag and make sure the sender notices it.
    pub(crate) fn wake_for_exit(&self) {
        self.die.store(true, Ordering::SeqCst);
        for _ in 0..WAKE_SENTINELS {
            self.queue.push(Outgoing::sentinel());
        }
    }
}

/// Body of the sender thread.
pub(crate) fn run(shared: Arc<SenderShared>, mut pacer: Pacer) {
    tracing::debug!("sender thread started");

    while !shared.die.load(Ordering::SeqCst) {
        let Outgoing { stream, packet } = shared.queue.pop();
        if packet.is_empty() {
            continue;
        }

        let deadline = match pacer.admit(packet.dts, packet.clock) {
            Verdict::Drop => {
                shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                shared.pool.put(packet.buf);
                continue;
            }
            Verdict::Send { deadline, wait } => {
                if wait && !shared.queue.sleep_until(deadline, &shared.die) {
                    shared.pool.put(packet.buf);
                    break;
                }
                deadline
            }
        };

        if let Some(track) = shared.tracks.get(stream) {
            let ssrc = track.ssrc();
            let mut delivered = false;
            for sink in track.snapshot_sinks() {
                if sink.is_closed() {
                    continue;
                }
                match sink.deliver(ssrc, &packet.buf) {
                    Ok(n) => {
                        delivered = true;
                        shared.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        shared.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                        sink.report_error(&e);
                    }
                }
            }
            if delivered {
                shared.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            tracing::trace!(stream = stream.0, "packet for removed stream");
        }

        let dropped = pacer.take_dropped();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped {dropped} packets");
        }

        let late = mdate() - deadline;
        if late > LATE_SEND_THRESHOLD {
            shared.counters.late.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(late_us = late, "packet has been sent too late");
        }

        shared.pool.put(packet.buf);
    }

    tracing::debug!("sender thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_is_cut_short_by_exit() {
        let shared = Arc::new(SenderShared::new(1500, Arc::new(TrackTable::default())));
        let sleeper = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                shared
                    .queue
                    .sleep_until(mdate() + 60_000_000, &shared.die)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        let started = std::time::Instant::now();
        shared.wake_for_exit();
        assert!(!sleeper.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn sleep_survives_pushes() {
        let queue = PacketQueue::new();
        let die = AtomicBool::new(false);
        let deadline = mdate() + 30_000;
        queue.push(Outgoing::sentinel());
        assert!(queue.sleep_until(deadline, &die));
        assert!(mdate() >= deadline);
    }

    #[test]
    fn first_packet_is_never_dropped() {
        let mut pacer = Pacer::new(300_000, 1);
        assert_eq!(
            pacer.admit(10_000_000, false),
            Verdict::Send {
                deadline: 10_300_000,
                wait: true
            }
        );
    }

    #[test]
    fn forward_hole_is_dropped_then_resyncs() {
        let mut pacer = Pacer::new(0, 1);
        assert!(matches!(pacer.admit(0, false), Verdict::Send { .. }));
        assert_eq!(pacer.admit(3_000_000, false), Verdict::Drop);
        // The dropped deadline becomes the reference.
        assert!(matches!(pacer.admit(3_040_000, false), Verdict::Send { .. }));
        assert_eq!(pacer.take_dropped(), 1);
        assert_eq!(pacer.holes(), 1);
    }

    #[test]
    fn backward_jump_over_two_seconds_is_one_hole() {
        let mut pacer = Pacer::new(300_000, 1);
        pacer.admit(5_000_000, false);
        pacer.admit(5_040_000, false);

        assert_eq!(pacer.admit(2_540_000, false), Verdict::Drop);
        assert!(matches!(pacer.admit(2_580_000, false), Verdict::Send { .. }));
        assert_eq!(pacer.holes(), 1);
        assert_eq!(pacer.take_dropped(), 1);
    }

    #[test]
    fn consecutive_drops_count_as_one_hole() {
        let mut pacer = Pacer::new(0, 1);
        pacer.admit(0, false);
        assert_eq!(pacer.admit(10_000_000, false), Verdict::Drop);
        assert_eq!(pacer.admit(20_000_000, false), Verdict::Drop);
        assert!(matches!(pacer.admit(20_010_000, false), Verdict::Send { .. }));
        assert_eq!(pacer.holes(), 1);
        assert_eq!(pacer.take_dropped(), 2);
        assert_eq!(pacer.take_dropped(), 0);
    }

    #[test]
    fn past_packet_is_still_sent() {
        let mut pacer = Pacer::new(0, 1);
        pacer.admit(1_000_000, false);
        assert!(matches!(pacer.admit(500_000, false), Verdict::Send { .. }));
        assert_eq!(pacer.holes(), 0);
    }

    #[test]
    fn group_waits_on_last_packet() {
        let mut pacer = Pacer::new(0, 3);
        let waits: Vec<bool> = (0..6)
            .map(|i| match pacer.admit(i * 1000, false) {
                Verdict::Send { wait, .. } => wait,
                Verdict::Drop => panic!("unexpected drop"),
            })
            .collect();
        assert_eq!(waits, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn clock_reference_forces_wait_and_restarts_group() {
        let mut pacer = Pacer::new(0, 3);
        pacer.admit(0, false);
        assert_eq!(
            pacer.admit(1000, true),
            Verdict::Send {
                deadline: 1000,
                wait: true
            }
        );
        assert_eq!(
            pacer.admit(2000, false),
            Verdict::Send {
                deadline: 2000,
                wait: false
            }
        );
    }

    #[test]
    fn queue_is_fifo() {
        let queue = PacketQueue::new();
        for dts in [1, 2, 3] {
            queue.push(Outgoing {
                stream: StreamId(0),
                packet: RtpPacket {
                    buf: vec![0; 12],
                    dts,
                    clock: false,
                },
            });
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().packet.dts, 1);
        assert_eq!(queue.pop().packet.dts, 2);
        assert_eq!(queue.pop().packet.dts, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_wakes_on_push_from_other_thread() {
        let queue = Arc::new(PacketQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                queue.push(Outgoing::sentinel());
            })
        };
        let item = queue.pop();
        assert!(item.packet.is_empty());
        producer.join().unwrap();
    }
}
