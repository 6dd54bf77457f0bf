use parking_lot::Mutex;

use crate::clock::Mtime;

/// Upper bound on the number of recycled buffers kept by a [`BlockPool`].
pub const MAX_EMPTY_BLOCKS: usize = 200;

/// A chunk of elementary-stream bytes handed over by a producer.
///
/// `dts` is the presentation time in [`clock`](crate::clock) microseconds.
/// `clock` marks blocks carrying a clock-reference sample (e.g. an MPEG-TS
/// PCR): the packet enclosing it is sent exactly at its deadline.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub data: Vec<u8>,
    pub dts: Mtime,
    pub clock: bool,
}

impl Block {
    pub fn new(data: Vec<u8>, dts: Mtime) -> Self {
        Self {
            data,
            dts,
            clock: false,
        }
    }

    /// Mark the block as carrying a clock reference.
    pub fn with_clock(mut self) -> Self {
        self.clock = true;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Free-list of MTU-sized packet buffers shared by the packetisers and the
/// sender thread.
///
/// Holds at most [`MAX_EMPTY_BLOCKS`] buffers; surplus buffers are released.
/// When the list is empty a fresh buffer is allocated.
#[derive(Debug)]
pub struct BlockPool {
    free: Mutex<Vec<Vec<u8>>>,
    mtu: usize,
}

impl BlockPool {
    pub fn new(mtu: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            mtu,
        }
    }

    /// Take an empty buffer with room for one MTU.
    pub fn take(&self) -> Vec<u8> {
        match self.free.lock().pop() {
            Some(buf) => buf,
            None => Vec::with_capacity(self.mtu),
        }
    }

    /// Return a buffer to the free-list.
    pub fn put(&self, mut buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() >= MAX_EMPTY_BLOCKS {
            tracing::trace!(depth = free.len(), "free-list full, releasing buffer");
            return;
        }
        buf.clear();
        free.push(buf);
    }

    /// Release buffers until the free-list is below its bound.
    /// Returns the number of buffers released.
    pub fn trim(&self) -> usize {
        let mut free = self.free.lock();
        let mut released = 0;
        while free.len() >= MAX_EMPTY_BLOCKS {
            free.pop();
            released += 1;
        }
        released
    }

    /// Number of buffers currently on the free-list.
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_buffers() {
        let pool = BlockPool::new(1500);
        let mut buf = pool.take();
        assert!(buf.capacity() >= 1500);
        buf.extend_from_slice(&[1, 2, 3]);
        pool.put(buf);
        assert_eq!(pool.len(), 1);

        let buf = pool.take();
        assert!(buf.is_empty(), "recycled buffer must be cleared");
        assert!(pool.is_empty());
    }

    #[test]
    fn free_list_is_bounded() {
        let pool = BlockPool::new(64);
        for _ in 0..MAX_EMPTY_BLOCKS + 50 {
            pool.put(Vec::with_capacity(64));
        }
        assert_eq!(pool.len(), MAX_EMPTY_BLOCKS);
    }

    #[test]
    fn saturated_and_drained_pool_still_allocates() {
        let pool = BlockPool::new(64);
        for _ in 0..MAX_EMPTY_BLOCKS {
            pool.put(Vec::with_capacity(64));
        }
        for _ in 0..MAX_EMPTY_BLOCKS {
            pool.take();
        }
        let fresh = pool.take();
        assert!(fresh.capacity() >= 64);
    }

    #[test]
    fn trim_drops_below_bound() {
        let pool = BlockPool::new(64);
        for _ in 0..MAX_EMPTY_BLOCKS {
            pool.put(Vec::new());
        }
        assert_eq!(pool.trim(), 1);
        assert_eq!(pool.len(), MAX_EMPTY_BLOCKS - 1);
    }

    #[test]
    fn clock_flag() {
        let block = Block::new(vec![0x47; 188], 1_000).with_clock();
        assert!(block.clock);
        assert_eq!(block.len(), 188);
    }
}
