//! Raw voltage blocks and the ring shared with the downstream consumer.
//!
//! Blocks move by ownership: the ingest holds a block exclusively from
//! `wait_free` until `set_filled`, the consumer from `wait_filled` until
//! `set_free`. Slot state therefore never needs per-word atomics; the two
//! queues and their condvars carry the FREE -> PROCESSING -> FILLED -> FREE
//! lifecycle.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::IngestError;
use crate::STATUS_TOTAL_SIZE;

/// One fixed-size block of shared memory: a status-snapshot header region
/// followed by the voltage data area, addressed in 16-bit units.
pub struct RawBlock {
    pub block_num: u64,
    /// Packets scattered into this block so far.
    pub npacket: u64,
    header: Vec<u8>,
    data: Vec<u16>,
}

impl RawBlock {
    fn with_capacity(data_bytes: usize) -> Self {
        Self {
            block_num: 0,
            npacket: 0,
            header: vec![b' '; STATUS_TOTAL_SIZE],
            data: vec![0u16; data_bytes / 2],
        }
    }

    /// Prepare a recycled block for a new block number. The data area is
    /// left as-is; drop accounting covers cells no packet overwrites.
    pub fn init(&mut self, block_num: u64) {
        self.block_num = block_num;
        self.npacket = 0;
    }

    pub fn data_units(&mut self) -> &mut [u16] {
        &mut self.data
    }

    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn set_header(&mut self, rendered: &[u8]) {
        let n = rendered.len().min(self.header.len());
        self.header[..n].copy_from_slice(&rendered[..n]);
    }
}

struct RingState {
    free: VecDeque<RawBlock>,
    filled: VecDeque<RawBlock>,
    closed: bool,
}

/// Fixed-capacity ring of raw blocks between the ingest and a consumer.
pub struct BlockRing {
    state: Mutex<RingState>,
    free_cv: Condvar,
    filled_cv: Condvar,
    capacity: usize,
}

impl BlockRing {
    /// Allocate `nblocks` blocks of `data_bytes` each, all initially free.
    pub fn new(nblocks: usize, data_bytes: usize) -> Self {
        let free = (0..nblocks)
            .map(|_| RawBlock::with_capacity(data_bytes))
            .collect();
        Self {
            state: Mutex::new(RingState {
                free,
                filled: VecDeque::new(),
                closed: false,
            }),
            free_cv: Condvar::new(),
            filled_cv: Condvar::new(),
            capacity: nblocks,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks not currently sitting in the free queue, over the total.
    pub fn occupancy(&self) -> (usize, usize) {
        let state = self.state.lock();
        (self.capacity - state.free.len(), self.capacity)
    }

    /// Acquire a free block. `Ok(None)` on timeout; the ring being closed
    /// is the fatal case.
    pub fn wait_free(&self, timeout: Duration) -> Result<Option<RawBlock>, IngestError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(IngestError::RingClosed);
            }
            if let Some(block) = state.free.pop_front() {
                return Ok(Some(block));
            }
            if self.free_cv.wait_for(&mut state, timeout).timed_out() {
                return Ok(None);
            }
        }
    }

    /// Publish a finalized block to the consumer.
    pub fn set_filled(&self, block: RawBlock) {
        let mut state = self.state.lock();
        state.filled.push_back(block);
        self.filled_cv.notify_one();
    }

    /// Consumer side: take the next filled block.
    pub fn wait_filled(&self, timeout: Duration) -> Result<Option<RawBlock>, IngestError> {
        let mut state = self.state.lock();
        loop {
            if let Some(block) = state.filled.pop_front() {
                return Ok(Some(block));
            }
            if state.closed {
                return Err(IngestError::RingClosed);
            }
            if self.filled_cv.wait_for(&mut state, timeout).timed_out() {
                return Ok(None);
            }
        }
    }

    /// Consumer side: recycle a drained block.
    pub fn set_free(&self, block: RawBlock) {
        let mut state = self.state.lock();
        state.free.push_back(block);
        self.free_cv.notify_one();
    }

    /// Close the ring; every waiter unblocks with `RingClosed`. Filled
    /// blocks already queued remain drainable.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.free_cv.notify_all();
        self.filled_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_lifecycle_and_occupancy() {
        let ring = BlockRing::new(3, 1024);
        assert_eq!(ring.occupancy(), (0, 3));

        let mut block = ring.wait_free(Duration::from_millis(10)).unwrap().unwrap();
        block.init(7);
        assert_eq!(ring.occupancy(), (1, 3));

        ring.set_filled(block);
        let block = ring.wait_filled(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(block.block_num, 7);
        ring.set_free(block);
        assert_eq!(ring.occupancy(), (0, 3));
    }

    #[test]
    fn test_wait_free_times_out_when_exhausted() {
        let ring = BlockRing::new(1, 1024);
        let held = ring.wait_free(Duration::from_millis(10)).unwrap().unwrap();
        let start = Instant::now();
        let got = ring.wait_free(Duration::from_millis(20)).unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        ring.set_free(held);
        assert!(ring.wait_free(Duration::from_millis(10)).unwrap().is_some());
    }

    #[test]
    fn test_close_unblocks_waiters() {
        let ring = Arc::new(BlockRing::new(1, 1024));
        let held = ring.wait_free(Duration::from_millis(10)).unwrap().unwrap();

        let waiter = {
            let ring = ring.clone();
            std::thread::spawn(move || ring.wait_free(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        ring.close();
        assert!(matches!(waiter.join().unwrap(), Err(IngestError::RingClosed)));
        drop(held);
    }

    #[test]
    fn test_filled_drainable_after_close() {
        let ring = BlockRing::new(2, 1024);
        let mut block = ring.wait_free(Duration::from_millis(10)).unwrap().unwrap();
        block.init(1);
        ring.set_filled(block);
        ring.close();
        let drained = ring.wait_filled(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(drained.block_num, 1);
        assert!(matches!(
            ring.wait_filled(Duration::from_millis(10)),
            Err(IngestError::RingClosed)
        ));
    }
}
