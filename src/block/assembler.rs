//! Sliding-window block assembly.
//!
//! Exactly two working blocks accept packets at any instant; everything
//! else is late, a window advance, or a discontinuity that re-seats the
//! window past the disruptor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::block::ring::{BlockRing, RawBlock};
use crate::block::view::BlockView;
use crate::error::IngestError;
use crate::obs::ObsInfo;
use crate::status::{render_records, StatusBuffer};

/// How long one free-wait attempt blocks before the waiting status is
/// refreshed and cancellation is re-checked.
const FREE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone)]
pub struct AssemblerStats {
    /// Packets one block older than the window.
    pub nlate: u64,
    /// Drops accumulated over all finalized blocks.
    pub ndrop_total: u64,
    /// Blocks handed to the consumer.
    pub nblocks: u64,
    /// Window re-seats due to discontinuities.
    pub nreinit: u64,
}

/// Two-wide sliding window of working blocks over the output ring.
pub struct BlockAssembler {
    ring: Arc<BlockRing>,
    view: BlockView,
    piperblk: u64,
    pkts_per_block: u64,
    /// Exactly two blocks once primed; `window[1].block_num` is always
    /// `window[0].block_num + 1`.
    window: Vec<RawBlock>,
    pub stats: AssemblerStats,
}

impl BlockAssembler {
    pub fn new(ring: Arc<BlockRing>, obs: &ObsInfo) -> Result<Self, IngestError> {
        Ok(Self {
            ring,
            view: BlockView::new(obs)?,
            piperblk: obs.piperblk,
            pkts_per_block: obs.pkts_per_block,
            window: Vec::with_capacity(2),
            stats: AssemblerStats::default(),
        })
    }

    pub fn is_primed(&self) -> bool {
        !self.window.is_empty()
    }

    /// Block numbers of the current window, older first.
    pub fn window_nums(&self) -> Option<(u64, u64)> {
        match self.window.as_slice() {
            [w0, w1] => Some((w0.block_num, w1.block_num)),
            _ => None,
        }
    }

    /// Route one accepted packet per the window decision table. Payload
    /// geometry and stream index are already validated by the caller.
    pub fn dispatch(
        &mut self,
        pktidx: u64,
        feng_id: u16,
        stream: u32,
        payload: &[u8],
        status: &StatusBuffer,
        cancel: &AtomicBool,
    ) -> Result<(), IngestError> {
        let b = pktidx / self.piperblk;

        if !self.is_primed() {
            // First packet of the observation seats the window at its
            // block.
            self.seat_window(b, status, cancel)?;
        }

        let w0 = self.window[0].block_num;
        let w1 = w0 + 1;

        if b == w0 {
            self.scatter_into(0, feng_id, stream, pktidx, payload);
        } else if b == w1 {
            self.scatter_into(1, feng_id, stream, pktidx, payload);
        } else if b == w1 + 1 {
            self.advance(status, cancel)?;
            self.scatter_into(1, feng_id, stream, pktidx, payload);
        } else if b + 1 == w0 {
            self.stats.nlate += 1;
        } else {
            // Far out of window, in either direction: finalize what we
            // have, re-seat past the disruptor, and drop it.
            warn!(
                "pktidx {} (block {}) far from window [{}, {}]; reinitializing",
                pktidx, b, w0, w1
            );
            self.stats.nreinit += 1;
            self.reinit(b, status, cancel)?;
        }
        Ok(())
    }

    fn scatter_into(&mut self, idx: usize, feng_id: u16, stream: u32, pktidx: u64, payload: &[u8]) {
        let block = &mut self.window[idx];
        self.view
            .scatter(block.data_units(), feng_id, stream, pktidx, payload);
        block.npacket += 1;
    }

    /// Finalize `W[0]`, shift `W[1]` down, and acquire a fresh `W[1]`.
    fn advance(&mut self, status: &StatusBuffer, cancel: &AtomicBool) -> Result<(), IngestError> {
        let next_num = self.window[1].block_num + 1;
        let retiring = self.window.remove(0);
        self.finalize(retiring, status);
        let mut fresh = self.acquire_free(status, cancel)?;
        fresh.init(next_num);
        self.window.push(fresh);
        Ok(())
    }

    /// Discontinuity: finalize both working blocks with their accumulated
    /// drops, then re-seat the window just past the disruptor at
    /// `{B+1, B+2}`.
    fn reinit(&mut self, b: u64, status: &StatusBuffer, cancel: &AtomicBool) -> Result<(), IngestError> {
        for retiring in self.window.drain(..).collect::<Vec<_>>() {
            self.finalize(retiring, status);
        }
        self.seat_window(b + 1, status, cancel)
    }

    fn seat_window(
        &mut self,
        first_num: u64,
        status: &StatusBuffer,
        cancel: &AtomicBool,
    ) -> Result<(), IngestError> {
        debug_assert!(self.window.is_empty());
        for num in [first_num, first_num + 1] {
            let mut block = self.acquire_free(status, cancel)?;
            block.init(num);
            self.window.push(block);
        }
        Ok(())
    }

    /// Write counters and the status snapshot into the block header and
    /// hand the block to the consumer. Called at most once per block
    /// lifetime.
    fn finalize(&mut self, mut block: RawBlock, status: &StatusBuffer) {
        let ndrop = self.pkts_per_block.saturating_sub(block.npacket);
        let mut header = status.lock().snapshot();
        header.insert("PKTIDX".into(), (block.block_num * self.piperblk).into());
        header.insert("NPKT".into(), block.npacket.into());
        header.insert("NDROP".into(), ndrop.into());
        header.insert(
            "DROPSTAT".into(),
            format!("{}/{}", ndrop, self.pkts_per_block).into(),
        );
        block.set_header(&render_records(&header));

        self.stats.ndrop_total += ndrop;
        self.stats.nblocks += 1;
        self.ring.set_filled(block);
    }

    /// Free-wait: retried until a block is free or cancellation; while
    /// waiting, the status buffer reports the stall.
    fn acquire_free(
        &mut self,
        status: &StatusBuffer,
        cancel: &AtomicBool,
    ) -> Result<RawBlock, IngestError> {
        let mut stalled = false;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(IngestError::Cancelled);
            }
            match self.ring.wait_free(FREE_WAIT)? {
                Some(block) => {
                    if stalled {
                        status.lock().set("NETSTAT", "receiving");
                    }
                    return Ok(block);
                }
                None => {
                    stalled = true;
                    let (used, total) = self.ring.occupancy();
                    let mut st = status.lock();
                    st.set("NETSTAT", "outblocked");
                    st.set("NETBUFST", format!("{}/{}", used, total));
                }
            }
        }
    }

    /// Abandon the working blocks without finalizing, returning their
    /// memory to the ring. Used at cancellation.
    pub fn abandon(mut self) {
        for block in self.window.drain(..) {
            self.ring.set_free(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::ObsInfo;
    use crate::status::find_record;
    use crate::testutil::{s1_status, tagged_payload};

    struct Rig {
        ring: Arc<BlockRing>,
        asm: BlockAssembler,
        status: Arc<StatusBuffer>,
        obs: ObsInfo,
        cancel: AtomicBool,
    }

    fn rig(nblocks: usize) -> Rig {
        let status = Arc::new(s1_status());
        let obs = ObsInfo::from_status(&status.lock()).unwrap();
        let ring = Arc::new(BlockRing::new(nblocks, obs.block_data_size));
        let asm = BlockAssembler::new(ring.clone(), &obs).unwrap();
        Rig {
            ring,
            asm,
            status,
            obs,
            cancel: AtomicBool::new(false),
        }
    }

    impl Rig {
        fn feed(&mut self, pktidx: u64) {
            let payload = tagged_payload(&self.obs, pktidx);
            self.asm
                .dispatch(pktidx, 0, 0, &payload, &self.status, &self.cancel)
                .unwrap();
        }

        fn take_filled(&self) -> RawBlock {
            self.ring
                .wait_filled(Duration::from_millis(100))
                .unwrap()
                .expect("finalized block")
        }

        fn no_filled(&self) -> bool {
            self.ring
                .wait_filled(Duration::from_millis(10))
                .unwrap()
                .is_none()
        }
    }

    #[test]
    fn test_s1_clean_run() {
        let mut r = rig(6);
        for pktidx in 0..256 {
            r.feed(pktidx);
        }
        // Two more advances flush blocks 0 and 1.
        r.feed(256);
        r.feed(384);

        for expected_pktidx in [0i64, 128] {
            let block = r.take_filled();
            assert_eq!(block.npacket, 128);
            let header = block.header();
            assert_eq!(
                find_record(header, "PKTIDX").as_deref(),
                Some(expected_pktidx.to_string().as_str())
            );
            assert_eq!(find_record(header, "NPKT").as_deref(), Some("128"));
            assert_eq!(find_record(header, "NDROP").as_deref(), Some("0"));
            assert_eq!(find_record(header, "DROPSTAT").as_deref(), Some("0/128"));
            r.ring.set_free(block);
        }
        assert!(r.no_filled());
        assert_eq!(r.asm.stats.ndrop_total, 0);
    }

    #[test]
    fn test_s2_uniform_drop() {
        let mut r = rig(6);
        for pktidx in (0..256).step_by(2) {
            r.feed(pktidx);
        }
        r.feed(256);
        r.feed(384);

        for _ in 0..2 {
            let block = r.take_filled();
            assert_eq!(block.npacket, 64);
            assert_eq!(find_record(block.header(), "NPKT").as_deref(), Some("64"));
            assert_eq!(find_record(block.header(), "NDROP").as_deref(), Some("64"));
            assert_eq!(
                find_record(block.header(), "DROPSTAT").as_deref(),
                Some("64/128")
            );
            r.ring.set_free(block);
        }
        assert_eq!(r.asm.stats.ndrop_total, 128);
    }

    #[test]
    fn test_s3_late_packet_ignored() {
        let mut r = rig(6);
        for pktidx in 0..128 {
            r.feed(pktidx);
        }
        // Advance finalizes block 0; window is now {1, 2}.
        r.feed(256);
        assert_eq!(r.asm.window_nums(), Some((1, 2)));

        let block0 = r.take_filled();
        assert_eq!(block0.npacket, 128);
        r.ring.set_free(block0);

        // A straggler for the already-finalized block 0.
        r.feed(10);
        assert_eq!(r.asm.stats.nlate, 1);
        assert_eq!(r.asm.window_nums(), Some((1, 2)));
        // Nothing new was finalized and nothing was scattered.
        assert!(r.no_filled());
        assert_eq!(r.asm.window[0].npacket, 0);
        assert_eq!(r.asm.window[1].npacket, 1); // the pktidx 256 packet
    }

    #[test]
    fn test_s4_forward_discontinuity() {
        let mut r = rig(6);
        for pktidx in 0..128 {
            r.feed(pktidx);
        }
        // Jump far ahead: B = 10000 / 128 = 78.
        r.feed(10000);

        let block0 = r.take_filled();
        assert_eq!(block0.block_num, 0);
        assert_eq!(find_record(block0.header(), "NDROP").as_deref(), Some("0"));
        r.ring.set_free(block0);

        let block1 = r.take_filled();
        assert_eq!(block1.block_num, 1);
        assert_eq!(block1.npacket, 0);
        assert_eq!(find_record(block1.header(), "NDROP").as_deref(), Some("128"));
        r.ring.set_free(block1);

        // The window follows the disruptor, which itself is discarded.
        assert_eq!(r.asm.window_nums(), Some((79, 80)));
        assert_eq!(r.asm.window[0].npacket + r.asm.window[1].npacket, 0);
        assert_eq!(r.asm.stats.nreinit, 1);
    }

    #[test]
    fn test_duplicates_clamp_ndrop() {
        let mut r = rig(6);
        for pktidx in 0..128 {
            r.feed(pktidx);
            r.feed(pktidx);
        }
        r.feed(256);

        let block0 = r.take_filled();
        assert_eq!(block0.npacket, 256);
        assert_eq!(find_record(block0.header(), "NDROP").as_deref(), Some("0"));
    }

    #[test]
    fn test_window_monotonicity() {
        let mut r = rig(8);
        let mut checked = 0;
        for pktidx in (0..2048).step_by(3) {
            r.feed(pktidx);
            if let Some((w0, w1)) = r.asm.window_nums() {
                assert_eq!(w1, w0 + 1);
                checked += 1;
            }
            // Keep the ring drained so advances never stall.
            while let Ok(Some(block)) = r.ring.wait_filled(Duration::from_millis(1)) {
                r.ring.set_free(block);
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn test_finalized_blocks_in_increasing_order() {
        let mut r = rig(8);
        for pktidx in 0..1024 {
            r.feed(pktidx);
            while let Ok(Some(block)) = r.ring.wait_filled(Duration::from_millis(1)) {
                assert_eq!(block.block_num, r.asm.stats.nblocks - 1);
                r.ring.set_free(block);
            }
        }
        assert_eq!(r.asm.stats.nblocks, 6); // blocks 0..=5 retired
    }

    #[test]
    fn test_free_wait_reports_outblocked() {
        let mut r = rig(3);
        let ring = r.ring.clone();
        let status = r.status.clone();
        for pktidx in 0..256 {
            r.feed(pktidx);
        }
        // Window {0,1} plus one free block. The first advance consumes the
        // last free block; the second must stall until the consumer frees
        // one.
        let stalled = std::thread::spawn(move || {
            r.feed(256);
            r.feed(384);
            r
        });
        std::thread::sleep(Duration::from_millis(300));
        {
            let st = status.lock();
            assert_eq!(st.get_str("NETSTAT"), Some("outblocked"));
            assert_eq!(st.get_str("NETBUFST"), Some("3/3"));
        }

        // Consumer resumes: drain one block and the backlog clears.
        let block = ring.wait_filled(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(block.block_num, 0);
        ring.set_free(block);

        let r = stalled.join().unwrap();
        assert_eq!(r.asm.window_nums(), Some((2, 3)));
        assert_eq!(r.asm.stats.nblocks, 2);
    }
}
