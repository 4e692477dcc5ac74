//! Typed 4-D view over a block's data area and the packet scatter kernel.
//!
//! The data area is `[FID][STREAM][CHAN][TIME]` with FID slowest and TIME
//! fastest, addressed in 16-bit units (one packed polarization pair each).
//! Strides are computed once per ObsInfo change and the worst-case cell is
//! proven in bounds at construction, so the hot loop indexes without
//! per-sample checks beyond the slice's own.

use crate::error::IngestError;
use crate::obs::ObsInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockView {
    /// Channel stride within one antenna/stream/pktidx cell.
    pub ostride: usize,
    /// One stream for all packet indices of the block.
    pub stream_stride: usize,
    pub fid_stride: usize,
    pub pktidx_stride: usize,
    piperblk: u64,
    pktntime: usize,
    pktnchan: usize,
    nants: usize,
    nstrm: usize,
    eff_units: usize,
}

impl BlockView {
    pub fn new(obs: &ObsInfo) -> Result<Self, IngestError> {
        let piperblk = obs.piperblk as usize;
        let pktntime = obs.pktntime as usize;
        let pktnchan = obs.pktnchan as usize;
        let nants = obs.nants as usize;
        let nstrm = obs.nstrm as usize;

        let ostride = piperblk * pktntime;
        let stream_stride = obs.payload_units * piperblk;
        let fid_stride = stream_stride * nstrm;
        // One packet-index slot covers PKTNTIME samples along the fastest
        // axis; ostride = PIPERBLK * PKTNTIME keeps slots disjoint.
        let pktidx_stride = pktntime;
        let eff_units = obs.eff_block_size / 2;

        let worst = (nants - 1) * fid_stride
            + (nstrm - 1) * stream_stride
            + (piperblk - 1) * pktidx_stride
            + (pktnchan - 1) * ostride
            + (pktntime - 1);
        if worst >= eff_units {
            return Err(IngestError::ObsInfo(format!(
                "scatter geometry overruns the effective block: cell {} >= {} units",
                worst, eff_units
            )));
        }

        Ok(Self {
            ostride,
            stream_stride,
            fid_stride,
            pktidx_stride,
            piperblk: obs.piperblk,
            pktntime,
            pktnchan,
            nants,
            nstrm,
            eff_units,
        })
    }

    /// Effective data-area size in 16-bit units.
    pub fn eff_units(&self) -> usize {
        self.eff_units
    }

    #[inline]
    fn base_offset(&self, feng_id: u16, stream: u32, pktidx: u64) -> usize {
        feng_id as usize * self.fid_stride
            + stream as usize * self.stream_stride
            + (pktidx % self.piperblk) as usize * self.pktidx_stride
    }

    /// Scatter one packet payload into the block at its
    /// (antenna, stream, time, channel) rectangle. Duplicate deliveries
    /// land on the same cells; the last write wins.
    pub fn scatter(
        &self,
        data: &mut [u16],
        feng_id: u16,
        stream: u32,
        pktidx: u64,
        payload: &[u8],
    ) {
        debug_assert!(data.len() >= self.eff_units);
        debug_assert_eq!(payload.len(), self.pktntime * self.pktnchan * 2);
        debug_assert!((feng_id as usize) < self.nants);
        debug_assert!((stream as usize) < self.nstrm);

        let mut base = self.base_offset(feng_id, stream, pktidx);
        let mut src = 0;
        for _t in 0..self.pktntime {
            let row = &mut data[base..];
            for c in 0..self.pktnchan {
                let at = 2 * (src + c);
                row[c * self.ostride] = u16::from_ne_bytes([payload[at], payload[at + 1]]);
            }
            base += 1;
            src += self.pktnchan;
        }
    }

    /// Inverse of [`scatter`](Self::scatter): read one packet's rectangle
    /// back out of a block.
    pub fn gather(
        &self,
        data: &[u16],
        feng_id: u16,
        stream: u32,
        pktidx: u64,
        out: &mut Vec<u8>,
    ) {
        out.clear();
        let mut base = self.base_offset(feng_id, stream, pktidx);
        for _t in 0..self.pktntime {
            let row = &data[base..];
            for c in 0..self.pktnchan {
                out.extend_from_slice(&row[c * self.ostride].to_ne_bytes());
            }
            base += 1;
        }
    }
}
