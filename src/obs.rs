//! Observation geometry derived from the status buffer.
//!
//! An `ObsInfo` is immutable for the lifetime of an observation; the ingest
//! re-derives it at the 1 Hz tick and rebuilds its block view whenever the
//! parameters change.

use crate::error::IngestError;
use crate::status::StatusGuard;

/// Physical size of a raw block's data area when `BLOCSIZE` is absent.
pub const DEFAULT_BLOCK_DATA_SIZE: usize = 128 * 1024 * 1024;

const DEFAULT_NPOL: i64 = 2;
const DEFAULT_NBITS: i64 = 4;

/// Per-observation packet and block geometry.
///
/// The derived fields are fixed by the inputs: `PIPERBLK` packet indices
/// per block, `OBSNCHAN` total channels, the effective (written) block
/// size, and the expected packet count per block.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsInfo {
    pub fenchan: u32,
    pub nants: u32,
    pub nstrm: u32,
    pub pktnchan: u32,
    pub pktntime: u32,
    pub schan: u32,
    pub nbits: u32,
    pub npol: u32,
    /// Channel bandwidth in MHz; negative for a flipped band.
    pub chan_bw: f64,
    pub synctime: u64,
    /// Physical data-area size of one raw block in bytes.
    pub block_data_size: usize,

    // Derived.
    pub obsnchan: u64,
    pub piperblk: u64,
    pub pkts_per_block: u64,
    /// Bytes of the data area actually written; the tail beyond this is
    /// never touched.
    pub eff_block_size: usize,
    pub payload_bytes: usize,
    /// Payload size in 16-bit units (one packed polarization pair each).
    pub payload_units: usize,
    pub obsbw: f64,
    /// Sample period in seconds.
    pub tbin: f64,
}

impl ObsInfo {
    /// Derive the observation geometry from a locked status buffer.
    pub fn from_status(st: &StatusGuard<'_>) -> Result<Self, IngestError> {
        let fenchan = require(st, "FENCHAN")?;
        let nants = require(st, "NANTS")?;
        let nstrm = require(st, "NSTRM")?;
        let pktnchan = require(st, "PKTNCHAN")?;
        let pktntime = require(st, "PKTNTIME")?;
        let schan = st.get_int("SCHAN").unwrap_or(0);
        let npol = st.get_int("NPOL").unwrap_or(DEFAULT_NPOL);
        let nbits = st.get_int("NBITS").unwrap_or(DEFAULT_NBITS);
        let chan_bw = st
            .get_real("CHAN_BW")
            .ok_or_else(|| IngestError::ObsInfo("missing CHAN_BW".into()))?;
        let synctime = st.get_int("SYNCTIME").unwrap_or(0).max(0) as u64;
        let block_data_size = match st.get_int("BLOCSIZE") {
            Some(v) if v > 0 => v as usize,
            _ => DEFAULT_BLOCK_DATA_SIZE,
        };

        for (name, v) in [
            ("NANTS", nants),
            ("NSTRM", nstrm),
            ("PKTNCHAN", pktnchan),
            ("PKTNTIME", pktntime),
        ] {
            if v < 1 {
                return Err(IngestError::ObsInfo(format!("{} = {} out of range", name, v)));
            }
        }
        if schan < 0 {
            return Err(IngestError::ObsInfo(format!("SCHAN = {} out of range", schan)));
        }
        if fenchan < nstrm * pktnchan {
            return Err(IngestError::ObsInfo(format!(
                "FENCHAN = {} smaller than NSTRM*PKTNCHAN = {}",
                fenchan,
                nstrm * pktnchan
            )));
        }
        if chan_bw == 0.0 {
            return Err(IngestError::ObsInfo("CHAN_BW = 0".into()));
        }

        let sample_bytes = (2 * nbits) as usize / 8;
        if npol as usize * sample_bytes != 2 {
            return Err(IngestError::ObsInfo(format!(
                "NPOL = {} with NBITS = {} does not pack into 16-bit units",
                npol, nbits
            )));
        }

        let nants = nants as u64;
        let nstrm = nstrm as u64;
        let pktnchan = pktnchan as u64;
        let pktntime = pktntime as u64;

        let pkt_cell_bytes =
            nants * nstrm * pktnchan * pktntime * npol as u64 * sample_bytes as u64;
        let piperblk = block_data_size as u64 / pkt_cell_bytes;
        if piperblk < 1 {
            return Err(IngestError::ObsInfo(format!(
                "block of {} bytes holds no complete packet index",
                block_data_size
            )));
        }

        let obsnchan = nants * nstrm * pktnchan;
        let eff_block_size =
            (piperblk * obsnchan * pktntime * npol as u64 * sample_bytes as u64) as usize;
        let payload_bytes = (pktntime * pktnchan * npol as u64 * sample_bytes as u64) as usize;

        Ok(ObsInfo {
            fenchan: fenchan as u32,
            nants: nants as u32,
            nstrm: nstrm as u32,
            pktnchan: pktnchan as u32,
            pktntime: pktntime as u32,
            schan: schan as u32,
            nbits: nbits as u32,
            npol: npol as u32,
            chan_bw,
            synctime,
            block_data_size,
            obsnchan,
            piperblk,
            pkts_per_block: piperblk * nants * nstrm,
            eff_block_size,
            payload_bytes,
            payload_units: payload_bytes / 2,
            obsbw: chan_bw * obsnchan as f64,
            tbin: 1e-6 / chan_bw.abs(),
        })
    }

    /// Stream index of a packet's starting channel, or `None` if the
    /// channel is not one of this antenna's stream boundaries.
    pub fn stream_of(&self, feng_chan: u16) -> Option<u32> {
        let chan = (feng_chan as u32).checked_sub(self.schan)?;
        if chan % self.pktnchan != 0 {
            return None;
        }
        let stream = chan / self.pktnchan;
        (stream < self.nstrm).then_some(stream)
    }

    /// Publish the derived geometry to the status buffer.
    pub fn publish(&self, st: &mut StatusGuard<'_>) {
        st.set("OBSNCHAN", self.obsnchan);
        st.set("PIPERBLK", self.piperblk);
        st.set("BLOCSIZE", self.eff_block_size);
        st.set("OBSBW", self.obsbw);
        st.set("TBIN", self.tbin);
        st.set("PKTFMT", "ATASNAPV");
        st.set("OBSINFO", "VALID");
    }
}

fn require(st: &StatusGuard<'_>, key: &str) -> Result<i64, IngestError> {
    st.get_int(key)
        .ok_or_else(|| IngestError::ObsInfo(format!("missing {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::s1_status;

    #[test]
    fn test_derive_s1_geometry() {
        let sb = s1_status();
        let obs = ObsInfo::from_status(&sb.lock()).unwrap();
        assert_eq!(obs.piperblk, 128);
        assert_eq!(obs.obsnchan, 64);
        assert_eq!(obs.pkts_per_block, 128);
        assert_eq!(obs.payload_bytes, 2048);
        assert_eq!(obs.payload_units, 1024);
        assert_eq!(obs.eff_block_size, 262_144);
        assert!((obs.tbin - 4e-6).abs() < 1e-12);
        assert!((obs.obsbw - 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_effective_size_smaller_than_physical() {
        let sb = s1_status();
        sb.lock().set("BLOCSIZE", 262_144usize + 1000);
        let obs = ObsInfo::from_status(&sb.lock()).unwrap();
        // The odd tail holds no complete packet index and is never written.
        assert_eq!(obs.piperblk, 128);
        assert_eq!(obs.eff_block_size, 262_144);
    }

    #[test]
    fn test_missing_key_rejected() {
        let sb = s1_status();
        sb.lock().remove("NANTS");
        let err = ObsInfo::from_status(&sb.lock()).unwrap_err();
        assert!(err.to_string().contains("NANTS"));
    }

    #[test]
    fn test_unpackable_sample_format_rejected() {
        let sb = s1_status();
        sb.lock().set("NBITS", 8u32);
        assert!(ObsInfo::from_status(&sb.lock()).is_err());
    }

    #[test]
    fn test_zero_bandwidth_rejected() {
        let sb = s1_status();
        sb.lock().set("CHAN_BW", 0.0f64);
        assert!(ObsInfo::from_status(&sb.lock()).is_err());
    }

    #[test]
    fn test_stream_lookup() {
        let sb = s1_status();
        {
            let mut st = sb.lock();
            st.set("NSTRM", 2u32);
            st.set("SCHAN", 64u32);
            st.set("FENCHAN", 256u32);
        }
        let obs = ObsInfo::from_status(&sb.lock()).unwrap();
        assert_eq!(obs.stream_of(64), Some(0));
        assert_eq!(obs.stream_of(128), Some(1));
        // Not a stream boundary, below SCHAN, beyond NSTRM.
        assert_eq!(obs.stream_of(100), None);
        assert_eq!(obs.stream_of(0), None);
        assert_eq!(obs.stream_of(192), None);
    }
}
