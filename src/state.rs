//! Observation state machine: IDLE / LISTEN / RECORD.
//!
//! The machine is driven from the ingest loop by DESTIP changes (IDLE <->
//! LISTEN) and by packet indices crossing the [PKTSTART, PKTSTOP) window
//! (LISTEN <-> RECORD). Scattering is identical in LISTEN and RECORD; the
//! machine gates the start-time stamp and the published DAQSTATE.

use std::net::Ipv4Addr;

use log::{debug, info};

use crate::error::IngestError;
use crate::obs::ObsInfo;
use crate::status::StatusBuffer;
use crate::time::mjd_from_unix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqState {
    Idle,
    Listen,
    Record,
}

impl DaqState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaqState::Idle => "IDLE",
            DaqState::Listen => "LISTEN",
            DaqState::Record => "RECORD",
        }
    }
}

/// Record gating for one ingest instance.
pub struct ObsGate {
    pub state: DaqState,
    pktstart: u64,
    pktstop: u64,
}

impl Default for ObsGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ObsGate {
    pub fn new() -> Self {
        Self {
            state: DaqState::Idle,
            pktstart: 0,
            pktstop: 0,
        }
    }

    pub fn pktstop(&self) -> u64 {
        self.pktstop
    }

    /// Flows torn down; stop gating until DESTIP comes back.
    pub fn to_idle(&mut self, status: &StatusBuffer) {
        self.state = DaqState::Idle;
        let mut st = status.lock();
        st.set("DAQSTATE", DaqState::Idle.as_str());
        st.set("STTVALID", 0u64);
    }

    /// Flows installed; start watching for the record window.
    pub fn to_listen(&mut self, status: &StatusBuffer) {
        self.state = DaqState::Listen;
        let mut st = status.lock();
        st.set("DAQSTATE", DaqState::Listen.as_str());
        st.set("STTVALID", 0u64);
    }

    /// Runs at each first packet of a block (`pktidx % PIPERBLK == 0`).
    ///
    /// In LISTEN this re-reads PKTSTART and DWELL, normalizes PKTSTART down
    /// to a block boundary (writing it back), derives PKTSTOP, and enters
    /// RECORD when the index is inside the window.
    pub fn block_boundary(&mut self, pktidx: u64, obs: &ObsInfo, status: &StatusBuffer) {
        match self.state {
            DaqState::Idle => {}
            DaqState::Listen => {
                let (pktstart, pktstop);
                {
                    let mut st = status.lock();
                    let raw_start = st.get_int("PKTSTART").unwrap_or(0).max(0) as u64;
                    let dwell = st.get_real("DWELL").unwrap_or(0.0).max(0.0);

                    pktstart = raw_start - raw_start % obs.piperblk;
                    let dwell_blks = (dwell
                        / (obs.tbin * obs.pktntime as f64 * obs.piperblk as f64))
                        .floor() as u64;
                    pktstop = pktstart + obs.piperblk * dwell_blks;

                    st.set("PKTSTART", pktstart);
                    st.set("PKTSTOP", pktstop);
                }
                self.pktstart = pktstart;
                self.pktstop = pktstop;

                if pktstart <= pktidx && pktidx < pktstop {
                    self.enter_record(pktidx, obs, status);
                }
            }
            DaqState::Record => {
                self.on_packet(pktidx, status);
            }
        }
    }

    /// Cheap per-packet check: leave RECORD once the stop index passes.
    pub fn on_packet(&mut self, pktidx: u64, status: &StatusBuffer) {
        if self.state == DaqState::Record && pktidx >= self.pktstop {
            debug!("record window closed at pktidx {}", pktidx);
            self.state = DaqState::Listen;
            let mut st = status.lock();
            st.set("DAQSTATE", DaqState::Listen.as_str());
            st.set("STTVALID", 0u64);
        }
    }

    fn enter_record(&mut self, pktidx: u64, obs: &ObsInfo, status: &StatusBuffer) {
        // Absolute observation start from the F-engine sync epoch.
        let realtime_secs = pktidx as f64 * obs.pktntime as f64 / (1e6 * obs.chan_bw.abs());
        let mjd = mjd_from_unix(obs.synctime as f64 + realtime_secs);

        info!(
            "recording from pktidx {} to {} (start {}+{:.6}s)",
            pktidx, self.pktstop, obs.synctime, realtime_secs
        );
        self.state = DaqState::Record;
        let mut st = status.lock();
        st.set("DAQSTATE", DaqState::Record.as_str());
        st.set("STT_IMJD", mjd.imjd);
        st.set("STT_SMJD", mjd.smjd);
        st.set("STT_OFFS", mjd.offs);
        st.set("STTVALID", 1u64);
    }
}

/// Parse a DESTIP spec: `A.B.C.D` for one destination, `A.B.C.D+N` for
/// `N+1` contiguous destinations starting at `A.B.C.D`.
pub fn parse_destip(spec: &str) -> Result<(Ipv4Addr, usize), IngestError> {
    let spec = spec.trim();
    let (base, extra) = match spec.split_once('+') {
        Some((base, n)) => {
            let n: usize = n.parse().map_err(|_| IngestError::DestSpec {
                spec: spec.to_string(),
                reason: format!("bad flow count '{}'", n),
            })?;
            (base, n)
        }
        None => (spec, 0),
    };
    let base: Ipv4Addr = base.parse().map_err(|_| IngestError::DestSpec {
        spec: spec.to_string(),
        reason: format!("bad address '{}'", base),
    })?;
    Ok((base, extra + 1))
}

/// Expand a parsed DESTIP into concrete destinations, clamped to
/// `maxflows`.
pub fn expand_dests(base: Ipv4Addr, count: usize, maxflows: usize) -> Vec<Ipv4Addr> {
    let count = count.min(maxflows.max(1));
    let base = u32::from(base);
    (0..count as u32)
        .map(|i| Ipv4Addr::from(base.wrapping_add(i)))
        .collect()
}

/// `0.0.0.0` (or an empty spec) means no flows: IDLE.
pub fn is_idle_dest(spec: &str) -> bool {
    let spec = spec.trim();
    spec.is_empty() || spec == "0.0.0.0"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::ObsInfo;
    use crate::testutil::s1_status;

    #[test]
    fn test_s5_state_transitions() {
        let status = s1_status();
        let obs = ObsInfo::from_status(&status.lock()).unwrap();
        // DWELL spanning exactly two blocks of packet indices.
        let dwell = 2.0 * obs.tbin * obs.pktntime as f64 * obs.piperblk as f64;
        {
            let mut st = status.lock();
            st.set("PKTSTART", 256u64);
            st.set("DWELL", dwell);
        }

        let mut gate = ObsGate::new();
        gate.to_listen(&status);

        let mut rises = 0;
        let mut falls = 0;
        let mut last_valid = 0i64;
        for pktidx in 0..1024u64 {
            if pktidx % obs.piperblk == 0 {
                gate.block_boundary(pktidx, &obs, &status);
            } else {
                gate.on_packet(pktidx, &status);
            }
            let valid = status.lock().get_int("STTVALID").unwrap_or(0);
            if valid == 1 && last_valid == 0 {
                rises += 1;
                assert_eq!(pktidx, 256);
                assert_eq!(gate.state, DaqState::Record);
            }
            if valid == 0 && last_valid == 1 {
                falls += 1;
                assert_eq!(pktidx, 512);
                assert_eq!(gate.state, DaqState::Listen);
            }
            last_valid = valid;
        }
        assert_eq!((rises, falls), (1, 1));

        // PKTSTOP derived from DWELL, PKTSTART written back normalized.
        let st = status.lock();
        assert_eq!(st.get_int("PKTSTART"), Some(256));
        assert_eq!(st.get_int("PKTSTOP"), Some(512));

        // Start time: SYNCTIME + 256 * 16 / (1e6 * 0.25) seconds.
        let expect = crate::time::mjd_from_unix(1_600_000_000.0 + 256.0 * 16.0 / 250_000.0);
        assert_eq!(st.get_int("STT_IMJD"), Some(expect.imjd as i64));
        assert_eq!(st.get_int("STT_SMJD"), Some(expect.smjd as i64));
    }

    #[test]
    fn test_pktstart_normalized_to_block_boundary() {
        let status = s1_status();
        let obs = ObsInfo::from_status(&status.lock()).unwrap();
        {
            let mut st = status.lock();
            st.set("PKTSTART", 300u64); // not a multiple of PIPERBLK = 128
            st.set("DWELL", 1.0f64);
        }
        let mut gate = ObsGate::new();
        gate.to_listen(&status);
        gate.block_boundary(0, &obs, &status);

        assert_eq!(status.lock().get_int("PKTSTART"), Some(256));
    }

    #[test]
    fn test_zero_dwell_never_records() {
        let status = s1_status();
        let obs = ObsInfo::from_status(&status.lock()).unwrap();
        status.lock().set("PKTSTART", 0u64);

        let mut gate = ObsGate::new();
        gate.to_listen(&status);
        for pktidx in (0..1024u64).step_by(obs.piperblk as usize) {
            gate.block_boundary(pktidx, &obs, &status);
        }
        assert_eq!(gate.state, DaqState::Listen);
        assert_eq!(status.lock().get_int("STTVALID"), Some(0));
    }

    #[test]
    fn test_parse_destip_forms() {
        let (base, count) = parse_destip("239.8.0.1").unwrap();
        assert_eq!(base, Ipv4Addr::new(239, 8, 0, 1));
        assert_eq!(count, 1);

        let (base, count) = parse_destip("239.8.0.1+3").unwrap();
        assert_eq!(base, Ipv4Addr::new(239, 8, 0, 1));
        assert_eq!(count, 4);

        assert!(parse_destip("not-an-ip").is_err());
        assert!(parse_destip("239.8.0.1+x").is_err());
    }

    #[test]
    fn test_expand_dests_clamped_to_maxflows() {
        let dests = expand_dests(Ipv4Addr::new(239, 8, 0, 253), 8, 4);
        assert_eq!(
            dests,
            vec![
                Ipv4Addr::new(239, 8, 0, 253),
                Ipv4Addr::new(239, 8, 0, 254),
                Ipv4Addr::new(239, 8, 0, 255),
                Ipv4Addr::new(239, 8, 1, 0),
            ]
        );
    }

    #[test]
    fn test_idle_dest_detection() {
        assert!(is_idle_dest("0.0.0.0"));
        assert!(is_idle_dest("  "));
        assert!(!is_idle_dest("239.8.0.1"));
    }
}
