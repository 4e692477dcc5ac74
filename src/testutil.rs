//! Shared fixtures for the scenario tests.

use crate::input::packet::{write_header, PacketHeader, PKT_HEADER_SIZE};
use crate::obs::ObsInfo;
use crate::status::StatusBuffer;

/// The S1 geometry used throughout the scenario tests: one antenna, one
/// stream, 64 channels x 16 time samples per packet, 128 packet indices
/// per block, 128 packets per block.
pub(crate) fn s1_status() -> StatusBuffer {
    let sb = StatusBuffer::new();
    {
        let mut st = sb.lock();
        st.set("FENCHAN", 64u32);
        st.set("NANTS", 1u32);
        st.set("NSTRM", 1u32);
        st.set("PKTNCHAN", 64u32);
        st.set("PKTNTIME", 16u32);
        st.set("SCHAN", 0u32);
        st.set("CHAN_BW", 0.25f64);
        st.set("SYNCTIME", 1_600_000_000u64);
        st.set("BLOCSIZE", 262_144usize);
    }
    sb
}

pub(crate) fn s1_obsinfo() -> ObsInfo {
    let sb = s1_status();
    let obs_info = ObsInfo::from_status(&sb.lock()).unwrap();
    obs_info
}

/// Payload whose 16-bit units encode their own (pktidx, time, chan)
/// coordinates, so scatter placement is checkable sample by sample.
pub(crate) fn tagged_payload(obs: &ObsInfo, pktidx: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(obs.payload_bytes);
    for t in 0..obs.pktntime as u64 {
        for c in 0..obs.pktnchan as u64 {
            let unit = ((pktidx & 0x3F) << 10 | (t & 0xF) << 6 | (c & 0x3F)) as u16;
            payload.extend_from_slice(&unit.to_ne_bytes());
        }
    }
    payload
}

/// Complete wire frame (header + payload) for one packet.
pub(crate) fn frame(obs: &ObsInfo, pktidx: u64, feng_id: u16, feng_chan: u16) -> Vec<u8> {
    let header = PacketHeader {
        pktidx,
        n_chans: obs.pktnchan as u16,
        feng_chan,
        feng_id,
    };
    let mut buf = vec![0u8; PKT_HEADER_SIZE];
    write_header(&mut buf, &header);
    buf.extend_from_slice(&tagged_payload(obs, pktidx));
    buf
}
