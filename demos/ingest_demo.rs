//! End-to-end ingest demo: UDP capture -> block assembly -> drain.
//!
//! Usage:
//!   cargo run --example ingest_demo            # listen on 127.0.0.1:10000
//!   cargo run --example ingest_demo -- 10000
//!
//! Pair with the feeder:
//!   cargo run --example feed_demo
//!
//! Configures an S1-style observation through the status buffer, spawns
//! the ingest thread on a UDP packet source, and acts as the downstream
//! consumer: every finalized block is drained, its header summarized, and
//! its memory recycled. Runs until Ctrl-C (or 30 s).

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use guppi_ingest::{
    status::find_record, BlockRing, FrameLayout, IngestConfig, IngestThread, StatusBuffer,
    UdpPacketSource, UdpSourceConfig,
};

fn main() {
    env_logger::init();

    let port: i64 = env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(10000);

    // Observation parameters arrive through the status buffer, exactly as
    // an operator would poke them into a running pipeline.
    let status = Arc::new(StatusBuffer::new());
    {
        let mut st = status.lock();
        st.set("FENCHAN", 64u32);
        st.set("NANTS", 1u32);
        st.set("NSTRM", 1u32);
        st.set("PKTNCHAN", 64u32);
        st.set("PKTNTIME", 16u32);
        st.set("SCHAN", 0u32);
        st.set("CHAN_BW", 0.25f64);
        st.set("SYNCTIME", 1_600_000_000u64);
        st.set("BLOCSIZE", 262_144usize);
        st.set("BINDPORT", port);
        st.set("DESTIP", "127.0.0.1");
        st.set("PKTSTART", 0u64);
        st.set("DWELL", 10.0f64);
    }

    let payload_bytes = 16 * 64 * 2;
    let layout = FrameLayout::new(payload_bytes, 256);
    let source = UdpPacketSource::new(layout, UdpSourceConfig::default());
    let ring = Arc::new(BlockRing::new(8, 262_144));

    let ingest = IngestThread::spawn(
        IngestConfig::default(),
        status.clone(),
        ring.clone(),
        source,
    )
    .expect("spawn ingest");

    println!("ingest listening on port {}; feed it with feed_demo", port);

    // Downstream consumer: drain finalized blocks for 30 seconds.
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        match ring.wait_filled(Duration::from_millis(500)) {
            Ok(Some(block)) => {
                println!(
                    "block {:>4}: NPKT={:<6} DROPSTAT={}",
                    block.block_num,
                    block.npacket,
                    find_record(block.header(), "DROPSTAT").unwrap_or_default(),
                );
                ring.set_free(block);
            }
            Ok(None) => {
                let st = status.lock();
                println!(
                    "waiting... DAQSTATE={} NETSTAT={} PHYSPKPS={}",
                    st.get_str("DAQSTATE").unwrap_or("?"),
                    st.get_str("NETSTAT").unwrap_or("?"),
                    st.get_real("PHYSPKPS").unwrap_or(0.0),
                );
            }
            Err(e) => {
                eprintln!("ring error: {}", e);
                break;
            }
        }
    }

    ingest.join().expect("ingest exited cleanly");
}
