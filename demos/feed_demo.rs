//! Synthetic F-engine feeder - transmits voltage packets over UDP.
//!
//! Usage:
//!   cargo run --example feed_demo                      # 127.0.0.1:10000
//!   cargo run --example feed_demo -- 239.8.0.1 10000   # custom destination
//!
//! Emits the S1-style geometry (one antenna, one stream, 64 channels x 16
//! time samples per packet) at a gentle rate so the ingest demo has
//! something real to reassemble.

use std::env;
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use guppi_ingest::PacketBuilder;

const PKTNCHAN: usize = 64;
const PKTNTIME: u32 = 16;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let dest = args.get(1).map(String::as_str).unwrap_or("127.0.0.1");
    let port: u16 = args
        .get(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(10000);

    let socket = UdpSocket::bind("0.0.0.0:0").expect("bind feeder socket");
    let mut builder = PacketBuilder::new(0, PKTNTIME);

    println!("feeding voltage packets to {}:{}", dest, port);

    let mut payload = vec![0u8; PKTNTIME as usize * PKTNCHAN * 2];
    let mut pktidx: u64 = 0;
    loop {
        // A recognizable ramp so a consumer can eyeball the samples.
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (pktidx as usize + i) as u8;
        }
        let frame = builder.build(pktidx, 0, &payload);
        if let Err(e) = socket.send_to(frame, (dest, port)) {
            eprintln!("send failed: {}", e);
            return;
        }
        pktidx += 1;

        if pktidx % 128 == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }
}
