//! UDP packet source: multicast flows feeding slot-aligned input blocks.
//!
//! A dedicated socket thread receives datagrams and packs them into input
//! blocks; blocks circulate through a pair of lock-free SPSC rings (free
//! and filled) between that thread and the ingest.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::IngestError;
use crate::input::source::{FrameLayout, InputBlock, PacketSource};

/// Socket read timeout; also bounds shutdown latency.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const FREE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct UdpSourceConfig {
    /// Local interface address for multicast membership.
    pub bind_host: Ipv4Addr,
    /// Input blocks circulating between the socket thread and the ingest.
    pub nblocks: usize,
    /// Kernel receive buffer size.
    pub recv_buf_bytes: usize,
    /// A partially filled block is published after this long.
    pub flush_after: Duration,
}

impl Default for UdpSourceConfig {
    fn default() -> Self {
        Self {
            bind_host: Ipv4Addr::UNSPECIFIED,
            nblocks: 8,
            recv_buf_bytes: 32 * 1024 * 1024,
            flush_after: Duration::from_millis(50),
        }
    }
}

pub struct UdpPacketSource {
    layout: FrameLayout,
    config: UdpSourceConfig,
    filled: HeapCons<InputBlock>,
    free: HeapProd<InputBlock>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
    flows: Vec<Ipv4Addr>,
}

impl UdpPacketSource {
    pub fn new(layout: FrameLayout, config: UdpSourceConfig) -> Self {
        // Placeholder ring ends; install_flows wires up live rings when a
        // capture thread is started.
        let (_, filled) = HeapRb::<InputBlock>::new(1).split();
        let (free, _) = HeapRb::<InputBlock>::new(1).split();
        Self {
            layout,
            config,
            filled,
            free,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            thread: None,
            flows: Vec::new(),
        }
    }

    /// Datagrams dropped because no input block was free.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn open_socket(&self, dests: &[Ipv4Addr], port: u16) -> Result<UdpSocket, IngestError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;

        if let Err(e) = socket.set_recv_buffer_size(self.config.recv_buf_bytes) {
            warn!("recv buffer request of {} bytes failed: {}", self.config.recv_buf_bytes, e);
        }

        for dest in dests {
            if dest.is_multicast() {
                socket.join_multicast_v4(dest, &self.config.bind_host)?;
            }
        }

        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(socket.into())
    }

    fn spawn_capture(&mut self, socket: UdpSocket) {
        let filled_rb = HeapRb::<InputBlock>::new(self.config.nblocks);
        let free_rb = HeapRb::<InputBlock>::new(self.config.nblocks);
        let (filled_prod, filled_cons) = filled_rb.split();
        let (mut free_prod, free_cons) = free_rb.split();
        for _ in 0..self.config.nblocks {
            let _ = free_prod.try_push(InputBlock::new(&self.layout));
        }
        self.filled = filled_cons;
        self.free = free_prod;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let dropped = self.dropped.clone();
        let layout = self.layout;
        let flush_after = self.config.flush_after;
        self.thread = Some(thread::spawn(move || {
            capture_loop(
                socket,
                layout,
                running,
                free_cons,
                filled_prod,
                flush_after,
                dropped,
            );
        }));
    }
}

impl PacketSource for UdpPacketSource {
    fn layout(&self) -> FrameLayout {
        self.layout
    }

    fn wait_filled(&mut self, timeout: Duration) -> Result<Option<InputBlock>, IngestError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(block) = self.filled.try_pop() {
                return Ok(Some(block));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(FREE_POLL);
        }
    }

    fn set_free(&mut self, mut block: InputBlock) {
        block.clear();
        // Capacity equals the number of circulating blocks, so this only
        // fails across an install/teardown boundary; the stale block is
        // simply retired.
        let _ = self.free.try_push(block);
    }

    fn install_flows(&mut self, dests: &[Ipv4Addr], port: u16) -> Result<(), IngestError> {
        self.teardown_flows();
        let socket = self.open_socket(dests, port)?;
        self.spawn_capture(socket);
        self.flows = dests.to_vec();
        info!("installed {} flow(s) on port {}", dests.len(), port);
        Ok(())
    }

    fn teardown_flows(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.flows.clear();
    }

    fn nstreams(&self) -> usize {
        self.flows.len()
    }

    fn set_bind_host(&mut self, host: Ipv4Addr) {
        self.config.bind_host = host;
    }
}

impl Drop for UdpPacketSource {
    fn drop(&mut self) {
        self.teardown_flows();
    }
}

fn capture_loop(
    socket: UdpSocket,
    layout: FrameLayout,
    running: Arc<AtomicBool>,
    mut free: HeapCons<InputBlock>,
    mut filled: HeapProd<InputBlock>,
    flush_after: Duration,
    dropped: Arc<AtomicU64>,
) {
    let mut scratch = vec![0u8; layout.slot_size];
    let mut current: Option<(InputBlock, usize, Instant)> = None;
    let mut seq = 0u64;

    while running.load(Ordering::SeqCst) {
        let (mut block, mut slot, started) = match current.take() {
            Some(cur) => cur,
            None => match free.try_pop() {
                Some(mut block) => {
                    block.clear();
                    block.seq = seq;
                    seq += 1;
                    (block, 0, Instant::now())
                }
                None => {
                    // Ingest is behind; drain the socket so the kernel
                    // queue does not back up silently.
                    if socket.recv(&mut scratch).is_ok() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    continue;
                }
            },
        };

        match socket.recv(&mut scratch) {
            Ok(len) => {
                if let Some(len) = layout.place(
                    layout.slot_mut(&mut block.data, slot),
                    &scratch[..len],
                ) {
                    block.lens[slot] = len;
                    slot += 1;
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("udp receive failed: {}", e);
                break;
            }
        }

        if slot == layout.slots_per_block || (slot > 0 && started.elapsed() >= flush_after) {
            block.filled_at = Instant::now();
            if filled.try_push(block).is_err() {
                dropped.fetch_add(layout.slots_per_block as u64, Ordering::Relaxed);
            }
        } else {
            current = Some((block, slot, started));
        }
    }

    // Hand any partial block over so it stays in circulation.
    if let Some((mut block, _, _)) = current.take() {
        block.filled_at = Instant::now();
        let _ = filled.try_push(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::source::parse_slot;
    use crate::testutil::{frame, s1_obsinfo};

    #[test]
    fn test_wait_filled_times_out_without_flows() {
        let layout = FrameLayout::new(2048, 4);
        let mut src = UdpPacketSource::new(layout, UdpSourceConfig::default());
        let got = src.wait_filled(Duration::from_millis(5)).unwrap();
        assert!(got.is_none());
        assert_eq!(src.nstreams(), 0);
    }

    #[test]
    fn test_loopback_capture() {
        let obs = s1_obsinfo();
        let layout = FrameLayout::new(obs.payload_bytes, 4);
        let mut src = UdpPacketSource::new(
            layout,
            UdpSourceConfig {
                flush_after: Duration::from_millis(20),
                ..Default::default()
            },
        );

        // Unicast delivery to the bound port; no multicast membership
        // needed for a loopback test.
        let port = 42747;
        src.install_flows(&[Ipv4Addr::new(127, 0, 0, 1)], port).unwrap();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        for idx in 0..4u64 {
            tx.send_to(&frame(&obs, idx, 0, 0), ("127.0.0.1", port)).unwrap();
        }

        let block = src
            .wait_filled(Duration::from_secs(2))
            .unwrap()
            .expect("filled block");
        assert_eq!(block.nframes(), 4);
        for slot in 0..4 {
            let pkt = parse_slot(&layout, layout.slot(&block.data, slot), block.lens[slot])
                .expect("parseable frame");
            assert_eq!(pkt.header.pktidx, slot as u64);
        }
        src.set_free(block);
        src.teardown_flows();
    }
}
