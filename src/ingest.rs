//! The ingest loop: capture -> parse -> scatter -> advance, plus the 1 Hz
//! status tick and the observation state machine driving it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::block::assembler::BlockAssembler;
use crate::block::ring::BlockRing;
use crate::error::IngestError;
use crate::input::packet::PKT_HEADER_SIZE;
use crate::input::source::{parse_slot, PacketSource};
use crate::obs::ObsInfo;
use crate::state::{expand_dests, is_idle_dest, parse_destip, DaqState, ObsGate};
use crate::status::StatusBuffer;
use crate::time::heartbeat;
use crate::{register_instance, unregister_instance, N_INPUT_BLOCKS};

/// Longest wait for the next input block before the loop services its
/// periodic work.
const INPUT_WAIT: Duration = Duration::from_millis(50);

const TICK_PERIOD: Duration = Duration::from_secs(1);

const DEFAULT_MAXFLOWS: i64 = 16;
const DEFAULT_BINDPORT: i64 = 10000;

#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub instance_id: u32,
    /// Core to pin the ingest thread to, when possible.
    pub pin_core: Option<usize>,
}

/// Throughput bookkeeping between ticks and between block boundaries.
struct Rates {
    tick_bits: u64,
    tick_pkts: u64,
    last_tick: Instant,
    boundary_bits: u64,
    boundary_pkts: u64,
    last_boundary: Instant,
}

impl Rates {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            tick_bits: 0,
            tick_pkts: 0,
            last_tick: now,
            boundary_bits: 0,
            boundary_pkts: 0,
            last_boundary: now,
        }
    }

    fn count(&mut self, wire_bytes: usize) {
        let bits = (wire_bytes as u64) * 8;
        self.tick_bits += bits;
        self.tick_pkts += 1;
        self.boundary_bits += bits;
        self.boundary_pkts += 1;
    }
}

/// Mutable state of one running ingest.
struct IngestContext {
    obs: Option<ObsInfo>,
    assembler: Option<BlockAssembler>,
    gate: ObsGate,
    rates: Rates,
    /// First accepted payload size this observation; mismatches are bogus.
    expected_payload: Option<usize>,
    npkts_total: u64,
    nbogus: u64,
    last_bogus_warn: Option<Instant>,
    /// Fill-to-free latencies of the last N input blocks, in ms.
    blkms: VecDeque<f64>,
    /// DESTIP value currently in effect.
    destip: String,
    netstat: String,
}

impl IngestContext {
    fn new() -> Self {
        Self {
            obs: None,
            assembler: None,
            gate: ObsGate::new(),
            rates: Rates::new(),
            expected_payload: None,
            npkts_total: 0,
            nbogus: 0,
            last_bogus_warn: None,
            blkms: VecDeque::with_capacity(N_INPUT_BLOCKS),
            destip: "0.0.0.0".to_string(),
            netstat: String::new(),
        }
    }

    fn set_netstat(&mut self, status: &StatusBuffer, value: &str) {
        if self.netstat != value {
            self.netstat = value.to_string();
            status.lock().set("NETSTAT", value);
        }
    }
}

/// Bogus-frame accounting with rate-limited reporting. Free function over
/// the two fields so the caller can hold other context borrows.
fn count_bogus(nbogus: &mut u64, last_warn: &mut Option<Instant>, what: &str) {
    *nbogus += 1;
    let due = last_warn.map_or(true, |t| t.elapsed() >= Duration::from_secs(1));
    if due {
        *last_warn = Some(Instant::now());
        warn!("bogus frame ({}); {} so far", what, *nbogus);
    }
}

/// Run the ingest loop on the current thread until cancellation or a
/// fatal error.
pub fn run_ingest<S: PacketSource>(
    config: &IngestConfig,
    status: &Arc<StatusBuffer>,
    ring: &Arc<BlockRing>,
    source: &mut S,
    cancel: &Arc<AtomicBool>,
) -> Result<(), IngestError> {
    crate::rt::elevate_current_thread(config.pin_core);

    let mut ctx = IngestContext::new();
    let overlap = {
        let mut st = status.lock();
        st.set("DAQSTATE", DaqState::Idle.as_str());
        st.set("DAQPULSE", heartbeat());
        st.set("NPKTS", 0u64);
        st.set("NDROP", 0u64);
        st.set("NLATE", 0u64);
        st.set("NBOGUS", 0u64);
        st.set("STTVALID", 0u64);
        if !st.contains("OBS_MODE") {
            st.set("OBS_MODE", "RAW");
        }
        let overlap = st.get_int("OVERLAP").unwrap_or(0);
        if overlap != 0 {
            st.set("OVERLAP", 0u64);
        }
        overlap
    };
    if overlap != 0 {
        // Block overlap is not supported by this scatter path.
        warn!("OVERLAP = {} not supported; forced to 0", overlap);
    }
    ctx.set_netstat(status, "idle");
    refresh_obsinfo(&mut ctx, status, ring);

    let layout = source.layout();
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let inblock = source.wait_filled(INPUT_WAIT)?;

        if ctx.rates.last_tick.elapsed() >= TICK_PERIOD {
            tick(&mut ctx, status, ring, source);
        }

        let Some(inblock) = inblock else {
            if ctx.gate.state != DaqState::Idle {
                ctx.set_netstat(status, "waiting");
            }
            continue;
        };
        let held_since = Instant::now();

        if ctx.obs.is_none() || ctx.assembler.is_none() {
            // No usable observation: keep the input ring moving and the
            // windows untouched.
            ctx.set_netstat(status, "obsinfo");
            source.set_free(inblock);
            continue;
        }
        ctx.set_netstat(status, "receiving");

        let mut cancelled = false;
        for slot in 0..layout.slots_per_block {
            let len = inblock.lens[slot];
            if len == 0 {
                continue;
            }
            ctx.npkts_total += 1;

            let frame = layout.slot(&inblock.data, slot);
            let Some(pkt) = parse_slot(&layout, frame, len) else {
                count_bogus(&mut ctx.nbogus, &mut ctx.last_bogus_warn, "unparseable header");
                continue;
            };

            // Only disjoint context fields are touched below, so the
            // observation borrow can span the whole packet path.
            let obs = match ctx.obs.as_ref() {
                Some(obs) => obs,
                None => break,
            };

            if pkt.header.n_chans as u32 != obs.pktnchan {
                count_bogus(&mut ctx.nbogus, &mut ctx.last_bogus_warn, "channel count");
                continue;
            }

            let psize = pkt.payload.len();
            match ctx.expected_payload {
                None => {
                    if psize != obs.payload_bytes {
                        count_bogus(&mut ctx.nbogus, &mut ctx.last_bogus_warn, "payload size");
                        continue;
                    }
                    ctx.expected_payload = Some(psize);
                }
                Some(expected) if psize != expected => {
                    count_bogus(&mut ctx.nbogus, &mut ctx.last_bogus_warn, "payload size");
                    continue;
                }
                _ => {}
            }

            if pkt.header.feng_id as u32 >= obs.nants {
                continue;
            }
            let Some(stream) = obs.stream_of(pkt.header.feng_chan) else {
                continue;
            };
            ctx.rates.count(PKT_HEADER_SIZE + psize);

            let pktidx = pkt.header.pktidx;
            if pktidx % obs.piperblk == 0 {
                ctx.gate.block_boundary(pktidx, obs, status);
                publish_boundary(
                    &mut ctx.rates,
                    ctx.assembler.as_ref(),
                    obs,
                    ctx.npkts_total,
                    status,
                    pktidx,
                );
            } else {
                ctx.gate.on_packet(pktidx, status);
            }

            let Some(assembler) = ctx.assembler.as_mut() else {
                break;
            };
            match assembler.dispatch(pktidx, pkt.header.feng_id, stream, pkt.payload, status, cancel)
            {
                Ok(()) => {}
                Err(IngestError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("block ring failure: {}", e);
                    source.set_free(inblock);
                    return Err(e);
                }
            }
        }

        source.set_free(inblock);
        if cancelled {
            break;
        }

        if ctx.blkms.len() == N_INPUT_BLOCKS {
            ctx.blkms.pop_front();
        }
        ctx.blkms
            .push_back(held_since.elapsed().as_secs_f64() * 1e3);
    }

    // Cancellation: abandon (do not finalize) the working blocks.
    if let Some(assembler) = ctx.assembler.take() {
        assembler.abandon();
    }
    info!(
        "ingest stopping after {} packets, {} bogus",
        ctx.npkts_total, ctx.nbogus
    );
    Ok(())
}

/// Once-per-second work: heartbeat, physical rates, counter republish,
/// ObsInfo re-read and DESTIP processing.
fn tick<S: PacketSource>(
    ctx: &mut IngestContext,
    status: &Arc<StatusBuffer>,
    ring: &Arc<BlockRing>,
    source: &mut S,
) {
    let elapsed = ctx.rates.last_tick.elapsed().as_secs_f64();
    let gbps = ctx.rates.tick_bits as f64 / elapsed / 1e9;
    let pkps = ctx.rates.tick_pkts as f64 / elapsed / 1e3;
    ctx.rates.tick_bits = 0;
    ctx.rates.tick_pkts = 0;
    ctx.rates.last_tick = Instant::now();

    let blkms = if ctx.blkms.is_empty() {
        0.0
    } else {
        ctx.blkms.iter().sum::<f64>() / ctx.blkms.len() as f64
    };
    let (ndrop, nlate) = ctx
        .assembler
        .as_ref()
        .map(|a| (a.stats.ndrop_total, a.stats.nlate))
        .unwrap_or((0, 0));

    let (used, total) = ring.occupancy();
    {
        let mut st = status.lock();
        st.set("DAQPULSE", heartbeat());
        st.set("PHYSGBPS", gbps);
        st.set("PHYSPKPS", pkps);
        st.set("NETBLKMS", blkms);
        st.set("NETBUFST", format!("{}/{}", used, total));
        st.set("NPKTS", ctx.npkts_total);
        st.set("NBOGUS", ctx.nbogus);
        st.set("NDROP", ndrop);
        st.set("NLATE", nlate);
    }

    refresh_obsinfo(ctx, status, ring);
    process_destip(ctx, status, source);
}

/// Re-derive ObsInfo from the status buffer, rebuilding the assembler when
/// the observation changed and publishing OBSINFO validity.
fn refresh_obsinfo(ctx: &mut IngestContext, status: &Arc<StatusBuffer>, ring: &Arc<BlockRing>) {
    let derived = {
        let st = status.lock();
        ObsInfo::from_status(&st)
    };
    match derived {
        Ok(obs) => {
            if ctx.obs.as_ref() == Some(&obs) {
                return;
            }
            match BlockAssembler::new(ring.clone(), &obs) {
                Ok(assembler) => {
                    info!(
                        "observation: {} ant x {} stream x {} chan, PIPERBLK {}",
                        obs.nants, obs.nstrm, obs.pktnchan, obs.piperblk
                    );
                    if let Some(old) = ctx.assembler.take() {
                        old.abandon();
                    }
                    obs.publish(&mut status.lock());
                    ctx.assembler = Some(assembler);
                    ctx.obs = Some(obs);
                    ctx.expected_payload = None;
                }
                Err(e) => {
                    warn!("unusable observation geometry: {}", e);
                    invalidate_obs(ctx, status);
                }
            }
        }
        Err(e) => {
            if ctx.obs.is_some() {
                warn!("observation parameters became invalid: {}", e);
            }
            invalidate_obs(ctx, status);
        }
    }
}

fn invalidate_obs(ctx: &mut IngestContext, status: &Arc<StatusBuffer>) {
    status.lock().set("OBSINFO", "INVALID");
    if let Some(assembler) = ctx.assembler.take() {
        assembler.abandon();
    }
    ctx.obs = None;
    ctx.expected_payload = None;
}

/// Handle DESTIP edits from the operator. Changes while flows are active
/// are rejected unless the new value is `0.0.0.0`.
fn process_destip<S: PacketSource>(
    ctx: &mut IngestContext,
    status: &Arc<StatusBuffer>,
    source: &mut S,
) {
    let (requested, maxflows, port, bindhost) = {
        let st = status.lock();
        (
            st.get_str("DESTIP").unwrap_or("0.0.0.0").to_string(),
            st.get_int("MAXFLOWS").unwrap_or(DEFAULT_MAXFLOWS).max(1) as usize,
            st.get_int("BINDPORT").unwrap_or(DEFAULT_BINDPORT) as u16,
            st.get_str("BINDHOST").and_then(|h| h.parse().ok()),
        )
    };
    if requested == ctx.destip {
        return;
    }

    if is_idle_dest(&requested) {
        info!("DESTIP cleared; tearing down {} flow(s)", source.nstreams());
        source.teardown_flows();
        ctx.gate.to_idle(status);
        ctx.set_netstat(status, "idle");
        ctx.destip = requested;
        return;
    }

    if source.nstreams() > 0 {
        error!(
            "DESTIP change to '{}' rejected while {} flow(s) active",
            requested,
            source.nstreams()
        );
        // Preserve the value actually in effect.
        status.lock().set("DESTIP", ctx.destip.clone());
        return;
    }

    match parse_destip(&requested) {
        Ok((base, count)) => {
            if let Some(host) = bindhost {
                source.set_bind_host(host);
            }
            let dests = expand_dests(base, count, maxflows);
            match source.install_flows(&dests, port) {
                Ok(()) => {
                    info!("listening on {} flow(s) from {}", dests.len(), base);
                    ctx.gate.to_listen(status);
                    ctx.set_netstat(status, "waiting");
                    ctx.destip = requested;
                }
                Err(e) => {
                    error!("flow installation for '{}' failed: {}", requested, e);
                }
            }
        }
        Err(e) => {
            error!("{}", e);
            status.lock().set("DESTIP", ctx.destip.clone());
        }
    }
}

/// Republished at every block-boundary packet, before that block can be
/// finalized.
fn publish_boundary(
    rates: &mut Rates,
    assembler: Option<&BlockAssembler>,
    obs: &ObsInfo,
    npkts_total: u64,
    status: &StatusBuffer,
    pktidx: u64,
) {
    let elapsed = rates.last_boundary.elapsed().as_secs_f64().max(1e-9);
    let gbps = rates.boundary_bits as f64 / elapsed / 1e9;
    let pkps = rates.boundary_pkts as f64 / elapsed / 1e3;
    rates.boundary_bits = 0;
    rates.boundary_pkts = 0;
    rates.last_boundary = Instant::now();

    let (ndrop, nlate) = assembler
        .map(|a| (a.stats.ndrop_total, a.stats.nlate))
        .unwrap_or((0, 0));

    let mut st = status.lock();
    st.set("PKTIDX", pktidx);
    st.set("BLOCSIZE", obs.eff_block_size);
    st.set("NETGBPS", gbps);
    st.set("NETPKPS", pkps);
    st.set("NPKTS", npkts_total);
    st.set("NDROP", ndrop);
    st.set("NLATE", nlate);
}

/// Handle to a spawned ingest thread.
pub struct IngestThread {
    instance_id: u32,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<Result<(), IngestError>>,
}

impl IngestThread {
    /// Spawn the ingest on its own named thread and register the instance
    /// so out-of-band control can attach to its status buffer.
    pub fn spawn<S: PacketSource + 'static>(
        config: IngestConfig,
        status: Arc<StatusBuffer>,
        ring: Arc<BlockRing>,
        mut source: S,
    ) -> Result<Self, IngestError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let instance_id = config.instance_id;
        let registry_status = status.clone();

        let handle = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("ingest-{}", instance_id))
                .spawn(move || {
                    let result = run_ingest(&config, &status, &ring, &mut source, &cancel);
                    if let Err(e) = &result {
                        error!("ingest {} terminated: {}", instance_id, e);
                    } else {
                        debug!("ingest {} exited cleanly", instance_id);
                    }
                    result
                })?
        };
        register_instance(instance_id, registry_status);
        Ok(Self {
            instance_id,
            cancel,
            handle,
        })
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Request cancellation and wait for the loop to exit.
    pub fn join(self) -> Result<(), IngestError> {
        self.cancel.store(true, Ordering::Relaxed);
        unregister_instance(self.instance_id);
        self.handle
            .join()
            .map_err(|_| IngestError::Source("ingest thread panicked".to_string()))?
    }
}
