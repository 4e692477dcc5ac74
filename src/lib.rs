//! F-engine UDP voltage ingest for GUPPI raw pipelines.
//!
//! Reassembles high-rate UDP packets from F-engine antennas into
//! contiguous, time-ordered voltage blocks:
//! - Input: slot-aligned packet frames from a capture source (UDP
//!   multicast flows, or an in-memory source for tests and feeders)
//! - Output: GUPPI-style raw blocks (status-snapshot header + a
//!   `[FID][STREAM][CHAN][TIME]` data area) on a ring shared with a
//!   downstream consumer
//!
//! All configuration flows through the shared status buffer; an
//! observation state machine (IDLE / LISTEN / RECORD) is driven by the
//! DESTIP, PKTSTART, PKTSTOP and DWELL keys.

pub mod block;
pub mod error;
pub mod ingest;
pub mod input;
pub mod obs;
pub mod rt;
pub mod state;
pub mod status;
pub mod time;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;

pub use block::assembler::BlockAssembler;
pub use block::ring::{BlockRing, RawBlock};
pub use block::view::BlockView;
pub use error::IngestError;
pub use ingest::{run_ingest, IngestConfig, IngestThread};
pub use input::packet::{PacketBuilder, PacketHeader, VoltagePacket};
pub use input::source::{FrameLayout, InputBlock, MemPacketSource, PacketSource};
pub use input::udp::{UdpPacketSource, UdpSourceConfig};
pub use obs::ObsInfo;
pub use state::{DaqState, ObsGate};
pub use status::{StatusBuffer, StatusValue};

/// Frame header and payload offsets within a capture slot are multiples
/// of this.
pub const PKT_ALIGNMENT_SIZE: usize = 64;

/// One status card image.
pub const STATUS_RECORD_SIZE: usize = 80;

/// Size of the status snapshot region at the head of each raw block.
pub const STATUS_TOTAL_SIZE: usize = 5120;

/// Moving-average window for the input fill-to-free latency statistic.
pub const N_INPUT_BLOCKS: usize = 16;

// Instance registry: out-of-band operator control attaches to a running
// ingest's status buffer by instance id. Registration happens at thread
// spawn, removal at join; access is never on the packet path.
lazy_static! {
    static ref INSTANCE_REGISTRY: RwLock<HashMap<u32, Arc<StatusBuffer>>> =
        RwLock::new(HashMap::new());
}

/// Register a running instance's status buffer.
pub fn register_instance(instance_id: u32, status: Arc<StatusBuffer>) {
    INSTANCE_REGISTRY.write().insert(instance_id, status);
}

/// Remove an instance from the registry.
pub fn unregister_instance(instance_id: u32) {
    INSTANCE_REGISTRY.write().remove(&instance_id);
}

/// Attach to a running instance's status buffer.
pub fn attach_instance(instance_id: u32) -> Option<Arc<StatusBuffer>> {
    INSTANCE_REGISTRY.read().get(&instance_id).cloned()
}
