//! Packet input: wire-format parsing and packet sources.

pub mod packet;
pub mod source;
pub mod udp;

pub use packet::{PacketHeader, VoltagePacket};
pub use source::{FrameLayout, InputBlock, MemPacketSource, PacketSource};
pub use udp::{UdpPacketSource, UdpSourceConfig};
