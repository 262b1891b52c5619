//! Multilink PPP (RFC 1990) bundling engine.
//!
//! Splits outbound datagrams into sequenced fragments spread over several
//! physical links, and reassembles inbound fragments arriving out of order
//! across those links back into datagrams. Link establishment and protocol
//! demultiplexing are left to the caller.

pub mod bundle;
pub mod config;
pub mod engine;
pub mod error;
pub mod fragmenter;
pub mod header;
pub mod link;
pub mod reassembly;
pub mod sequence;
pub mod stats;

// Re-export commonly used items
pub use bundle::{Bundle, BundleState, LinkTransport};
pub use config::{BundleConfig, ConfigError, LinkConfig, NodeConfig};
pub use engine::{BundleHandle, ChannelTransport, EngineError, InboundLink};
pub use error::{MpError, TransportError, Violation};
pub use fragmenter::{OutboundFragment, Strategy};
pub use header::{HeaderError, MpHeader};
pub use link::LinkId;
pub use reassembly::{DatagramSink, ReassemblyLimits};
pub use sequence::{Seq, SeqMode};
pub use stats::{BundleStats, StatsServer, DEFAULT_STATS_PORT};
