//! A transparent impairment tunnel between two network interfaces
//!
//! Frames entering through either [`Port`] traverse a per-direction chain of impairment
//! stages before leaving through the opposite port. The configuration lives in a
//! [`ConfigStore`] and can be replaced at runtime through a [`ReloadController`], which
//! rebuilds the chains without losing frames already in flight.

mod chain;
pub mod config;
pub mod direction;
pub mod frame;
pub mod modules;
pub mod packet;
pub mod pcap_exporter;
pub mod reload;
pub mod sampling;
pub mod stats;
pub mod tunnel;

pub use config::{ConfigError, ConfigSnapshot, ConfigSource, ConfigStore, FileSource};
pub use direction::{Direction, PerDirection};
pub use frame::Frame;
pub use modules::StageKind;
pub use reload::{ReloadController, ReloadError, ReloadHandle, ReloadState};
pub use stats::{PacketStats, PipelineStats, StageStats};
pub use tunnel::{Port, PortPeer, Tunnel, TunnelError, TunnelOptions};
