//! # LidarLink Discovery
//!
//! Device discovery and management for the LidarLink control plane.
//!
//! This crate provides:
//! - [`DeviceDiscovery`]: broadcast listener and handshake state machine
//! - [`DeviceManager`]: handle table, topology mode, heartbeat state and
//!   device notifications
//! - [`CommandChannel`]: per-device command sockets, ack matching and
//!   heartbeats, exposed to the manager through [`CommandDispatcher`]
//! - [`ConnectionService`]: owns all of the above and drives them from a
//!   single task
//!
//! ## Example
//!
//! ```no_run
//! use lidarlink_core::{BroadcastCode, TopologyMode};
//! use lidarlink_discovery::{ConnectionService, ManagerEvent, ServiceConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ConnectionService::start(ServiceConfig::default()).await?;
//! let manager = service.manager();
//! manager.add_listening_device(BroadcastCode::parse("0TFDFG700601881")?, TopologyMode::Lidar)?;
//!
//! let mut events = manager.event_channel();
//! while let Some(event) = events.recv().await {
//!     if let ManagerEvent::Device { info, event } = event {
//!         println!("{} {}", info.broadcast_code, event);
//!     }
//! }
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod service;
pub mod table;

#[cfg(test)]
mod mock;

pub use channel::{ChannelConfig, ChannelEvent, CommandChannel, CommandHandle, CommandRequest};
pub use discovery::{
    CandidateOutcome, DeviceDiscovery, DiscoveryConfig, FoundDevice, HandshakeAbort,
    LocalIpResolver,
};
pub use dispatch::{CommandCallback, CommandDispatcher, CommandStatus};
pub use error::{DiscoveryError, DispatchError, ManagerError, ServiceError};
pub use manager::{BroadcastCallback, ConnectedCallback, DeviceManager, ManagerEvent};
pub use service::{ConnectionService, ServiceConfig};
pub use table::{DeviceSlot, DeviceTable};
