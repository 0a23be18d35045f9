#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # activ5
//!
//! A Rust library for talking to Activ5 isometric trainers over Bluetooth Low
//! Energy.
//!
//! The crate is split into a pure protocol layer and an event-driven session
//! engine:
//!
//! - **Codec** ([`protocol`], [`units`]): decodes the legacy delimited ASCII
//!   framing of first-generation devices and the per-channel binary framing of
//!   current devices into tagged [`Message`]s, and frames text [`Command`]s.
//! - **Sessions** ([`SessionManager`], [`DeviceSession`]): tracks every
//!   discovered device, runs the handshake, detects when identity is complete
//!   and turns force readings into double-squeeze gestures.
//! - **Transport** ([`Transport`], [`BtleplugTransport`]): fire-and-forget
//!   radio requests whose results come back as events.
//! - **Observers** ([`DeviceObserver`], [`MainQueue`]): notifications are
//!   delivered in order on one task of your choosing, then rebroadcast to
//!   any number of subscribers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use activ5::{inbox, BtleplugTransport, ManagerOptions, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sink, inbox) = inbox();
//!     let transport = BtleplugTransport::new(sink.clone()).await?;
//!     let (manager, queue) = SessionManager::new(transport, ManagerOptions::default(), sink);
//!
//!     tokio::spawn(manager.clone().run(inbox));
//!     tokio::spawn(queue.run());
//!
//!     // Scan for 30 seconds, then connect to whatever was found
//!     manager.scan().await?.await?;
//!     for device in manager.devices().await {
//!         manager.connect(&device.peripheral).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

/// btleplug-backed radio transport
pub mod ble;
/// Error types and handling
pub mod error;
/// Domain events and observer delivery
pub mod events;
/// Session registry and transport event handling
pub mod manager;
/// Channel identifiers, message decoding and command framing
pub mod protocol;
/// Per-device session state and commands
pub mod session;
/// Double-squeeze gesture detection
pub mod squeeze;
/// Transport seam and the manager's inbox
pub mod transport;
/// Type definitions and data structures
pub mod types;
/// Raw sensor unit conversions
pub mod units;

// Re-export the main types for convenient usage
pub use ble::BtleplugTransport;
pub use error::{Activ5Error, Result};
pub use events::{DeviceEvent, DeviceObserver, MainQueue};
pub use manager::SessionManager;
pub use protocol::{Channel, Command, Message, MessageKind, MessageValue};
pub use session::DeviceSession;
pub use squeeze::{SqueezeDetector, SqueezePhase, SqueezeSignal};
pub use transport::{inbox, ChannelHandle, EventSink, Inbox, Input, Transport, TransportEvent};
pub use types::{
    ConnectionState, DeviceInfo, ImuSample, ManagerConnectionState, ManagerOptions, PeripheralKey, RadioState,
    ReconnectPolicy, SqueezeState, SqueezeThreshold, ACTIV5_SERVICE_UUID,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
