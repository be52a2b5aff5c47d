//! # Wearable Ranging Tag Core
//!
//! The device-independent core of a wearable UWB ranging tag: a set of tags
//! discovers each other over a low-power link, elects roles without a fixed
//! coordinator, and then measures pairwise distances in slotted TDMA rounds
//! driven by a periodic timer and radio completion events.
//!
//! ## Features
//!
//! - **Leaderless role election**: a pure decision over the discovery
//!   snapshot; mastership is only ever claimed by the device others join
//! - **Eight-phase TDMA rounds**: schedule broadcast, slotted ranging,
//!   status exchange, computation, idle gap, and membership updates
//! - **Single-sided two-way ranging**: 40-bit radio timestamps, delayed
//!   transmissions, and clock-offset-free distance math
//! - **Event-flag dispatch**: producers OR bits from any context, one
//!   consumer drains and handles them in a fixed order
//! - **Schedule-device requests**: a master enrolls directly, a participant
//!   forwards to its master at most once at a time
//! - **Embedded-friendly**: fixed-capacity tables, bounded frame buffers
//!
//! ## Quick Start
//!
//! ```rust
//! use rangetag::sim::{Position, SimConfig, SimNetwork};
//!
//! # fn main() -> Result<(), rangetag::radio::RadioError> {
//! let mut net = SimNetwork::new(SimConfig::default());
//! let a = net.add_tag(0x01, Position::new(0.0, 0.0))?;
//! let b = net.add_tag(0x02, Position::new(3000.0, 0.0))?;
//!
//! // Step through discovery, election, and a few ranging rounds.
//! net.run_steps(120);
//!
//! assert_eq!(net.master_count(), 1);
//! assert!(net.device(a).scheduler().is_active());
//! let measured = net.device(b).platform().last_distance_to(net.device(a).id());
//! assert!(measured.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The core is organized into several key modules:
//!
//! - [`types`] - Device identity and shared domain types
//! - [`events`] - OR-accumulated event flags and the wait primitives
//! - [`peers`] - Discovery observation windows
//! - [`election`] - Role election over discovery snapshots
//! - [`protocol`] - Ranging frame encoding and decoding
//! - [`ranging`] - Timestamp algebra and two-way ranging math
//! - [`radio`] - The radio driver seam and bring-up ladder
//! - [`link`] - The discovery link transport seam
//! - [`scheduler`] - The eight-phase TDMA round state machine
//! - [`app`] - The dispatch loop tying link, radio, and platform together
//! - [`sim`] - Multi-device simulation harness

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod types;
pub mod events;
pub mod peers;
pub mod election;
pub mod protocol;
pub mod ranging;
pub mod radio;
pub mod link;
pub mod scheduler;
pub mod app;
pub mod sim;

// Re-export main public types for convenience
pub use app::{AppConfig, Platform, TagApp, TagContext};
pub use events::{AppEvent, EventFlags};
pub use scheduler::{RangingScheduler, SchedulerConfig};
pub use types::{DeviceId, RangeMeasurement, RangingRole};
