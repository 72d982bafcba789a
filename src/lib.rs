//! Session engine for a family of LiFePO4/NMC/LTO Battery Management
//! Systems with a BLE serial interface.
//!
//! The BMS exposes a UART-style GATT service (`FFF0`) and speaks a
//! newline-delimited ASCII protocol over it: the client writes short
//! commands to one characteristic and the device streams `key:value` /
//! `key=value` telemetry and parameter echoes back over another, split
//! across MTU-sized notification chunks.
//!
//! This crate owns the whole conversation: scanning and connecting
//! ([`transport`]), chunk reassembly ([`reassembler`]), line decoding into a
//! live battery model ([`protocol`], [`battery`], [`params`]), password
//! verification with its four-minute grant window ([`auth`]) and a
//! serialized, prioritized write path with a keep-alive heartbeat
//! ([`queue`]). The [`Session`] handle ties these together behind a single
//! actor task and publishes consolidated [`Snapshot`]s to any number of
//! observers.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # pub async fn main() -> bmslink::Result<()> {
//!     let transport = Arc::new(bmslink::BleTransport::new().await?);
//!     let session = bmslink::Session::spawn(transport);
//!     session.start_scan();
//!
//!     let mut snapshots = session.subscribe();
//!     while snapshots.changed().await.is_ok() {
//!         let snapshot = snapshots.borrow().clone();
//!         println!("{:?} {:.2}V", snapshot.state, snapshot.battery.total_voltage);
//!     }
//! #   Ok(())
//! # }
//! ```

pub mod auth;
pub mod battery;
pub mod codec;
mod error;
pub mod params;
pub mod protocol;
pub mod queue;
pub mod reassembler;
mod session;
pub mod transport;

pub use battery::{BatteryState, FaultReason};
pub use error::{Error, Result};
pub use params::{Parameter, ParameterTable};
pub use protocol::ChemistryPreset;
pub use queue::{Priority, WriteQueue, WriteReceipt};
pub use reassembler::LineReassembler;
pub use session::{Notice, Session, SessionState, Snapshot, SCAN_TIMEOUT};
pub use transport::ble::BleTransport;
pub use transport::{DiscoveredDevice, Transport};
