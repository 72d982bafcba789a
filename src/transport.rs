//! The boundary between the session engine and the BLE stack.
//!
//! The engine never touches the radio directly: it drives a [`Transport`]
//! (adapter readiness, scanning, connecting), a per-connection [`Link`]
//! (service discovery, teardown) and a [`WriteTarget`] (one characteristic
//! write). The production implementation in [`ble`] is backed by `bluest`;
//! tests drive the engine with channel-backed fakes.

use crate::error::Result;
use async_trait::async_trait;
use bluest::Uuid;
use futures_util::stream::BoxStream;
use std::sync::Arc;

pub mod ble;

/// The fixed GATT service exposed by the battery hardware.
pub const SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";
/// Characteristic the device pushes telemetry lines through.
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";
/// Characteristic commands are written to.
pub const WRITE_CHARACTERISTIC_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";

pub fn service_uuid() -> Uuid {
    Uuid::parse_str(SERVICE_UUID).unwrap()
}

pub fn notify_characteristic_uuid() -> Uuid {
    Uuid::parse_str(NOTIFY_CHARACTERISTIC_UUID).unwrap()
}

pub fn write_characteristic_uuid() -> Uuid {
    Uuid::parse_str(WRITE_CHARACTERISTIC_UUID).unwrap()
}

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Opaque transport-level identifier, valid for [`Transport::connect`].
    pub id: String,
    pub name: String,
    pub rssi: i16,
}

/// Adapter-level capability: readiness, scanning and connecting.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wait until the adapter is powered and authorized.
    async fn ready(&self) -> Result<()>;

    /// Start a scan. The stream yields advertisements until it is dropped,
    /// which stops the scan.
    async fn scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>>;

    /// Open a GATT connection to a previously discovered device.
    async fn connect(&self, device_id: &str) -> Result<Box<dyn Link>>;
}

/// One live GATT connection.
#[async_trait]
pub trait Link: Send + Sync {
    /// Discover the required service and characteristics and return the
    /// session endpoints. Missing service or characteristics are fatal for
    /// the connection attempt.
    async fn endpoints(&self) -> Result<LinkEndpoints>;

    /// Tear the connection down.
    async fn disconnect(&self) -> Result<()>;
}

/// A bound write characteristic.
#[async_trait]
pub trait WriteTarget: Send + Sync {
    async fn write(&self, payload: &[u8]) -> Result<()>;
}

/// The endpoints of a discovered link.
pub struct LinkEndpoints {
    pub write: Arc<dyn WriteTarget>,
    /// Inbound payload chunks. The stream ending (or yielding an error)
    /// signals that the link dropped.
    pub notifications: BoxStream<'static, Result<Vec<u8>>>,
}
