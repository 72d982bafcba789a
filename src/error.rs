use bluest::Uuid;

/// Error taxonomy of the session engine.
///
/// Only the adapter-level variants are terminal for a session; everything
/// else is recovered locally. Unparsable protocol input is never an `Error`:
/// the decoder logs and drops it so that decoding continues with the next
/// token (protocol tolerance is a design requirement).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The Bluetooth adapter is off, missing or not usable.
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,
    /// The platform refused Bluetooth access.
    #[error("bluetooth permission denied")]
    PermissionDenied,
    /// A scan could not be started.
    #[error("device scan failed: {0}")]
    ScanFailed(String),
    /// The GATT connection could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    /// The peripheral does not expose the required service.
    #[error("service {0} not found on device")]
    ServiceNotFound(Uuid),
    /// The peripheral does not expose a required characteristic.
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),
    /// A characteristic write did not complete within the ceiling.
    #[error("characteristic write timed out")]
    WriteTimeout,
    /// A characteristic write was rejected by the transport.
    #[error("characteristic write failed: {0}")]
    WriteFailed(String),
    /// The link dropped underneath us.
    #[error("device disconnected")]
    Disconnected,
    /// An operation was attempted outside the `Ready` state.
    #[error("session not ready")]
    NotReady,
    /// Underlying BLE stack error that fits no other variant.
    #[error("bluetooth error: {0}")]
    Ble(#[from] bluest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
