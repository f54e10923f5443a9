//! Abstract interface to the GATT transport. The object transfer engine and
//! response router are generic over this trait; the only concrete
//! implementation shipped here is [`crate::transport_btleplug`].

use crate::error::DfuError;

/// Called once per inbound control-point notification.
pub type NotificationHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// GATT capabilities the DFU protocol needs. Connect/disconnect and service
/// discovery are handled by [`DfuTransportManager`]; this trait covers only
/// what the response router and object transfer engine drive directly.
pub trait DfuTransport: Send + Sync {
    /// Write-with-response to the control-point characteristic.
    async fn write_control_point(&self, bytes: &[u8]) -> Result<(), DfuError>;

    /// Write-with-response to the packet-data characteristic. Fragmentation
    /// above `packet_size` is the caller's responsibility.
    async fn write_data_point(&self, bytes: &[u8]) -> Result<(), DfuError>;

    /// Enable notifications on the control-point characteristic and register
    /// `handler` to be invoked with each notification's payload. Must be
    /// called, and its future resolved, before the first control-point write.
    async fn subscribe_control_point(&self, handler: NotificationHandler) -> Result<(), DfuError>;

    /// The data-point fragment size to use for this connection. Bounded by
    /// the negotiated GATT MTU; defaults to `ATT_MTU_DEFAULT(23) - 3 = 20`.
    fn packet_size(&self) -> usize;

    /// Update the fragment size after an `MTU_GET` negotiation. Implementations
    /// must never let the engine use a size larger than what the peripheral
    /// actually reported.
    fn set_packet_size(&self, size: usize);
}

/// Connects to a named or addressed peripheral and yields a transport for it.
pub trait DfuTransportManager {
    type Transport: DfuTransport;

    async fn connect(&mut self, target: &str, timeout: std::time::Duration) -> Result<(), DfuError>;

    fn transport(&self) -> std::sync::Arc<Self::Transport>;

    async fn disconnect(&mut self) -> Result<(), DfuError>;
}
