//! Endpoint traits abstracting the CAN wire.

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use contracts::Timestamp;

/// Endpoint failure classes. `DeviceRemoved` is fatal for the owning source;
/// `NetworkDown` keeps the endpoint open and the source retries.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("network device removed")]
    DeviceRemoved,

    #[error("network down or unreachable")]
    NetworkDown,

    #[error("capability not supported: {0}")]
    Unsupported(String),

    #[error("endpoint error: {0}")]
    Other(String),
}

/// One CAN frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub payload: Bytes,
}

/// A received frame with the kernel timestamps the endpoint could extract.
#[derive(Debug, Clone)]
pub struct ReceivedCanFrame {
    pub frame: CanFrame,
    pub software_timestamp_ms: Option<Timestamp>,
    pub hardware_timestamp_ms: Option<Timestamp>,
}

/// Non-blocking raw CAN endpoint bound to a named interface.
pub trait RawCanEndpoint: Send {
    /// Receive up to `max_frames` buffered frames. An empty vec means
    /// nothing was pending.
    fn receive_batch(&mut self, max_frames: usize) -> Result<Vec<ReceivedCanFrame>, EndpointError>;

    fn send(&mut self, frame: &CanFrame) -> Result<(), EndpointError>;

    fn close(&mut self);
}

/// Segmented request/response channel (ISO-TP style) to one ECU, or the
/// functional broadcast address.
pub trait IsoTpEndpoint: Send {
    fn send(&mut self, payload: &[u8]) -> Result<(), EndpointError>;

    /// Receive one response, `Ok(None)` on timeout.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>, EndpointError>;

    fn close(&mut self);
}

/// How a raw CAN endpoint should be opened.
#[derive(Debug, Clone)]
pub struct CanEndpointOptions {
    pub interface_name: String,
    /// Ask for FD frames.
    pub enable_fd: bool,
    /// Fail the open instead of degrading when FD is unavailable.
    pub require_fd: bool,
    /// Ask the kernel to attach receive timestamps.
    pub enable_kernel_timestamps: bool,
}

/// Opens raw CAN endpoints; the embedder supplies the real binding.
pub trait CanEndpointFactory: Send + Sync {
    fn open(&self, options: &CanEndpointOptions) -> Result<Box<dyn RawCanEndpoint>, EndpointError>;
}

/// Opens the endpoints the OBD module needs on its gateway interface.
pub trait ObdTransport: Send + Sync {
    /// Raw endpoint for ECU discovery broadcasts.
    fn open_raw(&self) -> Result<Box<dyn RawCanEndpoint>, EndpointError>;

    /// Request/response channel to one ECU.
    fn open_channel(
        &self,
        rx_id: u32,
        tx_id: u32,
        extended: bool,
    ) -> Result<Box<dyn IsoTpEndpoint>, EndpointError>;

    /// Functional broadcast channel (listen-only flow control).
    fn open_broadcast(&self, extended: bool) -> Result<Box<dyn IsoTpEndpoint>, EndpointError>;
}
