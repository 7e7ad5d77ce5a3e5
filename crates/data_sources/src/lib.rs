//! # Data Sources
//!
//! Protocol data sources driven by the scheme manager's dictionary updates.
//! Each source owns one worker thread: a null dictionary puts the worker to
//! sleep, a fresh dictionary wakes it and reconfigures its I/O loop.
//!
//! The wire itself is abstracted behind endpoint traits ("open an endpoint
//! on a named interface, receive N datagrams without blocking"); concrete
//! socket bindings plug in from the embedder, mocks serve the tests.

mod can;
mod custom;
mod endpoint;
pub mod mock;
mod obd;

pub use can::{
    CanDataSource, CanFrameSample, CanFrameConsumer, CanSourceConfig, CanSourceStats,
    CanTimestampType,
};
pub use custom::{
    CollectedCustomSignal, CustomDataSource, CustomSample, CustomSignalConsumer,
    CustomSourceAdapter,
};
pub use endpoint::{
    CanEndpointFactory, CanEndpointOptions, CanFrame, EndpointError, IsoTpEndpoint, ObdTransport,
    RawCanEndpoint, ReceivedCanFrame,
};
pub use obd::{
    DtcConsumer, DtcInfo, ObdConfig, ObdOverCanModule, ObdResponse, ObdResponseConsumer,
    SERVICE_CURRENT_DATA, SERVICE_STORED_DTCS,
};
