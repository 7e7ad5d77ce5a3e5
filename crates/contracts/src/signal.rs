//! Signal, interface and channel identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique 32-bit signal id.
///
/// Ids with the top bit set are synthetic partial-signal ids, allocated while
/// extracting decoder dictionaries for a (base signal, signal path) pair.
/// All other ids are assigned by the cloud.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SignalId(pub u32);

impl SignalId {
    /// Marker bit for synthetic partial-signal ids.
    pub const SYNTHETIC_BIT: u32 = 0x8000_0000;

    pub fn is_synthetic(self) -> bool {
        (self.0 & Self::SYNTHETIC_BIT) != 0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SignalId {
    fn from(raw: u32) -> Self {
        SignalId(raw)
    }
}

/// Opaque network-interface identifier issued by the cloud.
pub type InterfaceId = String;

/// Raw CAN frame id as seen on the bus.
pub type CanFrameId = u32;

/// Dense numeric channel id assigned by the [`ChannelIdTranslator`].
///
/// [`ChannelIdTranslator`]: crate::ChannelIdTranslator
pub type ChannelNumericId = u32;

/// Sentinel for an interface id that could not be translated.
pub const INVALID_CHANNEL_NUMERIC_ID: ChannelNumericId = ChannelNumericId::MAX;

/// OBD-II parameter id (service 01).
pub type Pid = u8;

/// Wire protocol a signal is decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkProtocol {
    /// Raw socket CAN frames.
    RawCan,
    /// OBD-II PIDs requested over CAN (ISO-TP).
    Obd,
    /// Embedder-defined decoding.
    Custom,
    /// Structured messages addressed by (interface, message id).
    Complex,
}

impl NetworkProtocol {
    /// All protocols, in publication order.
    pub const ALL: [NetworkProtocol; 4] = [
        NetworkProtocol::RawCan,
        NetworkProtocol::Obd,
        NetworkProtocol::Custom,
        NetworkProtocol::Complex,
    ];
}

/// Value type of a decoded signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Bool,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float,
    #[default]
    Double,
    String,
    /// Type could not be resolved; consumers treat the value as opaque.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_bit() {
        assert!(!SignalId(0x7FFF_FFFF).is_synthetic());
        assert!(SignalId(0x8000_0000).is_synthetic());
        assert!(SignalId(0x8000_0001 | 42).is_synthetic());
    }
}
