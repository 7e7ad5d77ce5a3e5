//! Decoder manifest - the decoding-rule document.
//!
//! Immutable after build: the loader produces it once per arrival, workers
//! share it behind an `Arc`. A change requires a whole new manifest.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    CanFrameId, InterfaceId, NetworkProtocol, Pid, SignalId, SignalPath, SignalType, SyncId,
};

/// Decoding rule for a single signal inside a CAN frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanSignalFormat {
    pub signal_id: SignalId,
    pub first_bit_position: u16,
    pub size_in_bits: u16,
    pub factor: f64,
    pub offset: f64,
    #[serde(default)]
    pub is_big_endian: bool,
    #[serde(default)]
    pub is_signed: bool,
    #[serde(default)]
    pub signal_type: SignalType,
}

/// Decoding rules for one CAN frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CanMessageFormat {
    pub message_id: CanFrameId,
    pub size_in_bytes: u8,
    #[serde(default)]
    pub is_multiplexed: bool,
    #[serde(default)]
    pub signals: Vec<CanSignalFormat>,
}

/// Decoding rule for an OBD-II PID signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidDecoderFormat {
    /// Length of the whole PID response; a PID may carry several signals.
    pub pid_response_length: u8,
    pub service_mode: u8,
    pub pid: Pid,
    pub scaling: f64,
    pub offset: f64,
    pub start_byte: u8,
    pub byte_length: u8,
    /// Bit manipulation, applied only when `byte_length` is 1.
    #[serde(default)]
    pub bit_right_shift: u8,
    #[serde(default = "default_bit_mask_length")]
    pub bit_mask_length: u8,
    #[serde(default)]
    pub is_signed: bool,
    #[serde(default)]
    pub signal_type: SignalType,
}

fn default_bit_mask_length() -> u8 {
    8
}

/// Decoding rule for an embedder-defined signal, e.g. the signal's
/// fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomDecoderFormat {
    pub interface_id: InterfaceId,
    pub decoder: String,
    pub signal_id: SignalId,
    #[serde(default)]
    pub signal_type: SignalType,
}

/// Node id in the complex-type graph. 0 is reserved.
pub type ComplexTypeId = u32;

/// Message id of a structured message, unique per (interface, message).
pub type ComplexMessageId = String;

/// Decoding rule for a structured message signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexDecoderFormat {
    pub interface_id: InterfaceId,
    pub message_id: ComplexMessageId,
    pub root_type_id: ComplexTypeId,
}

/// Element of the complex-type graph. Repeating types are referenced by id
/// so the manifest stays compact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexTypeElement {
    Struct {
        ordered_type_ids: Vec<ComplexTypeId>,
    },
    Array {
        size: u32,
        repeated_type_id: ComplexTypeId,
    },
    Primitive {
        signal_type: SignalType,
        scaling: f64,
        offset: f64,
    },
}

/// Built decoder manifest. Lookups only; construction goes through the
/// document loader (or directly in tests).
#[derive(Debug, Default)]
pub struct DecoderManifest {
    pub sync_id: SyncId,
    /// Per-interface, per-frame CAN decoding rules.
    pub can_message_formats: HashMap<InterfaceId, HashMap<CanFrameId, CanMessageFormat>>,
    /// Reverse index: which frame on which interface carries a signal.
    pub signal_to_frame: HashMap<SignalId, (CanFrameId, InterfaceId)>,
    pub pid_decoders: HashMap<SignalId, PidDecoderFormat>,
    pub custom_decoders: HashMap<SignalId, CustomDecoderFormat>,
    pub complex_decoders: HashMap<SignalId, ComplexDecoderFormat>,
    pub complex_types: HashMap<ComplexTypeId, ComplexTypeElement>,
}

impl DecoderManifest {
    pub fn id(&self) -> &SyncId {
        &self.sync_id
    }

    /// Protocol the signal is decoded from, `None` if the manifest does not
    /// know the signal.
    pub fn network_protocol(&self, signal_id: SignalId) -> Option<NetworkProtocol> {
        if self.signal_to_frame.contains_key(&signal_id) {
            Some(NetworkProtocol::RawCan)
        } else if self.pid_decoders.contains_key(&signal_id) {
            Some(NetworkProtocol::Obd)
        } else if self.custom_decoders.contains_key(&signal_id) {
            Some(NetworkProtocol::Custom)
        } else if self.complex_decoders.contains_key(&signal_id) {
            Some(NetworkProtocol::Complex)
        } else {
            None
        }
    }

    pub fn can_frame_and_interface(&self, signal_id: SignalId) -> Option<&(CanFrameId, InterfaceId)> {
        self.signal_to_frame.get(&signal_id)
    }

    pub fn can_message_format(
        &self,
        interface_id: &InterfaceId,
        frame_id: CanFrameId,
    ) -> Option<&CanMessageFormat> {
        self.can_message_formats
            .get(interface_id)
            .and_then(|frames| frames.get(&frame_id))
    }

    pub fn pid_decoder(&self, signal_id: SignalId) -> Option<&PidDecoderFormat> {
        self.pid_decoders.get(&signal_id)
    }

    pub fn custom_decoder(&self, signal_id: SignalId) -> Option<&CustomDecoderFormat> {
        self.custom_decoders.get(&signal_id)
    }

    pub fn complex_decoder(&self, signal_id: SignalId) -> Option<&ComplexDecoderFormat> {
        self.complex_decoders.get(&signal_id)
    }

    pub fn complex_type(&self, type_id: ComplexTypeId) -> Option<&ComplexTypeElement> {
        self.complex_types.get(&type_id)
    }

    /// Resolve the value type reached by walking `path` from `root_type_id`.
    ///
    /// Struct elements descend by index, array elements descend into the
    /// repeated type regardless of index, and the walk terminates as soon as
    /// a primitive is reached. Any failed lookup yields `Unknown`.
    pub fn resolve_path_type(&self, root_type_id: ComplexTypeId, path: &SignalPath) -> SignalType {
        let mut current = root_type_id;
        let mut elements = path.iter();
        loop {
            match self.complex_types.get(&current) {
                Some(ComplexTypeElement::Primitive { signal_type, .. }) => return *signal_type,
                Some(ComplexTypeElement::Struct { ordered_type_ids }) => {
                    match elements.next().and_then(|idx| ordered_type_ids.get(*idx as usize)) {
                        Some(child) => current = *child,
                        None => return SignalType::Unknown,
                    }
                }
                Some(ComplexTypeElement::Array { repeated_type_id, .. }) => match elements.next() {
                    Some(_) => current = *repeated_type_id,
                    None => return SignalType::Unknown,
                },
                None => return SignalType::Unknown,
            }
        }
    }

    /// Value type of a directly decodable signal; `Unknown` for full complex
    /// references and unknown signals.
    pub fn signal_type(&self, signal_id: SignalId) -> SignalType {
        if let Some((frame_id, interface_id)) = self.signal_to_frame.get(&signal_id) {
            return self
                .can_message_format(interface_id, *frame_id)
                .and_then(|format| {
                    format
                        .signals
                        .iter()
                        .find(|signal| signal.signal_id == signal_id)
                })
                .map(|signal| signal.signal_type)
                .unwrap_or(SignalType::Unknown);
        }
        if let Some(decoder) = self.pid_decoders.get(&signal_id) {
            return decoder.signal_type;
        }
        if let Some(decoder) = self.custom_decoders.get(&signal_id) {
            return decoder.signal_type;
        }
        SignalType::Unknown
    }
}
