//! Decoder dictionaries - the per-protocol derived decoding artifacts.
//!
//! Ordered containers throughout: extraction must be deterministic, two runs
//! over the same inputs yield structurally equal dictionaries.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    CanFrameId, CanMessageFormat, ChannelNumericId, ComplexMessageId, ComplexTypeElement,
    ComplexTypeId, InterfaceId, SignalId, SignalPath, SignalType,
};

/// Decoding method for one CAN frame (or one OBD PID under channel 0).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanDecoderMethod {
    /// Frame format retaining only the signals to collect.
    pub format: CanMessageFormat,
}

/// Dictionary shared by the raw-CAN and OBD protocols. For OBD everything
/// lives under channel 0 and the frame id is the PID number.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanDecoderDictionary {
    pub decoder_methods: BTreeMap<ChannelNumericId, BTreeMap<CanFrameId, CanDecoderMethod>>,
    pub signal_ids_to_collect: BTreeSet<SignalId>,
}

impl CanDecoderDictionary {
    pub fn is_empty(&self) -> bool {
        self.decoder_methods.is_empty() && self.signal_ids_to_collect.is_empty()
    }
}

/// Decoding method for one embedder-defined decoder key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomDecoderMethod {
    pub signal_id: SignalId,
    pub signal_type: SignalType,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CustomDecoderDictionary {
    pub decoders: BTreeMap<InterfaceId, BTreeMap<String, CustomDecoderMethod>>,
}

impl CustomDecoderDictionary {
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

/// One partial-signal reference inside a complex message decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPathEntry {
    pub partial_signal_id: SignalId,
    pub path: SignalPath,
}

/// Decoding method for one structured message.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexDecoderMethod {
    pub signal_id: SignalId,
    /// Collect the whole raw message, set when a scheme references the base
    /// signal directly rather than through paths.
    pub collect_raw: bool,
    /// Referenced paths, lexicographically sorted by element sequence.
    pub signal_paths: Vec<SignalPathEntry>,
    pub root_type_id: ComplexTypeId,
    /// Subset of the type graph reachable from `root_type_id`.
    pub types: BTreeMap<ComplexTypeId, ComplexTypeElement>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComplexDecoderDictionary {
    pub decoders: BTreeMap<InterfaceId, BTreeMap<ComplexMessageId, ComplexDecoderMethod>>,
}

impl ComplexDecoderDictionary {
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

/// Tagged union over the per-protocol dictionaries. Listeners match on the
/// variant; a mismatching variant at a source boundary is a wiring bug.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderDictionary {
    Can(CanDecoderDictionary),
    Custom(CustomDecoderDictionary),
    Complex(ComplexDecoderDictionary),
}

impl DecoderDictionary {
    pub fn is_empty(&self) -> bool {
        match self {
            DecoderDictionary::Can(d) => d.is_empty(),
            DecoderDictionary::Custom(d) => d.is_empty(),
            DecoderDictionary::Complex(d) => d.is_empty(),
        }
    }

    pub fn as_can(&self) -> Option<&CanDecoderDictionary> {
        match self {
            DecoderDictionary::Can(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&CustomDecoderDictionary> {
        match self {
            DecoderDictionary::Custom(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_complex(&self) -> Option<&ComplexDecoderDictionary> {
        match self {
            DecoderDictionary::Complex(d) => Some(d),
            _ => None,
        }
    }
}
