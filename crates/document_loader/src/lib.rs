//! # Document Loader
//!
//! Builds the two control-plane document families from their serialized
//! payloads:
//! - decoder manifests (decoding rules keyed by signal id)
//! - collection-scheme lists (what to collect, when, under what condition)
//!
//! plus last-known-state template diffs. Parsing and semantic validation are
//! separate passes; a payload that fails either leaves the previously built
//! document in place at the caller.

mod parser;
mod validator;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use contracts::{AgentError, DecoderManifest, SchemeList, StateTemplatesDiff};

/// Parse and validate a serialized decoder manifest.
///
/// # Errors
/// - payload is not valid JSON for the manifest schema
/// - semantic validation fails (empty ids, out-of-range bit positions, ...)
pub fn build_decoder_manifest(payload: &[u8]) -> Result<DecoderManifest, AgentError> {
    let dto = parser::parse_decoder_manifest(payload)?;
    validator::validate_decoder_manifest(&dto)?;

    let mut manifest = DecoderManifest {
        sync_id: dto.sync_id,
        ..Default::default()
    };

    for network in dto.can_networks {
        let frames = manifest
            .can_message_formats
            .entry(network.interface_id.clone())
            .or_default();
        for format in network.message_formats {
            for signal in &format.signals {
                manifest
                    .signal_to_frame
                    .insert(signal.signal_id, (format.message_id, network.interface_id.clone()));
            }
            frames.insert(format.message_id, format);
        }
    }

    for pid_signal in dto.pid_signals {
        manifest.pid_decoders.insert(pid_signal.signal_id, pid_signal.format);
    }

    for custom in dto.custom_signals {
        manifest.custom_decoders.insert(custom.signal_id, custom);
    }

    for complex in dto.complex_signals {
        manifest.complex_decoders.insert(
            complex.signal_id,
            contracts::ComplexDecoderFormat {
                interface_id: complex.interface_id,
                message_id: complex.message_id,
                root_type_id: complex.root_type_id,
            },
        );
    }

    for entry in dto.complex_types {
        // Duplicate type ids: first wins.
        if manifest.complex_types.contains_key(&entry.type_id) {
            warn!(type_id = entry.type_id, "duplicate complex type id, keeping first");
            continue;
        }
        manifest.complex_types.insert(entry.type_id, entry.element);
    }

    Ok(manifest)
}

/// Parse and validate a serialized collection-scheme list.
///
/// Duplicate scheme ids within one payload resolve latest-wins.
pub fn build_scheme_list(payload: &[u8]) -> Result<SchemeList, AgentError> {
    let dto = parser::parse_scheme_list(payload)?;
    validator::validate_scheme_list(&dto)?;

    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut schemes = Vec::with_capacity(dto.schemes.len());
    for scheme in dto.schemes {
        match by_id.get(&scheme.id) {
            Some(&slot) => {
                warn!(scheme_id = %scheme.id, "duplicate scheme id in payload, keeping latest");
                schemes[slot] = Arc::new(scheme);
            }
            None => {
                by_id.insert(scheme.id.clone(), schemes.len());
                schemes.push(Arc::new(scheme));
            }
        }
    }

    Ok(SchemeList {
        sync_id: dto.sync_id,
        schemes,
    })
}

/// Parse and validate a serialized state-template diff.
pub fn build_state_templates(payload: &[u8]) -> Result<StateTemplatesDiff, AgentError> {
    let diff = parser::parse_state_templates(payload)?;
    validator::validate_state_templates(&diff)?;
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{NetworkProtocol, SignalId};

    const MANIFEST_JSON: &str = r#"{
        "sync_id": "dm-1",
        "can_networks": [
            {
                "interface_id": "bus-0",
                "message_formats": [
                    {
                        "message_id": 256,
                        "size_in_bytes": 8,
                        "signals": [
                            {
                                "signal_id": 1,
                                "first_bit_position": 0,
                                "size_in_bits": 16,
                                "factor": 0.5,
                                "offset": 0.0
                            }
                        ]
                    }
                ]
            }
        ],
        "pid_signals": [
            {
                "signal_id": 4096,
                "format": {
                    "pid_response_length": 4,
                    "service_mode": 1,
                    "pid": 20,
                    "scaling": 0.0125,
                    "offset": -40.0,
                    "start_byte": 0,
                    "byte_length": 2
                }
            }
        ],
        "custom_signals": [
            {
                "interface_id": "iface-30",
                "decoder": "Vehicle.Custom.Speed",
                "signal_id": 8192,
                "signal_type": "double"
            }
        ]
    }"#;

    const SCHEME_LIST_JSON: &str = r#"{
        "sync_id": "list-1",
        "schemes": [
            {
                "id": "scheme-a",
                "decoder_manifest_id": "dm-1",
                "start_time_ms": 500,
                "expiry_time_ms": 2000,
                "trigger": { "time_based": { "period_ms": 100 } },
                "signals": [ { "signal_id": 1 } ]
            }
        ]
    }"#;

    #[test]
    fn test_build_decoder_manifest() {
        let manifest = build_decoder_manifest(MANIFEST_JSON.as_bytes()).unwrap();
        assert_eq!(manifest.sync_id, "dm-1");
        assert_eq!(
            manifest.network_protocol(SignalId(1)),
            Some(NetworkProtocol::RawCan)
        );
        assert_eq!(
            manifest.network_protocol(SignalId(4096)),
            Some(NetworkProtocol::Obd)
        );
        assert_eq!(
            manifest.network_protocol(SignalId(8192)),
            Some(NetworkProtocol::Custom)
        );
        let (frame_id, interface_id) = manifest.can_frame_and_interface(SignalId(1)).unwrap();
        assert_eq!(*frame_id, 0x100);
        assert_eq!(interface_id, "bus-0");
    }

    #[test]
    fn test_build_scheme_list() {
        let list = build_scheme_list(SCHEME_LIST_JSON.as_bytes()).unwrap();
        assert_eq!(list.sync_id, "list-1");
        assert_eq!(list.schemes.len(), 1);
        assert_eq!(list.schemes[0].id, "scheme-a");
        assert_eq!(list.schemes[0].decoder_manifest_id, "dm-1");
    }

    #[test]
    fn test_duplicate_scheme_id_latest_wins() {
        let payload = r#"{
            "sync_id": "list-2",
            "schemes": [
                {
                    "id": "scheme-a",
                    "decoder_manifest_id": "dm-1",
                    "start_time_ms": 0,
                    "expiry_time_ms": 100,
                    "trigger": { "time_based": { "period_ms": 100 } }
                },
                {
                    "id": "scheme-a",
                    "decoder_manifest_id": "dm-1",
                    "start_time_ms": 0,
                    "expiry_time_ms": 900,
                    "trigger": { "time_based": { "period_ms": 100 } }
                }
            ]
        }"#;
        let list = build_scheme_list(payload.as_bytes()).unwrap();
        assert_eq!(list.schemes.len(), 1);
        assert_eq!(list.schemes[0].expiry_time_ms, 900);
    }

    #[test]
    fn test_garbage_payload_fails_parse() {
        assert!(build_decoder_manifest(b"not json").is_err());
        assert!(build_scheme_list(b"{\"schemes\": 12}").is_err());
    }

    #[test]
    fn test_build_state_templates() {
        let payload = r#"{
            "version": 3,
            "add": [
                {
                    "id": "lks-1",
                    "decoder_manifest_id": "dm-1",
                    "update_strategy": { "periodic": { "period_ms": 10 } },
                    "signals": [ { "signal_id": 11 } ]
                }
            ],
            "remove": [ "lks-0" ]
        }"#;
        let diff = build_state_templates(payload.as_bytes()).unwrap();
        assert_eq!(diff.version, 3);
        assert_eq!(diff.add.len(), 1);
        assert_eq!(diff.remove, vec!["lks-0".to_string()]);
    }
}
