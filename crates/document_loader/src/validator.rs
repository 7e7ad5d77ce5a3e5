//! Semantic validation, run after parsing.
//!
//! Rules:
//! - non-empty sync ids and scheme ids
//! - CAN signal bit ranges fit the declared frame size
//! - PID signal byte ranges fit the declared response length
//! - custom decoders carry an interface and a decoder key
//! - partial-signal placeholder ids carry the synthetic marker bit

use contracts::{AgentError, StateTemplatesDiff};

use crate::parser::{DecoderManifestDto, SchemeListDto};

pub fn validate_decoder_manifest(dto: &DecoderManifestDto) -> Result<(), AgentError> {
    if dto.sync_id.is_empty() {
        return Err(AgentError::document_validation("sync_id", "cannot be empty"));
    }

    for network in &dto.can_networks {
        if network.interface_id.is_empty() {
            return Err(AgentError::document_validation(
                "can_networks[].interface_id",
                "cannot be empty",
            ));
        }
        for format in &network.message_formats {
            let frame_bits = u32::from(format.size_in_bytes) * 8;
            for signal in &format.signals {
                let end_bit = u32::from(signal.first_bit_position) + u32::from(signal.size_in_bits);
                if signal.size_in_bits == 0 || end_bit > frame_bits {
                    return Err(AgentError::document_validation(
                        format!(
                            "can_networks[{}].message_formats[{:#x}].signals[{}]",
                            network.interface_id, format.message_id, signal.signal_id
                        ),
                        format!("bit range {end_bit} exceeds frame size of {frame_bits} bits"),
                    ));
                }
            }
        }
    }

    for pid_signal in &dto.pid_signals {
        let format = &pid_signal.format;
        let end_byte = u16::from(format.start_byte) + u16::from(format.byte_length);
        if format.byte_length == 0 || end_byte > u16::from(format.pid_response_length) {
            return Err(AgentError::document_validation(
                format!("pid_signals[{}]", pid_signal.signal_id),
                format!(
                    "byte range {end_byte} exceeds response length {}",
                    format.pid_response_length
                ),
            ));
        }
    }

    for custom in &dto.custom_signals {
        if custom.interface_id.is_empty() || custom.decoder.is_empty() {
            return Err(AgentError::document_validation(
                format!("custom_signals[{}]", custom.signal_id),
                "interface_id and decoder cannot be empty",
            ));
        }
    }

    for complex in &dto.complex_signals {
        if complex.interface_id.is_empty() || complex.message_id.is_empty() {
            return Err(AgentError::document_validation(
                format!("complex_signals[{}]", complex.signal_id),
                "interface_id and message_id cannot be empty",
            ));
        }
    }

    Ok(())
}

pub fn validate_scheme_list(dto: &SchemeListDto) -> Result<(), AgentError> {
    if dto.sync_id.is_empty() {
        return Err(AgentError::document_validation("sync_id", "cannot be empty"));
    }

    for scheme in &dto.schemes {
        if scheme.id.is_empty() {
            return Err(AgentError::document_validation("schemes[].id", "cannot be empty"));
        }
        if scheme.decoder_manifest_id.is_empty() {
            return Err(AgentError::document_validation(
                format!("schemes[{}].decoder_manifest_id", scheme.id),
                "cannot be empty",
            ));
        }
        if scheme.expiry_time_ms < scheme.start_time_ms {
            return Err(AgentError::document_validation(
                format!("schemes[{}]", scheme.id),
                format!(
                    "expiry {} before start {}",
                    scheme.expiry_time_ms, scheme.start_time_ms
                ),
            ));
        }
        for placeholder in scheme.partial_signal_lookup.keys() {
            if !placeholder.is_synthetic() {
                return Err(AgentError::document_validation(
                    format!("schemes[{}].partial_signal_lookup", scheme.id),
                    format!("placeholder id {placeholder} is missing the synthetic marker bit"),
                ));
            }
        }
        for (base, _path) in scheme.partial_signal_lookup.values() {
            if base.is_synthetic() {
                return Err(AgentError::document_validation(
                    format!("schemes[{}].partial_signal_lookup", scheme.id),
                    format!("base signal {base} cannot itself be synthetic"),
                ));
            }
        }
    }

    Ok(())
}

pub fn validate_state_templates(diff: &StateTemplatesDiff) -> Result<(), AgentError> {
    for template in &diff.add {
        if template.id.is_empty() {
            return Err(AgentError::document_validation("add[].id", "cannot be empty"));
        }
        if template.decoder_manifest_id.is_empty() {
            return Err(AgentError::document_validation(
                format!("add[{}].decoder_manifest_id", template.id),
                "cannot be empty",
            ));
        }
    }
    for id in &diff.remove {
        if id.is_empty() {
            return Err(AgentError::document_validation("remove[]", "cannot be empty"));
        }
    }
    Ok(())
}
