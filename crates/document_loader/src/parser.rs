//! Wire-shape DTOs and JSON parsing for the control-plane documents.

use serde::Deserialize;

use contracts::{
    AgentError, CanMessageFormat, CollectionScheme, ComplexMessageId, ComplexTypeElement,
    ComplexTypeId, CustomDecoderFormat, InterfaceId, PidDecoderFormat, SignalId,
    StateTemplatesDiff, SyncId,
};

/// All CAN decoding rules of one network interface.
#[derive(Debug, Deserialize)]
pub struct CanNetworkDto {
    pub interface_id: InterfaceId,
    #[serde(default)]
    pub message_formats: Vec<CanMessageFormat>,
}

/// OBD PID decoding rule bound to its signal id.
#[derive(Debug, Deserialize)]
pub struct PidSignalDto {
    pub signal_id: SignalId,
    pub format: PidDecoderFormat,
}

/// Complex message decoding rule bound to its signal id.
#[derive(Debug, Deserialize)]
pub struct ComplexSignalDto {
    pub signal_id: SignalId,
    pub interface_id: InterfaceId,
    pub message_id: ComplexMessageId,
    pub root_type_id: ComplexTypeId,
}

#[derive(Debug, Deserialize)]
pub struct ComplexTypeDto {
    pub type_id: ComplexTypeId,
    pub element: ComplexTypeElement,
}

/// Serialized decoder manifest as delivered by the control plane.
#[derive(Debug, Deserialize)]
pub struct DecoderManifestDto {
    pub sync_id: SyncId,
    #[serde(default)]
    pub can_networks: Vec<CanNetworkDto>,
    #[serde(default)]
    pub pid_signals: Vec<PidSignalDto>,
    #[serde(default)]
    pub custom_signals: Vec<CustomDecoderFormat>,
    #[serde(default)]
    pub complex_signals: Vec<ComplexSignalDto>,
    #[serde(default)]
    pub complex_types: Vec<ComplexTypeDto>,
}

/// Serialized collection-scheme list.
#[derive(Debug, Deserialize)]
pub struct SchemeListDto {
    pub sync_id: SyncId,
    #[serde(default)]
    pub schemes: Vec<CollectionScheme>,
}

pub fn parse_decoder_manifest(payload: &[u8]) -> Result<DecoderManifestDto, AgentError> {
    serde_json::from_slice(payload).map_err(|e| AgentError::DocumentParse {
        message: format!("decoder manifest: {e}"),
        source: Some(Box::new(e)),
    })
}

pub fn parse_scheme_list(payload: &[u8]) -> Result<SchemeListDto, AgentError> {
    serde_json::from_slice(payload).map_err(|e| AgentError::DocumentParse {
        message: format!("collection scheme list: {e}"),
        source: Some(Box::new(e)),
    })
}

pub fn parse_state_templates(payload: &[u8]) -> Result<StateTemplatesDiff, AgentError> {
    serde_json::from_slice(payload).map_err(|e| AgentError::DocumentParse {
        message: format!("state template list: {e}"),
        source: Some(Box::new(e)),
    })
}
