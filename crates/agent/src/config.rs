//! Agent configuration: static, local, TOML.
//!
//! Documents from the control plane decide *what* to collect; this file only
//! decides which buses exist and how the workers pace themselves.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use contracts::AgentError;
use data_sources::CanTimestampType;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Persistence directory for the last-known documents.
    pub persistence_dir: PathBuf,

    /// Scheme-manager idle sleep bound; 0 keeps the built-in default.
    #[serde(default)]
    pub idle_time_ms: u64,

    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Optional documents to install at startup, e.g. for bench setups
    /// without a live control-plane connection.
    #[serde(default)]
    pub seed_decoder_manifest: Option<PathBuf>,
    #[serde(default)]
    pub seed_collection_schemes: Option<PathBuf>,

    #[serde(default)]
    pub can_interfaces: Vec<CanInterfaceConfig>,

    #[serde(default)]
    pub obd: Option<ObdSectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanInterfaceConfig {
    /// Cloud-issued interface id this bus is referenced by in manifests.
    pub interface_id: String,
    /// Local network interface name.
    pub name: String,
    #[serde(default)]
    pub timestamp_type: CanTimestampType,
    #[serde(default)]
    pub force_can_fd: bool,
    #[serde(default = "default_source_idle_time_ms")]
    pub idle_time_ms: u64,
}

fn default_source_idle_time_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObdSectionConfig {
    pub gateway_interface: String,
    #[serde(default)]
    pub pid_request_interval_s: u64,
    #[serde(default)]
    pub dtc_request_interval_s: u64,
    #[serde(default)]
    pub broadcast_requests: bool,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content).map_err(|e| AgentError::DocumentParse {
            message: format!("agent config: {e}"),
            source: Some(Box::new(e)),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AgentError> {
        let mut interface_ids = HashSet::new();
        let mut names = HashSet::new();
        for interface in &self.can_interfaces {
            if interface.interface_id.is_empty() || interface.name.is_empty() {
                return Err(AgentError::document_validation(
                    "can_interfaces[]",
                    "interface_id and name cannot be empty",
                ));
            }
            if !interface_ids.insert(&interface.interface_id) {
                return Err(AgentError::document_validation(
                    format!("can_interfaces[id={}]", interface.interface_id),
                    "duplicate interface_id",
                ));
            }
            if !names.insert(&interface.name) {
                return Err(AgentError::document_validation(
                    format!("can_interfaces[name={}]", interface.name),
                    "duplicate interface name",
                ));
            }
        }
        if let Some(obd) = &self.obd {
            if obd.gateway_interface.is_empty() {
                return Err(AgentError::document_validation(
                    "obd.gateway_interface",
                    "cannot be empty",
                ));
            }
        }
        Ok(())
    }
}
