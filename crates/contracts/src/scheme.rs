//! Collection schemes and state templates - the what-to-collect documents.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Expression, SignalId, SignalType, SyncId, Timestamp};

/// Index sequence into a complex-type tree, outermost element first.
pub type SignalPath = Vec<u32>;

/// How a condition trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Collect whenever the condition holds.
    #[default]
    Always,
    /// Collect only on a false-to-true transition.
    RisingEdge,
}

/// What makes a scheme collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    TimeBased {
        period_ms: u64,
    },
    ConditionBased {
        expression: Expression,
        #[serde(default)]
        min_interval_ms: u64,
        #[serde(default)]
        trigger_mode: TriggerMode,
    },
}

/// Collection parameters for one signal of a scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub signal_id: SignalId,
    #[serde(default = "default_sample_buffer_size")]
    pub sample_buffer_size: u32,
    #[serde(default)]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub fixed_window_ms: u64,
    /// Signal participates in the condition but is not uploaded.
    #[serde(default)]
    pub condition_only: bool,
}

fn default_sample_buffer_size() -> u32 {
    750
}

/// On-demand fetch schedule for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    pub signal_id: SignalId,
    pub trigger: FetchTrigger,
    #[serde(default)]
    pub actions: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTrigger {
    TimeBased {
        period_ms: u64,
        #[serde(default)]
        max_executions_per_interval: u64,
    },
    ConditionBased {
        condition: Expression,
    },
}

/// One collection scheme as delivered by the control plane.
///
/// Full-field equality drives the "any field changed" check during
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionScheme {
    pub id: SyncId,
    /// The manifest this scheme's signal ids refer to. Schemes referencing a
    /// different manifest than the current one are retained but excluded
    /// from all derived artifacts.
    pub decoder_manifest_id: SyncId,
    pub start_time_ms: Timestamp,
    pub expiry_time_ms: Timestamp,
    pub trigger: Trigger,
    #[serde(default)]
    pub signals: Vec<SignalInfo>,
    #[serde(default)]
    pub after_duration_ms: u64,
    #[serde(default)]
    pub include_active_dtcs: bool,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub persist_all_data: bool,
    #[serde(default)]
    pub compress_data: bool,
    /// Partial-signal placeholders: placeholder id (top bit set) to the
    /// (base complex signal, path) pair it stands for.
    #[serde(default)]
    pub partial_signal_lookup: HashMap<SignalId, (SignalId, SignalPath)>,
    #[serde(default)]
    pub fetch_configs: Vec<FetchConfig>,
}

impl CollectionScheme {
    /// Whether the scheme window contains `now`. Zero-duration schemes are
    /// never active.
    pub fn is_active_at(&self, now_ms: Timestamp) -> bool {
        self.start_time_ms <= now_ms && now_ms < self.expiry_time_ms
    }
}

/// Immutable-after-build container of collection schemes.
#[derive(Debug, Clone, Default)]
pub struct SchemeList {
    pub sync_id: SyncId,
    pub schemes: Vec<Arc<CollectionScheme>>,
}

impl SchemeList {
    pub fn scheme_ids(&self) -> Vec<SyncId> {
        self.schemes.iter().map(|s| s.id.clone()).collect()
    }
}

/// How a last-known-state template samples its signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTemplateUpdateStrategy {
    OnChange,
    Periodic { period_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTemplateSignal {
    pub signal_id: SignalId,
    #[serde(default)]
    pub signal_type: SignalType,
}

/// Last-known-state template: a standing subscription to a signal set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTemplate {
    pub id: SyncId,
    pub decoder_manifest_id: SyncId,
    pub update_strategy: StateTemplateUpdateStrategy,
    pub signals: Vec<StateTemplateSignal>,
}

/// Versioned add/remove diff over the installed state templates. Diffs with
/// a version older than the last applied one are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateTemplatesDiff {
    pub version: u64,
    #[serde(default)]
    pub add: Vec<StateTemplate>,
    #[serde(default)]
    pub remove: Vec<SyncId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme(start: Timestamp, expiry: Timestamp) -> CollectionScheme {
        CollectionScheme {
            id: "scheme-1".to_string(),
            decoder_manifest_id: "dm-1".to_string(),
            start_time_ms: start,
            expiry_time_ms: expiry,
            trigger: Trigger::TimeBased { period_ms: 1000 },
            signals: Vec::new(),
            after_duration_ms: 0,
            include_active_dtcs: false,
            priority: 0,
            persist_all_data: false,
            compress_data: false,
            partial_signal_lookup: HashMap::new(),
            fetch_configs: Vec::new(),
        }
    }

    #[test]
    fn test_active_window_is_half_open() {
        let s = scheme(500, 2000);
        assert!(!s.is_active_at(499));
        assert!(s.is_active_at(500));
        assert!(s.is_active_at(1999));
        assert!(!s.is_active_at(2000));
    }

    #[test]
    fn test_zero_duration_scheme_never_active() {
        let s = scheme(1000, 1000);
        assert!(!s.is_active_at(1000));
    }

    #[test]
    fn test_scheme_equality_detects_field_change() {
        let a = scheme(500, 2000);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.priority = 7;
        assert_ne!(a, b);
    }
}
