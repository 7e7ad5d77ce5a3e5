//! Inspection matrix and fetch matrix - the condition-evaluator inputs.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    CollectionScheme, ComplexMessageId, Expression, InterfaceId, SignalId, SignalType, SyncId,
    TriggerMode,
};

/// One signal required by an inspection condition, with its resolved type.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectionSignal {
    pub signal_id: SignalId,
    pub signal_type: SignalType,
    pub sample_buffer_size: u32,
    pub min_interval_ms: u64,
    pub fixed_window_ms: u64,
    pub condition_only: bool,
}

/// One condition handed to the evaluator, derived from one enabled scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectionCondition {
    pub scheme_id: SyncId,
    pub expression: Expression,
    pub signals: Vec<InspectionSignal>,
    pub trigger_mode: TriggerMode,
    pub min_interval_ms: u64,
    pub after_duration_ms: u64,
    pub include_active_dtcs: bool,
    pub priority: u32,
    pub persist_all_data: bool,
    pub compress_data: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InspectionMatrix {
    pub conditions: Vec<InspectionCondition>,
}

/// Periodic fetch parameters for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBasedFetch {
    pub period_ms: u64,
    pub max_executions_per_interval: u64,
}

/// Condition-triggered fetch: predicate plus the actions to run on trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionBasedFetch {
    pub signal_id: SignalId,
    pub condition: Expression,
    pub actions: Vec<Expression>,
}

/// Derived schedule for on-demand signal fetches.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchMatrix {
    pub time_based: BTreeMap<SignalId, TimeBasedFetch>,
    pub condition_based: Vec<ConditionBasedFetch>,
}

/// Manifest-consistent enabled schemes, published to interested components.
#[derive(Debug, Clone, Default)]
pub struct ActiveSchemes {
    pub schemes: Vec<Arc<CollectionScheme>>,
}

/// Raw-buffer slot configuration for a string or complex signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSignalBufferConfig {
    pub signal_id: SignalId,
    pub interface_id: InterfaceId,
    /// Set for complex signals only.
    pub message_id: Option<ComplexMessageId>,
    pub signal_type: SignalType,
}
