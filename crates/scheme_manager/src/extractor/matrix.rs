//! Inspection-matrix and fetch-matrix extraction.
//!
//! One inspection condition per enabled, manifest-consistent scheme. Partial
//! placeholder ids are rewritten to the same canonical synthetic ids the
//! dictionary extractor allocates, so the evaluator and the decoders agree.

use tracing::{debug, warn};

use contracts::{
    CollectionScheme, ConditionBasedFetch, DecoderManifest, Expression, FetchMatrix, FetchTrigger,
    InspectionCondition, InspectionMatrix, InspectionSignal, NetworkProtocol, SignalId,
    TimeBasedFetch, Trigger, TriggerMode,
};

use crate::partial::PartialSignalRegistry;
use crate::state::SchemeState;

/// Extract both matrices from the enabled set.
pub fn extract_matrices(
    state: &SchemeState,
    registry: &mut PartialSignalRegistry,
) -> (InspectionMatrix, FetchMatrix) {
    let mut inspection = InspectionMatrix::default();
    let mut fetch = FetchMatrix::default();

    let manifest = match &state.current_manifest {
        Some(manifest) => manifest.clone(),
        None => return (inspection, fetch),
    };

    for scheme in state.enabled.values() {
        if scheme.decoder_manifest_id != manifest.sync_id {
            debug!(
                scheme_id = %scheme.id,
                "scheme excluded from inspection matrix, references a different manifest"
            );
            continue;
        }
        inspection
            .conditions
            .push(build_condition(scheme, &manifest, registry));
        accumulate_fetch(scheme, registry, &mut fetch);
    }

    (inspection, fetch)
}

fn build_condition(
    scheme: &CollectionScheme,
    manifest: &DecoderManifest,
    registry: &mut PartialSignalRegistry,
) -> InspectionCondition {
    let signals = scheme
        .signals
        .iter()
        .map(|info| InspectionSignal {
            signal_id: canonicalize(info.signal_id, scheme, registry),
            signal_type: resolve_signal_type(info.signal_id, scheme, manifest),
            sample_buffer_size: info.sample_buffer_size,
            min_interval_ms: info.min_interval_ms,
            fixed_window_ms: info.fixed_window_ms,
            condition_only: info.condition_only,
        })
        .collect();

    // Time-based schemes compile to an always-true condition paced by the
    // collection period.
    let (expression, min_interval_ms, trigger_mode) = match &scheme.trigger {
        Trigger::TimeBased { period_ms } => {
            (Expression::Bool(true), *period_ms, TriggerMode::Always)
        }
        Trigger::ConditionBased {
            expression,
            min_interval_ms,
            trigger_mode,
        } => {
            let mut expression = expression.clone();
            expression.map_signal_ids(&mut_canonicalize(scheme, registry));
            (expression, *min_interval_ms, *trigger_mode)
        }
    };

    InspectionCondition {
        scheme_id: scheme.id.clone(),
        expression,
        signals,
        trigger_mode,
        min_interval_ms,
        after_duration_ms: scheme.after_duration_ms,
        include_active_dtcs: scheme.include_active_dtcs,
        priority: scheme.priority,
        persist_all_data: scheme.persist_all_data,
        compress_data: scheme.compress_data,
    }
}

fn accumulate_fetch(
    scheme: &CollectionScheme,
    registry: &mut PartialSignalRegistry,
    fetch: &mut FetchMatrix,
) {
    for config in &scheme.fetch_configs {
        let signal_id = canonicalize(config.signal_id, scheme, registry);
        match &config.trigger {
            FetchTrigger::TimeBased {
                period_ms,
                max_executions_per_interval,
            } => {
                if *period_ms == 0 {
                    warn!(%signal_id, scheme_id = %scheme.id, "dropping fetch config with zero period");
                    continue;
                }
                // First config wins when several schemes fetch one signal.
                fetch.time_based.entry(signal_id).or_insert(TimeBasedFetch {
                    period_ms: *period_ms,
                    max_executions_per_interval: *max_executions_per_interval,
                });
            }
            FetchTrigger::ConditionBased { condition } => {
                let mut condition = condition.clone();
                condition.map_signal_ids(&mut_canonicalize(scheme, registry));
                let actions = config
                    .actions
                    .iter()
                    .cloned()
                    .map(|mut action| {
                        action.map_signal_ids(&mut_canonicalize(scheme, registry));
                        action
                    })
                    .collect();
                fetch.condition_based.push(ConditionBasedFetch {
                    signal_id,
                    condition,
                    actions,
                });
            }
        }
    }
}

/// Rewrite a scheme-local partial placeholder to its canonical synthetic id.
/// Non-synthetic ids and placeholders without a lookup entry pass through.
fn canonicalize(
    signal_id: SignalId,
    scheme: &CollectionScheme,
    registry: &mut PartialSignalRegistry,
) -> SignalId {
    if !signal_id.is_synthetic() {
        return signal_id;
    }
    match scheme.partial_signal_lookup.get(&signal_id) {
        Some((base, path)) => registry.resolve(*base, path),
        None => signal_id,
    }
}

/// Closure form of [`canonicalize`] for expression rewriting. The registry
/// is pre-seeded here because `map_signal_ids` takes a `Fn`.
fn mut_canonicalize<'a>(
    scheme: &'a CollectionScheme,
    registry: &mut PartialSignalRegistry,
) -> impl Fn(SignalId) -> SignalId + 'a {
    // Resolve every pair the scheme knows up front, then look up immutably.
    let resolved: std::collections::HashMap<SignalId, SignalId> = scheme
        .partial_signal_lookup
        .iter()
        .map(|(placeholder, (base, path))| (*placeholder, registry.resolve(*base, path)))
        .collect();
    move |signal_id| resolved.get(&signal_id).copied().unwrap_or(signal_id)
}

/// Signal type for an inspection signal.
///
/// Partial references walk the complex-type graph from the base signal's
/// root; full complex references and unknown signals resolve to `Unknown`.
fn resolve_signal_type(
    signal_id: SignalId,
    scheme: &CollectionScheme,
    manifest: &DecoderManifest,
) -> contracts::SignalType {
    if signal_id.is_synthetic() {
        if let Some((base, path)) = scheme.partial_signal_lookup.get(&signal_id) {
            if let Some(decoder) = manifest.complex_decoder(*base) {
                return manifest.resolve_path_type(decoder.root_type_id, path);
            }
        }
        return contracts::SignalType::Unknown;
    }
    if manifest.network_protocol(signal_id) == Some(NetworkProtocol::Complex) {
        return contracts::SignalType::Unknown;
    }
    manifest.signal_type(signal_id)
}
