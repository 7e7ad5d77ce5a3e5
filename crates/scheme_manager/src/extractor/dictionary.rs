//! Decoder-dictionary extraction.
//!
//! Input: the union of signals across enabled, manifest-consistent schemes
//! (plus installed state templates). Output: one dictionary per protocol,
//! `None` where nothing is to be decoded so the protocol's sources pause.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use contracts::{
    CanDecoderDictionary, CanDecoderMethod, CanFrameId, CanMessageFormat, CanSignalFormat,
    ChannelIdTranslator, ChannelNumericId, CollectionScheme, ComplexDecoderDictionary,
    ComplexDecoderMethod, ComplexMessageId, ComplexTypeElement, ComplexTypeId,
    CustomDecoderDictionary, CustomDecoderMethod, DecoderDictionary, DecoderManifest, InterfaceId,
    NetworkProtocol, PidDecoderFormat, RawSignalBufferConfig, SignalId, SignalPath,
    SignalPathEntry, SignalType, INVALID_CHANNEL_NUMERIC_ID,
};

use crate::partial::PartialSignalRegistry;
use crate::state::SchemeState;

#[derive(Default)]
struct CanAccumulator {
    /// channel -> frame -> retained signal ids
    frames: BTreeMap<ChannelNumericId, BTreeMap<CanFrameId, BTreeSet<SignalId>>>,
    collect: BTreeSet<SignalId>,
}

#[derive(Default)]
struct ObdAccumulator {
    /// PID -> retained signal ids
    pids: BTreeMap<CanFrameId, BTreeSet<SignalId>>,
    collect: BTreeSet<SignalId>,
}

struct ComplexMethodAccumulator {
    base_signal_id: SignalId,
    collect_raw: bool,
    root_type_id: ComplexTypeId,
    /// path -> canonical synthetic id; BTreeMap keeps paths in lexicographic
    /// order and deduplicates across schemes.
    paths: BTreeMap<SignalPath, SignalId>,
}

/// Run the extraction over every enabled, manifest-consistent scheme.
pub fn extract_decoder_dictionaries(
    state: &SchemeState,
    translator: &ChannelIdTranslator,
    registry: &mut PartialSignalRegistry,
) -> BTreeMap<NetworkProtocol, Option<Arc<DecoderDictionary>>> {
    let mut output: BTreeMap<NetworkProtocol, Option<Arc<DecoderDictionary>>> =
        NetworkProtocol::ALL.iter().map(|p| (*p, None)).collect();

    let manifest = match &state.current_manifest {
        Some(manifest) => manifest.clone(),
        None => return output,
    };

    let mut can = CanAccumulator::default();
    let mut obd = ObdAccumulator::default();
    let mut custom = CustomDecoderDictionary::default();
    let mut complex: BTreeMap<(InterfaceId, ComplexMessageId), ComplexMethodAccumulator> =
        BTreeMap::new();

    for scheme in state.enabled.values() {
        if scheme.decoder_manifest_id != manifest.sync_id {
            debug!(
                scheme_id = %scheme.id,
                scheme_manifest = %scheme.decoder_manifest_id,
                "scheme excluded from dictionary, references a different manifest"
            );
            continue;
        }
        for signal in &scheme.signals {
            accumulate_signal(
                signal.signal_id,
                scheme,
                &manifest,
                translator,
                registry,
                &mut can,
                &mut obd,
                &mut custom,
                &mut complex,
            );
        }
    }

    // State templates subscribe signals on top of the schemes.
    for template in state.state_templates.values() {
        if template.decoder_manifest_id != manifest.sync_id {
            continue;
        }
        for signal in &template.signals {
            accumulate_plain_signal(
                signal.signal_id,
                &manifest,
                translator,
                &mut can,
                &mut obd,
                &mut custom,
            );
        }
    }

    output.insert(
        NetworkProtocol::RawCan,
        materialize_can(&can, &manifest, translator)
            .map(|d| Arc::new(DecoderDictionary::Can(d))),
    );
    output.insert(
        NetworkProtocol::Obd,
        materialize_obd(&obd, &manifest).map(|d| Arc::new(DecoderDictionary::Can(d))),
    );
    output.insert(
        NetworkProtocol::Custom,
        (!custom.is_empty()).then(|| Arc::new(DecoderDictionary::Custom(custom))),
    );
    output.insert(
        NetworkProtocol::Complex,
        materialize_complex(complex, &manifest)
            .map(|d| Arc::new(DecoderDictionary::Complex(d))),
    );
    output
}

#[allow(clippy::too_many_arguments)]
fn accumulate_signal(
    signal_id: SignalId,
    scheme: &CollectionScheme,
    manifest: &DecoderManifest,
    translator: &ChannelIdTranslator,
    registry: &mut PartialSignalRegistry,
    can: &mut CanAccumulator,
    obd: &mut ObdAccumulator,
    custom: &mut CustomDecoderDictionary,
    complex: &mut BTreeMap<(InterfaceId, ComplexMessageId), ComplexMethodAccumulator>,
) {
    if signal_id.is_synthetic() {
        // Partial reference into a complex signal.
        let (base, path) = match scheme.partial_signal_lookup.get(&signal_id) {
            Some(pair) => pair,
            None => {
                warn!(%signal_id, scheme_id = %scheme.id, "partial signal without lookup entry, skipping");
                metrics::counter!("scheme_manager_skipped_signals").increment(1);
                return;
            }
        };
        let decoder = match manifest.complex_decoder(*base) {
            Some(decoder) => decoder,
            None => {
                warn!(base = %base, "partial signal base is not a complex signal, skipping");
                metrics::counter!("scheme_manager_skipped_signals").increment(1);
                return;
            }
        };
        let canonical = registry.resolve(*base, path);
        let method = complex
            .entry((decoder.interface_id.clone(), decoder.message_id.clone()))
            .or_insert_with(|| ComplexMethodAccumulator {
                base_signal_id: *base,
                collect_raw: false,
                root_type_id: decoder.root_type_id,
                paths: BTreeMap::new(),
            });
        method.paths.insert(path.clone(), canonical);
        return;
    }

    match manifest.network_protocol(signal_id) {
        Some(NetworkProtocol::Complex) => {
            // Full reference: collect the raw message.
            let Some(decoder) = manifest.complex_decoder(signal_id) else {
                return;
            };
            complex
                .entry((decoder.interface_id.clone(), decoder.message_id.clone()))
                .or_insert_with(|| ComplexMethodAccumulator {
                    base_signal_id: signal_id,
                    collect_raw: false,
                    root_type_id: decoder.root_type_id,
                    paths: BTreeMap::new(),
                })
                .collect_raw = true;
        }
        _ => accumulate_plain_signal(signal_id, manifest, translator, can, obd, custom),
    }
}

fn accumulate_plain_signal(
    signal_id: SignalId,
    manifest: &DecoderManifest,
    translator: &ChannelIdTranslator,
    can: &mut CanAccumulator,
    obd: &mut ObdAccumulator,
    custom: &mut CustomDecoderDictionary,
) {
    match manifest.network_protocol(signal_id) {
        Some(NetworkProtocol::RawCan) => {
            let Some((frame_id, interface_id)) = manifest.can_frame_and_interface(signal_id) else {
                return;
            };
            let channel = translator.channel_numeric_id(interface_id);
            if channel == INVALID_CHANNEL_NUMERIC_ID {
                warn!(%signal_id, interface_id = %interface_id, "interface not configured, skipping signal");
                metrics::counter!("scheme_manager_skipped_signals").increment(1);
                return;
            }
            can.frames
                .entry(channel)
                .or_default()
                .entry(*frame_id)
                .or_default()
                .insert(signal_id);
            can.collect.insert(signal_id);
        }
        Some(NetworkProtocol::Obd) => {
            let Some(decoder) = manifest.pid_decoder(signal_id) else {
                return;
            };
            obd.pids
                .entry(CanFrameId::from(decoder.pid))
                .or_default()
                .insert(signal_id);
            obd.collect.insert(signal_id);
        }
        Some(NetworkProtocol::Custom) => {
            let Some(decoder) = manifest.custom_decoder(signal_id) else {
                return;
            };
            custom
                .decoders
                .entry(decoder.interface_id.clone())
                .or_default()
                .insert(
                    decoder.decoder.clone(),
                    CustomDecoderMethod {
                        signal_id,
                        signal_type: decoder.signal_type,
                    },
                );
        }
        Some(NetworkProtocol::Complex) | None => {
            debug!(%signal_id, "signal has no decodable protocol here, skipping");
            metrics::counter!("scheme_manager_skipped_signals").increment(1);
        }
    }
}

fn materialize_can(
    acc: &CanAccumulator,
    manifest: &DecoderManifest,
    translator: &ChannelIdTranslator,
) -> Option<CanDecoderDictionary> {
    if acc.frames.is_empty() && acc.collect.is_empty() {
        return None;
    }
    let mut dictionary = CanDecoderDictionary {
        signal_ids_to_collect: acc.collect.clone(),
        ..Default::default()
    };
    for (channel, frames) in &acc.frames {
        let interface_id = match translator.interface_id(*channel) {
            Some(interface_id) => interface_id,
            None => continue,
        };
        let methods = dictionary.decoder_methods.entry(*channel).or_default();
        for (frame_id, retained) in frames {
            let Some(format) = manifest.can_message_format(interface_id, *frame_id) else {
                warn!(frame_id, interface_id = %interface_id, "frame format missing from manifest");
                continue;
            };
            // Keep only the collected subset, in the manifest's signal order.
            let mut subset = format.clone();
            subset.signals.retain(|signal| retained.contains(&signal.signal_id));
            methods.insert(*frame_id, CanDecoderMethod { format: subset });
        }
    }
    Some(dictionary)
}

fn materialize_obd(acc: &ObdAccumulator, manifest: &DecoderManifest) -> Option<CanDecoderDictionary> {
    if acc.pids.is_empty() {
        return None;
    }
    let mut dictionary = CanDecoderDictionary {
        signal_ids_to_collect: acc.collect.clone(),
        ..Default::default()
    };
    // OBD has a single logical port: everything lives under channel 0 and the
    // frame id is the PID number.
    let methods = dictionary.decoder_methods.entry(0).or_default();
    for (pid, retained) in &acc.pids {
        let mut format = CanMessageFormat {
            message_id: *pid,
            ..Default::default()
        };
        for signal_id in retained {
            let Some(decoder) = manifest.pid_decoder(*signal_id) else {
                continue;
            };
            format.size_in_bytes = decoder.pid_response_length;
            format.signals.push(pid_signal_format(*signal_id, decoder));
        }
        methods.insert(*pid, CanDecoderMethod { format });
    }
    Some(dictionary)
}

/// Expand a PID byte/bit layout into a frame signal format.
fn pid_signal_format(signal_id: SignalId, decoder: &PidDecoderFormat) -> CanSignalFormat {
    let (first_bit_position, size_in_bits) = if decoder.byte_length == 1 {
        (
            u16::from(decoder.start_byte) * 8 + u16::from(decoder.bit_right_shift),
            u16::from(decoder.bit_mask_length),
        )
    } else {
        (
            u16::from(decoder.start_byte) * 8,
            u16::from(decoder.byte_length) * 8,
        )
    };
    CanSignalFormat {
        signal_id,
        first_bit_position,
        size_in_bits,
        factor: decoder.scaling,
        offset: decoder.offset,
        is_big_endian: true,
        is_signed: decoder.is_signed,
        signal_type: decoder.signal_type,
    }
}

fn materialize_complex(
    acc: BTreeMap<(InterfaceId, ComplexMessageId), ComplexMethodAccumulator>,
    manifest: &DecoderManifest,
) -> Option<ComplexDecoderDictionary> {
    if acc.is_empty() {
        return None;
    }
    let mut dictionary = ComplexDecoderDictionary::default();
    for ((interface_id, message_id), method) in acc {
        let types = reachable_types(method.root_type_id, manifest);
        let signal_paths = method
            .paths
            .into_iter()
            .map(|(path, partial_signal_id)| SignalPathEntry {
                partial_signal_id,
                path,
            })
            .collect();
        dictionary
            .decoders
            .entry(interface_id)
            .or_default()
            .insert(
                message_id,
                ComplexDecoderMethod {
                    signal_id: method.base_signal_id,
                    collect_raw: method.collect_raw,
                    signal_paths,
                    root_type_id: method.root_type_id,
                    types,
                },
            );
    }
    Some(dictionary)
}

/// Subset of the type graph reachable from `root`. Missing type ids are
/// logged and left out; the rest of the method stays usable.
fn reachable_types(
    root: ComplexTypeId,
    manifest: &DecoderManifest,
) -> BTreeMap<ComplexTypeId, ComplexTypeElement> {
    let mut types = BTreeMap::new();
    let mut queue = VecDeque::from([root]);
    while let Some(type_id) = queue.pop_front() {
        if types.contains_key(&type_id) {
            continue;
        }
        let Some(element) = manifest.complex_type(type_id) else {
            warn!(type_id, "complex type missing from manifest");
            continue;
        };
        types.insert(type_id, element.clone());
        match element {
            ComplexTypeElement::Struct { ordered_type_ids } => {
                queue.extend(ordered_type_ids.iter().copied());
            }
            ComplexTypeElement::Array { repeated_type_id, .. } => {
                queue.push_back(*repeated_type_id);
            }
            ComplexTypeElement::Primitive { .. } => {}
        }
    }
    types
}

/// Raw-buffer slot configuration derived from the freshly extracted
/// dictionaries: one slot per collected string signal and per complex
/// message.
pub fn raw_buffer_configs(
    dictionaries: &BTreeMap<NetworkProtocol, Option<Arc<DecoderDictionary>>>,
) -> Vec<RawSignalBufferConfig> {
    let mut configs = Vec::new();

    if let Some(Some(dictionary)) = dictionaries.get(&NetworkProtocol::Custom) {
        if let Some(custom) = dictionary.as_custom() {
            for (interface_id, methods) in &custom.decoders {
                for method in methods.values() {
                    if method.signal_type == SignalType::String {
                        configs.push(RawSignalBufferConfig {
                            signal_id: method.signal_id,
                            interface_id: interface_id.clone(),
                            message_id: None,
                            signal_type: SignalType::String,
                        });
                    }
                }
            }
        }
    }

    if let Some(Some(dictionary)) = dictionaries.get(&NetworkProtocol::Complex) {
        if let Some(complex) = dictionary.as_complex() {
            for (interface_id, methods) in &complex.decoders {
                for (message_id, method) in methods {
                    configs.push(RawSignalBufferConfig {
                        signal_id: method.signal_id,
                        interface_id: interface_id.clone(),
                        message_id: Some(message_id.clone()),
                        signal_type: SignalType::Unknown,
                    });
                }
            }
        }
    }

    configs.sort_by_key(|config| config.signal_id);
    configs
}
