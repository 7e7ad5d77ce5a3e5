//! Derived-artifact extraction over realistic manifest/scheme combinations.

use std::collections::HashMap;
use std::sync::Arc;

use contracts::{
    CanMessageFormat, CanSignalFormat, ChannelIdTranslator, CollectionScheme, ComplexDecoderFormat,
    ComplexTypeElement, CustomDecoderFormat, DecoderManifest, Expression, NetworkProtocol,
    PidDecoderFormat, SchemeList, SignalId, SignalInfo, SignalType, TimePoint, Timestamp, Trigger,
    TriggerMode,
};
use scheme_manager::{
    extract_decoder_dictionaries, extract_matrices, raw_buffer_configs, PartialSignalRegistry,
    SchemeState,
};

fn time(system_time_ms: Timestamp) -> TimePoint {
    TimePoint {
        system_time_ms,
        monotonic_time_ms: system_time_ms,
    }
}

fn can_format(message_id: u32, signal_ids: &[u32]) -> CanMessageFormat {
    CanMessageFormat {
        message_id,
        size_in_bytes: 8,
        is_multiplexed: false,
        signals: signal_ids
            .iter()
            .map(|id| CanSignalFormat {
                signal_id: SignalId(*id),
                first_bit_position: 0,
                size_in_bits: 8,
                factor: 1.0,
                offset: 0.0,
                is_big_endian: false,
                is_signed: false,
                signal_type: SignalType::Double,
            })
            .collect(),
    }
}

fn pid_format(
    response_length: u8,
    pid: u8,
    scaling: f64,
    offset: f64,
    start_byte: u8,
    byte_length: u8,
    bit_right_shift: u8,
    bit_mask_length: u8,
) -> PidDecoderFormat {
    PidDecoderFormat {
        pid_response_length: response_length,
        service_mode: 1,
        pid,
        scaling,
        offset,
        start_byte,
        byte_length,
        bit_right_shift,
        bit_mask_length,
        is_signed: false,
        signal_type: SignalType::Double,
    }
}

/// Two CAN channels, two OBD PIDs, two custom decoders.
fn test_manifest(sync_id: &str) -> DecoderManifest {
    let mut manifest = DecoderManifest {
        sync_id: sync_id.to_string(),
        ..Default::default()
    };

    let node10 = manifest
        .can_message_formats
        .entry("10".to_string())
        .or_default();
    node10.insert(0x100, can_format(0x100, &[1, 2, 3, 4, 5, 6, 7, 8]));
    node10.insert(0x101, CanMessageFormat::default());
    node10.insert(0x110, can_format(0x110, &[9]));
    let node20 = manifest
        .can_message_formats
        .entry("20".to_string())
        .or_default();
    node20.insert(0x200, can_format(0x200, &[10, 17]));
    node20.insert(0x300, can_format(0x300, &[25]));

    for id in 1..=8u32 {
        manifest
            .signal_to_frame
            .insert(SignalId(id), (0x100, "10".to_string()));
    }
    manifest
        .signal_to_frame
        .insert(SignalId(9), (0x110, "10".to_string()));
    for id in 10..=17u32 {
        manifest
            .signal_to_frame
            .insert(SignalId(id), (0x200, "20".to_string()));
    }
    manifest
        .signal_to_frame
        .insert(SignalId(25), (0x300, "20".to_string()));

    manifest.pid_decoders.insert(
        SignalId(0x1000),
        pid_format(4, 0x14, 0.0125, -40.0, 0, 2, 0, 8),
    );
    manifest.pid_decoders.insert(
        SignalId(0x1001),
        pid_format(4, 0x14, 0.0125, -40.0, 2, 2, 0, 8),
    );
    manifest
        .pid_decoders
        .insert(SignalId(0x1005), pid_format(10, 0x70, 1.0, 0.0, 9, 1, 0, 2));
    manifest
        .pid_decoders
        .insert(SignalId(0x1006), pid_format(10, 0x70, 1.0, 0.0, 9, 1, 2, 2));

    manifest.custom_decoders.insert(
        SignalId(0x2000),
        CustomDecoderFormat {
            interface_id: "30".to_string(),
            decoder: "custom-decoder-0".to_string(),
            signal_id: SignalId(0x2000),
            signal_type: SignalType::Double,
        },
    );
    manifest.custom_decoders.insert(
        SignalId(0x2001),
        CustomDecoderFormat {
            interface_id: "31".to_string(),
            decoder: "custom-decoder-1".to_string(),
            signal_id: SignalId(0x2001),
            signal_type: SignalType::Double,
        },
    );

    manifest
}

fn translator() -> ChannelIdTranslator {
    let mut translator = ChannelIdTranslator::new();
    translator.add("10".to_string());
    translator.add("20".to_string());
    translator
}

fn scheme(id: &str, dm: &str, start: Timestamp, expiry: Timestamp, signals: &[u32]) -> Arc<CollectionScheme> {
    Arc::new(CollectionScheme {
        id: id.to_string(),
        decoder_manifest_id: dm.to_string(),
        start_time_ms: start,
        expiry_time_ms: expiry,
        trigger: Trigger::TimeBased { period_ms: 500 },
        signals: signals
            .iter()
            .map(|id| SignalInfo {
                signal_id: SignalId(*id),
                sample_buffer_size: 750,
                min_interval_ms: 0,
                fixed_window_ms: 0,
                condition_only: false,
            })
            .collect(),
        after_duration_ms: 0,
        include_active_dtcs: false,
        priority: 0,
        persist_all_data: false,
        compress_data: false,
        partial_signal_lookup: HashMap::new(),
        fetch_configs: Vec::new(),
    })
}

fn list(schemes: Vec<Arc<CollectionScheme>>) -> SchemeList {
    SchemeList {
        sync_id: "list".to_string(),
        schemes,
    }
}

fn scheme2_signals() -> Vec<u32> {
    let mut signals: Vec<u32> = (10..=17).collect();
    signals.extend([0x1000, 0x1001, 0x1005, 0x1006, 0x2000, 0x2001]);
    signals.push(0x10000); // unknown protocol, must be skipped
    signals
}

fn state_with(manifest: DecoderManifest, schemes: Vec<Arc<CollectionScheme>>, now: Timestamp) -> SchemeState {
    let mut state = SchemeState::new();
    state.current_manifest = Some(Arc::new(manifest));
    state.rebuild(&list(schemes), time(now));
    state
}

#[test]
fn test_dictionary_covers_enabled_schemes_only() {
    let translator = translator();
    let mut state = state_with(
        test_manifest("dm-1"),
        vec![
            scheme("scheme-1", "dm-1", 1000, 6000, &(1..=9).collect::<Vec<_>>()),
            scheme("scheme-2", "dm-1", 1000, 6000, &scheme2_signals()),
            scheme("scheme-3", "dm-1", 7000, 12_000, &[25]),
        ],
        1000,
    );
    let mut registry = PartialSignalRegistry::new();

    let dictionaries = extract_decoder_dictionaries(&state, &translator, &mut registry);

    let can = dictionaries[&NetworkProtocol::RawCan]
        .as_ref()
        .and_then(|d| d.as_can())
        .cloned()
        .expect("raw-can dictionary expected");
    let channel10 = translator.channel_numeric_id("10");
    let channel20 = translator.channel_numeric_id("20");
    assert_ne!(channel10, channel20);

    let node10 = &can.decoder_methods[&channel10];
    // 0x101 exists in the manifest but no scheme wants it.
    assert!(!node10.contains_key(&0x101));
    // 0x110 keeps only signal 9.
    let method_0x110 = &node10[&0x110];
    assert_eq!(method_0x110.format.signals.len(), 1);
    assert_eq!(method_0x110.format.signals[0].signal_id, SignalId(9));
    // 0x200 keeps its two decodable signals.
    let method_0x200 = &can.decoder_methods[&channel20][&0x200];
    assert_eq!(method_0x200.format.signals.len(), 2);
    assert_eq!(method_0x200.format.signals[0].signal_id, SignalId(10));
    assert_eq!(method_0x200.format.signals[1].signal_id, SignalId(17));
    // scheme-3 is still idle, its frame stays out.
    assert!(!can.decoder_methods[&channel20].contains_key(&0x300));
    // 9 CAN signals from scheme-1 plus 8 from scheme-2.
    assert_eq!(can.signal_ids_to_collect.len(), 17);
    for id in 1..=9u32 {
        assert!(can.signal_ids_to_collect.contains(&SignalId(id)));
    }

    let obd = dictionaries[&NetworkProtocol::Obd]
        .as_ref()
        .and_then(|d| d.as_can())
        .cloned()
        .expect("obd dictionary expected");
    assert_eq!(obd.signal_ids_to_collect.len(), 4);
    let pids = &obd.decoder_methods[&0];
    let pid_0x14 = &pids[&0x14];
    assert_eq!(pid_0x14.format.size_in_bytes, 4);
    assert_eq!(pid_0x14.format.signals.len(), 2);
    assert_eq!(pid_0x14.format.signals[0].signal_id, SignalId(0x1000));
    assert_eq!(pid_0x14.format.signals[0].first_bit_position, 0);
    assert_eq!(pid_0x14.format.signals[0].size_in_bits, 16);
    assert!((pid_0x14.format.signals[0].factor - 0.0125).abs() < f64::EPSILON);
    assert!((pid_0x14.format.signals[0].offset + 40.0).abs() < f64::EPSILON);
    assert_eq!(pid_0x14.format.signals[1].signal_id, SignalId(0x1001));
    assert_eq!(pid_0x14.format.signals[1].first_bit_position, 16);
    let pid_0x70 = &pids[&0x70];
    assert_eq!(pid_0x70.format.size_in_bytes, 10);
    assert_eq!(pid_0x70.format.signals[0].first_bit_position, 72);
    assert_eq!(pid_0x70.format.signals[0].size_in_bits, 2);
    assert_eq!(pid_0x70.format.signals[1].first_bit_position, 74);
    assert_eq!(pid_0x70.format.signals[1].size_in_bits, 2);
    assert!(!pids.contains_key(&0x20));

    let custom = dictionaries[&NetworkProtocol::Custom]
        .as_ref()
        .and_then(|d| d.as_custom())
        .cloned()
        .expect("custom dictionary expected");
    assert_eq!(custom.decoders.len(), 2);
    assert_eq!(
        custom.decoders["30"]["custom-decoder-0"].signal_id,
        SignalId(0x2000)
    );
    assert_eq!(
        custom.decoders["31"]["custom-decoder-1"].signal_id,
        SignalId(0x2001)
    );

    assert!(dictionaries[&NetworkProtocol::Complex].is_none());

    // Time travel: scheme-1 and scheme-2 expire, scheme-3 enables.
    assert!(state.check_timeline(time(7000)));
    let dictionaries = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let can = dictionaries[&NetworkProtocol::RawCan]
        .as_ref()
        .and_then(|d| d.as_can())
        .cloned()
        .expect("raw-can dictionary expected");
    assert!(!can.decoder_methods.contains_key(&channel10));
    let node20 = &can.decoder_methods[&channel20];
    assert!(!node20.contains_key(&0x200));
    assert_eq!(node20[&0x300].format.signals.len(), 1);
    assert_eq!(node20[&0x300].format.signals[0].signal_id, SignalId(25));
    assert_eq!(can.signal_ids_to_collect.len(), 1);
    assert!(dictionaries[&NetworkProtocol::Obd].is_none());
    assert!(dictionaries[&NetworkProtocol::Custom].is_none());
}

#[test]
fn test_manifest_mismatch_excludes_schemes_from_all_artifacts() {
    // Active schemes reference dm-1, then dm-2 arrives. Until a list
    // re-references dm-2, derived artifacts stay empty but the schemes are
    // retained and reported.
    let translator = translator();
    let mut state = state_with(
        test_manifest("dm-1"),
        vec![
            scheme("scheme-c", "dm-1", 0, 10_000, &[1, 2]),
            scheme("scheme-d", "dm-1", 0, 10_000, &[10]),
        ],
        1000,
    );
    state.current_manifest = Some(Arc::new(test_manifest("dm-2")));
    let mut registry = PartialSignalRegistry::new();

    let dictionaries = extract_decoder_dictionaries(&state, &translator, &mut registry);
    assert!(dictionaries.values().all(|d| d.is_none()));

    let (inspection, fetch) = extract_matrices(&state, &mut registry);
    assert!(inspection.conditions.is_empty());
    assert!(fetch.time_based.is_empty() && fetch.condition_based.is_empty());

    let mut documents = state.checkin_documents();
    documents.sort();
    assert_eq!(
        documents,
        vec![
            "dm-2".to_string(),
            "scheme-c".to_string(),
            "scheme-d".to_string()
        ]
    );
    assert!(!state.schemes_in_sync_with_manifest());
}

fn complex_manifest(sync_id: &str) -> DecoderManifest {
    let mut manifest = DecoderManifest {
        sync_id: sync_id.to_string(),
        ..Default::default()
    };
    manifest.complex_decoders.insert(
        SignalId(0x0200_0000),
        ComplexDecoderFormat {
            interface_id: "interface1".to_string(),
            message_id: "messageID1".to_string(),
            root_type_id: 30,
        },
    );
    manifest.complex_decoders.insert(
        SignalId(0x0100_0000),
        ComplexDecoderFormat {
            interface_id: "interface1".to_string(),
            message_id: "messageID3".to_string(),
            root_type_id: 20,
        },
    );
    manifest.complex_types.insert(
        30,
        ComplexTypeElement::Struct {
            ordered_type_ids: vec![20, 10, 20],
        },
    );
    manifest.complex_types.insert(
        20,
        ComplexTypeElement::Array {
            size: 50_000,
            repeated_type_id: 10,
        },
    );
    manifest.complex_types.insert(
        10,
        ComplexTypeElement::Primitive {
            signal_type: SignalType::Uint64,
            scaling: 1.0,
            offset: 0.0,
        },
    );
    manifest
}

fn complex_scheme(id: &str, lookup: &[(u32, u32, Vec<u32>)], direct: &[u32]) -> Arc<CollectionScheme> {
    let mut signals: Vec<SignalInfo> = lookup
        .iter()
        .map(|(placeholder, _, _)| SignalInfo {
            signal_id: SignalId(*placeholder),
            sample_buffer_size: 750,
            min_interval_ms: 0,
            fixed_window_ms: 0,
            condition_only: false,
        })
        .collect();
    signals.extend(direct.iter().map(|id| SignalInfo {
        signal_id: SignalId(*id),
        sample_buffer_size: 750,
        min_interval_ms: 0,
        fixed_window_ms: 0,
        condition_only: false,
    }));
    Arc::new(CollectionScheme {
        id: id.to_string(),
        decoder_manifest_id: "dm-1".to_string(),
        start_time_ms: 0,
        expiry_time_ms: 10_000,
        trigger: Trigger::ConditionBased {
            expression: Expression::Binary {
                op: contracts::BinaryOp::Gt,
                left: Box::new(Expression::Signal {
                    signal_id: SignalId(lookup.first().map(|(p, _, _)| *p).unwrap_or(1)),
                }),
                right: Box::new(Expression::Number(0.0)),
            },
            min_interval_ms: 100,
            trigger_mode: TriggerMode::Always,
        },
        signals,
        after_duration_ms: 0,
        include_active_dtcs: false,
        priority: 0,
        persist_all_data: false,
        compress_data: false,
        partial_signal_lookup: lookup
            .iter()
            .map(|(placeholder, base, path)| {
                (SignalId(*placeholder), (SignalId(*base), path.clone()))
            })
            .collect(),
        fetch_configs: Vec::new(),
    })
}

#[test]
fn test_complex_paths_sorted_and_typed() {
    let translator = ChannelIdTranslator::new();
    let state = state_with(
        complex_manifest("dm-1"),
        vec![complex_scheme(
            "scheme-complex",
            &[
                (0xFFFF_0000, 0x0200_0000, vec![1, 2, 5]),
                (0xFFF3_0000, 0x0200_0000, vec![1, 1, 7]),
                (0xFFF6_0000, 0x0200_0000, vec![2, 2]),
                (0xFFF4_0000, 0x0200_0000, vec![2]),
                (0xFFF5_0000, 0x0100_0000, vec![0]),
            ],
            &[0x0100_0000],
        )],
        1000,
    );
    let mut registry = PartialSignalRegistry::new();

    let dictionaries = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let complex = dictionaries[&NetworkProtocol::Complex]
        .as_ref()
        .and_then(|d| d.as_complex())
        .cloned()
        .expect("complex dictionary expected");

    let decoder = &complex.decoders["interface1"]["messageID1"];
    assert_eq!(decoder.signal_id, SignalId(0x0200_0000));
    assert!(!decoder.collect_raw);
    assert_eq!(decoder.signal_paths.len(), 4);
    assert_eq!(decoder.signal_paths[0].path, vec![1, 1, 7]);
    assert_eq!(decoder.signal_paths[1].path, vec![1, 2, 5]);
    assert_eq!(decoder.signal_paths[2].path, vec![2]);
    assert_eq!(decoder.signal_paths[3].path, vec![2, 2]);
    assert!(decoder.signal_paths.iter().all(|p| p.partial_signal_id.is_synthetic()));
    assert_eq!(decoder.root_type_id, 30);
    assert_eq!(
        decoder.types[&30],
        ComplexTypeElement::Struct {
            ordered_type_ids: vec![20, 10, 20]
        }
    );
    assert!(decoder.types.contains_key(&20));
    assert!(decoder.types.contains_key(&10));

    let decoder3 = &complex.decoders["interface1"]["messageID3"];
    assert_eq!(decoder3.signal_id, SignalId(0x0100_0000));
    assert!(decoder3.collect_raw);
    assert_eq!(decoder3.signal_paths.len(), 1);

    // Matrix side: types resolve through the graph, placeholders are
    // rewritten to the dictionary's canonical ids.
    let (inspection, _) = extract_matrices(&state, &mut registry);
    assert_eq!(inspection.conditions.len(), 1);
    let signals = &inspection.conditions[0].signals;
    assert_eq!(signals.len(), 6);
    assert_eq!(signals[0].signal_type, SignalType::Uint64); // {1,2,5}
    assert_eq!(signals[1].signal_type, SignalType::Uint64); // {1,1,7}
    assert_eq!(signals[2].signal_type, SignalType::Uint64); // {2,2}
    assert_eq!(signals[3].signal_type, SignalType::Unknown); // {2} ends on array
    assert_eq!(signals[4].signal_type, SignalType::Uint64); // {0} into messageID3
    assert_eq!(signals[5].signal_type, SignalType::Unknown); // full complex ref

    let path_125_id = decoder.signal_paths[1].partial_signal_id;
    assert_eq!(signals[0].signal_id, path_125_id);
    // The condition expression references the canonical id too.
    let mut expression_ids = Vec::new();
    inspection.conditions[0]
        .expression
        .collect_signal_ids(&mut expression_ids);
    assert_eq!(expression_ids[0], path_125_id);
}

#[test]
fn test_partial_signal_shared_across_schemes() {
    // Two schemes reference the same (base, path) pair through different
    // placeholder ids; the dictionary holds one entry and both conditions
    // agree on its canonical id.
    let translator = ChannelIdTranslator::new();
    let state = state_with(
        complex_manifest("dm-1"),
        vec![
            complex_scheme("scheme-x", &[(0xFFFF_0000, 0x0200_0000, vec![1, 2, 5])], &[]),
            complex_scheme("scheme-y", &[(0xFFF9_9999, 0x0200_0000, vec![1, 2, 5])], &[]),
        ],
        1000,
    );
    let mut registry = PartialSignalRegistry::new();

    let dictionaries = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let complex = dictionaries[&NetworkProtocol::Complex]
        .as_ref()
        .and_then(|d| d.as_complex())
        .cloned()
        .unwrap();
    let decoder = &complex.decoders["interface1"]["messageID1"];
    assert_eq!(decoder.signal_paths.len(), 1);
    let canonical = decoder.signal_paths[0].partial_signal_id;

    let (inspection, _) = extract_matrices(&state, &mut registry);
    assert_eq!(inspection.conditions.len(), 2);
    for condition in &inspection.conditions {
        assert_eq!(condition.signals[0].signal_id, canonical);
    }
}

#[test]
fn test_extraction_is_deterministic() {
    let translator = translator();
    let state = state_with(
        test_manifest("dm-1"),
        vec![
            scheme("scheme-1", "dm-1", 1000, 6000, &(1..=9).collect::<Vec<_>>()),
            scheme("scheme-2", "dm-1", 1000, 6000, &scheme2_signals()),
        ],
        1000,
    );
    let mut registry = PartialSignalRegistry::new();

    let first = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let second = extract_decoder_dictionaries(&state, &translator, &mut registry);
    assert_eq!(first, second);

    let (inspection_a, fetch_a) = extract_matrices(&state, &mut registry);
    let (inspection_b, fetch_b) = extract_matrices(&state, &mut registry);
    assert_eq!(inspection_a, inspection_b);
    assert_eq!(fetch_a, fetch_b);
}

#[test]
fn test_synthetic_ids_stable_within_manifest_epoch() {
    let translator = ChannelIdTranslator::new();
    let state = state_with(
        complex_manifest("dm-1"),
        vec![complex_scheme("scheme-x", &[(0xFFFF_0000, 0x0200_0000, vec![1, 2, 5])], &[])],
        1000,
    );
    let mut registry = PartialSignalRegistry::new();
    registry.reset_epoch(&"dm-1".to_string());

    let first = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let second = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let id_of = |dictionaries: &std::collections::BTreeMap<
        NetworkProtocol,
        Option<Arc<contracts::DecoderDictionary>>,
    >| {
        dictionaries[&NetworkProtocol::Complex]
            .as_ref()
            .and_then(|d| d.as_complex())
            .map(|d| d.decoders["interface1"]["messageID1"].signal_paths[0].partial_signal_id)
            .unwrap()
    };
    assert_eq!(id_of(&first), id_of(&second));
}

#[test]
fn test_raw_buffer_configs_for_string_and_complex_signals() {
    let translator = ChannelIdTranslator::new();
    let mut manifest = complex_manifest("dm-1");
    manifest.custom_decoders.insert(
        SignalId(0x3000),
        CustomDecoderFormat {
            interface_id: "40".to_string(),
            decoder: "Vehicle.VIN".to_string(),
            signal_id: SignalId(0x3000),
            signal_type: SignalType::String,
        },
    );
    let mut schemes = vec![complex_scheme(
        "scheme-x",
        &[(0xFFFF_0000, 0x0200_0000, vec![1, 2, 5])],
        &[],
    )];
    schemes.push(scheme("scheme-s", "dm-1", 0, 10_000, &[0x3000]));
    let state = state_with(manifest, schemes, 1000);
    let mut registry = PartialSignalRegistry::new();

    let dictionaries = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let configs = raw_buffer_configs(&dictionaries);
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].signal_id, SignalId(0x3000));
    assert_eq!(configs[0].signal_type, SignalType::String);
    assert_eq!(configs[0].message_id, None);
    assert_eq!(configs[1].signal_id, SignalId(0x0200_0000));
    assert_eq!(configs[1].message_id, Some("messageID1".to_string()));
}

#[test]
fn test_time_based_trigger_compiles_to_paced_condition() {
    let state = state_with(
        test_manifest("dm-1"),
        vec![scheme("scheme-1", "dm-1", 0, 10_000, &[1])],
        1000,
    );
    let mut registry = PartialSignalRegistry::new();
    let (inspection, _) = extract_matrices(&state, &mut registry);
    assert_eq!(inspection.conditions.len(), 1);
    let condition = &inspection.conditions[0];
    assert_eq!(condition.expression, Expression::Bool(true));
    assert_eq!(condition.min_interval_ms, 500);
    assert_eq!(condition.trigger_mode, TriggerMode::Always);
    assert_eq!(condition.signals[0].signal_type, SignalType::Double);
}

#[test]
fn test_state_template_signals_join_the_collect_set() {
    let translator = translator();
    let mut state = state_with(
        test_manifest("dm-1"),
        vec![scheme("scheme-1", "dm-1", 0, 10_000, &[1])],
        1000,
    );
    state.apply_state_templates(&contracts::StateTemplatesDiff {
        version: 1,
        add: vec![contracts::StateTemplate {
            id: "lks-1".to_string(),
            decoder_manifest_id: "dm-1".to_string(),
            update_strategy: contracts::StateTemplateUpdateStrategy::Periodic { period_ms: 10 },
            signals: vec![contracts::StateTemplateSignal {
                signal_id: SignalId(11),
                signal_type: SignalType::Double,
            }],
        }],
        remove: vec![],
    });
    let mut registry = PartialSignalRegistry::new();

    let dictionaries = extract_decoder_dictionaries(&state, &translator, &mut registry);
    let can = dictionaries[&NetworkProtocol::RawCan]
        .as_ref()
        .and_then(|d| d.as_can())
        .cloned()
        .unwrap();
    assert!(can.signal_ids_to_collect.contains(&SignalId(1)));
    assert!(can.signal_ids_to_collect.contains(&SignalId(11)));
    // Signal 11 lives in frame 0x200 on the second channel.
    let channel20 = translator.channel_numeric_id("20");
    assert!(can.decoder_methods[&channel20].contains_key(&0x200));
}

#[test]
fn test_fetch_configs_partition_into_the_fetch_matrix() {
    let mut base = (*scheme("scheme-1", "dm-1", 0, 10_000, &[1])).clone();
    base.fetch_configs = vec![
        contracts::FetchConfig {
            signal_id: SignalId(1),
            trigger: contracts::FetchTrigger::TimeBased {
                period_ms: 5000,
                max_executions_per_interval: 3,
            },
            actions: vec![],
        },
        contracts::FetchConfig {
            signal_id: SignalId(2),
            trigger: contracts::FetchTrigger::ConditionBased {
                condition: Expression::Binary {
                    op: contracts::BinaryOp::Gt,
                    left: Box::new(Expression::Signal {
                        signal_id: SignalId(3),
                    }),
                    right: Box::new(Expression::Number(10.0)),
                },
            },
            actions: vec![Expression::Signal {
                signal_id: SignalId(2),
            }],
        },
        // Malformed: zero period must be dropped without aborting.
        contracts::FetchConfig {
            signal_id: SignalId(4),
            trigger: contracts::FetchTrigger::TimeBased {
                period_ms: 0,
                max_executions_per_interval: 1,
            },
            actions: vec![],
        },
    ];
    let state = state_with(test_manifest("dm-1"), vec![Arc::new(base)], 1000);
    let mut registry = PartialSignalRegistry::new();

    let (_, fetch) = extract_matrices(&state, &mut registry);
    assert_eq!(fetch.time_based.len(), 1);
    let time_based = &fetch.time_based[&SignalId(1)];
    assert_eq!(time_based.period_ms, 5000);
    assert_eq!(time_based.max_executions_per_interval, 3);

    assert_eq!(fetch.condition_based.len(), 1);
    assert_eq!(fetch.condition_based[0].signal_id, SignalId(2));
    assert_eq!(fetch.condition_based[0].actions.len(), 1);
    assert!(!fetch.time_based.contains_key(&SignalId(4)));
}
