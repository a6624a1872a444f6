//! End-to-end tests for decode, mix and calibration.

use std::sync::Arc;

use cgp_rs::decoder;
use cgp_rs::{
    Codebook, CodebookEntry, Constellation, ConstellationRef, DecodeRequest, Engine, EngineConfig,
    Error, JsonDirSink, Packet, SuperNode,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

/// Unit vector whose projection on `[1, 0]` is `x`.
fn at(x: f32) -> Vec<f32> {
    vec![x, (1.0 - x * x).max(0.0).sqrt()]
}

fn codebook(projections: &[f32]) -> Codebook {
    Codebook::new(
        projections
            .iter()
            .enumerate()
            .map(|(i, &x)| CodebookEntry::new(format!("e{i}"), format!("entry {i}"), at(x)).with_source_ref(format!("doc:{i}")))
            .collect(),
    )
}

fn uniform4() -> Constellation {
    Constellation::new("c0", vec![1.0, 0.0], (0.0, 1.0), vec![0.25; 4])
}

fn stored_engine() -> (Engine, cgp_rs::ShapeKey) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let packet = Packet::new("docs", "text").with_supernode(SuperNode::new(
        "sn0",
        vec![
            Constellation::new("c0", vec![1.0, 0.0], (0.0, 1.0), vec![0.1, 0.2, 0.3, 0.4]),
            Constellation::new("c1", vec![0.0, 1.0], (0.0, 1.0), vec![0.4, 0.3, 0.2, 0.1]),
        ],
    ));
    let key = engine.ingest(packet).unwrap().key;
    (engine, key)
}

// ============================================================================
// 1. Decode
// ============================================================================

#[test]
fn test_stored_decode_carries_provenance() {
    let (engine, key) = stored_engine();
    let request = DecodeRequest::new(ConstellationRef::stored(key.clone(), Some("c0"))).per_constellation(2);
    let response = engine.decode(&request, &codebook(&[0.1, 0.9, 0.6])).unwrap();

    assert_eq!(response.candidates.len(), 2);
    let top = &response.candidates[0];
    assert_eq!(top.source.entry_id, "e1");
    assert_eq!(top.source.shape.as_ref(), Some(&key));
    assert_eq!(top.source.constellation_id, "c0");
    assert_eq!(top.source.source_ref.as_deref(), Some("doc:1"));
    assert_eq!(response.selected.as_ref(), Some(top));
    assert!(response.gate.is_none());
}

#[test]
fn test_whole_shape_decode_covers_every_constellation() {
    let (engine, key) = stored_engine();
    let request = DecodeRequest::new(ConstellationRef::stored(key, None)).per_constellation(1);
    let response = engine.decode(&request, &codebook(&[0.2, 0.8])).unwrap();
    let owners: Vec<&str> = response.candidates.iter().map(|c| c.source.constellation_id.as_str()).collect();
    assert_eq!(owners, vec!["c0", "c1"]);
}

#[test]
fn test_unknown_constellation_is_not_found() {
    let (engine, key) = stored_engine();
    let request = DecodeRequest::new(ConstellationRef::stored(key, Some("c9")));
    assert!(matches!(engine.decode(&request, &codebook(&[0.5])), Err(Error::NotFound(_))));
}

#[test]
fn test_empty_codebook_is_empty_result() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let request = DecodeRequest::new(ConstellationRef::inline(uniform4())).with_gate(true);
    let response = engine.decode(&request, &Codebook::default()).unwrap();
    assert!(response.candidates.is_empty());
    assert!(response.selected.is_none());
    assert_eq!(response.gate.unwrap().telemetry.decision, cgp_rs::GateDecision::Empty);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_decode_is_deterministic(
        projections in prop::collection::vec(-1.0f32..1.0, 1..24),
        n in 1usize..8,
    ) {
        let c = Constellation::new("c0", vec![0.6, 0.8], (-1.0, 1.0), vec![0.1, 0.2, 0.3, 0.4]);
        let cb = codebook(&projections);
        let first = decoder::decode(&c, &cb, n, None).unwrap();
        let second = decoder::decode(&c, &cb, n, None).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.len() <= n);
        for pair in first.windows(2) {
            prop_assert!(pair[0].weight >= pair[1].weight);
        }
    }
}

// ============================================================================
// 2. Mix
// ============================================================================

#[test]
fn test_mix_between_two_stored_constellations() {
    let (engine, key) = stored_engine();
    let a = ConstellationRef::stored(key.clone(), Some("c0"));
    let b = ConstellationRef::stored(key, Some("c1"));
    let cb = codebook(&[0.1, 0.7, 0.95]);

    let out = engine.mix(&a, &b, 1.0, 1.0, Some((&cb, 2))).unwrap();
    let anchor = out.constellation.anchor.clone().unwrap();
    let s = std::f32::consts::FRAC_1_SQRT_2;
    assert!((anchor[0] - s).abs() < 1e-6 && (anchor[1] - s).abs() < 1e-6);
    for w in &out.constellation.spectrum {
        assert!((w - 0.25).abs() < 1e-6);
    }
    assert_eq!(out.candidates.unwrap().len(), 2);
}

#[test]
fn test_mix_rejects_whole_shape_reference() {
    let (engine, key) = stored_engine();
    let whole = ConstellationRef::stored(key, None);
    let inline = ConstellationRef::inline(uniform4());
    assert!(matches!(engine.mix(&whole, &inline, 1.0, 1.0, None), Err(Error::Validation(_))));
}

// ============================================================================
// 3. Calibration
// ============================================================================

#[test]
fn test_uniform_projections_calibrate_to_zero_divergence() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let projections: Vec<f32> = (0..16).map(|i| (i as f32 + 0.5) / 16.0).collect();
    let out = engine.calibrate(&ConstellationRef::inline(uniform4()), &codebook(&projections)).unwrap();

    assert!((out.report.coverage - 1.0).abs() < 1e-12);
    assert!(out.report.kl < 1e-6, "kl = {}", out.report.kl);
    assert!(out.report.js < 1e-6, "js = {}", out.report.js);
    assert!(out.link.is_none());
}

#[test]
fn test_calibration_report_is_persisted() {
    let dir = std::env::temp_dir().join(format!("cgp-e2e-reports-{}", std::process::id()));
    let engine = Engine::new(EngineConfig::default())
        .unwrap()
        .with_report_sink(Arc::new(JsonDirSink::new(&dir).unwrap()));

    let out = engine.calibrate(&ConstellationRef::inline(uniform4()), &codebook(&[0.1, 0.9])).unwrap();
    let link = out.link.unwrap();
    let saved: cgp_rs::CalibrationReport =
        serde_json::from_str(&std::fs::read_to_string(&link).unwrap()).unwrap();
    assert_eq!(saved.constellation_id, out.report.constellation_id);
    assert_eq!(saved.samples, 2);
    assert_eq!(saved.created_at, out.report.created_at);
    assert!((saved.kl - out.report.kl).abs() < 1e-9);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_empty_codebook_calibrates_to_neutral_report() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let out = engine.calibrate(&ConstellationRef::inline(uniform4()), &Codebook::default()).unwrap();
    assert!(out.report.empty);
    assert_eq!(out.report.samples, 0);
    assert_eq!(out.report.coverage, 0.0);
    assert_eq!(out.report.empirical, vec![0.0; 4]);
    assert!(out.report.kl.is_finite());
    assert!(out.report.js.is_finite());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_calibration_bounds(
        projections in prop::collection::vec(-1.0f32..1.0, 1..32),
        raw in prop::collection::vec(0.0f32..1.0, 1..10),
    ) {
        let total: f32 = raw.iter().sum();
        prop_assume!(total > 1e-3);
        let spectrum: Vec<f32> = raw.iter().map(|x| x / total).collect();
        let c = Constellation::new("c0", vec![1.0, 0.0], (-1.0, 1.0), spectrum);
        let r = decoder::calibrate(&c, &codebook(&projections), None).unwrap();
        prop_assert!(r.kl.is_finite() && r.kl >= 0.0);
        prop_assert!(r.js >= 0.0 && r.js <= std::f64::consts::LN_2);
        prop_assert!((0.0..=1.0).contains(&r.coverage));
    }
}
