//! End-to-end tests for ingest: signature policy, anchor sealing,
//! content addressing, eviction and point resolve.

use cgp_rs::crypto::{self, canonical_bytes, seal_constellation, sign_bytes, sign_packet, verify_bytes};
use cgp_rs::{
    BuildItem, BuilderPack, Codebook, CodebookEntry, Constellation, ConstellationRef, DecodeRequest,
    Engine, EngineConfig, Error, PackParams, PackStatus, Packet, Point, ShapeStore, SuperNode,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const SECRET: &str = "correct horse battery staple";

fn packet(tag: &str) -> Packet {
    Packet::new("docs", "text").with_meta("tag", tag).with_supernode(SuperNode::new(
        "sn0",
        vec![
            Constellation::new("c0", vec![1.0, 0.0], (0.0, 1.0), vec![0.25, 0.75]).with_points(vec![
                Point::new(format!("{tag}-p0"), 0.8, 0.9).with_source_ref("media:abc#t=5-9"),
            ]),
            Constellation::new("c1", vec![0.0, 1.0], (0.2, 0.9), vec![0.5, 0.5])
                .with_points(vec![Point::new(format!("{tag}-p1"), 0.3, 0.6)]),
        ],
    ))
}

fn signed(tag: &str) -> Packet {
    let mut p = packet(tag);
    sign_packet(&mut p, SECRET).unwrap();
    p
}

fn strict() -> Engine {
    Engine::new(EngineConfig::default().with_passphrase(SECRET).with_require_signature(true)).unwrap()
}

// ============================================================================
// 1. Signature policy
// ============================================================================

#[test]
fn test_unsigned_rejected_when_required() {
    let engine = strict();
    assert!(matches!(engine.ingest(packet("a")), Err(Error::Authentication(_))));
    assert!(engine.store().is_empty());
}

#[test]
fn test_signed_packet_accepted() {
    let engine = strict();
    let receipt = engine.ingest(signed("a")).unwrap();
    assert_eq!(receipt.event, "geometry.cgp.v1");
    assert_eq!(receipt.key.as_str().len(), 64);
    assert!(engine.store().contains(&receipt.key).unwrap());
}

#[test]
fn test_tampered_packet_rejected_even_when_not_required() {
    let engine = Engine::new(EngineConfig::default().with_passphrase(SECRET)).unwrap();
    let mut p = signed("a");
    p.meta.insert("tag".into(), "b".into());
    assert!(matches!(engine.ingest(p), Err(Error::Authentication(_))));

    // Unsigned is still fine under the lenient policy.
    assert!(engine.ingest(packet("a")).is_ok());
}

#[test]
fn test_wrong_passphrase_rejected() {
    let engine = strict();
    let mut p = packet("a");
    sign_packet(&mut p, "another secret").unwrap();
    assert!(matches!(engine.ingest(p), Err(Error::Authentication(_))));
}

#[test]
fn test_content_hash_ignores_signature() {
    let engine = Engine::new(EngineConfig::default().with_passphrase(SECRET)).unwrap();
    let a = engine.ingest(packet("a")).unwrap();
    let b = engine.ingest(signed("a")).unwrap();
    assert_eq!(a.key, b.key);
    assert!(!b.inserted);
}

/// Sorted-key compact JSON as an external producer would sign it.
const PRODUCER_CANONICAL: &str = concat!(
    r#"{"meta":{"modality":"text","namespace":"docs"},"spec":"chit.cgp.v0.1","#,
    r#""supernodes":[{"constellations":[{"anchor":[1.0,0.0],"id":"c0","points":[],"#,
    r#""radial_minmax":[0.0,1.0],"spectrum":[0.1,0.9]}],"id":"sn0"}]}"#,
);

#[test]
fn test_externally_signed_packet_verifies() {
    let tag = sign_bytes(PRODUCER_CANONICAL.as_bytes(), SECRET).unwrap();
    let mut wire: serde_json::Value = serde_json::from_str(PRODUCER_CANONICAL).unwrap();
    wire["sig"] = serde_json::json!({ "alg": "HMAC-SHA256", "hmac": tag });
    let p: Packet = serde_json::from_value(wire).unwrap();
    assert_eq!(canonical_bytes(&p).unwrap(), PRODUCER_CANONICAL.as_bytes());

    let receipt = strict().ingest(p).unwrap();
    assert_eq!(receipt.key.as_str(), crypto::sha256_hex(PRODUCER_CANONICAL.as_bytes()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_byte_flip_breaks_signature(pos in any::<prop::sample::Index>(), mask in 1u8..=255) {
        let bytes = canonical_bytes(&packet("a")).unwrap();
        let tag = sign_bytes(&bytes, SECRET).unwrap();
        prop_assert!(verify_bytes(&bytes, &tag, SECRET));

        let mut flipped = bytes.clone();
        let i = pos.index(flipped.len());
        flipped[i] ^= mask;
        prop_assert!(!verify_bytes(&flipped, &tag, SECRET));
    }
}

// ============================================================================
// 2. Anchor sealing
// ============================================================================

fn items() -> Vec<BuildItem> {
    (0..6)
        .map(|i| {
            let v = if i < 3 { vec![1.0, 0.1 * i as f32] } else { vec![0.1 * i as f32, 1.0] };
            BuildItem::new(format!("it{i}"), v).with_text(format!("item {i}"))
        })
        .collect()
}

fn two_way_pack() -> BuilderPack {
    BuilderPack {
        id: "pack-2".into(),
        status: PackStatus::Active,
        generation: 1,
        params: PackParams { k: 2, iterations: 10, beta: 10.0, bins: 4, tau: 0.1 },
        halting: None,
    }
}

fn codebook() -> Codebook {
    Codebook::new(vec![
        CodebookEntry::new("x", "along x", vec![1.0, 0.05]),
        CodebookEntry::new("y", "along y", vec![0.05, 1.0]),
    ])
}

#[test]
fn test_sealed_build_roundtrips_through_ingest_and_decode() {
    let config = EngineConfig::default()
        .with_passphrase(SECRET)
        .with_require_signature(true)
        .with_encrypt_anchors(true);
    let engine = Engine::new(config).unwrap();
    engine.announce_pack("docs", "text", two_way_pack()).unwrap();

    let built = engine.build(&items(), "docs", "text").unwrap();
    assert_eq!(built.pack_id.as_deref(), Some("pack-2"));
    assert!(built.packet.sig.is_some());
    assert!(built.packet.constellations().all(|c| c.is_encrypted()));

    let receipt = engine.ingest(built.packet).unwrap();
    let stored = engine.store().get(&receipt.key).unwrap().unwrap();
    assert!(stored.constellations().all(|c| c.anchor.is_none()));

    let request = DecodeRequest::new(ConstellationRef::stored(receipt.key, None)).per_constellation(1);
    let response = engine.decode(&request, &codebook()).unwrap();
    assert_eq!(response.candidates.len(), 2);
}

#[test]
fn test_decrypt_disabled_stores_opaque_and_decode_fails_closed() {
    let mut p = packet("sealed");
    for sn in &mut p.supernodes {
        for c in &mut sn.constellations {
            seal_constellation(c, SECRET).unwrap();
        }
    }
    let engine = Engine::new(EngineConfig::default().with_passphrase(SECRET).with_anchor_decrypt(false)).unwrap();
    let key = engine.ingest(p).unwrap().key;

    let request = DecodeRequest::new(ConstellationRef::stored(key, Some("c0")));
    assert!(matches!(engine.decode(&request, &codebook()), Err(Error::Crypto(_))));
}

#[test]
fn test_moved_anchor_fails_ingest() {
    let mut p = packet("moved");
    let c = &mut p.supernodes[0].constellations;
    seal_constellation(&mut c[0], SECRET).unwrap();
    seal_constellation(&mut c[1], SECRET).unwrap();
    let enc0 = c[0].anchor_enc.take();
    c[0].anchor_enc = c[1].anchor_enc.take();
    c[1].anchor_enc = enc0;

    let engine = Engine::new(EngineConfig::default().with_passphrase(SECRET)).unwrap();
    assert!(matches!(engine.ingest(p), Err(Error::Crypto(_))));
    assert!(engine.store().is_empty());
}

// ============================================================================
// 3. Eviction and point resolve
// ============================================================================

#[test]
fn test_capacity_two_evicts_first_of_three() {
    let engine = Engine::new(EngineConfig::default().with_store_capacity(2)).unwrap();
    let first = engine.ingest(packet("one")).unwrap();
    engine.ingest(packet("two")).unwrap();
    let third = engine.ingest(packet("three")).unwrap();

    assert_eq!(third.evicted, vec![first.key.clone()]);
    assert!(!engine.store().contains(&first.key).unwrap());
    assert!(matches!(engine.resolve_point("one-p0"), Err(Error::NotFound(_))));
    assert!(engine.resolve_point("two-p0").is_ok());
    assert!(engine.resolve_point("three-p1").is_ok());
}

#[test]
fn test_resolve_point_renders_media_link() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let receipt = engine.ingest(packet("a")).unwrap();

    let link = engine.resolve_point("a-p0").unwrap();
    assert_eq!(link.link, "https://www.youtube.com/watch?v=abc&t=5s");
    assert_eq!(link.shape, receipt.key);

    assert_eq!(engine.resolve_point("a-p1").unwrap().link, "cgp://point/a-p1");
}

#[test]
fn test_custom_media_template() {
    let mut config = EngineConfig::default();
    config.media_link_template = "https://media.example/{id}?from={start}&to={end}".into();
    let engine = Engine::new(config).unwrap();
    engine.ingest(packet("a")).unwrap();
    assert_eq!(
        engine.resolve_point("a-p0").unwrap().link,
        "https://media.example/abc?from=5&to=9"
    );
}

#[test]
fn test_export_lists_shapes_oldest_first() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine.ingest(packet("one")).unwrap();
    engine.ingest(packet("two")).unwrap();

    let mut out = Vec::new();
    assert_eq!(cgp_rs::export::export_shapes_jsonl(engine.store(), &mut out).unwrap(), 2);
    let text = String::from_utf8(out).unwrap();
    let first: Packet = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(first.meta["tag"], "one");
    assert_eq!(crypto::content_hash(&first).unwrap(), engine.store().keys()[0].as_str());
}
