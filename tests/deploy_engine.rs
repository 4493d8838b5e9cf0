use routeforge::core::config::ForgeConfig;
use routeforge::core::db::initialize_forge_db;
use routeforge::core::engine::{
    engine_code_digest, CodeLookup, DeployEngine, DeployRequest, IntegrityGuard,
};
use routeforge::core::error::ForgeError;
use routeforge::core::hash::{Digest, Salt};
use routeforge::core::store::Store;
use rusqlite::params;
use tempfile::tempdir;

fn test_config() -> ForgeConfig {
    ForgeConfig {
        timelock_secs: 1,
        max_code_size: 64,
        max_chunk_size: 16,
        base_fee: 10,
        fee_per_byte: 1,
        engine_id: "engine-under-test".to_string(),
        bootstrap_admin: "operator".to_string(),
    }
}

fn setup() -> (tempfile::TempDir, Store, ForgeConfig) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path().to_path_buf());
    initialize_forge_db(&store.root).expect("init db");
    (tmp, store, test_config())
}

fn engine(store: &Store, config: &ForgeConfig) -> DeployEngine {
    let guard = IntegrityGuard {
        expected_engine_code: engine_code_digest(&config.engine_id),
        expected_manifest_hash: None,
    };
    let engine = DeployEngine::open(store.clone(), config.clone(), Some(guard));
    engine.initialize().expect("engine init");
    engine
}

#[test]
fn predict_matches_deploy_and_tracks_code_hash() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let salt = Salt([7u8; 32]);
    let content = b"code unit alpha";
    let predicted = engine.predict(&salt, &Digest::of(content));

    let outcome = engine.deploy("operator", &salt, content, 1_000).expect("deploy");
    assert_eq!(outcome.address, predicted);
    assert!(outcome.placed);

    // Same salt, different content: different address.
    let other = engine.predict(&salt, &Digest::of(b"code unit beta"));
    assert_ne!(other, predicted);

    let stored = engine.code_hash_at(&predicted).expect("lookup");
    assert_eq!(stored, Some(Digest::of(content)));
}

#[test]
fn overpayment_is_refunded_exactly_and_fee_is_credited() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let content = b"fee-check";
    let required = config.base_fee + config.fee_per_byte * content.len() as u64;

    let outcome = engine
        .deploy("operator", &Salt([1u8; 32]), content, required + 1)
        .expect("deploy");
    assert_eq!(outcome.refund, 1);
    assert_eq!(engine.fee_balance().expect("balance"), required);
}

#[test]
fn insufficient_fee_rejects_without_state_change() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let salt = Salt([2u8; 32]);
    let content = b"underpaid";
    let err = engine.deploy("operator", &salt, content, 3).unwrap_err();
    assert!(matches!(err, ForgeError::InsufficientFee { .. }));

    let address = engine.predict(&salt, &Digest::of(content));
    assert_eq!(engine.code_unit_size(&address).expect("size"), None);
    assert_eq!(engine.fee_balance().expect("balance"), 0);
}

#[test]
fn redeploying_identical_content_is_idempotent() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let salt = Salt([3u8; 32]);
    let content = b"same twice";

    let first = engine.deploy("operator", &salt, content, 1_000).expect("deploy");
    assert!(first.placed);
    let balance_after_first = engine.fee_balance().expect("balance");

    let second = engine.deploy("operator", &salt, content, 1_000).expect("deploy");
    assert!(!second.placed);
    assert_eq!(second.address, first.address);
    // Nothing placed, so the whole payment comes back.
    assert_eq!(second.refund, 1_000);
    assert_eq!(engine.fee_balance().expect("balance"), balance_after_first);
}

#[test]
fn occupied_address_with_different_content_is_a_collision() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let salt = Salt([4u8; 32]);
    let content = b"original";
    let outcome = engine.deploy("operator", &salt, content, 1_000).expect("deploy");

    // Corrupt the stored unit, as a substituted engine would.
    let conn = rusqlite::Connection::open(store.root.join("forge.db")).expect("open");
    conn.execute(
        "UPDATE code_units SET code_hash = ?1 WHERE address = ?2",
        params![Digest::of(b"swapped").to_hex(), outcome.address.to_hex()],
    )
    .expect("tamper");
    drop(conn);

    let err = engine.deploy("operator", &salt, content, 1_000).unwrap_err();
    assert!(matches!(err, ForgeError::Collision { .. }));
}

#[test]
fn staging_is_idempotent_per_content() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let first = engine.stage("operator", b"chunk-a").expect("stage");
    let second = engine.stage("operator", b"chunk-a").expect("stage");
    assert_eq!(first, second);
    assert_eq!(engine.chunk_count().expect("count"), 1);

    engine.stage("operator", b"chunk-b").expect("stage");
    assert_eq!(engine.chunk_count().expect("count"), 2);
}

#[test]
fn oversized_chunk_and_code_are_rejected() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let big_chunk = vec![0u8; (config.max_chunk_size + 1) as usize];
    assert!(matches!(
        engine.stage("operator", &big_chunk),
        Err(ForgeError::Validation(_))
    ));

    let big_code = vec![0u8; (config.max_code_size + 1) as usize];
    assert!(matches!(
        engine.deploy("operator", &Salt([5u8; 32]), &big_code, 10_000),
        Err(ForgeError::Validation(_))
    ));
}

#[test]
fn chunked_deploy_assembles_past_the_code_ceiling() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    // Five full chunks: 80 bytes assembled, over the 64-byte direct ceiling.
    let mut assembled = Vec::new();
    let mut hashes = Vec::new();
    for i in 0..5u8 {
        let chunk = vec![i; config.max_chunk_size as usize];
        let chunk_ref = engine.stage("operator", &chunk).expect("stage");
        hashes.push(chunk_ref.hash);
        assembled.extend_from_slice(&chunk);
    }

    let salt = Salt([6u8; 32]);
    let outcome = engine
        .deploy_chunked("operator", &salt, &hashes, 10_000)
        .expect("chunked deploy");
    assert_eq!(outcome.address, engine.predict(&salt, &Digest::of(&assembled)));
    assert_eq!(
        engine.code_unit_size(&outcome.address).expect("size"),
        Some(assembled.len() as u64)
    );

    let missing = Digest::of(b"never staged");
    assert!(matches!(
        engine.deploy_chunked("operator", &Salt([7u8; 32]), &[missing], 10_000),
        Err(ForgeError::NotFound(_))
    ));
}

#[test]
fn atomic_batch_is_all_or_nothing() {
    let (_tmp, store, config) = setup();
    let engine = engine(&store, &config);

    let good = DeployRequest {
        salt: Salt([8u8; 32]),
        content: b"batch-ok".to_vec(),
        fee_paid: 1_000,
    };
    let underpaid = DeployRequest {
        salt: Salt([9u8; 32]),
        content: b"batch-broke".to_vec(),
        fee_paid: 1,
    };

    let err = engine
        .deploy_batch("operator", &[good.clone(), underpaid.clone()], true)
        .unwrap_err();
    assert!(matches!(err, ForgeError::InsufficientFee { .. }));

    // Rolled back: the good item was not placed either.
    let good_address = engine.predict(&good.salt, &Digest::of(&good.content));
    assert_eq!(engine.code_unit_size(&good_address).expect("size"), None);
    assert_eq!(engine.fee_balance().expect("balance"), 0);

    // Best-effort reports per item and keeps the good placement.
    let outcomes = engine
        .deploy_batch("operator", &[good, underpaid], false)
        .expect("best effort");
    assert!(outcomes[0].is_ok());
    assert!(matches!(outcomes[1], Err(ForgeError::InsufficientFee { .. })));
    assert_eq!(
        engine.code_unit_size(&good_address).expect("size"),
        Some("batch-ok".len() as u64)
    );
}

#[test]
fn integrity_mismatch_halts_deploys_until_cleared() {
    let (_tmp, store, config) = setup();
    // Record the true engine digest first.
    let honest = engine(&store, &config);
    honest.deploy("operator", &Salt([10u8; 32]), b"before halt", 1_000).expect("deploy");

    // An engine whose guard expects a different build triggers the halt.
    let wrong_guard = IntegrityGuard {
        expected_engine_code: Digest::of(b"some other build"),
        expected_manifest_hash: None,
    };
    let imposter = DeployEngine::open(store.clone(), config.clone(), Some(wrong_guard));
    let err = imposter
        .deploy("operator", &Salt([11u8; 32]), b"blocked", 1_000)
        .unwrap_err();
    assert!(matches!(err, ForgeError::Integrity(_)));

    // The halt is persisted and blocks even a correctly-guarded engine.
    assert!(honest.is_halted().expect("halted"));
    let err = honest
        .deploy("operator", &Salt([12u8; 32]), b"still blocked", 1_000)
        .unwrap_err();
    assert!(matches!(err, ForgeError::Integrity(_)));

    honest.clear_halt("operator").expect("clear");
    honest
        .deploy("operator", &Salt([12u8; 32]), b"after clear", 1_000)
        .expect("deploy resumes");
}

#[test]
fn manifest_guard_rejects_unrecorded_or_mismatched_manifest() {
    let (_tmp, store, config) = setup();
    let honest = engine(&store, &config);
    let manifest_hash = Digest::of(b"authoritative manifest");

    let guarded = DeployEngine::open(
        store.clone(),
        config.clone(),
        Some(IntegrityGuard {
            expected_engine_code: engine_code_digest(&config.engine_id),
            expected_manifest_hash: Some(manifest_hash),
        }),
    );

    // Nothing recorded yet: the guard fails closed.
    let err = guarded
        .deploy("operator", &Salt([13u8; 32]), b"x", 1_000)
        .unwrap_err();
    assert!(matches!(err, ForgeError::Integrity(_)));

    honest.clear_halt("operator").expect("clear");
    honest
        .record_manifest_hash("operator", &manifest_hash)
        .expect("record");
    guarded
        .deploy("operator", &Salt([13u8; 32]), b"x", 1_000)
        .expect("deploy with matching manifest");
}
