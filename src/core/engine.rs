//! Content-addressed deployment engine.
//!
//! Code units are placed at addresses computed in advance from the engine
//! identity, a caller-supplied salt, and the content hash. Storage is
//! append-only: an address, once bound to a code hash, is never rebound.
//! Oversized logical units are staged as chunks and assembled at deploy time.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::clock::now_epoch_z;
use crate::core::config::ForgeConfig;
use crate::core::db::{meta_get, meta_set, with_forge_db};
use crate::core::error::ForgeError;
use crate::core::events::EventLog;
use crate::core::hash::{Address, Digest, Salt, sha256_concat, ADDR_TAG};
use crate::core::store::Store;

const META_ENGINE_CODE_HASH: &str = "engine.code_hash";
const META_MANIFEST_HASH: &str = "engine.manifest_hash";
const META_HALTED: &str = "engine.halted";
const META_FEE_BALANCE: &str = "fees.balance";

/// Reference to a staged, deduplicated content chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub hash: Digest,
    pub size: u64,
}

/// Result of one placement. `placed` is false when the identical unit was
/// already at the address (idempotent success, nothing written).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub address: Address,
    pub code_hash: Digest,
    pub refund: u64,
    pub placed: bool,
}

/// One item of a batch deployment.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub salt: Salt,
    pub content: Vec<u8>,
    pub fee_paid: u64,
}

/// Counts over a batch's per-item results.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatchOutcomeSummary {
    pub deployed: usize,
    pub failed: usize,
}

impl BatchOutcomeSummary {
    pub fn from(outcomes: &[Result<DeployOutcome, ForgeError>]) -> Self {
        let deployed = outcomes.iter().filter(|o| o.is_ok()).count();
        Self {
            deployed,
            failed: outcomes.len() - deployed,
        }
    }
}

/// Expected digests the engine re-validates before placing code. Defends
/// against substitution of the deployment engine itself or of the
/// authoritative manifest it serves.
#[derive(Debug, Clone)]
pub struct IntegrityGuard {
    pub expected_engine_code: Digest,
    pub expected_manifest_hash: Option<Digest>,
}

/// Code-hash lookup at an address. The router re-validates routes through
/// this seam, and tests substitute an in-memory map.
pub trait CodeLookup {
    fn code_hash_at(&self, address: &Address) -> Result<Option<Digest>, ForgeError>;
}

/// Digest identifying a deployment engine build. Folded into the meta table
/// at init and checked by the integrity guard on every deploy.
pub fn engine_code_digest(engine_id: &str) -> Digest {
    Digest::of(engine_id.as_bytes())
}

/// Pure address derivation. Must equal the address `deploy` produces for the
/// same engine identity, salt, and code hash.
pub fn predict_address(engine_id: &str, salt: &Salt, code_hash: &Digest) -> Address {
    let id_len = (engine_id.len() as u64).to_be_bytes();
    let digest = sha256_concat(&[
        ADDR_TAG,
        &id_len,
        engine_id.as_bytes(),
        salt.as_bytes(),
        code_hash.as_bytes(),
    ]);
    Address(digest.0)
}

pub struct DeployEngine {
    store: Store,
    config: ForgeConfig,
    guard: Option<IntegrityGuard>,
    log: EventLog,
}

impl DeployEngine {
    pub fn open(store: Store, config: ForgeConfig, guard: Option<IntegrityGuard>) -> Self {
        let log = EventLog::new(&store);
        Self {
            store,
            config,
            guard,
            log,
        }
    }

    /// Record this engine build's identity digest. Called once at `init`.
    pub fn initialize(&self) -> Result<(), ForgeError> {
        with_forge_db(&self.store.root, |conn| {
            meta_set(
                conn,
                META_ENGINE_CODE_HASH,
                &engine_code_digest(&self.config.engine_id).to_hex(),
            )
        })
    }

    pub fn predict(&self, salt: &Salt, code_hash: &Digest) -> Address {
        predict_address(&self.config.engine_id, salt, code_hash)
    }

    pub fn required_fee(&self, size: u64) -> u64 {
        self.config.base_fee + self.config.fee_per_byte * size
    }

    /// Record the authoritative manifest hash the guard checks against.
    pub fn record_manifest_hash(&self, actor: &str, hash: &Digest) -> Result<(), ForgeError> {
        with_forge_db(&self.store.root, |conn| {
            meta_set(conn, META_MANIFEST_HASH, &hash.to_hex())
        })?;
        self.log
            .append(actor, "manifest_recorded", json!({ "manifest_hash": hash }))
    }

    pub fn is_halted(&self) -> Result<bool, ForgeError> {
        with_forge_db(&self.store.root, |conn| halted(conn))
    }

    /// Lift an integrity halt after the operator has resolved the mismatch.
    pub fn clear_halt(&self, actor: &str) -> Result<(), ForgeError> {
        with_forge_db(&self.store.root, |conn| meta_set(conn, META_HALTED, "0"))?;
        self.log.append(actor, "halt_cleared", json!({}))
    }

    /// Accumulated fee-recipient balance (additive-only deltas).
    pub fn fee_balance(&self) -> Result<u64, ForgeError> {
        with_forge_db(&self.store.root, |conn| fee_balance(conn))
    }

    /// Stage a content chunk. Idempotent: re-staging identical content
    /// returns the existing reference without writing a second row.
    pub fn stage(&self, actor: &str, content: &[u8]) -> Result<ChunkRef, ForgeError> {
        let size = content.len() as u64;
        if size > self.config.max_chunk_size {
            return Err(ForgeError::Validation(format!(
                "chunk size {} exceeds ceiling {}",
                size, self.config.max_chunk_size
            )));
        }
        let hash = Digest::of(content);

        let fresh = with_forge_db(&self.store.root, |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT size FROM chunks WHERE hash = ?1",
                    params![hash.to_hex()],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO chunks(hash, size, content, staged_at) VALUES(?1, ?2, ?3, ?4)",
                params![hash.to_hex(), size as i64, content, now_epoch_z()],
            )?;
            Ok(true)
        })?;

        if fresh {
            self.log.append(
                actor,
                "chunk_staged",
                json!({ "hash": hash, "size": size }),
            )?;
        }
        Ok(ChunkRef { hash, size })
    }

    pub fn chunk(&self, hash: &Digest) -> Result<Option<ChunkRef>, ForgeError> {
        with_forge_db(&self.store.root, |conn| {
            let size: Option<i64> = conn
                .query_row(
                    "SELECT size FROM chunks WHERE hash = ?1",
                    params![hash.to_hex()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(size.map(|s| ChunkRef {
                hash: *hash,
                size: s as u64,
            }))
        })
    }

    pub fn chunk_count(&self) -> Result<u64, ForgeError> {
        with_forge_db(&self.store.root, |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    /// Place a code unit at its predicted address.
    pub fn deploy(
        &self,
        actor: &str,
        salt: &Salt,
        content: &[u8],
        fee_paid: u64,
    ) -> Result<DeployOutcome, ForgeError> {
        if content.len() as u64 > self.config.max_code_size {
            return Err(ForgeError::Validation(format!(
                "code size {} exceeds ceiling {} (stage chunks instead)",
                content.len(),
                self.config.max_code_size
            )));
        }
        let outcome = with_forge_db(&self.store.root, |conn| {
            self.check_integrity(conn)?;
            self.place(conn, salt, content, fee_paid)
        })?;
        self.log_deploy(actor, salt, &outcome)?;
        Ok(outcome)
    }

    /// Assemble previously staged chunks into one logical unit and place it.
    /// The per-publish size ceiling does not apply to the assembled whole;
    /// that is what staging is for.
    pub fn deploy_chunked(
        &self,
        actor: &str,
        salt: &Salt,
        chunk_hashes: &[Digest],
        fee_paid: u64,
    ) -> Result<DeployOutcome, ForgeError> {
        if chunk_hashes.is_empty() {
            return Err(ForgeError::Validation(
                "chunked deploy requires at least one chunk".to_string(),
            ));
        }
        let outcome = with_forge_db(&self.store.root, |conn| {
            self.check_integrity(conn)?;
            let mut content = Vec::new();
            for hash in chunk_hashes {
                let blob: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT content FROM chunks WHERE hash = ?1",
                        params![hash.to_hex()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let blob = blob.ok_or_else(|| {
                    ForgeError::NotFound(format!("chunk {} not staged", hash))
                })?;
                content.extend_from_slice(&blob);
            }
            self.place(conn, salt, &content, fee_paid)
        })?;
        self.log_deploy(actor, salt, &outcome)?;
        Ok(outcome)
    }

    /// Deploy a batch. Atomic mode is all-or-nothing: the first failure rolls
    /// back every placement and surfaces as the call's error. Best-effort
    /// mode reports one result per item.
    pub fn deploy_batch(
        &self,
        actor: &str,
        requests: &[DeployRequest],
        atomic: bool,
    ) -> Result<Vec<Result<DeployOutcome, ForgeError>>, ForgeError> {
        for request in requests {
            if request.content.len() as u64 > self.config.max_code_size {
                return Err(ForgeError::Validation(format!(
                    "batch item exceeds code size ceiling {}",
                    self.config.max_code_size
                )));
            }
        }

        let outcomes = with_forge_db(&self.store.root, |conn| {
            self.check_integrity(conn)?;
            if atomic {
                let tx = conn.transaction()?;
                let mut outcomes = Vec::with_capacity(requests.len());
                for request in requests {
                    let outcome =
                        self.place(&tx, &request.salt, &request.content, request.fee_paid)?;
                    outcomes.push(Ok(outcome));
                }
                tx.commit()?;
                Ok(outcomes)
            } else {
                let mut outcomes = Vec::with_capacity(requests.len());
                for request in requests {
                    outcomes.push(self.place(
                        conn,
                        &request.salt,
                        &request.content,
                        request.fee_paid,
                    ));
                }
                Ok(outcomes)
            }
        })?;

        for (request, outcome) in requests.iter().zip(outcomes.iter()) {
            if let Ok(outcome) = outcome {
                self.log_deploy(actor, &request.salt, outcome)?;
            }
        }
        Ok(outcomes)
    }

    pub fn code_unit_size(&self, address: &Address) -> Result<Option<u64>, ForgeError> {
        with_forge_db(&self.store.root, |conn| {
            let size: Option<i64> = conn
                .query_row(
                    "SELECT size FROM code_units WHERE address = ?1",
                    params![address.to_hex()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(size.map(|s| s as u64))
        })
    }

    // One placement inside an already-open connection or transaction.
    fn place(
        &self,
        conn: &Connection,
        salt: &Salt,
        content: &[u8],
        fee_paid: u64,
    ) -> Result<DeployOutcome, ForgeError> {
        let code_hash = Digest::of(content);
        let address = self.predict(salt, &code_hash);
        let size = content.len() as u64;

        let existing: Option<String> = conn
            .query_row(
                "SELECT code_hash FROM code_units WHERE address = ?1",
                params![address.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_hash) = existing {
            if existing_hash == code_hash.to_hex() {
                // Identical content already placed: idempotent, full refund.
                return Ok(DeployOutcome {
                    address,
                    code_hash,
                    refund: fee_paid,
                    placed: false,
                });
            }
            return Err(ForgeError::Collision {
                address: address.to_hex(),
            });
        }

        let required = self.required_fee(size);
        if fee_paid < required {
            return Err(ForgeError::InsufficientFee {
                required,
                paid: fee_paid,
            });
        }

        conn.execute(
            "INSERT INTO code_units(address, code_hash, size, content, salt, deployed_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                address.to_hex(),
                code_hash.to_hex(),
                size as i64,
                content,
                salt.to_hex(),
                now_epoch_z()
            ],
        )?;
        credit_fee(conn, required)?;

        Ok(DeployOutcome {
            address,
            code_hash,
            refund: fee_paid - required,
            placed: true,
        })
    }

    // Integrity self-check. A mismatch persists a halt flag that blocks all
    // further deploys until explicitly cleared.
    fn check_integrity(&self, conn: &Connection) -> Result<(), ForgeError> {
        if halted(conn)? {
            return Err(ForgeError::Integrity(
                "engine is halted pending integrity resolution".to_string(),
            ));
        }
        let Some(guard) = &self.guard else {
            return Ok(());
        };

        let recorded = meta_get(conn, META_ENGINE_CODE_HASH)?;
        let engine_ok = recorded.as_deref() == Some(guard.expected_engine_code.to_hex().as_str());

        let manifest_ok = match &guard.expected_manifest_hash {
            None => true,
            Some(expected) => {
                meta_get(conn, META_MANIFEST_HASH)?.as_deref() == Some(expected.to_hex().as_str())
            }
        };

        if engine_ok && manifest_ok {
            return Ok(());
        }

        meta_set(conn, META_HALTED, "1")?;
        self.log.append(
            "engine",
            "integrity_halted",
            json!({
                "engine_ok": engine_ok,
                "manifest_ok": manifest_ok,
            }),
        )?;
        Err(ForgeError::Integrity(format!(
            "self-check failed (engine_ok={}, manifest_ok={}); deploys halted",
            engine_ok, manifest_ok
        )))
    }

    fn log_deploy(
        &self,
        actor: &str,
        salt: &Salt,
        outcome: &DeployOutcome,
    ) -> Result<(), ForgeError> {
        self.log.append(
            actor,
            "deployed",
            json!({
                "address": outcome.address,
                "code_hash": outcome.code_hash,
                "salt": salt,
                "refund": outcome.refund,
                "placed": outcome.placed,
            }),
        )
    }
}

impl CodeLookup for DeployEngine {
    fn code_hash_at(&self, address: &Address) -> Result<Option<Digest>, ForgeError> {
        with_forge_db(&self.store.root, |conn| {
            let hash: Option<String> = conn
                .query_row(
                    "SELECT code_hash FROM code_units WHERE address = ?1",
                    params![address.to_hex()],
                    |row| row.get(0),
                )
                .optional()?;
            hash.map(|h| Digest::from_hex(&h)).transpose()
        })
    }
}

fn halted(conn: &Connection) -> Result<bool, ForgeError> {
    Ok(meta_get(conn, META_HALTED)?.as_deref() == Some("1"))
}

fn fee_balance(conn: &Connection) -> Result<u64, ForgeError> {
    Ok(meta_get(conn, META_FEE_BALANCE)?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0))
}

fn credit_fee(conn: &Connection, amount: u64) -> Result<(), ForgeError> {
    let balance = fee_balance(conn)?;
    meta_set(conn, META_FEE_BALANCE, &(balance + amount).to_string())
}
