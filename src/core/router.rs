//! Manifest router: the commit→delay→apply→activate state machine.
//!
//! One `RouterState` aggregate owns the live route table, the singleton
//! pending commitment, the role ledger, and the consumed-root set. The pure
//! transition logic lives on `RouterState`; `Router` wraps it with the
//! sqlite persistence, the injected clock, and the audit event log so the
//! machine survives the wall-clock wait between commit and activation.

use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::core::clock::{new_event_id, Clock};
use crate::core::config::ForgeConfig;
use crate::core::db::with_forge_db;
use crate::core::engine::CodeLookup;
use crate::core::error::ForgeError;
use crate::core::events::EventLog;
use crate::core::hash::{Address, Digest, Selector};
use crate::core::manifest::Route;
use crate::core::merkle::{verify, RouteProof};
use crate::core::roles::{load_roles, save_roles, Permission, RoleMap};
use crate::core::store::Store;

/// A committed root waiting out its timelock. At most one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommitment {
    pub root: Digest,
    pub epoch: u64,
    pub route_count: u64,
    pub manifest_hash: Option<Digest>,
    pub committed_at: u64,
    pub not_before: u64,
    pub committed_by: String,
}

/// Audit record written once per activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub activation_id: String,
    pub manifest_root: Digest,
    pub manifest_hash: Option<Digest>,
    pub epoch: u64,
    pub activated_at: u64,
    pub activated_by: String,
}

/// Status summary for introspection surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub epoch: u64,
    pub paused: bool,
    pub pending: Option<PendingCommitment>,
    pub applied_count: u64,
    pub active_count: u64,
    pub activations: u64,
}

/// The owned routing aggregate. All transitions are synchronous and either
/// fully apply or cleanly reject; nothing here retries internally.
#[derive(Debug, Clone, Default)]
pub struct RouterState {
    last_activated_epoch: u64,
    paused: bool,
    pub roles: RoleMap,
    pending: Option<PendingCommitment>,
    provisional: FxHashMap<Selector, Route>,
    active: FxHashMap<Selector, Route>,
    consumed: FxHashMap<Digest, u64>,
    activations: Vec<ActivationRecord>,
}

impl RouterState {
    /// Fresh state with every permission granted to `admin`.
    pub fn bootstrap(admin: &str) -> Self {
        let mut state = Self::default();
        for permission in Permission::ALL {
            state.roles.grant(admin, permission);
        }
        state
    }

    /// The epoch the next commit must declare: last activated + 1, so a
    /// fresh instance expects 1 and reads 2 after its first activation.
    pub fn epoch(&self) -> u64 {
        self.last_activated_epoch + 1
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pending(&self) -> Option<&PendingCommitment> {
        self.pending.as_ref()
    }

    pub fn activations(&self) -> &[ActivationRecord] {
        &self.activations
    }

    /// Manifest digest the deployment engine treats as authoritative: the
    /// pending commitment's, else the most recently activated one's.
    pub fn authoritative_manifest_hash(&self) -> Option<Digest> {
        self.pending
            .as_ref()
            .and_then(|p| p.manifest_hash)
            .or_else(|| self.activations.last().and_then(|a| a.manifest_hash))
    }

    fn require(&self, principal: &str, permission: Permission) -> Result<(), ForgeError> {
        if self.roles.permission(principal, permission) {
            Ok(())
        } else {
            Err(ForgeError::Authorization {
                principal: principal.to_string(),
                permission: permission.as_str().to_string(),
            })
        }
    }

    fn require_unpaused(&self) -> Result<(), ForgeError> {
        if self.paused {
            Err(ForgeError::Validation(
                "instance is paused; only resolution is available".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Commit a manifest root, starting the timelock.
    pub fn commit(
        &mut self,
        actor: &str,
        root: Digest,
        epoch: u64,
        route_count: u64,
        manifest_hash: Option<Digest>,
        timelock_secs: u64,
        now: u64,
    ) -> Result<&PendingCommitment, ForgeError> {
        self.require(actor, Permission::Commit)?;
        self.require_unpaused()?;
        if self.pending.is_some() {
            return Err(ForgeError::Validation(
                "a pending commitment already exists; activate or cancel it first".to_string(),
            ));
        }
        if self.consumed.contains_key(&root) {
            return Err(ForgeError::Timing(format!(
                "root {} was already activated and can never be reused",
                root
            )));
        }
        if epoch != self.epoch() {
            return Err(ForgeError::Validation(format!(
                "wrong epoch: expected {}, got {}",
                self.epoch(),
                epoch
            )));
        }
        if route_count == 0 {
            return Err(ForgeError::Validation(
                "manifest declares zero routes".to_string(),
            ));
        }

        self.pending = Some(PendingCommitment {
            root,
            epoch,
            route_count,
            manifest_hash,
            committed_at: now,
            not_before: now + timelock_secs,
            committed_by: actor.to_string(),
        });
        self.provisional.clear();
        Ok(self.pending.as_ref().unwrap())
    }

    /// Verify one route against the pending root and stage it provisionally.
    /// Idempotent per selector: re-applying the identical binding is a no-op
    /// (returns false).
    pub fn apply_route(
        &mut self,
        actor: &str,
        route: Route,
        proof: &RouteProof,
    ) -> Result<bool, ForgeError> {
        self.require(actor, Permission::Apply)?;
        self.require_unpaused()?;
        let pending = self.pending.as_ref().ok_or_else(|| {
            ForgeError::Validation("no pending commitment to apply against".to_string())
        })?;

        if !verify(&route.leaf(), proof, &pending.root)? {
            return Err(ForgeError::Validation(format!(
                "proof for selector {} does not reach the committed root",
                route.selector
            )));
        }

        if let Some(existing) = self.provisional.get(&route.selector) {
            if *existing == route {
                return Ok(false);
            }
            return Err(ForgeError::Validation(format!(
                "selector {} already applied with a different binding",
                route.selector
            )));
        }

        if self.provisional.len() as u64 >= pending.route_count {
            return Err(ForgeError::Validation(format!(
                "manifest declared {} routes; all already applied",
                pending.route_count
            )));
        }

        self.provisional.insert(route.selector, route);
        Ok(true)
    }

    /// Promote the fully applied provisional table to live. Partial
    /// manifests are rejected outright, never partially activated.
    pub fn activate(&mut self, actor: &str, now: u64) -> Result<ActivationRecord, ForgeError> {
        self.require(actor, Permission::Activate)?;
        self.require_unpaused()?;
        let pending = self.pending.as_ref().ok_or_else(|| {
            ForgeError::Validation("no pending commitment to activate".to_string())
        })?;

        if now < pending.not_before {
            return Err(ForgeError::Timing(format!(
                "timelock not elapsed: now {} < not_before {}",
                now, pending.not_before
            )));
        }
        let applied = self.provisional.len() as u64;
        if applied != pending.route_count {
            return Err(ForgeError::Validation(format!(
                "partial manifest: {} of {} routes applied",
                applied, pending.route_count
            )));
        }

        let pending = self.pending.take().unwrap();
        self.active = std::mem::take(&mut self.provisional);
        self.consumed.insert(pending.root, now);
        self.last_activated_epoch = pending.epoch;

        let record = ActivationRecord {
            activation_id: new_event_id(),
            manifest_root: pending.root,
            manifest_hash: pending.manifest_hash,
            epoch: pending.epoch,
            activated_at: now,
            activated_by: actor.to_string(),
        };
        self.activations.push(record.clone());
        Ok(record)
    }

    /// Abandon the pending commitment and everything staged against it.
    pub fn cancel(&mut self, actor: &str) -> Result<PendingCommitment, ForgeError> {
        self.require(actor, Permission::Commit)?;
        self.require_unpaused()?;
        let pending = self.pending.take().ok_or_else(|| {
            ForgeError::Validation("no pending commitment to cancel".to_string())
        })?;
        self.provisional.clear();
        Ok(pending)
    }

    /// Returns false when already in the requested pause state.
    pub fn set_paused(&mut self, actor: &str, paused: bool) -> Result<bool, ForgeError> {
        self.require(actor, Permission::Emergency)?;
        if self.paused == paused {
            return Ok(false);
        }
        self.paused = paused;
        Ok(true)
    }

    /// Resolve a selector to its implementing address. Unrestricted, works
    /// while paused, and fails closed: a target whose current code hash no
    /// longer matches the route's recorded hash resolves to no-route.
    pub fn resolve(
        &self,
        selector: &Selector,
        lookup: &impl CodeLookup,
    ) -> Result<Option<Address>, ForgeError> {
        let Some(route) = self.active.get(selector) else {
            return Ok(None);
        };
        match lookup.code_hash_at(&route.address)? {
            Some(actual) if actual == route.code_hash => Ok(Some(route.address)),
            _ => Ok(None),
        }
    }

    /// All active bindings, sorted by selector.
    pub fn routes(&self) -> Vec<Route> {
        let mut out: Vec<Route> = self.active.values().cloned().collect();
        out.sort_by_key(|r| r.selector);
        out
    }

    /// Deduplicated sorted list of addresses serving any selector.
    pub fn implementations(&self) -> Vec<Address> {
        let mut out: Vec<Address> = self.active.values().map(|r| r.address).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn grant(
        &mut self,
        actor: &str,
        principal: &str,
        permission: Permission,
    ) -> Result<bool, ForgeError> {
        self.require(actor, Permission::Admin)?;
        Ok(self.roles.grant(principal, permission))
    }

    pub fn revoke(
        &mut self,
        actor: &str,
        principal: &str,
        permission: Permission,
    ) -> Result<bool, ForgeError> {
        self.require(actor, Permission::Admin)?;
        Ok(self.roles.revoke(principal, permission))
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            epoch: self.epoch(),
            paused: self.paused,
            pending: self.pending.clone(),
            applied_count: self.provisional.len() as u64,
            active_count: self.active.len() as u64,
            activations: self.activations.len() as u64,
        }
    }
}

/// Persistent router: loads the aggregate from the store, runs one
/// transition under the serialized connection, saves, and events it.
pub struct Router {
    store: Store,
    config: ForgeConfig,
    clock: Arc<dyn Clock>,
    log: EventLog,
}

impl Router {
    pub fn open(store: Store, config: ForgeConfig, clock: Arc<dyn Clock>) -> Self {
        let log = EventLog::new(&store);
        Self {
            store,
            config,
            clock,
            log,
        }
    }

    /// Write the bootstrap role ledger. Called once at `init`.
    pub fn initialize(&self) -> Result<(), ForgeError> {
        let state = RouterState::bootstrap(&self.config.bootstrap_admin);
        with_forge_db(&self.store.root, |conn| {
            let tx = conn.transaction()?;
            save_state(&tx, &state)?;
            tx.commit()?;
            Ok(())
        })?;
        self.log.append(
            &self.config.bootstrap_admin,
            "role_granted",
            json!({
                "principal": self.config.bootstrap_admin,
                "permission": "all",
                "bootstrap": true,
            }),
        )
    }

    /// Read-only snapshot of the persisted aggregate.
    pub fn state(&self) -> Result<RouterState, ForgeError> {
        with_forge_db(&self.store.root, |conn| load_state(conn))
    }

    // One mutating transition: load, apply, save, all under the store lock.
    fn transition<F, R>(&self, f: F) -> Result<R, ForgeError>
    where
        F: FnOnce(&mut RouterState) -> Result<R, ForgeError>,
    {
        with_forge_db(&self.store.root, |conn| {
            let mut state = load_state(conn)?;
            let out = f(&mut state)?;
            let tx = conn.transaction()?;
            save_state(&tx, &state)?;
            tx.commit()?;
            Ok(out)
        })
    }

    // The transition has already committed when the audit append runs; a
    // failed append must not read as a failed (retryable) mutation.
    fn log_applied(
        &self,
        actor: &str,
        kind: &str,
        detail: serde_json::Value,
    ) -> Result<(), ForgeError> {
        self.log.append(actor, kind, detail).map_err(|e| {
            ForgeError::IoError(std::io::Error::other(format!(
                "transition applied but audit append failed: {}",
                e
            )))
        })
    }

    pub fn commit(
        &self,
        actor: &str,
        root: Digest,
        epoch: u64,
        route_count: u64,
        manifest_hash: Option<Digest>,
    ) -> Result<PendingCommitment, ForgeError> {
        let now = self.clock.now();
        let timelock = self.config.timelock_secs;
        let pending = self.transition(|state| {
            state
                .commit(actor, root, epoch, route_count, manifest_hash, timelock, now)
                .cloned()
        })?;
        self.log_applied(
            actor,
            "committed",
            json!({
                "root": pending.root,
                "epoch": pending.epoch,
                "route_count": pending.route_count,
                "manifest_hash": pending.manifest_hash,
                "not_before": pending.not_before,
            }),
        )?;
        Ok(pending)
    }

    pub fn apply_route(
        &self,
        actor: &str,
        route: Route,
        proof: &RouteProof,
    ) -> Result<bool, ForgeError> {
        let logged = route.clone();
        let applied = self.transition(|state| state.apply_route(actor, route, proof))?;
        if applied {
            self.log_applied(
                actor,
                "route_applied",
                json!({
                    "selector": logged.selector,
                    "address": logged.address,
                    "code_hash": logged.code_hash,
                }),
            )?;
        }
        Ok(applied)
    }

    /// Activation re-checks every staged binding against the code actually
    /// stored at its address before promotion; a drifted or missing unit
    /// rejects the whole activation.
    pub fn activate(&self, actor: &str) -> Result<ActivationRecord, ForgeError> {
        let now = self.clock.now();
        let record = with_forge_db(&self.store.root, |conn| {
            let mut state = load_state(conn)?;
            state.require(actor, Permission::Activate)?;
            for route in state.provisional.values() {
                if stored_code_hash(conn, &route.address)? != Some(route.code_hash) {
                    return Err(ForgeError::Integrity(format!(
                        "code at {} no longer matches the hash recorded for selector {}",
                        route.address, route.selector
                    )));
                }
            }
            let out = state.activate(actor, now)?;
            let tx = conn.transaction()?;
            save_state(&tx, &state)?;
            tx.commit()?;
            Ok(out)
        })?;
        self.log_applied(
            actor,
            "activated",
            json!({
                "activation_id": record.activation_id,
                "root": record.manifest_root,
                "manifest_hash": record.manifest_hash,
                "epoch": record.epoch,
                "activated_at": record.activated_at,
            }),
        )?;
        Ok(record)
    }

    pub fn cancel(&self, actor: &str) -> Result<PendingCommitment, ForgeError> {
        let cancelled = self.transition(|state| state.cancel(actor))?;
        self.log_applied(
            actor,
            "commitment_cancelled",
            json!({ "root": cancelled.root, "epoch": cancelled.epoch }),
        )?;
        Ok(cancelled)
    }

    pub fn pause(&self, actor: &str) -> Result<bool, ForgeError> {
        let changed = self.transition(|state| state.set_paused(actor, true))?;
        if changed {
            self.log_applied(actor, "paused", json!({}))?;
        }
        Ok(changed)
    }

    pub fn unpause(&self, actor: &str) -> Result<bool, ForgeError> {
        let changed = self.transition(|state| state.set_paused(actor, false))?;
        if changed {
            self.log_applied(actor, "unpaused", json!({}))?;
        }
        Ok(changed)
    }

    pub fn resolve(
        &self,
        selector: &Selector,
        lookup: &impl CodeLookup,
    ) -> Result<Option<Address>, ForgeError> {
        self.state()?.resolve(selector, lookup)
    }

    pub fn grant(
        &self,
        actor: &str,
        principal: &str,
        permission: Permission,
    ) -> Result<bool, ForgeError> {
        let changed = self.transition(|state| state.grant(actor, principal, permission))?;
        if changed {
            self.log_applied(
                actor,
                "role_granted",
                json!({ "principal": principal, "permission": permission.as_str() }),
            )?;
        }
        Ok(changed)
    }

    pub fn revoke(
        &self,
        actor: &str,
        principal: &str,
        permission: Permission,
    ) -> Result<bool, ForgeError> {
        let changed = self.transition(|state| state.revoke(actor, principal, permission))?;
        if changed {
            self.log_applied(
                actor,
                "role_revoked",
                json!({ "principal": principal, "permission": permission.as_str() }),
            )?;
        }
        Ok(changed)
    }
}

fn stored_code_hash(conn: &Connection, address: &Address) -> Result<Option<Digest>, ForgeError> {
    let hash: Option<String> = conn
        .query_row(
            "SELECT code_hash FROM code_units WHERE address = ?1",
            params![address.to_hex()],
            |row| row.get(0),
        )
        .optional()?;
    hash.map(|h| Digest::from_hex(&h)).transpose()
}

fn load_routes(conn: &Connection, table: &str) -> Result<FxHashMap<Selector, Route>, ForgeError> {
    let mut stmt =
        conn.prepare(&format!("SELECT selector, address, code_hash FROM {}", table))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut out = FxHashMap::default();
    for row in rows {
        let (selector, address, code_hash) = row?;
        let route = Route {
            selector: Selector::from_hex(&selector)?,
            address: Address::from_hex(&address)?,
            code_hash: Digest::from_hex(&code_hash)?,
        };
        out.insert(route.selector, route);
    }
    Ok(out)
}

fn save_routes(
    conn: &Connection,
    table: &str,
    routes: &FxHashMap<Selector, Route>,
) -> Result<(), ForgeError> {
    conn.execute(&format!("DELETE FROM {}", table), [])?;
    for route in routes.values() {
        conn.execute(
            &format!(
                "INSERT INTO {}(selector, address, code_hash) VALUES(?1, ?2, ?3)",
                table
            ),
            params![
                route.selector.to_hex(),
                route.address.to_hex(),
                route.code_hash.to_hex()
            ],
        )?;
    }
    Ok(())
}

pub fn load_state(conn: &Connection) -> Result<RouterState, ForgeError> {
    use crate::core::db::meta_get;

    let last_activated_epoch = meta_get(conn, "router.epoch")?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let paused = meta_get(conn, "router.paused")?.as_deref() == Some("1");

    let pending = conn
        .query_row(
            "SELECT root, epoch, route_count, manifest_hash, committed_at, not_before, committed_by
             FROM pending_commitment WHERE id = 0",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?
        .map(
            |(root, epoch, route_count, manifest_hash, committed_at, not_before, committed_by)| {
                Ok::<_, ForgeError>(PendingCommitment {
                    root: Digest::from_hex(&root)?,
                    epoch: epoch as u64,
                    route_count: route_count as u64,
                    manifest_hash: manifest_hash.map(|h| Digest::from_hex(&h)).transpose()?,
                    committed_at: committed_at as u64,
                    not_before: not_before as u64,
                    committed_by,
                })
            },
        )
        .transpose()?;

    let mut consumed = FxHashMap::default();
    {
        let mut stmt = conn.prepare("SELECT root, consumed_at FROM consumed_roots")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (root, consumed_at) = row?;
            consumed.insert(Digest::from_hex(&root)?, consumed_at as u64);
        }
    }

    let mut activations = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT activation_id, manifest_root, manifest_hash, epoch, activated_at, activated_by
             FROM activations ORDER BY activated_at, activation_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        for row in rows {
            let (activation_id, manifest_root, manifest_hash, epoch, activated_at, activated_by) =
                row?;
            activations.push(ActivationRecord {
                activation_id,
                manifest_root: Digest::from_hex(&manifest_root)?,
                manifest_hash: manifest_hash.map(|h| Digest::from_hex(&h)).transpose()?,
                epoch: epoch as u64,
                activated_at: activated_at as u64,
                activated_by,
            });
        }
    }

    Ok(RouterState {
        last_activated_epoch,
        paused,
        roles: load_roles(conn)?,
        pending,
        provisional: load_routes(conn, "provisional_routes")?,
        active: load_routes(conn, "active_routes")?,
        consumed,
        activations,
    })
}

pub fn save_state(conn: &Connection, state: &RouterState) -> Result<(), ForgeError> {
    use crate::core::db::meta_set;

    meta_set(conn, "router.epoch", &state.last_activated_epoch.to_string())?;
    meta_set(conn, "router.paused", if state.paused { "1" } else { "0" })?;
    save_roles(conn, &state.roles)?;

    conn.execute("DELETE FROM pending_commitment", [])?;
    if let Some(pending) = &state.pending {
        conn.execute(
            "INSERT INTO pending_commitment
             (id, root, epoch, route_count, manifest_hash, committed_at, not_before, committed_by)
             VALUES(0, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pending.root.to_hex(),
                pending.epoch as i64,
                pending.route_count as i64,
                pending.manifest_hash.map(|h| h.to_hex()),
                pending.committed_at as i64,
                pending.not_before as i64,
                pending.committed_by
            ],
        )?;
    }

    save_routes(conn, "provisional_routes", &state.provisional)?;
    save_routes(conn, "active_routes", &state.active)?;

    conn.execute("DELETE FROM consumed_roots", [])?;
    for (root, consumed_at) in &state.consumed {
        conn.execute(
            "INSERT INTO consumed_roots(root, consumed_at) VALUES(?1, ?2)",
            params![root.to_hex(), *consumed_at as i64],
        )?;
    }

    for record in &state.activations {
        conn.execute(
            "INSERT OR REPLACE INTO activations
             (activation_id, manifest_root, manifest_hash, epoch, activated_at, activated_by)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.activation_id,
                record.manifest_root.to_hex(),
                record.manifest_hash.map(|h| h.to_hex()),
                record.epoch as i64,
                record.activated_at as i64,
                record.activated_by
            ],
        )?;
    }
    Ok(())
}
