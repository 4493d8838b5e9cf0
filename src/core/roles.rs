//! Principal→permission assignments gating every mutating operation.
//!
//! A flat ledger, not a hierarchy: `permission()` is a pure lookup and no
//! permission implies another. Admin only controls the ledger itself.

use rusqlite::{params, Connection};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::core::clock::now_epoch_z;
use crate::core::error::ForgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Commit a manifest root (and cancel a pending commitment).
    Commit,
    /// Apply verified routes against the pending root.
    Apply,
    /// Promote the applied set to live.
    Activate,
    /// Pause and unpause the instance.
    Emergency,
    /// Grant and revoke permissions.
    Admin,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::Commit,
        Permission::Apply,
        Permission::Activate,
        Permission::Emergency,
        Permission::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Commit => "commit",
            Permission::Apply => "apply",
            Permission::Activate => "activate",
            Permission::Emergency => "emergency",
            Permission::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ForgeError> {
        match s {
            "commit" => Ok(Permission::Commit),
            "apply" => Ok(Permission::Apply),
            "activate" => Ok(Permission::Activate),
            "emergency" => Ok(Permission::Emergency),
            "admin" => Ok(Permission::Admin),
            other => Err(ForgeError::Validation(format!(
                "unknown permission '{}'",
                other
            ))),
        }
    }
}

/// In-memory role ledger. Write-rare, read on every mutating call.
#[derive(Debug, Clone, Default)]
pub struct RoleMap {
    grants: FxHashMap<String, FxHashSet<Permission>>,
}

impl RoleMap {
    /// Pure lookup: does `principal` hold `permission`?
    pub fn permission(&self, principal: &str, permission: Permission) -> bool {
        self.grants
            .get(principal)
            .map(|set| set.contains(&permission))
            .unwrap_or(false)
    }

    /// Returns false when the grant already existed.
    pub fn grant(&mut self, principal: &str, permission: Permission) -> bool {
        self.grants
            .entry(principal.to_string())
            .or_default()
            .insert(permission)
    }

    /// Returns false when there was nothing to revoke.
    pub fn revoke(&mut self, principal: &str, permission: Permission) -> bool {
        let Some(set) = self.grants.get_mut(principal) else {
            return false;
        };
        let removed = set.remove(&permission);
        if set.is_empty() {
            self.grants.remove(principal);
        }
        removed
    }

    /// Sorted (principal, permission) pairs for introspection.
    pub fn assignments(&self) -> Vec<(String, Permission)> {
        let mut out: Vec<(String, Permission)> = self
            .grants
            .iter()
            .flat_map(|(p, set)| set.iter().map(|perm| (p.clone(), *perm)))
            .collect();
        out.sort_by(|a, b| (a.0.as_str(), a.1.as_str()).cmp(&(b.0.as_str(), b.1.as_str())));
        out
    }
}

pub fn load_roles(conn: &Connection) -> Result<RoleMap, ForgeError> {
    let mut stmt = conn.prepare("SELECT principal, permission FROM roles")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = RoleMap::default();
    for row in rows {
        let (principal, permission) = row?;
        map.grant(&principal, Permission::parse(&permission)?);
    }
    Ok(map)
}

pub fn save_roles(conn: &Connection, map: &RoleMap) -> Result<(), ForgeError> {
    conn.execute("DELETE FROM roles", [])?;
    let now = now_epoch_z();
    for (principal, permission) in map.assignments() {
        conn.execute(
            "INSERT INTO roles(principal, permission, granted_at) VALUES(?1, ?2, ?3)",
            params![principal, permission.as_str(), now],
        )?;
    }
    Ok(())
}
