//! Manifest: an ordered declaration of selector→implementation bindings.
//!
//! A manifest is produced by an external deterministic builder; this module
//! gives the CLI and tests the same construction so roots and proofs agree
//! byte-for-byte. The JSON on disk is the interchange format; the canonical
//! hash is computed over a length-prefixed binary encoding, never the JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::ForgeError;
use crate::core::hash::{Address, Digest, Selector, sha256_concat, MANIFEST_TAG};
use crate::core::merkle::{leaf_hash, MerkleTree, RouteProof};

/// One selector→implementation binding with its expected code hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub selector: Selector,
    pub address: Address,
    pub code_hash: Digest,
}

impl Route {
    pub fn leaf(&self) -> Digest {
        leaf_hash(&self.selector, &self.address, &self.code_hash)
    }
}

/// Versioned route collection plus its Merkle root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub epoch: u64,
    pub routes: Vec<Route>,
    pub merkle_root: Digest,
}

impl Manifest {
    /// Build a manifest, computing the root over the routes in order.
    /// Duplicate selectors are rejected; a manifest binds each selector once.
    pub fn build(version: &str, epoch: u64, routes: Vec<Route>) -> Result<Self, ForgeError> {
        let mut seen = rustc_hash::FxHashSet::default();
        for route in &routes {
            if !seen.insert(route.selector) {
                return Err(ForgeError::Validation(format!(
                    "duplicate selector {} in manifest",
                    route.selector
                )));
            }
        }
        let merkle_root = compute_root(&routes)?;
        Ok(Self {
            version: version.to_string(),
            epoch,
            routes,
            merkle_root,
        })
    }

    /// Whole-manifest hash over the canonical binary encoding.
    pub fn manifest_hash(&self) -> Digest {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.version.len() as u64).to_be_bytes());
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&(self.routes.len() as u64).to_be_bytes());
        for route in &self.routes {
            buf.extend_from_slice(route.selector.as_bytes());
            buf.extend_from_slice(route.address.as_bytes());
            buf.extend_from_slice(route.code_hash.as_bytes());
        }
        buf.extend_from_slice(self.merkle_root.as_bytes());
        sha256_concat(&[MANIFEST_TAG, &buf])
    }

    /// Membership proof for the route binding `selector`.
    pub fn prove(&self, selector: &Selector) -> Result<(Route, RouteProof), ForgeError> {
        let index = self
            .routes
            .iter()
            .position(|r| r.selector == *selector)
            .ok_or_else(|| {
                ForgeError::NotFound(format!("selector {} not in manifest", selector))
            })?;
        let tree = MerkleTree::build(self.routes.iter().map(Route::leaf).collect())?;
        let proof = tree.prove(index)?;
        Ok((self.routes[index].clone(), proof))
    }

    /// Membership proofs for every route, building the tree once rather
    /// than once per selector.
    pub fn proofs(&self) -> Result<Vec<(Route, RouteProof)>, ForgeError> {
        let tree = MerkleTree::build(self.routes.iter().map(Route::leaf).collect())?;
        let mut out = Vec::with_capacity(self.routes.len());
        for (index, route) in self.routes.iter().enumerate() {
            out.push((route.clone(), tree.prove(index)?));
        }
        Ok(out)
    }

    /// Recompute the root and compare with the declared one.
    pub fn check_root(&self) -> Result<(), ForgeError> {
        let computed = compute_root(&self.routes)?;
        if computed != self.merkle_root {
            return Err(ForgeError::Integrity(format!(
                "manifest declares root {} but routes hash to {}",
                self.merkle_root, computed
            )));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ForgeError> {
        let content = fs::read_to_string(path).map_err(ForgeError::IoError)?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| ForgeError::Validation(format!("manifest parse: {}", e)))?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<(), ForgeError> {
        let rendered = serde_json::to_string_pretty(self)
            .map_err(|e| ForgeError::Validation(format!("manifest serialize: {}", e)))?;
        fs::write(path, rendered).map_err(ForgeError::IoError)?;
        Ok(())
    }
}

pub fn compute_root(routes: &[Route]) -> Result<Digest, ForgeError> {
    let tree = MerkleTree::build(routes.iter().map(Route::leaf).collect())?;
    Ok(tree.root())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(n: u8) -> Route {
        Route {
            selector: Selector([n, 0, 0, 1]),
            address: Address(Digest::of(&[n, 1]).0),
            code_hash: Digest::of(&[n, 2]),
        }
    }

    #[test]
    fn test_duplicate_selector_rejected() {
        let err = Manifest::build("v1", 1, vec![route(1), route(1)]);
        assert!(matches!(err, Err(ForgeError::Validation(_))));
    }

    #[test]
    fn test_manifest_hash_covers_routes_and_root() {
        let a = Manifest::build("v1", 1, vec![route(1), route(2)]).unwrap();
        let b = Manifest::build("v1", 1, vec![route(1), route(3)]).unwrap();
        assert_ne!(a.manifest_hash(), b.manifest_hash());
        assert_ne!(a.merkle_root, b.merkle_root);
    }

    #[test]
    fn test_proofs_covers_every_route() {
        use crate::core::merkle::verify;

        let m = Manifest::build("v1", 1, vec![route(1), route(2), route(3)]).unwrap();
        let pairs = m.proofs().unwrap();
        assert_eq!(pairs.len(), 3);
        for (r, proof) in &pairs {
            assert!(verify(&r.leaf(), proof, &m.merkle_root).unwrap());
        }
    }

    #[test]
    fn test_check_root_catches_tamper() {
        let mut m = Manifest::build("v1", 1, vec![route(1), route(2), route(3)]).unwrap();
        m.routes[1].code_hash = Digest::of(b"swapped");
        assert!(matches!(m.check_root(), Err(ForgeError::Integrity(_))));
    }
}
