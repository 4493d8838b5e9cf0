//! Cross-target salt derivation.
//!
//! Pure function over deployer identity, content hash, version, and nonce.
//! Independent deployment targets running the same engine id and code derive
//! identical salts, and therefore identical code-unit addresses, with zero
//! coordination.

use crate::core::hash::{Digest, Salt, sha256_concat, SALT_TAG};

/// `H(SALT_TAG ++ len(deployer) ++ deployer ++ content_hash ++ version ++ nonce)`.
///
/// The deployer identity is length-prefixed so `("ab", ...)` and `("a", "b...")`
/// can never collide across the field boundary.
pub fn universal_salt(deployer: &str, content_hash: &Digest, version: u32, nonce: u64) -> Salt {
    let deployer_len = (deployer.len() as u64).to_be_bytes();
    let version_be = version.to_be_bytes();
    let nonce_be = nonce.to_be_bytes();
    let digest = sha256_concat(&[
        SALT_TAG,
        &deployer_len,
        deployer.as_bytes(),
        content_hash.as_bytes(),
        &version_be,
        &nonce_be,
    ]);
    Salt(digest.0)
}
