//! Hash primitives and domain-separated tags.
//!
//! Every digest in the system is SHA-256 over a tagged, length-disciplined
//! byte layout. The newtypes below keep selectors, addresses, salts, and
//! content digests from being confused for one another at compile time; on
//! the wire and in sqlite they are all lowercase hex strings.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::core::error::ForgeError;

/// Tag prefixed to leaf hashes in the manifest Merkle tree.
pub const LEAF_TAG: &[u8] = b"routeforge.leaf.v1";
/// Tag prefixed to interior node hashes in the manifest Merkle tree.
pub const NODE_TAG: &[u8] = b"routeforge.node.v1";
/// Tag prefixed to content-addressed deployment addresses.
pub const ADDR_TAG: &[u8] = b"routeforge.addr.v1";
/// Tag prefixed to derived universal salts.
pub const SALT_TAG: &[u8] = b"routeforge.salt.v1";
/// Tag prefixed to whole-manifest hashes.
pub const MANIFEST_TAG: &[u8] = b"routeforge.manifest.v1";

/// SHA-256 over the concatenation of `parts`. Callers are responsible for
/// making the layout unambiguous (tags and length prefixes).
pub fn sha256_concat(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Digest(hasher.finalize().into())
}

fn decode_hex<const N: usize>(input: &str, what: &str) -> Result<[u8; N], ForgeError> {
    let hex = input.strip_prefix("0x").unwrap_or(input);
    // Byte-offset slicing below requires ASCII; multibyte input would split
    // a char boundary.
    if !hex.is_ascii() {
        return Err(ForgeError::Validation(format!(
            "{} contains non-hex characters",
            what
        )));
    }
    if hex.len() != N * 2 {
        return Err(ForgeError::Validation(format!(
            "{} must be {} hex chars, got {}",
            what,
            N * 2,
            hex.len()
        )));
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        let pair = &hex[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(pair, 16)
            .map_err(|_| ForgeError::Validation(format!("{} is not valid hex: {}", what, pair)))?;
    }
    Ok(out)
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

macro_rules! hex_newtype {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                encode_hex(&self.0)
            }

            /// Parse from lowercase or uppercase hex, with or without a
            /// `0x` prefix.
            pub fn from_hex(input: &str) -> Result<Self, ForgeError> {
                Ok(Self(decode_hex::<$len>(input, stringify!($name))?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = ForgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let hex = String::deserialize(deserializer)?;
                Self::from_hex(&hex).map_err(D::Error::custom)
            }
        }
    };
}

hex_newtype!(
    /// SHA-256 content or tree digest.
    Digest,
    32
);
hex_newtype!(
    /// Deterministic code-unit address.
    Address,
    32
);
hex_newtype!(
    /// Caller-supplied or derived deployment salt.
    Salt,
    32
);
hex_newtype!(
    /// Four-byte route selector.
    Selector,
    4
);

impl Digest {
    /// SHA-256 of raw content, untagged. Used for code hashes and chunk
    /// identities, where the content itself is the domain.
    pub fn of(content: &[u8]) -> Self {
        sha256_concat(&[content])
    }
}
