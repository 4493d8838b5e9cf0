//! Core modules for the routeforge deployment and routing control plane.
//!
//! The hard core lives here: the ordered-proof Merkle verifier, the
//! content-addressed deployment engine, the manifest router state machine,
//! and the cross-target salt derivation, plus the shared primitives they
//! stand on (hashing, storage, events, config, clock).

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod hash;
pub mod manifest;
pub mod merkle;
pub mod roles;
pub mod router;
pub mod salt;
pub mod schemas;
pub mod store;
