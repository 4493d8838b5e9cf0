//! Centralized database schema definitions for the forge store.
//!
//! One consolidated SQLite database holds both subsystems:
//! 1. Deployment engine: append-only content-addressed code units and chunks,
//!    plus the additive fee ledger and integrity-halt flag (meta).
//! 2. Router: role assignments, the singleton pending commitment, provisional
//!    and active route tables, consumed roots, and activation audit records.

pub const FORGE_DB_NAME: &str = "forge.db";

// --- Shared ---

pub const META_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- Deployment engine ---

pub const CODE_UNITS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS code_units (
        address TEXT PRIMARY KEY,
        code_hash TEXT NOT NULL,
        size INTEGER NOT NULL,
        content BLOB NOT NULL,
        salt TEXT NOT NULL,
        deployed_at TEXT NOT NULL
    )
";
pub const CODE_UNITS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_code_units_hash ON code_units(code_hash)";

pub const CHUNKS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chunks (
        hash TEXT PRIMARY KEY,
        size INTEGER NOT NULL,
        content BLOB NOT NULL,
        staged_at TEXT NOT NULL
    )
";

// --- Router ---

pub const ROLES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS roles (
        principal TEXT NOT NULL,
        permission TEXT NOT NULL,
        granted_at TEXT NOT NULL,
        PRIMARY KEY (principal, permission)
    )
";

// Singleton row (id = 0): at most one pending commitment exists at a time.
pub const PENDING_COMMITMENT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pending_commitment (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        root TEXT NOT NULL,
        epoch INTEGER NOT NULL,
        route_count INTEGER NOT NULL,
        manifest_hash TEXT,
        committed_at INTEGER NOT NULL,
        not_before INTEGER NOT NULL,
        committed_by TEXT NOT NULL
    )
";

pub const PROVISIONAL_ROUTES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS provisional_routes (
        selector TEXT PRIMARY KEY,
        address TEXT NOT NULL,
        code_hash TEXT NOT NULL
    )
";

pub const ACTIVE_ROUTES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS active_routes (
        selector TEXT PRIMARY KEY,
        address TEXT NOT NULL,
        code_hash TEXT NOT NULL
    )
";

pub const CONSUMED_ROOTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS consumed_roots (
        root TEXT PRIMARY KEY,
        consumed_at INTEGER NOT NULL
    )
";

pub const ACTIVATIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS activations (
        activation_id TEXT PRIMARY KEY,
        manifest_root TEXT NOT NULL,
        manifest_hash TEXT,
        epoch INTEGER NOT NULL,
        activated_at INTEGER NOT NULL,
        activated_by TEXT NOT NULL
    )
";

pub const ALL_SCHEMAS: &[&str] = &[
    META_SCHEMA,
    CODE_UNITS_SCHEMA,
    CODE_UNITS_INDEX,
    CHUNKS_SCHEMA,
    ROLES_SCHEMA,
    PENDING_COMMITMENT_SCHEMA,
    PROVISIONAL_ROUTES_SCHEMA,
    ACTIVE_ROUTES_SCHEMA,
    CONSUMED_ROOTS_SCHEMA,
    ACTIVATIONS_SCHEMA,
];
