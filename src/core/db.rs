use crate::core::error::ForgeError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn db_connect(db_path: &str) -> Result<Connection, ForgeError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(ForgeError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(ForgeError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(ForgeError::RusqliteError)?;
    Ok(conn)
}

pub fn forge_db_path(root: &Path) -> PathBuf {
    root.join(schemas::FORGE_DB_NAME)
}

/// Execute a closure with a serialized connection to the forge database.
///
/// All mutating operations on one store funnel through this lock, which is
/// what makes commit/apply/activate linearizable with respect to each other.
pub fn with_forge_db<F, R>(root: &Path, f: F) -> Result<R, ForgeError>
where
    F: FnOnce(&mut Connection) -> Result<R, ForgeError>,
{
    static DB_LOCK: Mutex<()> = Mutex::new(());
    let _lock = DB_LOCK.lock().unwrap();

    let db_path = forge_db_path(root);
    let mut conn = db_connect(&db_path.to_string_lossy())?;
    f(&mut conn)
}

pub fn initialize_forge_db(root: &Path) -> Result<(), ForgeError> {
    fs::create_dir_all(root).map_err(ForgeError::IoError)?;
    with_forge_db(root, |conn| {
        for schema in schemas::ALL_SCHEMAS {
            conn.execute(schema, [])?;
        }
        Ok(())
    })
}

pub fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>, ForgeError> {
    use rusqlite::OptionalExtension;
    let value = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

pub fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<(), ForgeError> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}
