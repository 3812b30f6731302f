use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;
use crate::migrations;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the users/sessions database.
///
/// Every repository clones this. Access is serialized through one
/// connection; closures passed to [`Database::with_conn`] run synchronously
/// and must not block on anything async.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Mutex<Connection>>,
    location: Arc<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::prepare(conn, path.to_path_buf())
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn prepare(mut conn: Connection, location: PathBuf) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let ran = migrations::apply(&mut conn)?;
        debug!(path = %location.display(), migrations = ran, "schema ready");
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
            location: Arc::new(location),
        })
    }

    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        f(&self.inner.lock())
    }

    pub fn path(&self) -> &Path {
        &self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("parley-db-{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn memory_database_is_migrated() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
        let names: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let names = stmt.query_map([], |row| row.get(0))?.collect::<Result<_, _>>()?;
                Ok(names)
            })
            .unwrap();
        assert_eq!(names, ["sessions", "users"]);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let db = Database::in_memory().unwrap();
        let on: bool = db
            .with_conn(|conn| Ok(conn.pragma_query_value(None, "foreign_keys", |r| r.get(0))?))
            .unwrap();
        assert!(on);
    }

    #[test]
    fn reopening_a_file_keeps_its_version() {
        let dir = scratch_dir();
        let path = dir.join("nested").join("parley.db");
        drop(Database::open(&path).unwrap());
        assert!(path.exists());

        let again = Database::open(&path).unwrap();
        let version = again.with_conn(migrations::current).unwrap();
        assert_eq!(version, migrations::latest());
        drop(again);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn newer_files_are_refused() {
        let dir = scratch_dir();
        let path = dir.join("parley.db");
        Database::open(&path)
            .unwrap()
            .with_conn(|conn| Ok(conn.pragma_update(None, "user_version", 99)?))
            .unwrap();

        assert!(matches!(Database::open(&path), Err(StoreError::Schema(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
