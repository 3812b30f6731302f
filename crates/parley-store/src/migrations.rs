//! Ordered DDL steps. `PRAGMA user_version` records how many have run.

use rusqlite::{Connection, TransactionBehavior};

use crate::error::StoreError;

const STEPS: &[&str] = &[
    // 1: accounts and their login sessions
    "CREATE TABLE users (
        id         TEXT PRIMARY KEY,
        name       TEXT NOT NULL UNIQUE COLLATE NOCASE,
        salt       TEXT,
        verifier   TEXT,
        extra      TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );
    CREATE TABLE sessions (
        id           TEXT PRIMARY KEY,
        user_id      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at   TEXT NOT NULL,
        last_used_at TEXT NOT NULL
    );
    CREATE INDEX sessions_by_user ON sessions(user_id);",
];

pub fn latest() -> u32 {
    STEPS.len() as u32
}

pub fn current(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring `conn` up to [`latest`]. Returns how many steps ran.
pub fn apply(conn: &mut Connection) -> Result<usize, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let from = current(&tx)?;
    if from > latest() {
        return Err(StoreError::Schema(format!(
            "database is at version {from}, this build knows {}",
            latest()
        )));
    }
    let pending = &STEPS[from as usize..];
    for ddl in pending {
        tx.execute_batch(ddl)?;
    }
    tx.pragma_update(None, "user_version", latest())?;
    tx.commit()?;
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current(&conn).unwrap(), 0);
        assert_eq!(apply(&mut conn).unwrap(), STEPS.len());
        assert_eq!(current(&conn).unwrap(), latest());
        assert_eq!(apply(&mut conn).unwrap(), 0);
    }

    #[test]
    fn refuses_future_versions() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", latest() + 5).unwrap();
        assert!(matches!(apply(&mut conn), Err(StoreError::Schema(msg)) if msg.contains(&format!("version {}", latest() + 5))));
    }
}
