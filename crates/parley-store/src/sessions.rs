use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::{SessionId, UserId};

use crate::columns::{stamp, RowReader};
use crate::database::Database;
use crate::error::StoreError;

/// A logged-in session as mirrored in the `sessions` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl SessionRow {
    /// A fresh session for `user_id`, created and last used now.
    pub fn mint(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            user_id,
            created_at: now,
            last_used_at: now,
        }
    }
}

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Every persisted session, oldest first. Used to warm the in-memory cache.
    #[instrument(skip(self))]
    pub fn list_all(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, created_at, last_used_at FROM sessions ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self, session), fields(session_id = %session.id, user_id = %session.user_id))]
    pub fn insert(&self, session: &SessionRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, created_at, last_used_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    session.id.as_str(),
                    session.user_id.as_str(),
                    stamp(&session.created_at),
                    stamp(&session.last_used_at),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, created_at, last_used_at FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Record a new last-used time.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn touch(&self, id: &SessionId, last_used_at: &DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET last_used_at = ?1 WHERE id = ?2",
                rusqlite::params![stamp(last_used_at), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Returns whether a row was removed.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(changed > 0)
        })
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn delete_for_user(&self, user_id: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM sessions WHERE user_id = ?1", [user_id.as_str()])?;
            Ok(changed)
        })
    }

    /// Remove every session whose last use is older than `cutoff`. Rows whose
    /// timestamp does not parse are left alone.
    #[instrument(skip(self))]
    pub fn delete_idle_before(&self, cutoff: &DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM sessions WHERE julianday(last_used_at) < julianday(?1)",
                [stamp(cutoff)],
            )?;
            Ok(removed)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let r = RowReader::new(row, "sessions");
    Ok(SessionRow {
        id: SessionId::from_raw(r.value::<String>("id")?),
        user_id: UserId::from_raw(r.value::<String>("user_id")?),
        created_at: r.timestamp("created_at")?,
        last_used_at: r.timestamp("last_used_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;
    use chrono::Duration;

    fn setup() -> (SessionRepo, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let alice = users.create("alice", None, None).unwrap().id;
        let bob = users.create("bob", None, None).unwrap().id;
        (SessionRepo::new(db), alice, bob)
    }

    #[test]
    fn insert_and_get() {
        let (repo, alice, _) = setup();
        let session = SessionRow::mint(alice.clone());
        repo.insert(&session).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched, session);
        assert_eq!(fetched.user_id, alice);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (repo, _, _) = setup();
        let result = repo.get(&SessionId::new());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let (repo, alice, _) = setup();
        let session = SessionRow::mint(alice);
        repo.insert(&session).unwrap();
        assert!(matches!(repo.insert(&session), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn unknown_user_is_rejected() {
        let (repo, _, _) = setup();
        let session = SessionRow::mint(UserId::new());
        assert!(repo.insert(&session).is_err());
    }

    #[test]
    fn list_all_returns_every_session() {
        let (repo, alice, bob) = setup();
        repo.insert(&SessionRow::mint(alice.clone())).unwrap();
        repo.insert(&SessionRow::mint(alice)).unwrap();
        repo.insert(&SessionRow::mint(bob)).unwrap();
        assert_eq!(repo.list_all().unwrap().len(), 3);
    }

    #[test]
    fn touch_updates_last_used() {
        let (repo, alice, _) = setup();
        let session = SessionRow::mint(alice);
        repo.insert(&session).unwrap();

        let later = session.last_used_at + Duration::days(2);
        repo.touch(&session.id, &later).unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.last_used_at, later);
        assert_eq!(fetched.created_at, session.created_at);

        assert!(matches!(repo.touch(&SessionId::new(), &later), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_and_delete_for_user() {
        let (repo, alice, bob) = setup();
        let a1 = SessionRow::mint(alice.clone());
        let a2 = SessionRow::mint(alice.clone());
        let b1 = SessionRow::mint(bob);
        for s in [&a1, &a2, &b1] {
            repo.insert(s).unwrap();
        }

        assert!(repo.delete(&a1.id).unwrap());
        assert!(!repo.delete(&a1.id).unwrap());
        assert_eq!(repo.delete_for_user(&alice).unwrap(), 1);

        let remaining = repo.list_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b1.id);
    }

    #[test]
    fn delete_idle_before_cutoff() {
        let (repo, alice, _) = setup();
        let now = Utc::now();
        let mut stale = SessionRow::mint(alice.clone());
        stale.last_used_at = now - Duration::days(40);
        let fresh = SessionRow::mint(alice);
        repo.insert(&stale).unwrap();
        repo.insert(&fresh).unwrap();

        let removed = repo.delete_idle_before(&(now - Duration::days(37))).unwrap();
        assert_eq!(removed, 1);
        let remaining = repo.list_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
    }

    #[test]
    fn idle_purge_survives_unreadable_rows() {
        let (repo, alice, _) = setup();
        let mut stale = SessionRow::mint(alice.clone());
        stale.last_used_at = Utc::now() - Duration::days(40);
        repo.insert(&stale).unwrap();
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sessions (id, user_id, created_at, last_used_at)
                     VALUES ('sess_bad', ?1, 'garbage', 'garbage')",
                    [alice.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(repo.delete_idle_before(&(Utc::now() - Duration::days(37))).unwrap(), 1);
        let left: Vec<String> = repo
            .db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM sessions")?;
                let ids = stmt.query_map([], |row| row.get(0))?.collect::<Result<_, _>>()?;
                Ok(ids)
            })
            .unwrap();
        assert_eq!(left, ["sess_bad"]);
    }
}
