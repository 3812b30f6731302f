use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::UserId;
use parley_core::security::ApiKey;

use crate::columns::{stamp, RowReader};
use crate::database::Database;
use crate::error::StoreError;

/// Key in `extra` holding the account's default upstream API key.
const API_KEY_FIELD: &str = "api_key";

/// An account. `salt` and `verifier` are hex and absent until a password is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub name: String,
    pub salt: Option<String>,
    pub verifier: Option<String>,
    pub extra: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    /// Salt and verifier, when the account has a password.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.salt.as_deref(), self.verifier.as_deref()) {
            (Some(salt), Some(verifier)) if !salt.is_empty() && !verifier.is_empty() => {
                Some((salt, verifier))
            }
            _ => None,
        }
    }

    /// Upstream key used when this user's chat request carries none.
    pub fn default_api_key(&self) -> Option<ApiKey> {
        ApiKey::non_empty(self.extra.get(API_KEY_FIELD).and_then(|v| v.as_str()))
    }
}

const USER_COLUMNS: &str = "id, name, salt, verifier, extra, created_at";

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, salt, verifier))]
    pub fn create(
        &self,
        name: &str,
        salt: Option<&str>,
        verifier: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        let user = UserRow {
            id: UserId::new(),
            name: name.to_string(),
            salt: salt.map(str::to_string),
            verifier: verifier.map(str::to_string),
            extra: serde_json::json!({}),
            created_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, salt, verifier, extra, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user.id.as_str(),
                    user.name,
                    user.salt,
                    user.verifier,
                    serde_json::to_string(&user.extra)?,
                    stamp(&user.created_at),
                ],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!("user {name} already exists")),
                other => other,
            })?;
            Ok(())
        })?;

        Ok(user)
    }

    /// Case-insensitive lookup by account name.
    #[instrument(skip(self))]
    pub fn find_by_name(&self, name: &str) -> Result<Option<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE name = ?1 COLLATE NOCASE"
            ))?;
            let mut rows = stmt.query([name])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_user(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_user(row),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }

    /// Replace the stored salt and verifier.
    #[instrument(skip(self, salt, verifier), fields(user_id = %id))]
    pub fn set_credentials(&self, id: &UserId, salt: &str, verifier: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET salt = ?1, verifier = ?2 WHERE id = ?3",
                rusqlite::params![salt, verifier, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
            Ok(())
        })
    }
}

impl UserRepo {
    /// Set or clear (`None` or blank) the account's default upstream key.
    #[instrument(skip(self, api_key), fields(user_id = %id))]
    pub fn set_default_api_key(&self, id: &UserId, api_key: Option<&str>) -> Result<(), StoreError> {
        let mut user = self.get(id)?;
        if !user.extra.is_object() {
            user.extra = serde_json::json!({});
        }
        if let Some(extra) = user.extra.as_object_mut() {
            match ApiKey::non_empty(api_key) {
                Some(key) => {
                    extra.insert(API_KEY_FIELD.into(), key.expose().into());
                }
                None => {
                    extra.remove(API_KEY_FIELD);
                }
            }
        }
        let encoded = serde_json::to_string(&user.extra)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET extra = ?1 WHERE id = ?2",
                rusqlite::params![encoded, id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    let r = RowReader::new(row, "users");
    Ok(UserRow {
        id: UserId::from_raw(r.value::<String>("id")?),
        name: r.value("name")?,
        salt: r.value("salt")?,
        verifier: r.value("verifier")?,
        extra: r.json("extra")?,
        created_at: r.timestamp("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepo {
        UserRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let user = repo.create("Alice", Some("00ff"), Some("abcd")).unwrap();
        let fetched = repo.get(&user.id).unwrap();
        assert_eq!(fetched, user);
        assert_eq!(fetched.credentials(), Some(("00ff", "abcd")));
    }

    #[test]
    fn find_by_name_is_case_insensitive() {
        let repo = repo();
        let user = repo.create("Alice", None, None).unwrap();
        let found = repo.find_by_name("aLiCe").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.name, "Alice");
        assert!(repo.find_by_name("mallory").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_conflicts_regardless_of_case() {
        let repo = repo();
        repo.create("alice", None, None).unwrap();
        let result = repo.create("ALICE", None, None);
        assert!(matches!(result, Err(StoreError::Conflict(msg)) if msg.contains("ALICE")));
    }

    #[test]
    fn user_without_password_has_no_credentials() {
        let repo = repo();
        let user = repo.create("bob", None, None).unwrap();
        assert!(user.credentials().is_none());

        let half = UserRow {
            salt: Some("00".into()),
            ..user.clone()
        };
        assert!(half.credentials().is_none());
    }

    #[test]
    fn set_credentials_replaces_verifier() {
        let repo = repo();
        let user = repo.create("carol", Some("01"), Some("02")).unwrap();
        repo.set_credentials(&user.id, "0a0b", "0c0d").unwrap();
        let fetched = repo.get(&user.id).unwrap();
        assert_eq!(fetched.credentials(), Some(("0a0b", "0c0d")));

        assert!(matches!(
            repo.set_credentials(&UserId::new(), "00", "00"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn default_api_key_is_set_and_cleared() {
        let repo = repo();
        let user = repo.create("dave", None, None).unwrap();
        assert!(user.default_api_key().is_none());

        repo.set_default_api_key(&user.id, Some(" sk-dave ")).unwrap();
        let fetched = repo.get(&user.id).unwrap();
        assert_eq!(fetched.default_api_key().unwrap().expose(), "sk-dave");
        assert_eq!(fetched.extra["api_key"], "sk-dave");

        repo.set_default_api_key(&user.id, Some("   ")).unwrap();
        assert!(repo.get(&user.id).unwrap().default_api_key().is_none());

        assert!(matches!(
            repo.set_default_api_key(&UserId::new(), Some("sk-x")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        assert!(matches!(repo().get(&UserId::new()), Err(StoreError::NotFound(_))));
    }
}
