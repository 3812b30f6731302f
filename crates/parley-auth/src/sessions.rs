use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use parley_core::ids::{SessionId, UserId};
use parley_store::{SessionRepo, SessionRow, StoreError};

use crate::config::SessionConfig;
use crate::error::AuthError;
use crate::purge::Purgeable;

/// In-memory cache of logged-in sessions, mirrored to the `sessions` table.
pub struct SessionStore {
    cache: DashMap<SessionId, SessionRow>,
    repo: SessionRepo,
    config: SessionConfig,
}

impl SessionStore {
    /// Warm the cache from persistence.
    pub fn load(repo: SessionRepo, config: SessionConfig) -> Result<Self, StoreError> {
        let cache = DashMap::new();
        for session in repo.list_all()? {
            cache.insert(session.id.clone(), session);
        }
        info!(sessions = cache.len(), "session cache loaded");
        Ok(Self { cache, repo, config })
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Mint and persist a session for `user_id`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn create(&self, user_id: &UserId) -> Result<SessionRow, StoreError> {
        let session = SessionRow::mint(user_id.clone());
        self.repo.insert(&session)?;
        self.cache.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// The session, if it exists, belongs to `user_id`, and has not idled out.
    ///
    /// A session idle past `refresh_after` has its last-used time moved to now
    /// and persisted; a younger one is returned as cached without a write.
    pub fn validate(&self, session_id: &SessionId, user_id: &UserId) -> Option<SessionRow> {
        let now = Utc::now();
        let (snapshot, refresh) = {
            let mut entry = self.cache.get_mut(session_id)?;
            if entry.user_id != *user_id {
                return None;
            }
            let idle = now - entry.last_used_at;
            if idle > self.config.session_ttl {
                (None, false)
            } else if idle > self.config.refresh_after {
                entry.last_used_at = now;
                (Some(entry.value().clone()), true)
            } else {
                (Some(entry.value().clone()), false)
            }
        };

        match snapshot {
            None => {
                self.evict(session_id);
                None
            }
            Some(session) => {
                if refresh {
                    if let Err(e) = self.repo.touch(session_id, &now) {
                        warn!(session_id = %session_id, error = %e, "failed to persist session refresh");
                    }
                }
                Some(session)
            }
        }
    }

    fn evict(&self, session_id: &SessionId) {
        self.cache.remove(session_id);
        if let Err(e) = self.repo.delete(session_id) {
            warn!(session_id = %session_id, error = %e, "failed to delete expired session");
        }
        debug!(session_id = %session_id, "session expired");
    }

    /// Log out one session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn invalidate(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let cached = self.cache.remove(session_id).is_some();
        let persisted = self.repo.delete(session_id)?;
        Ok(cached || persisted)
    }

    /// Drop every session belonging to `user_id`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn invalidate_all_for_user(&self, user_id: &UserId) -> Result<usize, StoreError> {
        let before = self.cache.len();
        self.cache.retain(|_, session| session.user_id != *user_id);
        let evicted = before.saturating_sub(self.cache.len());
        let deleted = self.repo.delete_for_user(user_id)?;
        info!(evicted, deleted, "invalidated all sessions for user");
        Ok(evicted.max(deleted))
    }

    /// Remove sessions idle past the TTL from cache and persistence.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.config.session_ttl;
        let before = self.cache.len();
        self.cache.retain(|_, session| session.last_used_at >= cutoff);
        let evicted = before.saturating_sub(self.cache.len());
        let deleted = self.repo.delete_idle_before(&cutoff)?;
        Ok(evicted.max(deleted))
    }
}

#[async_trait]
impl Purgeable for SessionStore {
    fn name(&self) -> &'static str {
        "sessions"
    }

    async fn purge(&self) -> Result<usize, AuthError> {
        Ok(self.purge_expired()?)
    }
}
