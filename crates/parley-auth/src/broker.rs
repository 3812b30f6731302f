//! Two-step password proof.
//!
//! Step 1 hands out a salt and server ephemeral for a username; step 2 checks
//! the client's proof against the challenge issued in step 1 and mints a
//! session. Both steps run under one process-wide lock, and every response is
//! held until a fixed time after the request arrived, so neither latency nor
//! response shape tells a caller which check failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use parley_core::ids::UserId;
use parley_store::{SessionRow, UserRepo};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::purge::Purgeable;
use crate::sessions::SessionStore;
use crate::srp::{self, ServerEphemeral};

/// Step-1 reply. Identical in shape for real and unknown accounts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoginChallenge {
    pub s: String,
    #[serde(rename = "B")]
    pub b: String,
    pub username: String,
}

/// Step-2 reply on success.
#[derive(Clone, Debug)]
pub struct LoginSuccess {
    pub session: SessionRow,
    pub m2: String,
}

/// Step-2 input, as received.
#[derive(Clone, Debug)]
pub struct LoginProof<'a> {
    pub name: &'a str,
    pub a: &'a str,
    pub b: &'a str,
    pub m1: &'a str,
}

/// Lowercased username and padded `B` hex.
type ChallengeKey = (String, String);

struct Challenge {
    ephemeral: ServerEphemeral,
    user_id: UserId,
    salt: Vec<u8>,
    verifier: BigUint,
    issued_at: Instant,
}

pub struct ChallengeBroker {
    users: UserRepo,
    sessions: Arc<SessionStore>,
    /// Held for the whole of each step; also the only guard on the challenge map.
    challenges: Mutex<HashMap<ChallengeKey, Challenge>>,
    substitute_secret: Vec<u8>,
    config: AuthConfig,
}

impl ChallengeBroker {
    pub fn new(users: UserRepo, sessions: Arc<SessionStore>, config: AuthConfig) -> Self {
        let substitute_secret = config
            .substitute_secret
            .clone()
            .unwrap_or_else(|| srp::random_bytes(32));
        Self {
            users,
            sessions,
            challenges: Mutex::new(HashMap::new()),
            substitute_secret,
            config,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Hold the response until `min_response_time` after `arrived`.
    pub async fn pace(&self, arrived: Instant) {
        tokio::time::sleep_until(arrived + self.config.min_response_time).await;
    }

    #[instrument(skip(self))]
    pub async fn step1(&self, name: &str) -> Result<LoginChallenge, AuthError> {
        let arrived = Instant::now();
        let result = self.issue_challenge(name);
        if let Err(e) = &result {
            debug!(kind = e.kind(), error = %e, "login step 1 failed");
        }
        self.pace(arrived).await;
        result
    }

    #[instrument(skip(self, proof), fields(name = proof.name))]
    pub async fn step2(&self, proof: LoginProof<'_>) -> Result<LoginSuccess, AuthError> {
        let arrived = Instant::now();
        let result = self.verify_proof(&proof);
        match &result {
            Ok(success) => info!(user_id = %success.session.user_id, "login succeeded"),
            Err(e) => debug!(kind = e.kind(), error = %e, "login step 2 failed"),
        }
        self.pace(arrived).await;
        result
    }

    fn issue_challenge(&self, name: &str) -> Result<LoginChallenge, AuthError> {
        check_len("name", name, self.config.max_field_len)?;
        let mut challenges = self.challenges.try_lock().map_err(|_| AuthError::Busy)?;
        drop_expired(&mut challenges, self.config.challenge_ttl);

        let canonical = srp::canonical_name(name);
        let account = self.users.find_by_name(&canonical)?;

        let real = account.as_ref().and_then(|user| {
            let (salt_hex, verifier_hex) = user.credentials()?;
            let salt = srp::decode_hex("salt", salt_hex).ok()?;
            let verifier = srp::decode_int("verifier", verifier_hex).ok()?;
            Some((user.id.clone(), salt, verifier))
        });

        match real {
            Some((user_id, salt, verifier)) => {
                let ephemeral = ServerEphemeral::generate(&verifier);
                let b = ephemeral.public_hex();
                challenges.insert(
                    (canonical.clone(), b.clone()),
                    Challenge {
                        ephemeral,
                        user_id,
                        salt: salt.clone(),
                        verifier,
                        issued_at: Instant::now(),
                    },
                );
                Ok(LoginChallenge {
                    s: hex::encode(salt),
                    b,
                    username: canonical,
                })
            }
            None => {
                let (salt, verifier) = srp::substitute_credentials(&self.substitute_secret, &canonical);
                let ephemeral = ServerEphemeral::generate(&verifier);
                Ok(LoginChallenge {
                    s: hex::encode(salt),
                    b: ephemeral.public_hex(),
                    username: canonical,
                })
            }
        }
    }

    fn verify_proof(&self, proof: &LoginProof<'_>) -> Result<LoginSuccess, AuthError> {
        let limit = self.config.max_field_len;
        check_len("name", proof.name, limit)?;
        check_len("A", proof.a, limit)?;
        check_len("B", proof.b, limit)?;
        check_len("M1", proof.m1, limit)?;

        let mut challenges = self.challenges.try_lock().map_err(|_| AuthError::Busy)?;

        let canonical = srp::canonical_name(proof.name);
        let b_hex = srp::encode_public(&srp::decode_int("B", proof.b)?);
        let challenge = challenges
            .remove(&(canonical.clone(), b_hex))
            .ok_or(AuthError::UnknownChallenge)?;

        if challenge.issued_at.elapsed() > self.config.challenge_ttl {
            return Err(AuthError::ExpiredChallenge);
        }

        let user = self
            .users
            .find_by_name(&canonical)?
            .ok_or(AuthError::UserMismatch)?;
        if user.id != challenge.user_id {
            return Err(AuthError::UserMismatch);
        }

        let a_pub = srp::decode_int("A", proof.a)?;
        let m1 = srp::decode_hex("M1", proof.m1)?;
        let m2 = srp::verify_client(
            &canonical,
            &challenge.salt,
            &challenge.verifier,
            &challenge.ephemeral,
            &a_pub,
            &m1,
        )?;

        let session = self.sessions.create(&user.id)?;
        drop(challenges);

        Ok(LoginSuccess {
            session,
            m2: hex::encode(m2),
        })
    }

    /// Store a new salt and verifier, end every existing session of the user,
    /// and mint a fresh one for the caller.
    #[instrument(skip(self, salt_hex, verifier_hex), fields(user_id = %user_id))]
    pub fn change_password(
        &self,
        user_id: &UserId,
        salt_hex: &str,
        verifier_hex: &str,
    ) -> Result<SessionRow, AuthError> {
        check_len("s", salt_hex, self.config.max_field_len)?;
        check_len("v", verifier_hex, self.config.max_field_len)?;
        let salt = srp::decode_hex("s", salt_hex)?;
        let verifier = srp::decode_int("v", verifier_hex)?;
        if salt.is_empty() {
            return Err(AuthError::Malformed("empty salt".into()));
        }

        self.users
            .set_credentials(user_id, &hex::encode(&salt), &hex::encode(verifier.to_bytes_be()))?;
        self.sessions.invalidate_all_for_user(user_id)?;
        let session = self.sessions.create(user_id)?;
        info!("password changed");
        Ok(session)
    }

    /// Drop challenges older than the TTL.
    pub async fn purge_stale(&self) -> usize {
        let mut challenges = self.challenges.lock().await;
        drop_expired(&mut challenges, self.config.challenge_ttl)
    }

    pub async fn pending(&self) -> usize {
        self.challenges.lock().await.len()
    }
}

#[async_trait]
impl Purgeable for ChallengeBroker {
    fn name(&self) -> &'static str {
        "challenges"
    }

    async fn purge(&self) -> Result<usize, AuthError> {
        Ok(self.purge_stale().await)
    }
}

fn drop_expired(challenges: &mut HashMap<ChallengeKey, Challenge>, ttl: Duration) -> usize {
    let before = challenges.len();
    challenges.retain(|_, c| c.issued_at.elapsed() <= ttl);
    before - challenges.len()
}

fn check_len(field: &'static str, value: &str, limit: usize) -> Result<(), AuthError> {
    if value.len() > limit {
        return Err(AuthError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}
