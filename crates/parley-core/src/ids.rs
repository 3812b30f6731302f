//! Prefixed string identifiers. Each kind picks its own prefix and entropy.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub trait IdKind {
    const PREFIX: &'static str;
    const LABEL: &'static str;
    fn entropy() -> String;
}

pub struct Id<K> {
    raw: String,
    kind: PhantomData<fn() -> K>,
}

pub enum UserKind {}
pub enum ConnectionKind {}
pub enum SessionKind {}

impl IdKind for UserKind {
    const PREFIX: &'static str = "usr";
    const LABEL: &'static str = "UserId";
    fn entropy() -> String {
        Uuid::now_v7().to_string()
    }
}

impl IdKind for ConnectionKind {
    const PREFIX: &'static str = "conn";
    const LABEL: &'static str = "ConnectionId";
    fn entropy() -> String {
        Uuid::now_v7().to_string()
    }
}

// Bearer credential: no timestamp bits.
impl IdKind for SessionKind {
    const PREFIX: &'static str = "sess";
    const LABEL: &'static str = "SessionId";
    fn entropy() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

pub type UserId = Id<UserKind>;
pub type ConnectionId = Id<ConnectionKind>;
pub type SessionId = Id<SessionKind>;

impl<K: IdKind> Id<K> {
    pub fn new() -> Self {
        Self::from_raw(format!("{}_{}", K::PREFIX, K::entropy()))
    }
}

impl<K> Id<K> {
    /// Wrap an id read back from storage or a client; no validation.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            kind: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl<K: IdKind> Default for Id<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for Id<K> {
    fn clone(&self) -> Self {
        Self::from_raw(self.raw.clone())
    }
}

impl<K> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K> Eq for Id<K> {}

impl<K> Hash for Id<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: IdKind> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(K::LABEL).field(&self.raw).finish()
    }
}

impl<K> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl<K> FromStr for Id<K> {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_raw(s))
    }
}

impl<K> AsRef<str> for Id<K> {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl<K> Serialize for Id<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de, K> Deserialize<'de> for Id<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from_raw)
    }
}
