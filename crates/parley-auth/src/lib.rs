//! Zero-knowledge login and the session cache it feeds.
//!
//! [`broker::ChallengeBroker`] runs the two-step SRP-6a handshake,
//! [`sessions::SessionStore`] keeps logged-in sessions in memory with a
//! SQLite mirror, and [`purge`] sweeps both on a fixed interval.

pub mod broker;
pub mod config;
pub mod error;
pub mod purge;
pub mod sessions;
pub mod srp;

pub use broker::{ChallengeBroker, LoginChallenge, LoginProof, LoginSuccess};
pub use config::{AuthConfig, SessionConfig};
pub use error::AuthError;
pub use purge::{spawn_purge_task, Purgeable};
pub use sessions::SessionStore;
