//! SQLite persistence for accounts and login sessions.

pub mod columns;
pub mod database;
pub mod error;
pub mod migrations;
pub mod sessions;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionRepo, SessionRow};
pub use users::{UserRepo, UserRow};
