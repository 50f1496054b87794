//! Database module: models and schema for persistent storage.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows plus insert payloads
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `actor.rs`: the single writer; every query runs through it

pub mod actor;
pub mod models;
pub mod schema;

pub use actor::{DbActorHandle, spawn};
pub use models::{
    DbApiKey, DbCredential, DbUsageLog, DbUser, DonationRewards, NewCredential, NewUsageLog,
    NewUser, PoolStats, SelectionRequest, UsageWindow,
};
pub use schema::SQLITE_INIT;
