//! Infrastructure implementations for Bookmarch.
//!
//! SQLite-backed repositories and the durable job queue (via sqlx with
//! split WAL pools), artifact checksumming, and configuration loading.

pub mod checksum;
pub mod config;
pub mod sqlite;
