//! # importq
//!
//! Durable staging queue for batch record imports.
//!
//! Batches of flat rows are aggregated into one record per business entity
//! and staged into a per-tenant queue. Workers claim entries exclusively,
//! hand each to a record processor, and quarantine the ones that fail so
//! they can be reported to operators. A backpressure monitor watches the
//! age of outstanding claims.
//!
//! The queue runs on Postgres ([`db::Db`]) or in process
//! ([`store::MemoryBackend`]), behind the same [`store::QueueStore`].

pub mod alert;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod model;
pub mod monitor;
pub mod store;
pub mod telemetry;
