//! # In-Memory Storage
//!
//! In-memory [`Database`](verdant_storage::Database) implementation for
//! tests and deterministic simulation.
//!
//! Uses `im::OrdMap` for O(1) structural-sharing clones, enabling efficient
//! snapshots without copying the entire dataset, and deterministic key
//! ordering so iteration behaves identically to a disk-backed engine.

mod database;

pub use database::MemoryDatabase;
