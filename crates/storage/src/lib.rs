//! Storage traits and shared key-space definitions.
//!
//! This crate defines the backing-store abstraction the verdant tree
//! persists into, along with the on-disk key space both the tree and any
//! storage backend need to agree on.
//!
//! # Design
//!
//! The backing store is an implementation detail of the embedding
//! application, not of the tree. The tree core consumes the [`Database`]
//! trait and never names a concrete engine; `verdant-storage-memory`
//! provides an in-memory implementation for tests and simulation, and a
//! disk-backed engine can be plugged in by implementing the same trait.
//!
//! # Contract
//!
//! A [`Database`] is an ordered key/value store supporting:
//!
//! - point reads ([`Database::get`], [`Database::has`])
//! - ordered range iteration in both directions ([`Database::iterate`])
//! - atomic application of a [`WriteBatch`] ([`Database::write`])
//!
//! Writes staged in a batch must become visible all at once or not at all;
//! the tree relies on this for crash consistency of version commits.

#![warn(missing_docs)]

mod database;
pub mod keys;

pub use database::{BatchOp, Database, DbIterator, StorageError, WriteBatch};
