//! Core types for the verdant versioned state tree.
//!
//! This crate provides the foundational types shared by the storage and
//! tree layers:
//!
//! - **Hash**: 32-byte Blake3 digest with hex formatting
//! - **Version**: the version counter type used throughout
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod hash;

pub use hash::{Hash, HexError};

/// Tree version number.
///
/// Versions are assigned by `save_version` and increase monotonically.
/// Version 0 means "no saved versions".
pub type Version = u64;
