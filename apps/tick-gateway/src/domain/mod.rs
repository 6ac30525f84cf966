//! Domain Layer - Core market types and subscription bookkeeping.
//!
//! This layer contains the core domain types for tick distribution
//! with no I/O. All types here are pure Rust with serialization support.

/// Price ticks, quote snapshots, and symbol canonicalization.
pub mod market;

/// Connection-to-symbol subscription index.
pub mod subscription;
