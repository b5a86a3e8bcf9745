//! Kiln Core - Foundational types for the Kiln generation pipeline
//!
//! This crate provides the types that all other Kiln crates depend on:
//! - `ContentHash` - SHA-256 based content hashing
//! - `canonical` - stable serialization for deterministic hashing
//! - Error types and Result alias

pub mod canonical;
mod error;
mod hash;

pub use error::{KilnError, Result};
pub use hash::ContentHash;
