//! Arbor common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Arbor components:
//! the error type, tree configuration, node handles, serializers and key
//! comparers.

pub mod compare;
pub mod config;
pub mod error;
pub mod handle;
pub mod serialize;

pub use compare::{
    AlternateComparer, FnComparer, KeyComparer, OrdComparer, Reverse, StringOrdinal,
    StringOrdinalIgnoreCase,
};
pub use config::{
    CachePolicy, CreatePolicy, DuplicateHandling, ExistingLogAction, StoragePerformance,
    StorageType, TreeConfig,
};
pub use error::{ArborError, Result};
pub use handle::{LockTimeout, StorageHandle};
pub use serialize::{PairSerializer, PrimitiveSerializer, Serializer};
