//! Shared types for the Kilnforge CI/CD platform.
//!
//! This crate holds the vocabulary every other crate in the workspace builds
//! on: the WAL entry format that flows from the Data Manager into ReadDB,
//! the closed set of error kinds every public operation returns, and the
//! configuration structs each service binary loads at startup.
//!
//! Nothing in here talks to etcd, S3, or disk. That's left to
//! `kilnforge-coordination`, `kilnforge-objectstore`, `kilnforge-datamanager`
//! and `kilnforge-readdb`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;
pub mod wal_entry;

pub use config::{
    CoordinationConfig, DataManagerConfig, ObjectStorageConfig, ServiceConfig, WebConfig,
};
pub use error::{Error, Result};
pub use wal_entry::{Action, ChangeNotification, DataType, Sequence, WalEntry};
