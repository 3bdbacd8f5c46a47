//! The thin service-shell layer shared by every microservice in this
//! workspace (configstore, runservice, notification, and whatever sits
//! behind the gateway).
//!
//! Per the design's scope (§1), HTTP routing, auth and concrete resource
//! schemas are out-of-scope "interfaces only" — a service binary is
//! expected to build its own `axum::Router` of CRUD handlers over
//! `DataManager`/`ReadDb` and merge it with what this crate provides:
//! the readiness handshake between DM and ReadDB, graceful shutdown, the
//! `/healthz`/`/readyz` routes, and the `kilnforge_core::Error` → HTTP
//! response mapping every handler eventually needs.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod health;
mod shell;

#[cfg(test)]
mod testing;

pub use error::ApiError;
pub use health::health_router;
pub use shell::{run, run_background, serve};
