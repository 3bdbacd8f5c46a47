//! The single-consumer worker that streams server-sent events from an
//! upstream and hands them to a caller-supplied handler under a
//! lease-backed mutex, so exactly one replica is consuming at a time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod sse;
pub mod worker;

#[cfg(test)]
mod testing;

pub use sse::SseReader;
pub use worker::{EventHandler, Worker, WorkerConfig};
