//! Structured logging initialization shared by every service binary.
//!
//! Each binary calls [`init`] once at startup instead of threading a
//! logger handle through every constructor; components log through the
//! ambient [`tracing`] dispatcher and are free to open their own spans
//! (`dm.checkpoint`, `readdb.catchup`, `eventconsumer.lease`, ...) to keep
//! related log lines correlated.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Honors `RUST_LOG` if set; otherwise defaults to `info` for this
/// workspace's crates and `warn` for dependencies. Safe to call more than
/// once per process (subsequent calls are no-ops) so tests can call it
/// freely.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,kilnforge=info"));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
