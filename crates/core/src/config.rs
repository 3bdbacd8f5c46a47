//! Configuration structs loaded by each service binary at startup.
//!
//! These mirror the knobs named in the design's data model and component
//! sections: where the coordination store and object store live, what
//! `base_path` a Data Manager instance is rooted at, and the handful of
//! tunables that govern segment flush, checkpoint cadence and GC safety
//! windows.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for the coordination store (etcd).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Cluster member endpoints, e.g. `["http://127.0.0.1:2379"]`.
    pub endpoints: Vec<String>,
    /// TLS client cert path, if the cluster requires mutual TLS.
    #[serde(default)]
    pub cert_file: Option<String>,
    /// TLS client key path, if the cluster requires mutual TLS.
    #[serde(default)]
    pub key_file: Option<String>,
    /// Username for username/password auth, if enabled.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for username/password auth, if enabled.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        CoordinationConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            cert_file: None,
            key_file: None,
            username: None,
            password: None,
        }
    }
}

/// Connection settings for the object store (S3-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// Bucket name holding every service's segments under their own
    /// `base_path` prefix.
    pub bucket: String,
    /// Custom endpoint, for S3-compatible stores other than AWS (e.g.
    /// MinIO). `None` uses the AWS default resolver.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Region, passed through to the SDK's region resolver.
    #[serde(default = "default_region")]
    pub region: String,
    /// Force path-style addressing, required by most non-AWS S3-compatible
    /// stores.
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Web server bind settings shared by every HTTP-facing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on, e.g. `0.0.0.0:8000`.
    pub listen_address: String,
    /// TLS certificate path. `None` serves plain HTTP (fine behind a
    /// terminating proxy).
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    /// TLS key path, required if `tls_cert_file` is set.
    #[serde(default)]
    pub tls_key_file: Option<String>,
}

/// Tunables for one Data Manager instance.
///
/// Each service (configstore, runservice, notification) constructs its own
/// Data Manager with a distinct `base_path` so their logs never collide in
/// the shared coordination store or object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataManagerConfig {
    /// Key and object prefix this instance owns. Every coordination-store
    /// key and object-store key this Data Manager touches is rooted here.
    pub base_path: String,
    /// Data type tags this instance accepts. `Append` rejects any entry
    /// whose tag isn't in this list.
    pub data_types: Vec<String>,
    /// Maximum bytes a segment may accumulate before being flushed.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    /// Maximum age a segment may reach before being flushed, even if under
    /// the byte threshold.
    #[serde(default = "default_segment_max_age")]
    pub segment_max_age: Duration,
    /// Maximum number of distinct keys a segment may hold before being
    /// flushed.
    #[serde(default = "default_segment_max_keys")]
    pub segment_max_keys: u64,
    /// How many committed sequences to retain in the WAL beyond the last
    /// checkpoint, so a lagging ReadDB can still catch up without a full
    /// reset.
    #[serde(default = "default_gc_safety_window")]
    pub gc_safety_window: u64,
    /// How often the checkpoint loop attempts to take a new checkpoint.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: Duration,
    /// Bound on the `Subscribe` change-notification channel. A slow
    /// consumer that falls behind this many notifications is disconnected
    /// rather than allowed to apply backpressure to writers.
    #[serde(default = "default_subscribe_buffer")]
    pub subscribe_buffer: usize,
}

fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_segment_max_age() -> Duration {
    Duration::from_secs(300)
}

fn default_segment_max_keys() -> u64 {
    100_000
}

fn default_gc_safety_window() -> u64 {
    10_000
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_subscribe_buffer() -> usize {
    1024
}

/// Top-level configuration for a service binary (configstore, runservice,
/// notification, gateway).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// HTTP server settings.
    pub web: WebConfig,
    /// Coordination store connection settings.
    pub coordination: CoordinationConfig,
    /// Object store connection settings.
    pub object_storage: ObjectStorageConfig,
    /// Local directory ReadDB uses for its embedded store and Data
    /// Manager recovery scratch space.
    pub data_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordination_defaults_to_localhost() {
        let c = CoordinationConfig::default();
        assert_eq!(c.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
    }

    #[test]
    fn data_manager_config_deserializes_with_defaults() {
        let json = r#"{"base_path": "configdata", "data_types": ["user", "org"]}"#;
        let cfg: DataManagerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.base_path, "configdata");
        assert_eq!(cfg.segment_max_bytes, default_segment_max_bytes());
        assert_eq!(cfg.gc_safety_window, default_gc_safety_window());
    }
}
