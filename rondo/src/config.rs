//! Runtime configuration surface.
//!
//! Bundles the pieces every other module takes as loose parameters today —
//! the HMAC key, the database root, default query parameters, and the
//! server's listener addresses and connection-pool size — into one value a
//! host application builds once at startup.
//!
//! **[ADDED]**: no teacher counterpart file exists; shaped after the
//! builder-style `new()` plus per-field doc comments used throughout
//! `series.rs`/`schema.rs` in the teacher crate.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::query::{ConsolidationConfig, DEFAULT_BUCKET_STRIDE_SECS, DEFAULT_CF, DEFAULT_FROM_SECS, DEFAULT_SAMPLES, DEFAULT_UNTIL_SECS};
use crate::server::ServerConfig;

/// Default HMAC key size when one is generated rather than supplied: 64
/// octets (spec §6.6).
pub const DEFAULT_KEY_LEN: usize = 64;

/// Default maximum simultaneously open connections, across both listeners.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Top-level configuration for mounting a database and, optionally, serving
/// it over BQIP.
#[derive(Debug, Clone)]
pub struct RondoConfig {
    /// Database root directory.
    pub root: PathBuf,
    /// Raw HMAC-SHA-512 key. Must be identical across every mount of a given
    /// database (spec §6.6).
    pub key: Vec<u8>,
    /// Default window/consolidation parameters applied to a query that
    /// leaves them unset.
    pub default_window_secs: (i64, i64),
    /// Default bucket-phase consolidation.
    pub default_bucket: ConsolidationConfig,
    /// Query listener address, if this process will serve BQIP.
    pub query_addr: Option<SocketAddr>,
    /// Metrics (measurement-ingest) listener address, if this process will
    /// serve BQIP.
    pub metrics_addr: Option<SocketAddr>,
    /// Maximum simultaneously open connections, across both listeners.
    pub max_connections: usize,
}

impl RondoConfig {
    /// Builds a configuration for `root`/`key` with every other field at its
    /// spec-default value and no server listeners configured.
    #[must_use]
    pub fn new(root: impl AsRef<Path>, key: Vec<u8>) -> Self {
        RondoConfig {
            root: root.as_ref().to_path_buf(),
            key,
            default_window_secs: (DEFAULT_FROM_SECS, DEFAULT_UNTIL_SECS),
            default_bucket: ConsolidationConfig {
                cf: DEFAULT_CF,
                stride_secs: DEFAULT_BUCKET_STRIDE_SECS,
                samples: DEFAULT_SAMPLES,
            },
            query_addr: None,
            metrics_addr: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Generates a fresh, random 64-octet key suitable for [`Self::new`].
    /// Hex encoding for display/storage at a CLI boundary is out of scope
    /// here (spec §6.6); this returns the raw binary key.
    #[must_use]
    pub fn generate_key() -> Vec<u8> {
        let mut key = vec![0u8; DEFAULT_KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Configures both BQIP listeners and the connection pool size.
    #[must_use]
    pub fn with_server(mut self, query_addr: SocketAddr, metrics_addr: SocketAddr, max_connections: usize) -> Self {
        self.query_addr = Some(query_addr);
        self.metrics_addr = Some(metrics_addr);
        self.max_connections = max_connections;
        self
    }

    /// Builds a [`ServerConfig`] from this configuration.
    ///
    /// # Panics
    ///
    /// Panics if [`Self::with_server`] was never called — callers that only
    /// want an embedded, serverless database should not reach for this.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            query_addr: self.query_addr.expect("with_server must be called before server_config"),
            metrics_addr: self.metrics_addr.expect("with_server must be called before server_config"),
            max_connections: self.max_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_key_produces_64_octets() {
        let key = RondoConfig::generate_key();
        assert_eq!(key.len(), DEFAULT_KEY_LEN);
    }

    #[test]
    fn new_fills_spec_defaults() {
        let cfg = RondoConfig::new("/tmp/does-not-matter", vec![0u8; 64]);
        assert_eq!(cfg.default_window_secs, (DEFAULT_FROM_SECS, DEFAULT_UNTIL_SECS));
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn with_server_fills_listener_fields() {
        let cfg = RondoConfig::new("/tmp/x", vec![0u8; 64])
            .with_server("127.0.0.1:9000".parse().unwrap(), "127.0.0.1:9001".parse().unwrap(), 10);
        let server_cfg = cfg.server_config();
        assert_eq!(server_cfg.max_connections, 10);
    }
}
