//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use mesh_net::wire::WireConfig;
use mesh_store::RadiskOptions;

/// Everything a [`crate::MeshNode`] recognizes. Construct with
/// [`Config::new`] and adjust fields; the defaults are the production
/// values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the radix store files.
    pub file: PathBuf,
    /// Max bytes per store file before slicing.
    pub size: usize,
    /// Staged-byte threshold that forces an early store flush.
    pub batch: usize,
    /// Idle interval between store flushes.
    pub write: Duration,
    /// Keep decoded store files in memory.
    pub cache: bool,
    /// Seen-message retention.
    pub max_age: Duration,
    /// Outbound queue cap.
    pub max_queue_length: usize,
    /// Require signatures for user souls and reject unsigned public writes.
    pub secure: bool,
    /// GET timeout; also the deferred-retry ceiling.
    pub wait: Duration,
    /// Upstream peer addresses to dial at startup.
    pub peers: Vec<String>,
    /// Bind a TCP server transport on this port.
    pub port: Option<u16>,
    /// Stable peer id; derived from a fresh keypair when unset.
    pub peer_id: Option<String>,
    /// Run the periodic rate-limiter cleanup; tests turn this off.
    pub rate_sweep: bool,
}

impl Config {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Config {
            file: file.into(),
            size: 1024 * 1024,
            batch: 64 * 1024,
            write: Duration::from_millis(1),
            cache: true,
            max_age: Duration::from_secs(9),
            max_queue_length: 1000,
            secure: false,
            wait: Duration::from_millis(100),
            peers: Vec::new(),
            port: None,
            peer_id: None,
            rate_sweep: true,
        }
    }

    pub(crate) fn radisk_options(&self) -> RadiskOptions {
        RadiskOptions {
            dir: self.file.clone(),
            size: self.size,
            batch: self.batch,
            write: self.write,
            cache: self.cache,
        }
    }

    pub(crate) fn wire_config(&self, peer_id: String) -> WireConfig {
        let mut cfg = WireConfig::new(peer_id);
        cfg.secure = self.secure;
        cfg.wait = self.wait;
        cfg.max_age = self.max_age;
        cfg.max_queue_length = self.max_queue_length;
        cfg.rate_sweep = self.rate_sweep;
        cfg
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new("mesh-data")
    }
}
