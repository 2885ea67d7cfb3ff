//! Configuration loading.
//!
//! The relay reads a single JSON file at startup. A missing or malformed
//! file is not fatal: the coded defaults below are used instead and a
//! warning is logged. The resulting [`Config`] value is passed explicitly
//! into the supervisor and from there into every session task — there is no
//! global configuration state.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the relay listens on for new host connections.
    #[serde(default = "default_host_port")]
    pub host_port: u16,
    /// Per-connection read deadline, in minutes, stamped once at accept time.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Low end of the range scanned for client-facing ports.
    #[serde(default = "default_client_port_min")]
    pub client_port_min: u16,
    /// High end of the range scanned for client-facing ports.
    #[serde(default = "default_client_port_max")]
    pub client_port_max: u16,
    /// Whether SBRP framing and responses start enabled for host sessions.
    #[serde(default = "default_use_relay_protocol")]
    pub use_relay_protocol: bool,
    /// Size of the buffer each connection reader fills per read.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Capacity of the frame and registry channels.
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
}

fn default_host_port() -> u16 {
    8080
}

fn default_timeout_minutes() -> u64 {
    5
}

fn default_client_port_min() -> u16 {
    8081
}

fn default_client_port_max() -> u16 {
    23000
}

fn default_use_relay_protocol() -> bool {
    true
}

fn default_read_buffer_size() -> usize {
    512
}

fn default_frame_queue_capacity() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_port: default_host_port(),
            timeout_minutes: default_timeout_minutes(),
            client_port_min: default_client_port_min(),
            client_port_max: default_client_port_max(),
            use_relay_protocol: default_use_relay_protocol(),
            read_buffer_size: default_read_buffer_size(),
            frame_queue_capacity: default_frame_queue_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to the coded
    /// defaults if the file is absent or malformed.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file unreadable, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file malformed, using defaults");
                Self::default()
            }
        }
    }

    /// The fixed read deadline applied to every accepted connection.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}
