//! Socket configuration
//!
//! Options are fixed when a socket is bound and shared by every connection
//! it owns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UtpError};
use crate::packet::MAX_PAYLOAD_SIZE;

/// Firewall callback: returns false to refuse a SYN from that address
#[derive(Clone)]
pub struct AcceptFilter(Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>);

impl AcceptFilter {
    pub fn new(filter: impl Fn(SocketAddr) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(filter))
    }

    pub fn allows(&self, addr: SocketAddr) -> bool {
        (self.0)(addr)
    }
}

impl fmt::Debug for AcceptFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AcceptFilter(..)")
    }
}

/// uTP socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtpConfig {
    /// SYNs held for `accept` before the oldest is evicted with a reset
    #[serde(default = "default_backlog")]
    pub backlog: usize,

    /// Cap of in-order bytes waiting for `read` (also the advertised window)
    #[serde(default = "default_read_buffer_len")]
    pub read_buffer_len: usize,

    /// In-flight packets per connection before `write` blocks
    #[serde(default = "default_max_unacked_sends")]
    pub max_unacked_sends: usize,

    /// Latency assumed before the first ack is measured
    #[serde(default = "default_initial_latency_ms")]
    pub initial_latency_ms: u64,

    /// A packet unacknowledged for this long kills the connection
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// A connection that receives nothing for this long is destroyed
    #[serde(default = "default_packet_read_timeout_secs")]
    pub packet_read_timeout_secs: u64,

    /// How long a pending ST_STATE waits to be coalesced (microseconds)
    #[serde(default = "default_pending_state_delay_us")]
    pub pending_state_delay_us: u64,

    /// Bound on `dial` when no cancellation token is supplied
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Consecutive receive failures before the socket is torn down
    #[serde(default = "default_max_consecutive_read_errors")]
    pub max_consecutive_read_errors: u32,

    /// Non-uTP datagrams queued for `recv_from`
    #[serde(default = "default_unused_read_capacity")]
    pub unused_read_capacity: usize,

    /// Optional SYN filter
    #[serde(skip)]
    pub accept_filter: Option<AcceptFilter>,
}

fn default_backlog() -> usize {
    50
}

fn default_read_buffer_len() -> usize {
    1 << 20 // ~1MiB
}

fn default_max_unacked_sends() -> usize {
    256
}

fn default_initial_latency_ms() -> u64 {
    400
}

fn default_write_timeout_secs() -> u64 {
    15
}

fn default_packet_read_timeout_secs() -> u64 {
    120
}

fn default_pending_state_delay_us() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_max_consecutive_read_errors() -> u32 {
    16
}

fn default_unused_read_capacity() -> usize {
    100
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            read_buffer_len: default_read_buffer_len(),
            max_unacked_sends: default_max_unacked_sends(),
            initial_latency_ms: default_initial_latency_ms(),
            write_timeout_secs: default_write_timeout_secs(),
            packet_read_timeout_secs: default_packet_read_timeout_secs(),
            pending_state_delay_us: default_pending_state_delay_us(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_consecutive_read_errors: default_max_consecutive_read_errors(),
            unused_read_capacity: default_unused_read_capacity(),
            accept_filter: None,
        }
    }
}

impl UtpConfig {
    /// Set the SYN filter
    pub fn with_accept_filter(
        mut self,
        filter: impl Fn(SocketAddr) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.accept_filter = Some(AcceptFilter::new(filter));
        self
    }

    pub fn initial_latency(&self) -> Duration {
        Duration::from_millis(self.initial_latency_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn packet_read_timeout(&self) -> Duration {
        Duration::from_secs(self.packet_read_timeout_secs)
    }

    pub fn pending_state_delay(&self) -> Duration {
        Duration::from_micros(self.pending_state_delay_us)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backlog == 0 {
            return Err(UtpError::invalid_input("backlog", "Must be at least 1"));
        }

        if self.read_buffer_len < MAX_PAYLOAD_SIZE {
            return Err(UtpError::invalid_input(
                "read_buffer_len",
                format!("Must hold at least one packet ({} bytes)", MAX_PAYLOAD_SIZE),
            ));
        }

        if self.read_buffer_len > u32::MAX as usize {
            return Err(UtpError::invalid_input(
                "read_buffer_len",
                "Must fit the 32-bit window field",
            ));
        }

        if self.max_unacked_sends == 0 {
            return Err(UtpError::invalid_input(
                "max_unacked_sends",
                "Must be at least 1",
            ));
        }

        if self.initial_latency_ms == 0 {
            return Err(UtpError::invalid_input(
                "initial_latency_ms",
                "Must be at least 1",
            ));
        }

        if self.write_timeout_secs == 0 {
            return Err(UtpError::invalid_input(
                "write_timeout_secs",
                "Must be at least 1",
            ));
        }

        if self.packet_read_timeout_secs == 0 {
            return Err(UtpError::invalid_input(
                "packet_read_timeout_secs",
                "Must be at least 1",
            ));
        }

        if self.max_consecutive_read_errors == 0 {
            return Err(UtpError::invalid_input(
                "max_consecutive_read_errors",
                "Must be at least 1",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = UtpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backlog, 50);
        assert_eq!(config.write_timeout(), Duration::from_secs(15));
        assert_eq!(config.pending_state_delay(), Duration::from_micros(500));
    }

    #[test]
    fn test_invalid_values() {
        let config = UtpConfig {
            backlog: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(UtpError::InvalidInput { field: "backlog", .. })
        ));

        let config = UtpConfig {
            read_buffer_len: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_fills_defaults() {
        let config: UtpConfig = serde_json::from_str(r#"{"backlog": 8}"#).unwrap();
        assert_eq!(config.backlog, 8);
        assert_eq!(config.read_buffer_len, 1 << 20);
        assert!(config.accept_filter.is_none());

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"backlog\":8"));
        assert!(!json.contains("accept_filter"));
    }

    #[test]
    fn test_accept_filter() {
        let config = UtpConfig::default().with_accept_filter(|addr| addr.port() != 9);
        let filter = config.accept_filter.unwrap();
        assert!(filter.allows("127.0.0.1:80".parse().unwrap()));
        assert!(!filter.allows("127.0.0.1:9".parse().unwrap()));
    }
}
