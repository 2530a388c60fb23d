//! Proxy configuration.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::offload::DEFAULT_DEADLINE;
use crate::{LOCAL_CID_LEN, MAX_CID_LEN};

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("local CID length {0} exceeds the 20-byte wire limit")]
    CidLength(usize),
    #[error("idle timeout must be longer than the sweep interval")]
    Timeouts,
}

/// Tunables for one proxy instance. Defaults match the satellite-link
/// deployment profile.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Length of the CIDs this endpoint mints for itself.
    pub local_cid_len: usize,
    /// Connections quiet for longer than this are reaped.
    pub idle_timeout: Duration,
    /// Cadence of the maintenance pass (ticks and reaping).
    pub sweep_interval: Duration,
    /// Deadline handed to the offload dispatcher per request.
    pub offload_deadline: Duration,
    /// Route per-packet transforms to the accelerator when one is attached.
    pub accelerate: bool,
    /// Echo received stream data back to the sender.
    pub echo: bool,
    /// How often to log a stats snapshot; zero disables.
    pub stats_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 4433)),
            local_cid_len: LOCAL_CID_LEN,
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            offload_deadline: DEFAULT_DEADLINE,
            accelerate: true,
            echo: true,
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_cid_len == 0 || self.local_cid_len > MAX_CID_LEN {
            return Err(ConfigError::CidLength(self.local_cid_len));
        }
        if self.idle_timeout <= self.sweep_interval {
            return Err(ConfigError::Timeouts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_cid_length_rejected() {
        let mut config = ProxyConfig::default();
        config.local_cid_len = 21;
        assert_eq!(config.validate(), Err(ConfigError::CidLength(21)));
    }

    #[test]
    fn sweep_must_undercut_idle_timeout() {
        let mut config = ProxyConfig::default();
        config.sweep_interval = Duration::from_secs(60);
        assert_eq!(config.validate(), Err(ConfigError::Timeouts));
    }
}
