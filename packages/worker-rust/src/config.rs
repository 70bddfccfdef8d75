//! Configuration for the worker node.

use std::time::Duration;

/// Worker node settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator's worker ingress address, `host:port`.
    pub coordinator_addr: String,
    /// Fixed delay between reconnect attempts. The worker retries
    /// indefinitely until shutdown.
    pub reconnect_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: "127.0.0.1:7401".to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.coordinator_addr, "127.0.0.1:7401");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }
}
