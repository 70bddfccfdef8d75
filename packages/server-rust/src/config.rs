//! Configuration types for the coordinator.

use std::time::Duration;

/// Top-level coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bind address for both TCP listeners and the UDP socket.
    pub host: String,
    /// Worker ingress port. 0 means OS-assigned.
    pub worker_port: u16,
    /// Client ingress port. 0 means OS-assigned.
    pub client_port: u16,
    /// UDP port progress datagrams are addressed to on each client's host.
    pub client_progress_port: u16,
    /// Per-lease settings.
    pub lease: LeaseConfig,
    /// Dispatch and failure policy.
    pub dispatch: DispatchConfig,
    /// Reliable datagram channel settings.
    pub progress: ProgressConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            worker_port: 7401,
            client_port: 7402,
            client_progress_port: 7403,
            lease: LeaseConfig::default(),
            dispatch: DispatchConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

/// Per-worker-lease settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Maximum time a lease waits for a worker's result frame before the
    /// round trip is abandoned and the connection dropped.
    pub result_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            result_timeout: Duration::from_secs(60),
        }
    }
}

/// Dispatch and failure policy settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Assignments a job may consume before a transport fault stops being
    /// retryable and the job is failed terminally.
    pub max_job_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_job_attempts: 3,
        }
    }
}

/// Reliable datagram channel settings.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Time to wait for an acknowledgment before resending.
    pub ack_timeout: Duration,
    /// Total send attempts per datagram before it is dropped.
    pub max_attempts: u32,
    /// Bounded queue capacity between producers and the sender task.
    pub queue_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(300),
            max_attempts: 5,
            queue_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_config_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.worker_port, 7401);
        assert_eq!(config.client_port, 7402);
        assert_eq!(config.client_progress_port, 7403);
    }

    #[test]
    fn lease_config_defaults() {
        assert_eq!(
            LeaseConfig::default().result_timeout,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn dispatch_config_defaults() {
        assert_eq!(DispatchConfig::default().max_job_attempts, 3);
    }

    #[test]
    fn progress_config_defaults() {
        let config = ProgressConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_millis(300));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.queue_capacity, 256);
    }
}
