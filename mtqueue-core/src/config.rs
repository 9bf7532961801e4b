//! Configuration for the dispatcher.

use std::time::Duration;

use tracing::warn;

use crate::admission::AdmissionPolicy;
use crate::error::ConfigError;
use crate::tier::PriorityTier;

/// Configuration for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Number of concurrent workers
    pub workers: usize,

    /// Queue slots shared by every tier
    pub shared_capacity: usize,

    /// Slots reserved per tier, on top of the shared pool
    pub reserved: [usize; PriorityTier::COUNT],

    /// Optional hard cap on queued entries per tier
    pub tier_limits: [Option<usize>; PriorityTier::COUNT],

    /// How long a submission may wait for queue space (`None` = fail fast)
    pub admission_wait: Option<Duration>,

    /// Maximum time a single backend call may take
    pub inference_timeout: Duration,

    /// Deadline applied to submissions that do not carry one
    pub default_deadline: Option<Duration>,

    /// How long finished results are kept for a caller that never collects them
    pub result_grace: Duration,

    /// Period of the task that reaps uncollected results
    pub janitor_interval: Duration,

    /// Pause before a crashed worker is restarted
    pub restart_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shared_capacity: 256,
            reserved: [16, 8, 0, 0],
            tier_limits: [None; PriorityTier::COUNT],
            admission_wait: None,
            inference_timeout: Duration::from_secs(30),
            default_deadline: None,
            result_grace: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(10),
            restart_backoff: Duration::from_millis(100),
        }
    }
}

impl DispatchConfig {
    /// One background worker, like a single model instance on one device
    pub fn single_worker() -> Self {
        Self {
            workers: 1,
            shared_capacity: 64,
            reserved: [8, 4, 0, 0],
            ..Self::default()
        }
    }

    /// Many workers and a deep queue for a horizontally scaled backend
    pub fn high_throughput() -> Self {
        Self {
            workers: 16,
            shared_capacity: 2048,
            reserved: [128, 64, 0, 0],
            inference_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Admission rules derived from this configuration
    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            shared_capacity: self.shared_capacity,
            reserved: self.reserved,
            tier_limits: self.tier_limits,
            wait: self.admission_wait,
        }
    }

    /// Physical queue capacity (shared pool plus reserves)
    pub fn queue_capacity(&self) -> usize {
        self.admission_policy().total_capacity()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero { field: "workers" });
        }
        if self.queue_capacity() == 0 {
            return Err(ConfigError::Zero { field: "queue capacity" });
        }
        if self.inference_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "inference_timeout" });
        }
        if self.janitor_interval.is_zero() {
            return Err(ConfigError::Zero { field: "janitor_interval" });
        }
        Ok(())
    }

    /// Create config from environment variables, skipping invalid values
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for (var, value) in env_vars() {
            if let Err(e) = config.apply_env(&var, &value) {
                warn!(error = %e, "Ignoring environment override");
            }
        }
        config
    }

    /// Create config from environment variables, failing on invalid values
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (var, value) in env_vars() {
            config.apply_env(&var, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply one `MTQUEUE_*` override
    pub fn apply_env(&mut self, var: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidEnv { var: var.to_string(), value: value.to_string() };
        let number = || value.trim().parse::<u64>().map_err(|_| invalid());

        match var {
            "MTQUEUE_WORKERS" => self.workers = number()? as usize,
            "MTQUEUE_QUEUE_CAPACITY" => self.shared_capacity = number()? as usize,
            "MTQUEUE_RESERVED_P0" => self.reserved[0] = number()? as usize,
            "MTQUEUE_RESERVED_P1" => self.reserved[1] = number()? as usize,
            "MTQUEUE_LIMIT_P0" => self.tier_limits[0] = Some(number()? as usize),
            "MTQUEUE_LIMIT_P1" => self.tier_limits[1] = Some(number()? as usize),
            "MTQUEUE_LIMIT_P2" => self.tier_limits[2] = Some(number()? as usize),
            "MTQUEUE_LIMIT_P3" => self.tier_limits[3] = Some(number()? as usize),
            "MTQUEUE_ADMISSION_WAIT_MS" => {
                self.admission_wait = match number()? {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                }
            }
            "MTQUEUE_INFERENCE_TIMEOUT_SECS" => {
                self.inference_timeout = Duration::from_secs(number()?)
            }
            "MTQUEUE_DEFAULT_DEADLINE_SECS" => {
                self.default_deadline = match number()? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                }
            }
            "MTQUEUE_RESULT_GRACE_SECS" => self.result_grace = Duration::from_secs(number()?),
            _ => {}
        }
        Ok(())
    }
}

fn env_vars() -> impl Iterator<Item = (String, String)> {
    std::env::vars().filter(|(key, _)| key.starts_with("MTQUEUE_"))
}
