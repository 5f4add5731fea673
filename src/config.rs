use std::time::Duration;

use crate::error::{Error, Result};

/// Default depth of every per-device sample queue, roughly a second of
/// samples at the maximum rate.
pub const DEFAULT_QUEUE_SIZE: usize = 100_000;

/// What happens to leftover queue contents between consecutive runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunResetPolicy {
    /// Queued output and unread input survive until `flush()` is called.
    Explicit,
    /// Output and input queues are flushed before every run or start.
    FlushBeforeRun,
}

impl Default for RunResetPolicy {
    fn default() -> Self {
        RunResetPolicy::Explicit
    }
}

/// Session-wide knobs. Devices copy what they need when they are probed.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub queue_size: usize,
    /// Requested rate in Hz, 0 picks the first device's default.
    pub sample_rate: u32,
    pub ignore_dataflow: bool,
    /// Spawn the hotplug monitor with the session.
    pub hotplug: bool,
    pub hotplug_interval: Duration,
    /// Upper bound on how long `end()` waits past the expected run time.
    pub end_timeout: Duration,
    /// Pause after pushing a device into its bootloader so it re-enumerates.
    pub samba_settle: Duration,
    pub reset_policy: RunResetPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            queue_size: DEFAULT_QUEUE_SIZE,
            sample_rate: 0,
            ignore_dataflow: false,
            hotplug: true,
            hotplug_interval: Duration::from_secs(2),
            end_timeout: Duration::from_secs(1),
            samba_settle: Duration::from_secs(1),
            reset_policy: RunResetPolicy::Explicit,
        }
    }
}

impl SessionConfig {
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_ignore_dataflow(mut self, ignore: bool) -> Self {
        self.ignore_dataflow = ignore;
        self
    }

    pub fn with_hotplug(mut self, enabled: bool) -> Self {
        self.hotplug = enabled;
        self
    }

    pub fn with_hotplug_interval(mut self, interval: Duration) -> Self {
        self.hotplug_interval = interval;
        self
    }

    pub fn with_end_timeout(mut self, timeout: Duration) -> Self {
        self.end_timeout = timeout;
        self
    }

    pub fn with_samba_settle(mut self, settle: Duration) -> Self {
        self.samba_settle = settle;
        self
    }

    pub fn with_reset_policy(mut self, policy: RunResetPolicy) -> Self {
        self.reset_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(Error::invalid("queue size must be non-zero"));
        }
        if self.hotplug && self.hotplug_interval == Duration::from_secs(0) {
            return Err(Error::invalid("hotplug interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(cfg.reset_policy, RunResetPolicy::Explicit);
        assert!(!cfg.ignore_dataflow);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_queue() {
        let cfg = SessionConfig::default().with_queue_size(0);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_zero_interval_only_matters_with_hotplug() {
        let cfg = SessionConfig::default().with_hotplug_interval(Duration::from_secs(0));
        assert!(cfg.validate().is_err());
        assert!(cfg.with_hotplug(false).validate().is_ok());
    }
}
