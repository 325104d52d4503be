//! Hub tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Limits and timers applied to every client connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Frames each client may have queued before it is evicted.
    pub mailbox_capacity: usize,
    /// Largest inbound frame in bytes; bigger frames are dropped.
    pub max_frame_size: usize,
    /// Read deadline, refreshed by each pong.
    pub pong_wait_secs: u64,
    /// Ping interval. Must be shorter than `pong_wait_secs`.
    pub ping_period_secs: u64,
    /// Upper bound on a single outbound write.
    pub write_wait_secs: u64,
    /// Depth of the control-loop command queue.
    pub control_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            max_frame_size: 4096,
            pong_wait_secs: 60,
            ping_period_secs: 54,
            write_wait_secs: 10,
            control_queue: 1024,
        }
    }
}

impl HubConfig {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.mailbox_capacity == 0 {
            return Err(HubError::InvalidConfig("mailbox_capacity must be > 0".into()));
        }
        if self.max_frame_size == 0 {
            return Err(HubError::InvalidConfig("max_frame_size must be > 0".into()));
        }
        if self.control_queue == 0 {
            return Err(HubError::InvalidConfig("control_queue must be > 0".into()));
        }
        if self.ping_period_secs == 0 || self.ping_period_secs >= self.pong_wait_secs {
            return Err(HubError::InvalidConfig(format!(
                "ping_period_secs ({}) must be non-zero and shorter than pong_wait_secs ({})",
                self.ping_period_secs, self.pong_wait_secs
            )));
        }
        if self.write_wait_secs == 0 {
            return Err(HubError::InvalidConfig("write_wait_secs must be > 0".into()));
        }
        Ok(())
    }
}
