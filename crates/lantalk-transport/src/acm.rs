use std::time::Duration;

/// When a connection may be closed for inactivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmClose {
    /// Never close for lack of application traffic.
    Off,
    /// Close gracefully once no application traffic flowed for the timeout
    /// and no invocation is outstanding.
    OnIdle,
}

/// Whether this side emits heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmHeartbeat {
    Off,
    /// Heartbeat every `timeout / 4` regardless of application traffic.
    ///
    /// Also enables silence detection: a connection that receives nothing
    /// (heartbeats included) for `timeout` is closed with
    /// [`CloseReason::Timeout`](crate::CloseReason::Timeout).
    Always,
}

/// Active connection management policy for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcmConfig {
    pub timeout: Duration,
    pub close: AcmClose,
    pub heartbeat: AcmHeartbeat,
}

impl AcmConfig {
    /// Policy used for a monitored peer session: no idle close, heartbeats
    /// always on.
    pub fn monitored(timeout: Duration) -> Self {
        Self {
            timeout,
            close: AcmClose::Off,
            heartbeat: AcmHeartbeat::Always,
        }
    }

    /// How often the connection monitor wakes up.
    pub(crate) fn tick(&self) -> Duration {
        (self.timeout / 4).max(Duration::from_millis(10))
    }
}

impl Default for AcmConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            close: AcmClose::OnIdle,
            heartbeat: AcmHeartbeat::Off,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitored_policy() {
        let acm = AcmConfig::monitored(Duration::from_secs(30));
        assert_eq!(acm.close, AcmClose::Off);
        assert_eq!(acm.heartbeat, AcmHeartbeat::Always);
        assert_eq!(acm.tick(), Duration::from_millis(7500));
    }

    #[test]
    fn tick_has_floor() {
        let acm = AcmConfig::monitored(Duration::from_millis(8));
        assert_eq!(acm.tick(), Duration::from_millis(10));
    }
}
