use std::time::Duration;

use sockmux_frame::FrameConfig;

/// Reconnection behavior after the transport closes or fails.
///
/// The n-th retry after a failure waits `step * (n - 1)`: the first retry is
/// immediate, the second waits one step, the third two steps. The delay is
/// unbounded unless `max_delay` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect at all. Default: true.
    pub enabled: bool,
    /// Linear backoff increment. Default: 1 second.
    pub step: Duration,
    /// Optional ceiling on the backoff delay. Default: none.
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            step: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the attempt that follows `attempts` earlier retries.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let delay = self.step.checked_mul(attempts).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Client configuration, supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint handed to the connector on every attempt.
    pub url: String,
    /// Frame size ceiling, applied to outgoing and incoming frames.
    pub frame: FrameConfig,
    /// Reconnection behavior.
    pub reconnect: ReconnectPolicy,
    /// Give up on a call with no response after this long. Default: never.
    pub call_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            frame: FrameConfig::default(),
            reconnect: ReconnectPolicy::default(),
            call_timeout: None,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.frame.max_frame_size = max_frame_size;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
