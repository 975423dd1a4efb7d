use std::time::Duration;

use url::Url;

use crate::{ChannelError, ChannelResult};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TYPE: &str = "ping";
pub const DEFAULT_DEDUPE_WINDOW: usize = 256;

/// How long to wait before reopening a dropped stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// Doubles from `initial` on each consecutive failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub base_url: Url,
    pub reconnect: ReconnectPolicy,
    /// Payload `type` treated as a heartbeat and never dispatched.
    pub heartbeat_type: String,
    /// Number of recently delivered event ids remembered to drop replays.
    pub dedupe_window: usize,
}

impl ChannelConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            reconnect: ReconnectPolicy::default(),
            heartbeat_type: DEFAULT_HEARTBEAT_TYPE.to_string(),
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// `<base>/notifications/stream?token=<token>`, keeping any path prefix
    /// already present on the base url.
    pub fn stream_url(&self, token: &str) -> ChannelResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChannelError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["notifications", "stream"]);
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_appends_path_and_token() {
        let config = ChannelConfig::new(Url::parse("https://api.shop.local/").unwrap());
        let url = config.stream_url("abc").expect("stream url");
        assert_eq!(
            url.as_str(),
            "https://api.shop.local/notifications/stream?token=abc"
        );
    }

    #[test]
    fn stream_url_keeps_prefix_and_escapes_token() {
        let config = ChannelConfig::new(Url::parse("https://api.shop.local/v1").unwrap());
        let url = config.stream_url("a b&c").expect("stream url");
        assert_eq!(url.path(), "/v1/notifications/stream");
        assert_eq!(url.query(), Some("token=a+b%26c"));
    }

    #[test]
    fn stream_url_rejects_opaque_base() {
        let config = ChannelConfig::new(Url::parse("mailto:ops@shop.local").unwrap());
        assert!(matches!(
            config.stream_url("t"),
            Err(ChannelError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn fixed_policy_ignores_attempt() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), DEFAULT_RECONNECT_DELAY);
        assert_eq!(policy.delay_for(9), DEFAULT_RECONNECT_DELAY);
    }

    #[test]
    fn exponential_policy_doubles_until_cap() {
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }
}
