//! Message bus between the scraper, the router and the messengers.
//!
//! Two backends with different guarantees sit behind [`Transport`]:
//! [`BroadcastTransport`] (redis pub/sub, at most once, lost without listeners) and
//! [`DurableTransport`] (redis streams, at least once, removed on ack). Code written
//! against the trait may assume neither more than at-least-once nor exactly-once.

mod broadcast;
mod durable;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use broadcast::BroadcastTransport;
pub use durable::DurableTransport;

/// Normalized posts from the scraper.
pub const MEDIA_CHANNEL: &str = "media";

/// Outbound messages for one telegram bot.
pub fn telegram_channel(bot_id: &str) -> String {
    format!("telegram_{bot_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One message read from the bus.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub channel: String,
    /// Set by backends that need an ack to drop the message.
    pub ack_token: Option<String>,
    pub payload: Vec<u8>,
}

pub type Subscription = BoxStream<'static, Result<Delivery, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Messages from all `channels`, each channel in the order the backend hands them out.
    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, TransportError>;

    /// Mark a delivery processed. No-op for deliveries without a token.
    async fn ack(&self, channel: &str, ack_token: Option<&str>) -> Result<(), TransportError>;
}

/// Linear back-off between unaccepted publishes: 1s, 2s, ... up to 30s.
pub const PUBLISH_BACKOFF_STEP: Duration = Duration::from_secs(1);
pub const MAX_PUBLISH_BACKOFF: Duration = Duration::from_secs(30);

pub fn next_backoff(current: Duration, step: Duration) -> Duration {
    (current + step).min(MAX_PUBLISH_BACKOFF)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_and_caps() {
        let mut delay = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..35 {
            delay = next_backoff(delay, PUBLISH_BACKOFF_STEP);
            seen.push(delay.as_secs());
        }
        assert_eq!(&seen[..3], &[1, 2, 3]);
        assert_eq!(seen[29], 30);
        assert!(seen[29..].iter().all(|s| *s == 30));
    }

    #[test]
    fn channel_names() {
        assert_eq!(telegram_channel("12345"), "telegram_12345");
        assert_eq!(MEDIA_CHANNEL, "media");
    }
}
