use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{next_backoff, Delivery, Subscription, Transport, TransportError, PUBLISH_BACKOFF_STEP};

/// Redis pub/sub. Nothing is stored: a message published while nobody listens is gone.
#[derive(Clone)]
pub struct BroadcastTransport {
    client: redis::Client,
    conn: ConnectionManager,
    verify_accepted: bool,
}

impl std::fmt::Debug for BroadcastTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastTransport")
            .field("verify_accepted", &self.verify_accepted)
            .finish()
    }
}

impl BroadcastTransport {
    pub async fn connect(redis_url: &str) -> Result<Self, TransportError> {
        info!("Connecting to redis pub/sub at {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn, verify_accepted: false })
    }

    /// Retry a publish until at least one subscriber received it. That only proves somebody
    /// listened at the time, not that the message got processed.
    pub fn verify_accepted(mut self, verify: bool) -> Self {
        self.verify_accepted = verify;
        self
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        let conn = self.conn.clone();
        publish_until_accepted(channel, self.verify_accepted, PUBLISH_BACKOFF_STEP, || {
            let mut conn = conn.clone();
            async move {
                let receivers: i64 = conn.publish(channel, payload).await?;
                debug!("Published {} bytes to {}, {} receivers", payload.len(), channel, receivers);
                Ok(receivers)
            }
        })
        .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, TransportError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }
        info!("Subscribed to {:?}", channels);

        let messages = pubsub.into_on_message().map(|msg| {
            Ok(Delivery {
                channel: msg.get_channel_name().to_string(),
                ack_token: None,
                payload: msg.get_payload_bytes().to_vec(),
            })
        });
        Ok(messages.boxed())
    }

    async fn ack(&self, _channel: &str, _ack_token: Option<&str>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Run `attempt` until it reports at least one receiver, or once if `verify` is off.
/// Returns how many attempts were made.
async fn publish_until_accepted<F, Fut>(
    channel: &str,
    verify: bool,
    step: Duration,
    mut attempt: F,
) -> Result<usize, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<i64, TransportError>>,
{
    let mut delay = Duration::ZERO;
    let mut attempts = 0;
    loop {
        let receivers = attempt().await?;
        attempts += 1;
        if !verify || receivers > 0 {
            return Ok(attempts);
        }
        delay = next_backoff(delay, step);
        warn!("No one accepted a message for channel {}, retrying in {:?}", channel, delay);
        tokio::time::sleep(delay).await;
    }
}
