use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{Delivery, Subscription, Transport, TransportError};

const PAYLOAD_FIELD: &str = "payload";
const BUFFER: usize = 16;

/// Redis streams with a consumer group: one durable queue per channel.
///
/// An entry stays in the stream until it is acked. Entries handed to this consumer and
/// never acked are handed out again on the next subscribe.
#[derive(Clone)]
pub struct DurableTransport {
    client: redis::Client,
    conn: ConnectionManager,
    group: String,
    consumer: String,
    poll_interval: Duration,
}

impl std::fmt::Debug for DurableTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTransport")
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl DurableTransport {
    pub async fn connect(redis_url: &str, group: &str, consumer: &str) -> Result<Self, TransportError> {
        info!("Connecting to redis streams at {} as {}/{}", redis_url, group, consumer);
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            group: group.to_string(),
            consumer: consumer.to_string(),
            poll_interval: Duration::from_secs(1),
        })
    }

    async fn ensure_group(&self, stream: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        // From "0" so entries published before the group existed are not lost.
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, &self.group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Transport for DurableTransport {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(channel, "*", &[(PAYLOAD_FIELD, payload)]).await?;
        debug!("Queued {} bytes on {} as {}", payload.len(), channel, id);
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(BUFFER);

        for channel in channels {
            self.ensure_group(channel).await?;
            let consumer = StreamConsumer {
                conn: self.client.get_multiplexed_async_connection().await?,
                stream: channel.to_string(),
                group: self.group.clone(),
                consumer: self.consumer.clone(),
                poll_interval: self.poll_interval,
            };
            tokio::spawn(consumer.run(tx.clone()));
        }
        info!("Consuming {:?} as {}/{}", channels, self.group, self.consumer);

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn ack(&self, channel: &str, ack_token: Option<&str>) -> Result<(), TransportError> {
        let Some(id) = ack_token else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(channel, &self.group, &[id]).await?;
        let _: i64 = conn.xdel(channel, &[id]).await?;
        debug!("Acked {} on {}", id, channel);
        Ok(())
    }
}

/// Read position in a stream: this consumer's pending entries after an id, then new ones.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Cursor {
    Pending(String),
    New,
}

impl Cursor {
    fn id(&self) -> &str {
        match self {
            Self::Pending(id) => id,
            Self::New => ">",
        }
    }

    /// Move past a batch just read. An empty pending batch means the backlog is drained.
    fn advance(self, batch: &[Delivery]) -> Self {
        match self {
            Self::New => Self::New,
            Self::Pending(_) if batch.is_empty() => Self::New,
            Self::Pending(id) => Self::Pending(batch.last().and_then(|d| d.ack_token.clone()).unwrap_or(id)),
        }
    }
}

/// Reads one stream into the shared subscription buffer.
struct StreamConsumer {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    poll_interval: Duration,
}

impl StreamConsumer {
    async fn run(mut self, tx: mpsc::Sender<Result<Delivery, TransportError>>) {
        let mut cursor = Cursor::Pending("0".to_string());
        while !tx.is_closed() {
            let entries = match self.read(cursor.id()).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Reading {} failed: {}", self.stream, e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let idle = entries.is_empty() && cursor == Cursor::New;
            if entries.is_empty() && cursor != Cursor::New {
                debug!("No more pending entries on {}", self.stream);
            }
            cursor = cursor.advance(&entries);
            if idle {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            for delivery in entries {
                if tx.send(Ok(delivery)).await.is_err() {
                    break;
                }
            }
        }
        debug!("Subscription to {} dropped", self.stream);
    }

    async fn read(&mut self, cursor: &str) -> Result<Vec<Delivery>, TransportError> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(BUFFER);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.stream.as_str()], &[cursor], &opts)
            .await?;

        let mut deliveries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                // Missing payload still goes out so the reader can drop and ack it.
                let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();
                deliveries.push(Delivery {
                    channel: key.key.clone(),
                    ack_token: Some(entry.id),
                    payload,
                });
            }
        }
        Ok(deliveries)
    }
}
