use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::SubscriptionConfig;
use crate::model::{OutboundMessage, Post};
use crate::sources::reddit::{ListingError, SubredditListing};
use crate::transport::{Transport, TransportError, MEDIA_CHANNEL};

/// Who wants which source.
#[async_trait]
pub trait Subscriptions: Send + Sync {
    /// Source ids with at least one subscriber.
    async fn sources(&self) -> Vec<String>;

    /// Subscribed chats of `source_id`, grouped by the bus channel of their bot.
    async fn destinations(&self, source_id: &str) -> HashMap<String, Vec<String>>;
}

/// Subscriptions from the config file, all served by one bot.
#[derive(Debug)]
pub struct StaticSubscriptions {
    channel: String,
    chats: BTreeMap<String, Vec<String>>,
}

impl StaticSubscriptions {
    pub fn new(channel: impl Into<String>, subscriptions: &[SubscriptionConfig]) -> Result<Self, ListingError> {
        let mut chats: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sub in subscriptions {
            let source_id = SubredditListing::from_url(&sub.listing)?.source_id();
            let subscribed = chats.entry(source_id).or_default();
            for chat in &sub.chats {
                if !subscribed.contains(chat) {
                    subscribed.push(chat.clone());
                }
            }
        }
        Ok(Self { channel: channel.into(), chats })
    }
}

#[async_trait]
impl Subscriptions for StaticSubscriptions {
    async fn sources(&self) -> Vec<String> {
        self.chats.keys().cloned().collect()
    }

    async fn destinations(&self, source_id: &str) -> HashMap<String, Vec<String>> {
        match self.chats.get(source_id) {
            Some(chats) if !chats.is_empty() => HashMap::from([(self.channel.clone(), chats.clone())]),
            _ => HashMap::new(),
        }
    }
}

/// Turns posts on the media channel into outbound messages for the bots.
pub struct Router<S> {
    subscriptions: S,
}

impl<S: Subscriptions> Router<S> {
    pub fn new(subscriptions: S) -> Self {
        Self { subscriptions }
    }

    pub async fn serve(&self, transport: &dyn Transport) -> Result<(), TransportError> {
        let mut posts = transport.subscribe(&[MEDIA_CHANNEL]).await?;
        info!("Routing posts from {}", MEDIA_CHANNEL);

        while let Some(delivery) = posts.next().await {
            let delivery = delivery?;
            match serde_json::from_slice::<Post>(&delivery.payload) {
                Ok(post) => self.route(transport, &post).await?,
                Err(e) => warn!("Dropping malformed post: {}", e),
            }
            transport.ack(&delivery.channel, delivery.ack_token.as_deref()).await?;
        }
        Ok(())
    }

    /// Publish one outbound message per bot subscribed to the post's source.
    pub async fn route(&self, transport: &dyn Transport, post: &Post) -> Result<(), TransportError> {
        let destinations = self.subscriptions.destinations(&post.source_id).await;
        if destinations.is_empty() {
            debug!("Nobody subscribed to {}", post.source_id);
            return Ok(());
        }

        for (channel, conversation_ids) in destinations {
            debug!("Routing {} to {} chats on {}", post.original_url, conversation_ids.len(), channel);
            let message = OutboundMessage {
                conversation_ids,
                post: Some(post.clone()),
                text: None,
            };
            transport.publish(&channel, &serde_json::to_vec(&message)?).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fakes::MemoryTransport;

    fn subscriptions() -> StaticSubscriptions {
        StaticSubscriptions::new(
            "telegram_123",
            &[
                SubscriptionConfig {
                    listing: "https://www.reddit.com/r/pics/top/?t=day".into(),
                    chats: vec!["1".into(), "2".into()],
                },
                SubscriptionConfig {
                    listing: "https://reddit.com/r/pics/top?t=day".into(),
                    chats: vec!["2".into(), "3".into()],
                },
                SubscriptionConfig {
                    listing: "https://www.reddit.com/r/aww/".into(),
                    chats: vec!["4".into()],
                },
            ],
        )
        .unwrap()
    }

    fn post(source_id: &str) -> Post {
        Post {
            source_id: source_id.into(),
            source_text: Some("r/pics".into()),
            original_url: "https://reddit.com/r/pics/comments/abc/".into(),
            text: Some("title".into()),
            url: None,
            images: None,
            videos: None,
        }
    }

    #[tokio::test]
    async fn merges_duplicate_listings() {
        let subs = subscriptions();
        assert_eq!(subs.sources().await, vec!["reddit@aww#hot#", "reddit@pics#top#day"]);
        assert_eq!(
            subs.destinations("reddit@pics#top#day").await,
            HashMap::from([("telegram_123".to_string(), vec!["1".to_string(), "2".into(), "3".into()])])
        );
        assert!(subs.destinations("reddit@nope#hot#").await.is_empty());
    }

    #[test]
    fn rejects_foreign_urls() {
        let bad = SubscriptionConfig { listing: "https://example.com/r/pics/".into(), chats: vec![] };
        assert!(matches!(
            StaticSubscriptions::new("telegram_123", &[bad]),
            Err(ListingError::BadHost(_))
        ));
    }

    #[tokio::test]
    async fn routes_and_acks() {
        let transport = MemoryTransport::default();
        let aww = serde_json::to_vec(&post("reddit@aww#hot#")).unwrap();
        let nobody = serde_json::to_vec(&post("reddit@nope#hot#")).unwrap();
        transport.queue(MEDIA_CHANNEL, Some("1-0"), &aww);
        transport.queue(MEDIA_CHANNEL, Some("2-0"), b"not json");
        transport.queue(MEDIA_CHANNEL, Some("3-0"), &nobody);

        Router::new(subscriptions()).serve(&transport).await.unwrap();

        let published: Vec<(String, OutboundMessage)> = transport.published_json();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "telegram_123");
        assert_eq!(published[0].1.conversation_ids, vec!["4"]);
        assert_eq!(published[0].1.post.as_ref().unwrap().source_id, "reddit@aww#hot#");

        let acked: Vec<Option<String>> = transport.acked().into_iter().map(|(_, token)| token).collect();
        assert_eq!(acked, vec![Some("1-0".into()), Some("2-0".into()), Some("3-0".into())]);
    }
}
