use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cache::SeenCache;
use crate::routing::Subscriptions;
use crate::sources::reddit::{normalize, RedditPost, SubredditListing};
use crate::sources::{PostSource, SourceError};
use crate::transport::{Transport, TransportError, MEDIA_CHANNEL};

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("seen cache failed: {0}")]
    Cache(#[from] redis::RedisError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Pause between listing fetches, grown while the source throttles us.
#[derive(Clone, Copy, Debug)]
pub struct Pacing {
    pub pause: Duration,
    pub step: Duration,
    pub max: Duration,
}

/// Polls every subscribed listing and publishes posts it has not seen on the media channel.
pub struct Scraper<P, C, S> {
    source: P,
    cache: C,
    subscriptions: S,
    pacing: Pacing,
    pause: Duration,
}

impl<P: PostSource, C: SeenCache, S: Subscriptions> Scraper<P, C, S> {
    pub fn new(source: P, cache: C, subscriptions: S, pacing: Pacing) -> Self {
        Self { source, cache, subscriptions, pacing, pause: pacing.pause }
    }

    pub async fn run(&mut self, transport: &dyn Transport) -> Result<(), ScrapeError> {
        info!("Scraping, pause {:?}", self.pacing.pause);
        loop {
            let published = self.poll_once(transport).await?;
            debug!("Round done, {} new posts", published);
            if published == 0 {
                tokio::time::sleep(self.pacing.pause.max(Duration::from_secs(1))).await;
            }
        }
    }

    /// One pass over all sources. Returns how many posts were published.
    pub async fn poll_once(&mut self, transport: &dyn Transport) -> Result<usize, ScrapeError> {
        let mut published = 0;
        for source_id in self.subscriptions.sources().await {
            let listing = match SubredditListing::from_source_id(&source_id) {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("Skipping source {}: {}", source_id, e);
                    continue;
                }
            };
            let cache_name = format!("cache_{listing}");
            // A listing seen for the first time only fills the cache, or
            // subscribing would flood the chats with a whole page of old posts.
            let first_time = !self.cache.exists(&cache_name).await?;

            let Some(posts) = self.fetch(&listing).await else {
                continue;
            };

            for post in posts {
                if !self.cache.remember(&cache_name, &post.id).await? || first_time {
                    continue;
                }
                let post = normalize(&source_id, &post);
                debug!("New post {}", post.original_url);
                transport.publish(MEDIA_CHANNEL, &serde_json::to_vec(&post).map_err(TransportError::from)?).await?;
                published += 1;
            }
        }
        Ok(published)
    }

    /// Fetch a listing, retrying until it succeeds. `None` if the listing is gone.
    async fn fetch(&mut self, listing: &SubredditListing) -> Option<Vec<RedditPost>> {
        loop {
            tokio::time::sleep(self.pause).await;
            match self.source.fetch_posts(listing).await {
                Ok(posts) => {
                    self.pause = self.pacing.pause;
                    return Some(posts);
                }
                Err(SourceError::RateLimited) => {
                    if self.pause < self.pacing.max {
                        self.pause += self.pacing.step;
                    }
                    warn!("Rate limited on {}, pause is now {:?}", listing, self.pause);
                }
                Err(SourceError::NotFound(url)) => {
                    warn!("Listing {} not found at {}", listing, url);
                    return None;
                }
                Err(e) => error!("Fetching {} failed: {}", listing, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::fakes::MemoryCache;
    use crate::model::Post;
    use crate::transport::fakes::MemoryTransport;

    /// Replies with queued results in order, then with empty pages.
    #[derive(Default)]
    struct FakeSource {
        replies: Mutex<VecDeque<Result<Vec<&'static str>, SourceError>>>,
        fetches: Mutex<usize>,
    }

    impl FakeSource {
        fn reply(&self, result: Result<Vec<&'static str>, SourceError>) {
            self.replies.lock().unwrap().push_back(result);
        }
    }

    fn raw_post(id: &str) -> RedditPost {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "subreddit": "pics",
            "subreddit_name_prefixed": "r/pics",
            "title": format!("post {id}"),
            "permalink": format!("/r/pics/comments/{id}/"),
            "url": format!("https://i.redd.it/{id}.jpg"),
        }))
        .unwrap()
    }

    #[async_trait]
    impl PostSource for FakeSource {
        async fn fetch_posts(&self, _listing: &SubredditListing) -> Result<Vec<RedditPost>, SourceError> {
            *self.fetches.lock().unwrap() += 1;
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(vec![]));
            reply.map(|ids| ids.into_iter().map(raw_post).collect())
        }
    }

    struct OneSource(&'static str);

    #[async_trait]
    impl Subscriptions for OneSource {
        async fn sources(&self) -> Vec<String> {
            vec![self.0.to_string()]
        }

        async fn destinations(&self, _source_id: &str) -> HashMap<String, Vec<String>> {
            HashMap::new()
        }
    }

    fn pacing() -> Pacing {
        Pacing { pause: Duration::ZERO, step: Duration::from_millis(1), max: Duration::from_millis(3) }
    }

    fn scraper(source: FakeSource, source_id: &'static str) -> Scraper<FakeSource, MemoryCache, OneSource> {
        Scraper::new(source, MemoryCache::default(), OneSource(source_id), pacing())
    }

    #[tokio::test]
    async fn first_round_only_fills_the_cache() {
        let source = FakeSource::default();
        source.reply(Ok(vec!["a", "b"]));
        source.reply(Ok(vec!["c", "a", "b"]));
        let mut scraper = scraper(source, "reddit@pics#hot#");
        let transport = MemoryTransport::default();

        assert_eq!(scraper.poll_once(&transport).await.unwrap(), 0);
        assert_eq!(scraper.poll_once(&transport).await.unwrap(), 1);

        let published: Vec<(String, Post)> = transport.published_json();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, MEDIA_CHANNEL);
        assert_eq!(published[0].1.source_id, "reddit@pics#hot#");
        assert_eq!(published[0].1.original_url, "https://reddit.com/r/pics/comments/c/");
        assert_eq!(published[0].1.text.as_deref(), Some("post c"));
    }

    #[tokio::test]
    async fn throttling_grows_pause_until_success() {
        let source = FakeSource::default();
        for _ in 0..5 {
            source.reply(Err(SourceError::RateLimited));
        }
        source.reply(Ok(vec!["a"]));
        let mut scraper = scraper(source, "reddit@pics#hot#");

        scraper.poll_once(&MemoryTransport::default()).await.unwrap();

        assert_eq!(*scraper.source.fetches.lock().unwrap(), 6);
        assert_eq!(scraper.pause, Duration::ZERO);
    }

    #[tokio::test]
    async fn pause_is_capped() {
        let source = FakeSource::default();
        let mut scraper = scraper(source, "reddit@pics#hot#");
        let listing = SubredditListing::from_source_id("reddit@pics#hot#").unwrap();
        for _ in 0..5 {
            scraper.source.reply(Err(SourceError::RateLimited));
        }
        scraper.source.reply(Err(SourceError::NotFound("gone".into())));

        assert!(scraper.fetch(&listing).await.is_none());
        assert_eq!(scraper.pause, Duration::from_millis(3));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_and_bad_ids_skipped() {
        let source = FakeSource::default();
        source.reply(Err(SourceError::Transient("503".into())));
        source.reply(Ok(vec!["a"]));
        let mut pics = scraper(source, "reddit@pics#hot#");
        pics.poll_once(&MemoryTransport::default()).await.unwrap();
        assert_eq!(*pics.source.fetches.lock().unwrap(), 2);

        let mut broken = scraper(FakeSource::default(), "tumblr@123");
        assert_eq!(broken.poll_once(&MemoryTransport::default()).await.unwrap(), 0);
        assert_eq!(*broken.source.fetches.lock().unwrap(), 0);
    }
}
