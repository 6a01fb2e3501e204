mod listing;
mod models;
mod normalize;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use super::{PostSource, SourceError};

pub use listing::{ListingError, SubredditListing};
pub use models::{RedditPost, RedditReply};
pub use normalize::normalize;

pub struct RedditClient {
    client: reqwest::Client,
    base_url: String,
}

impl RedditClient {
    pub fn new(user_agent: &str) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        Ok(Self { client, base_url: "https://www.reddit.com".into() })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl PostSource for RedditClient {
    #[instrument(skip_all, fields(listing = %listing))]
    async fn fetch_posts(&self, listing: &SubredditListing) -> Result<Vec<RedditPost>, SourceError> {
        let url = listing.to_url(&self.base_url, true);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        debug!("Got reply for {}: {}", url, res.status());

        match res.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(SourceError::RateLimited),
            StatusCode::NOT_FOUND => return Err(SourceError::NotFound(url)),
            status if !status.is_success() => {
                return Err(SourceError::Transient(format!("got {status} from {url}")))
            }
            _ => {}
        }

        let reply: RedditReply = res
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("bad listing json from {url}: {e}")))?;

        Ok(reply.into_posts())
    }
}
