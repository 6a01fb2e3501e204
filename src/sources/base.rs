use async_trait::async_trait;

use super::reddit::{RedditPost, SubredditListing};

/// Errors a source fetch can end with.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Source asked us to slow down. The scraper grows its pause.
    #[error("too many requests")]
    RateLimited,
    #[error("listing not found: {0}")]
    NotFound(String),
    /// Anything else. Logged and retried by the scraper loop.
    #[error("source request failed: {0}")]
    Transient(String),
}

/// Something the scraper can poll for posts.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Fetch the current first page of a listing.
    /// Returns an empty vec if the listing has no children.
    async fn fetch_posts(&self, listing: &SubredditListing) -> Result<Vec<RedditPost>, SourceError>;
}
