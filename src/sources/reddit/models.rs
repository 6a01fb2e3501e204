//! Raw reddit listing JSON.
//!
//! Only the fields the normalizer looks at are declared. Optional sub-structures are
//! parsed leniently: a malformed `preview`, `media` or gallery block becomes `None`,
//! and a child that does not parse at all is dropped, instead of failing the whole listing.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::warn;

const LINK_KIND: &str = "t3";

#[derive(Clone, Debug, Deserialize)]
pub struct RedditReply {
    pub data: Listing,
}

impl RedditReply {
    /// Link posts of the page. Other kinds of children are dropped.
    pub fn into_posts(self) -> Vec<RedditPost> {
        self.data
            .children
            .into_iter()
            .filter(|item| item.kind == LINK_KIND)
            .map(|item| item.data)
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Listing {
    #[serde(default, deserialize_with = "lenient_list")]
    pub children: Vec<Item>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Item {
    pub kind: String,
    pub data: RedditPost,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedditPost {
    pub id: String,
    pub subreddit: String,
    pub subreddit_name_prefixed: Option<String>,
    pub title: Option<String>,
    pub permalink: String,
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub preview: Option<Preview>,
    #[serde(default, deserialize_with = "lenient")]
    pub media: Option<Media>,
    #[serde(default, deserialize_with = "lenient")]
    pub media_metadata: Option<HashMap<String, MediaMetadata>>,
    #[serde(default, deserialize_with = "lenient")]
    pub gallery_data: Option<GalleryData>,
    #[serde(default, deserialize_with = "lenient")]
    pub crosspost_parent_list: Option<Vec<RedditPost>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MediaMetadata {
    /// Kind of the entry: `Image`, `AnimatedImage`, `RedditVideo`...
    pub e: Option<String>,
    /// Full size representation.
    pub s: Option<MetadataSource>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MetadataSource {
    pub u: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GalleryData {
    #[serde(default)]
    pub items: Vec<GalleryItem>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GalleryItem {
    pub media_id: String,
    pub caption: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedditVideo {
    pub fallback_url: String,
    #[serde(default)]
    pub is_gif: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Preview {
    #[serde(default)]
    pub images: Vec<PreviewImage>,
    pub reddit_video_preview: Option<RedditVideo>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PreviewImage {
    pub source: Option<ImageRef>,
    pub variants: Option<PreviewVariants>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PreviewVariants {
    pub gif: Option<VariantSet>,
    pub mp4: Option<VariantSet>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VariantSet {
    pub source: Option<ImageRef>,
    #[serde(default)]
    pub resolutions: Vec<ImageRef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Media {
    pub reddit_video: Option<RedditVideo>,
    pub oembed: Option<Embed>,
    /// Embed provider, e.g. `youtube.com`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Embed {
    pub thumbnail_url: Option<String>,
}

/// Drops the entries that fail to parse instead of failing the whole list.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    let total = values.len();
    let parsed: Vec<T> = values.into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect();
    if parsed.len() < total {
        warn!("Dropped {} malformed listing entries", total - parsed.len());
    }
    Ok(parsed)
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}
