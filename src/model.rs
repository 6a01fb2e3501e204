use serde::{Deserialize, Serialize};

/// Normalized post, as published on the `media` channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Subscription source id, e.g. `reddit@pics#top#day`.
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
    pub original_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Never `Some` of an empty vec, and never set together with `videos`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<MediaItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videos: Option<Vec<MediaItem>>,
}

/// One image or video with its candidate urls.
/// `urls` is ascending by preference: the last one is the best quality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

impl MediaItem {
    pub fn single(url: String) -> Self {
        Self { urls: vec![url], caption: None, audio: None }
    }

    /// Most preferred candidate.
    pub fn best_url(&self) -> Option<&str> {
        self.urls.last().map(String::as_str)
    }
}

/// What the router hands to a messenger: one post or text for a list of chats.
/// The first conversation is the fan-out leader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub conversation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Post>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
