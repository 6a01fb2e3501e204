//! Fan-out of outbound messages to telegram chats.
//!
//! One chat, the leader, gets the real send. Everybody else gets a `copyMessage` of the
//! leader's message, so a video is sized, remuxed and uploaded once per post rather than
//! once per chat. Media groups can't be copied and go to every chat separately.

mod merge;
mod strategy;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::model::{MediaItem, OutboundMessage, Post};
use crate::telegram::{InputFile, InputMedia, MessageId, TelegramError};
use crate::transport::{Transport, TransportError};

pub use merge::{Remuxer, MERGE_TIMEOUT};
pub use strategy::{ContentProbe, DeliveryStrategy, HttpProbe, StrategyResolver};

/// Telegram's cap on items in one media group.
pub const MEDIA_GROUP_LIMIT: usize = 10;

/// Failure to prepare a media item. The item is skipped, the post goes on.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("failed to get content size of {url}: {reason}")]
    ContentSize { url: String, reason: String },
    #[error("remux failed: {0}")]
    Remux(String),
    #[error("remux timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Merger: Send + Sync {
    /// Remux `video_url` (and `audio_url`, cut to the shorter stream) into one file.
    async fn merge(&self, video_url: &str, audio_url: Option<&str>) -> Result<Vec<u8>, ProcessingError>;
}

/// The chat platform calls the messenger needs.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<MessageId, TelegramError>;
    async fn send_photo(&self, chat_id: &str, photo: InputFile, caption: &str) -> Result<MessageId, TelegramError>;
    async fn send_video(&self, chat_id: &str, video: InputFile, caption: &str) -> Result<MessageId, TelegramError>;
    async fn send_media_group(&self, chat_id: &str, media: &[InputMedia]) -> Result<Vec<MessageId>, TelegramError>;
    async fn copy_message(&self, chat_id: &str, from_chat_id: &str, message_id: i64) -> Result<MessageId, TelegramError>;
}

pub struct Messenger<D> {
    destination: D,
    resolver: StrategyResolver,
}

impl<D: Destination> Messenger<D> {
    pub fn new(destination: D, resolver: StrategyResolver) -> Self {
        Self { destination, resolver }
    }

    /// Consume `channel` forever, delivering and then acking each message in order.
    pub async fn serve(&self, transport: &dyn Transport, channel: &str) -> Result<(), TransportError> {
        let mut messages = transport.subscribe(&[channel]).await?;
        info!("Listening for outbound messages on {}", channel);

        while let Some(delivery) = messages.next().await {
            let delivery = delivery?;
            match serde_json::from_slice::<OutboundMessage>(&delivery.payload) {
                Ok(message) => {
                    debug!("Got new message {:?}", message);
                    self.deliver(&message).await;
                }
                Err(e) => warn!("Dropping malformed message on {}: {}", delivery.channel, e),
            }
            transport.ack(&delivery.channel, delivery.ack_token.as_deref()).await?;
        }
        Ok(())
    }

    /// Deliver one message to all its chats. Never fails: errors are logged and end
    /// processing of this message only.
    pub async fn deliver(&self, message: &OutboundMessage) {
        if let Err(e) = self.try_deliver(message).await {
            error!("Could not process the post: {}", e);
        }
    }

    async fn try_deliver(&self, message: &OutboundMessage) -> Result<(), TelegramError> {
        let chats = &message.conversation_ids;

        if let Some(text) = &message.text {
            for chat_id in chats {
                skip_chat(chat_id, "text", self.destination.send_text(chat_id, text).await)?;
            }
        }

        let Some(post) = &message.post else {
            return Ok(());
        };
        let caption = caption(post);

        if let Some(images) = post.images.as_deref().filter(|images| images.len() > 1) {
            let media = media_group(images, &caption);
            // copyMessage does not work with media groups
            for chat_id in chats {
                skip_chat(chat_id, "media group", self.destination.send_media_group(chat_id, &media).await)?;
            }
            return Ok(());
        }

        let Some((leader, rest)) = chats.split_first() else {
            return Ok(());
        };
        let Some(sent) = self.send_leader(leader, post, &caption).await? else {
            return Ok(());
        };
        for chat_id in rest {
            let copied = self.destination.copy_message(chat_id, leader, sent.message_id).await;
            skip_chat(chat_id, "copy", copied)?;
        }
        Ok(())
    }

    /// Send the post's media to the leader chat. `None` if there was nothing to send or the
    /// leader refused it; the post then goes nowhere.
    async fn send_leader(&self, chat_id: &str, post: &Post, caption: &str) -> Result<Option<MessageId>, TelegramError> {
        let sent = if let Some(video) = post.videos.as_ref().and_then(|videos| videos.first()) {
            let caption = video.caption.as_deref().unwrap_or(caption);
            let file = match self.resolver.resolve(video).await {
                Ok(DeliveryStrategy::ByReference(url)) => InputFile::Url(url),
                Ok(DeliveryStrategy::ByUpload(bytes)) => InputFile::Bytes(bytes),
                Ok(DeliveryStrategy::Unavailable) => {
                    warn!("No video of {} fits telegram limits, skipping", post.original_url);
                    return Ok(None);
                }
                Err(e) => {
                    warn!("Skipping video of {}: {}", post.original_url, e);
                    return Ok(None);
                }
            };
            self.destination.send_video(chat_id, file, caption).await
        } else if let Some([image]) = post.images.as_deref() {
            let Some(url) = image.best_url() else {
                return Ok(None);
            };
            let caption = image.caption.as_deref().unwrap_or(caption);
            self.destination.send_photo(chat_id, InputFile::Url(url.to_string()), caption).await
        } else {
            self.destination.send_text(chat_id, caption).await
        };

        skip_chat(chat_id, "post", sent)
    }
}

/// Swallow errors that only concern `chat_id`; anything else aborts the message.
fn skip_chat<T>(chat_id: &str, what: &str, result: Result<T, TelegramError>) -> Result<Option<T>, TelegramError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_per_destination() => {
            warn!("Could not send {} to chat {}: {}", what, chat_id, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// At most [`MEDIA_GROUP_LIMIT`] photos, randomly picked when there are more.
fn media_group(images: &[MediaItem], caption: &str) -> Vec<InputMedia> {
    let picked: Vec<&MediaItem> = if images.len() > MEDIA_GROUP_LIMIT {
        images.choose_multiple(&mut rand::thread_rng(), MEDIA_GROUP_LIMIT).collect()
    } else {
        images.iter().collect()
    };

    picked
        .into_iter()
        .filter_map(|image| {
            let url = image.best_url()?.to_string();
            let caption = image.caption.clone().unwrap_or_else(|| caption.to_string());
            Some(InputMedia::photo(url, caption))
        })
        .collect()
}

/// `<a href="permalink">r/sub</a>: <a href="url">title</a>` in telegram HTML.
pub fn caption(post: &Post) -> String {
    let source = post.source_text.as_deref().unwrap_or(&post.source_id);
    let url = post.url.as_deref().unwrap_or(&post.original_url);
    let text = post.text.as_deref().filter(|t| !t.is_empty()).unwrap_or("...");
    format!(
        r#"<a href="{}">{}</a>: <a href="{}">{}</a>"#,
        escape_html(&post.original_url),
        escape_html(source),
        escape_html(url),
        escape_html(text)
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Sizes by url; unknown urls fail to probe.
    pub struct FakeProbe(HashMap<String, u64>);

    impl FakeProbe {
        pub fn new(sizes: &[(&str, u64)]) -> Self {
            Self(sizes.iter().map(|(url, size)| (url.to_string(), *size)).collect())
        }
    }

    #[async_trait]
    impl ContentProbe for FakeProbe {
        async fn content_size(&self, url: &str) -> Result<u64, ProcessingError> {
            self.0.get(url).copied().ok_or_else(|| ProcessingError::ContentSize {
                url: url.to_string(),
                reason: "not found".into(),
            })
        }
    }

    /// Returns `merged <video url>` and remembers its calls.
    #[derive(Clone, Default)]
    pub struct FakeMerger {
        calls: Arc<Mutex<Vec<(String, Option<String>)>>>,
        fail: bool,
    }

    impl FakeMerger {
        pub fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        pub fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Merger for FakeMerger {
        async fn merge(&self, video_url: &str, audio_url: Option<&str>) -> Result<Vec<u8>, ProcessingError> {
            self.calls
                .lock()
                .unwrap()
                .push((video_url.to_string(), audio_url.map(str::to_string)));
            if self.fail {
                return Err(ProcessingError::Remux("exit status: 1".into()));
            }
            Ok(format!("merged {video_url}").into_bytes())
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        Text { chat: String, text: String },
        Photo { chat: String, url: String, caption: String },
        VideoUrl { chat: String, url: String },
        VideoBytes { chat: String, bytes: Vec<u8> },
        Group { chat: String, media: Vec<InputMedia> },
        Copy { chat: String, from: String, message_id: i64 },
    }

    impl Call {
        pub fn chat(&self) -> &str {
            match self {
                Self::Text { chat, .. }
                | Self::Photo { chat, .. }
                | Self::VideoUrl { chat, .. }
                | Self::VideoBytes { chat, .. }
                | Self::Group { chat, .. }
                | Self::Copy { chat, .. } => chat,
            }
        }
    }

    /// Records calls. `fail_for` maps a chat id to the error every call to it returns.
    #[derive(Clone, Default)]
    pub struct FakeDestination {
        calls: Arc<Mutex<Vec<Call>>>,
        failures: Arc<Mutex<HashMap<String, fn() -> TelegramError>>>,
    }

    impl FakeDestination {
        pub fn fail_for(&self, chat: &str, error: fn() -> TelegramError) {
            self.failures.lock().unwrap().insert(chat.to_string(), error);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> Result<MessageId, TelegramError> {
            let chat = call.chat().to_string();
            let mut calls = self.calls.lock().unwrap();
            calls.push(call);
            if let Some(error) = self.failures.lock().unwrap().get(&chat) {
                return Err(error());
            }
            Ok(MessageId { message_id: 100 + calls.len() as i64 })
        }
    }

    #[async_trait]
    impl Destination for FakeDestination {
        async fn send_text(&self, chat_id: &str, text: &str) -> Result<MessageId, TelegramError> {
            self.record(Call::Text { chat: chat_id.into(), text: text.into() })
        }

        async fn send_photo(&self, chat_id: &str, photo: InputFile, caption: &str) -> Result<MessageId, TelegramError> {
            let InputFile::Url(url) = photo else {
                panic!("photos are always sent by url");
            };
            self.record(Call::Photo { chat: chat_id.into(), url, caption: caption.into() })
        }

        async fn send_video(&self, chat_id: &str, video: InputFile, _caption: &str) -> Result<MessageId, TelegramError> {
            match video {
                InputFile::Url(url) => self.record(Call::VideoUrl { chat: chat_id.into(), url }),
                InputFile::Bytes(bytes) => self.record(Call::VideoBytes { chat: chat_id.into(), bytes }),
            }
        }

        async fn send_media_group(&self, chat_id: &str, media: &[InputMedia]) -> Result<Vec<MessageId>, TelegramError> {
            let id = self.record(Call::Group { chat: chat_id.into(), media: media.to_vec() })?;
            Ok(vec![id])
        }

        async fn copy_message(&self, chat_id: &str, from_chat_id: &str, message_id: i64) -> Result<MessageId, TelegramError> {
            self.record(Call::Copy { chat: chat_id.into(), from: from_chat_id.into(), message_id })
        }
    }
}
