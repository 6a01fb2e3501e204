use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use tracing::{debug, warn};

use super::{Merger, ProcessingError};
use crate::model::MediaItem;

/// Largest file telegram fetches by url on its own.
pub const MAX_URL_SIZE: u64 = 20 * 1024 * 1000;
/// Largest multipart upload the bot api accepts.
pub const MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1000;

/// How one video item reaches telegram. Computed per delivery, never cached.
pub enum DeliveryStrategy {
    ByReference(String),
    ByUpload(Vec<u8>),
    Unavailable,
}

impl std::fmt::Debug for DeliveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByReference(url) => f.debug_tuple("ByReference").field(url).finish(),
            Self::ByUpload(bytes) => write!(f, "ByUpload({} bytes)", bytes.len()),
            Self::Unavailable => f.write_str("Unavailable"),
        }
    }
}

#[async_trait]
pub trait ContentProbe: Send + Sync {
    /// Byte size of the resource behind `url`, without downloading it.
    async fn content_size(&self, url: &str) -> Result<u64, ProcessingError>;
}

/// Sizes from `HEAD` requests.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContentProbe for HttpProbe {
    async fn content_size(&self, url: &str) -> Result<u64, ProcessingError> {
        let head = self.client.head(url).send().await.map_err(|e| ProcessingError::ContentSize {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = head.status().as_u16();
        let size = content_length(head.headers());
        debug!("Got head for {}, {}, {:?}", url, status, size);

        if status > 204 {
            return Err(ProcessingError::ContentSize {
                url: url.to_string(),
                reason: format!("unexpected status code {status}"),
            });
        }
        Ok(size.unwrap_or(0))
    }
}

/// `Response::content_length` reports the (empty) body for HEAD, so read the header.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

pub struct StrategyResolver {
    probe: Box<dyn ContentProbe>,
    merger: Box<dyn Merger>,
}

impl StrategyResolver {
    pub fn new(probe: impl ContentProbe + 'static, merger: impl Merger + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            merger: Box::new(merger),
        }
    }

    /// Pick the best candidate of a video item that fits a telegram limit.
    ///
    /// Candidates are tried from the last (best) one down. Without audio a candidate under
    /// [`MAX_URL_SIZE`] is passed by url; otherwise a candidate whose size plus the audio
    /// size is under [`MAX_UPLOAD_SIZE`] is remuxed and uploaded. A failed audio probe
    /// only mutes the video; a failed candidate probe or remux is an error.
    pub async fn resolve(&self, item: &MediaItem) -> Result<DeliveryStrategy, ProcessingError> {
        debug!("Will look for suitable video in {:?}", item.urls);

        let audio = match &item.audio {
            Some(url) => match self.probe.content_size(url).await {
                // Sized 0 when the server sends no Content-Length: nothing to merge.
                Ok(0) => {
                    debug!("Audio {} has no size, ignoring it", url);
                    None
                }
                Ok(size) => {
                    debug!("Audio size is {}", size);
                    Some((url.as_str(), size))
                }
                Err(e) => {
                    warn!("Ignoring audio channel: {}", e);
                    None
                }
            },
            None => None,
        };

        for candidate in item.urls.iter().rev() {
            let size = self.probe.content_size(candidate).await?;
            debug!("Candidate {} size is {}", candidate, size);

            if audio.is_none() && size < MAX_URL_SIZE {
                return Ok(DeliveryStrategy::ByReference(candidate.clone()));
            }

            let audio_size = audio.map_or(0, |(_, size)| size);
            if size.saturating_add(audio_size) < MAX_UPLOAD_SIZE {
                let bytes = self.merger.merge(candidate, audio.map(|(url, _)| url)).await?;
                return Ok(DeliveryStrategy::ByUpload(bytes));
            }
        }

        warn!("Could not find suitable video/audio among {} candidates", item.urls.len());
        Ok(DeliveryStrategy::Unavailable)
    }
}
