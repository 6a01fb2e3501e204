use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::delivery::Destination;

const PARSE_MODE: &str = "HTML";

/// Bot API errors, split by how the messenger reacts to them.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Bot was kicked, blocked or never added.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("telegram api error ({code}): {description}")]
    Api { code: u16, description: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TelegramError {
    fn from_status(code: u16, description: String) -> Self {
        match code {
            413 => Self::PayloadTooLarge(description),
            400 if description.to_lowercase().contains("too big") => Self::PayloadTooLarge(description),
            400 => Self::BadRequest(description),
            403 => Self::Forbidden(description),
            _ => Self::Api { code, description },
        }
    }

    /// Errors that only concern one chat; delivery to the others goes on.
    pub fn is_per_destination(&self) -> bool {
        matches!(self, Self::BadRequest(_) | Self::Forbidden(_) | Self::PayloadTooLarge(_))
    }
}

/// Media to send: a url telegram fetches itself, or bytes we upload.
pub enum InputFile {
    Url(String),
    Bytes(Vec<u8>),
}

impl std::fmt::Debug for InputFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InputMedia {
    pub r#type: String,
    pub media: String,
    pub caption: String,
    pub parse_mode: String,
}

impl InputMedia {
    pub fn photo(url: String, caption: String) -> Self {
        Self {
            r#type: "photo".into(),
            media: url,
            caption,
            parse_mode: PARSE_MODE.into(),
        }
    }
}

/// Handle of a sent message. Full `Message` replies parse into it too.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct MessageId {
    pub message_id: i64,
}

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Serialize)]
struct SendPhotoRequest<'a> {
    chat_id: &'a str,
    photo: &'a str,
    caption: &'a str,
    parse_mode: &'a str,
}

#[derive(Serialize)]
struct SendVideoRequest<'a> {
    chat_id: &'a str,
    video: &'a str,
    caption: &'a str,
    parse_mode: &'a str,
}

#[derive(Serialize)]
struct SendMediaGroupRequest<'a> {
    chat_id: &'a str,
    media: &'a [InputMedia],
}

#[derive(Serialize)]
struct CopyMessageRequest<'a> {
    chat_id: &'a str,
    from_chat_id: &'a str,
    message_id: i64,
}

/// Default limit for JSON calls. Uploads have none, a 50 MB video may take a while.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct TelegramClient {
    token: String,
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Result<Self, TelegramError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            token: token.into(),
            client,
            base_url: "https://api.telegram.org".into(),
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Numeric bot id, the part of the token before `:`.
    pub fn bot_id(&self) -> &str {
        bot_id(&self.token)
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call_json<R, T>(&self, method: &str, request: &R) -> Result<T, TelegramError>
    where
        R: Serialize + Sync,
        T: DeserializeOwned,
    {
        debug!("Going to {}", method);
        let res = self
            .client
            .post(self.api_url(method))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        read_reply(res).await
    }

    async fn call_multipart<T: DeserializeOwned>(&self, method: &str, form: Form) -> Result<T, TelegramError> {
        debug!("Going to {} (multipart)", method);
        let res = self.client.post(self.api_url(method)).multipart(form).send().await?;
        read_reply(res).await
    }

    /// `sendPhoto`/`sendVideo`: json for urls, multipart upload for bytes.
    async fn send_media(
        &self,
        kind: MediaKind,
        chat_id: &str,
        file: InputFile,
        caption: &str,
    ) -> Result<MessageId, TelegramError> {
        match (file, kind) {
            (InputFile::Url(url), MediaKind::Photo) => {
                let req = SendPhotoRequest { chat_id, photo: &url, caption, parse_mode: PARSE_MODE };
                self.call_json(kind.method(), &req).await
            }
            (InputFile::Url(url), MediaKind::Video) => {
                let req = SendVideoRequest { chat_id, video: &url, caption, parse_mode: PARSE_MODE };
                self.call_json(kind.method(), &req).await
            }
            (InputFile::Bytes(bytes), _) => {
                let form = Form::new()
                    .text("chat_id", chat_id.to_string())
                    .text("caption", caption.to_string())
                    .text("parse_mode", PARSE_MODE)
                    .part(kind.field(), Part::bytes(bytes).file_name(kind.file_name()));
                self.call_multipart(kind.method(), form).await
            }
        }
    }
}

#[derive(Clone, Copy)]
enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    fn method(self) -> &'static str {
        match self {
            Self::Photo => "sendPhoto",
            Self::Video => "sendVideo",
        }
    }

    fn field(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Photo => "photo.jpg",
            Self::Video => "video.mp4",
        }
    }
}

pub fn bot_id(token: &str) -> &str {
    token.split(':').next().unwrap_or(token)
}

async fn read_reply<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, TelegramError> {
    let status = res.status();
    let body = res.text().await?;
    debug!("Got {} ({} bytes)", status, body.len());

    let reply: Option<TelegramResponse<T>> = serde_json::from_str(&body).ok();

    if !status.is_success() {
        let description = reply.and_then(|r| r.description).unwrap_or(body);
        return Err(TelegramError::from_status(status.as_u16(), description));
    }

    match reply {
        Some(TelegramResponse { ok: true, result: Some(result), .. }) => Ok(result),
        Some(reply) => Err(TelegramError::Api {
            code: reply.error_code.unwrap_or(0),
            description: reply.description.unwrap_or_else(|| "empty result".into()),
        }),
        None => Err(TelegramError::Api {
            code: status.as_u16(),
            description: format!("unexpected reply: {body}"),
        }),
    }
}

#[async_trait]
impl Destination for TelegramClient {
    #[instrument(skip(self, text))]
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<MessageId, TelegramError> {
        let req = SendMessageRequest { chat_id, text, parse_mode: PARSE_MODE };
        self.call_json("sendMessage", &req).await
    }

    #[instrument(skip(self, caption))]
    async fn send_photo(&self, chat_id: &str, photo: InputFile, caption: &str) -> Result<MessageId, TelegramError> {
        self.send_media(MediaKind::Photo, chat_id, photo, caption).await
    }

    #[instrument(skip(self, caption))]
    async fn send_video(&self, chat_id: &str, video: InputFile, caption: &str) -> Result<MessageId, TelegramError> {
        self.send_media(MediaKind::Video, chat_id, video, caption).await
    }

    #[instrument(skip(self, media))]
    async fn send_media_group(&self, chat_id: &str, media: &[InputMedia]) -> Result<Vec<MessageId>, TelegramError> {
        let req = SendMediaGroupRequest { chat_id, media };
        self.call_json("sendMediaGroup", &req).await
    }

    #[instrument(skip(self))]
    async fn copy_message(&self, chat_id: &str, from_chat_id: &str, message_id: i64) -> Result<MessageId, TelegramError> {
        let req = CopyMessageRequest { chat_id, from_chat_id, message_id };
        self.call_json("copyMessage", &req).await
    }
}
