//! Raw reddit post → [`Post`].

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use super::models::{GalleryItem, Media, MediaMetadata, PreviewImage, RedditPost, RedditVideo, VariantSet};
use crate::model::{MediaItem, Post};

pub const REDDIT_WEB_ORIGIN: &str = "https://reddit.com";

/// Known v.redd.it DASH renditions, ascending.
pub const RESOLUTION_LADDER: [u32; 5] = [240, 360, 480, 720, 1080];

/// Embed providers whose thumbnail is worth relaying.
const THUMBNAIL_PROVIDERS: &[&str] = &["youtube.com"];

lazy_static! {
    static ref DASH_FILENAME: Regex = Regex::new(r"^DASH_(\d+)\.mp4$").unwrap();
}

/// The one shape a post is relayed as. Earlier variants win.
enum RawShape<'a> {
    Gallery {
        metadata: &'a HashMap<String, MediaMetadata>,
        items: &'a [GalleryItem],
    },
    Video(&'a RedditVideo),
    Embed(&'a Media),
    AnimatedPreview(&'a [PreviewImage]),
    StillPreview(&'a [PreviewImage]),
    Text,
}

impl<'a> RawShape<'a> {
    fn of(post: &'a RedditPost) -> Self {
        if let (Some(metadata), Some(gallery)) = (&post.media_metadata, &post.gallery_data) {
            return Self::Gallery { metadata, items: &gallery.items };
        }

        let native = post.media.as_ref().and_then(|m| m.reddit_video.as_ref());
        let preview = post.preview.as_ref().and_then(|p| p.reddit_video_preview.as_ref());
        if let Some(video) = native.or(preview) {
            return Self::Video(video);
        }

        if let Some(media) = post.media.as_ref().filter(|m| m.kind.is_some()) {
            return Self::Embed(media);
        }

        match &post.preview {
            Some(preview) if !preview.images.is_empty() => {
                if preview.images.iter().any(|image| animated_variant(image).is_some()) {
                    Self::AnimatedPreview(&preview.images)
                } else {
                    Self::StillPreview(&preview.images)
                }
            }
            _ => Self::Text,
        }
    }
}

/// Build the canonical post for `source_id` out of a raw reddit post.
///
/// Never fails: broken media blocks degrade to a text-only post.
pub fn normalize(source_id: &str, post: &RedditPost) -> Post {
    let mut post = post;
    while let Some(parent) = post.crosspost_parent_list.as_ref().and_then(|l| l.first()) {
        post = parent;
    }

    let mut images = Vec::new();
    let mut videos = Vec::new();

    match RawShape::of(post) {
        RawShape::Gallery { metadata, items } => images = gallery(metadata, items),
        RawShape::Video(video) => videos.extend(dash_video(video)),
        RawShape::Embed(media) => images.extend(embed_thumbnail(media)),
        RawShape::AnimatedPreview(list) => {
            videos = list.iter().filter_map(animated_variant).filter_map(animated_item).collect()
        }
        RawShape::StillPreview(list) => {
            images = list
                .iter()
                .filter_map(|image| image.source.as_ref())
                .map(|source| MediaItem::single(fix_url(&source.url)))
                .collect()
        }
        RawShape::Text => {}
    }

    Post {
        source_id: source_id.to_string(),
        source_text: post.subreddit_name_prefixed.clone().or_else(|| Some(post.subreddit.clone())),
        original_url: format!("{REDDIT_WEB_ORIGIN}{}", post.permalink),
        text: post.title.clone(),
        url: post.url.clone(),
        images: (!images.is_empty()).then_some(images),
        videos: (!videos.is_empty()).then_some(videos),
    }
}

fn fix_url(url: &str) -> String {
    url.replace("&amp;", "&")
}

fn gallery(metadata: &HashMap<String, MediaMetadata>, items: &[GalleryItem]) -> Vec<MediaItem> {
    items
        .iter()
        .filter_map(|item| {
            let entry = metadata.get(&item.media_id)?;
            if entry.e.as_deref() != Some("Image") {
                debug!("Skipping gallery item {} of kind {:?}", item.media_id, entry.e);
                return None;
            }
            let url = entry.s.as_ref()?.u.as_deref()?;
            Some(MediaItem {
                urls: vec![fix_url(url)],
                caption: item.caption.clone(),
                audio: None,
            })
        })
        .collect()
}

fn dash_video(video: &RedditVideo) -> Option<MediaItem> {
    let fallback = match Url::parse(&video.fallback_url) {
        Ok(url) => url,
        Err(e) => {
            warn!("Bad fallback url {}: {}", video.fallback_url, e);
            return None;
        }
    };

    let host = fallback.host_str()?;
    let origin = match fallback.port() {
        Some(port) => format!("{}://{}:{}", fallback.scheme(), host, port),
        None => format!("{}://{}", fallback.scheme(), host),
    };
    let (prefix, filename) = fallback.path().rsplit_once('/')?;
    let base = format!("{origin}{prefix}");

    let index = DASH_FILENAME
        .captures(filename)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .and_then(|res| RESOLUTION_LADDER.iter().position(|r| *r == res));

    let urls = match index {
        Some(index) => RESOLUTION_LADDER[..=index]
            .iter()
            .map(|res| format!("{base}/DASH_{res}.mp4"))
            .collect(),
        None => {
            debug!("Fallback {} is not on the resolution ladder", filename);
            vec![video.fallback_url.clone()]
        }
    };

    Some(MediaItem {
        urls,
        caption: None,
        audio: (!video.is_gif).then(|| format!("{base}/DASH_audio.mp4")),
    })
}

fn embed_thumbnail(media: &Media) -> Option<MediaItem> {
    let provider = media.kind.as_deref()?;
    if !THUMBNAIL_PROVIDERS.contains(&provider) {
        debug!("Unsupported embed provider {}", provider);
        return None;
    }
    let thumbnail = media.oembed.as_ref()?.thumbnail_url.as_deref()?;
    Some(MediaItem::single(thumbnail.to_string()))
}

/// mp4 rendition if there is one, gif otherwise; only if it has a ladder and a source.
fn animated_variant(image: &PreviewImage) -> Option<&VariantSet> {
    let variants = image.variants.as_ref()?;
    variants
        .mp4
        .as_ref()
        .or(variants.gif.as_ref())
        .filter(|set| !set.resolutions.is_empty() && set.source.is_some())
}

fn animated_item(set: &VariantSet) -> Option<MediaItem> {
    let source = set.source.as_ref()?;
    let urls = set
        .resolutions
        .iter()
        .chain(std::iter::once(source))
        .map(|r| fix_url(&r.url))
        .collect();
    Some(MediaItem { urls, caption: None, audio: None })
}
