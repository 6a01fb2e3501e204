use std::fmt;

use url::Url;

const DELIM: char = '#';
const SOURCE_PREFIX: &str = "reddit@";

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("not a reddit url: {0}")]
    BadHost(String),
    #[error("not a subreddit path: {0}")]
    BadPath(String),
    #[error("malformed listing id: {0}")]
    BadId(String),
}

/// One subreddit listing: `/r/<subreddit>/<sorting>/?t=<timing>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubredditListing {
    pub subreddit: String,
    pub sorting: String,
    pub timing: Option<String>,
}

impl SubredditListing {
    /// Parse a listing out of a browser url, e.g. `https://www.reddit.com/r/pics/top/?t=day`.
    pub fn from_url(url: &str) -> Result<Self, ListingError> {
        let parsed = Url::parse(url).map_err(|_| ListingError::BadHost(url.to_string()))?;
        match parsed.host_str() {
            Some("reddit.com") | Some("www.reddit.com") => {}
            _ => return Err(ListingError::BadHost(url.to_string())),
        }

        let segments: Vec<&str> = parsed.path().split('/').collect();
        let (r, subreddit, sorting) = match segments.as_slice() {
            [_, r, subreddit, sorting, ..] => (*r, *subreddit, *sorting),
            _ => return Err(ListingError::BadPath(parsed.path().to_string())),
        };
        if r != "r" || subreddit.is_empty() {
            return Err(ListingError::BadPath(parsed.path().to_string()));
        }

        let timing = parsed
            .query_pairs()
            .find(|(k, _)| k == "t")
            .map(|(_, v)| v.into_owned())
            .filter(|t| !t.is_empty());

        Ok(Self {
            subreddit: subreddit.to_string(),
            sorting: if sorting.is_empty() { "hot".into() } else { sorting.to_string() },
            timing,
        })
    }

    /// Inverse of `Display`: `subreddit#sorting#timing`.
    pub fn from_str_tuple(s: &str) -> Result<Self, ListingError> {
        let mut parts = s.split(DELIM);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(subreddit), Some(sorting), Some(timing), None) if !subreddit.is_empty() => Ok(Self {
                subreddit: subreddit.to_string(),
                sorting: sorting.to_string(),
                timing: (!timing.is_empty()).then(|| timing.to_string()),
            }),
            _ => Err(ListingError::BadId(s.to_string())),
        }
    }

    /// Parse a `reddit@subreddit#sorting#timing` source id.
    pub fn from_source_id(source_id: &str) -> Result<Self, ListingError> {
        let tuple = source_id
            .strip_prefix(SOURCE_PREFIX)
            .ok_or_else(|| ListingError::BadId(source_id.to_string()))?;
        Self::from_str_tuple(tuple)
    }

    pub fn source_id(&self) -> String {
        format!("{SOURCE_PREFIX}{self}")
    }

    /// Listing url under `base` (`https://www.reddit.com` in production).
    pub fn to_url(&self, base: &str, json: bool) -> String {
        let mut url = format!("{}/r/{}/{}/", base.trim_end_matches('/'), self.subreddit, self.sorting);
        if json {
            url.push_str(".json");
        }
        if let Some(timing) = &self.timing {
            url.push_str("?t=");
            url.push_str(timing);
        }
        url
    }
}

impl fmt::Display for SubredditListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIM}{}{DELIM}{}",
            self.subreddit,
            self.sorting,
            self.timing.as_deref().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browser_urls() {
        let listing = SubredditListing::from_url("https://www.reddit.com/r/pics/top/?t=day").unwrap();
        assert_eq!(listing.subreddit, "pics");
        assert_eq!(listing.sorting, "top");
        assert_eq!(listing.timing.as_deref(), Some("day"));

        let listing = SubredditListing::from_url("https://reddit.com/r/gifs/").unwrap();
        assert_eq!(listing.sorting, "hot");
        assert!(listing.timing.is_none());
    }

    #[test]
    fn rejects_foreign_urls() {
        assert!(matches!(
            SubredditListing::from_url("https://example.com/r/pics/top/"),
            Err(ListingError::BadHost(_))
        ));
        assert!(matches!(
            SubredditListing::from_url("https://www.reddit.com/user/someone/"),
            Err(ListingError::BadPath(_))
        ));
        assert!(matches!(
            SubredditListing::from_url("https://www.reddit.com/r/pics"),
            Err(ListingError::BadPath(_))
        ));
    }

    #[test]
    fn source_id_round_trip() {
        let listing = SubredditListing::from_url("https://www.reddit.com/r/pics/new/").unwrap();
        assert_eq!(listing.source_id(), "reddit@pics#new#");
        assert_eq!(SubredditListing::from_source_id("reddit@pics#new#").unwrap(), listing);
        assert!(SubredditListing::from_source_id("tumblr@pics#new#").is_err());
        assert!(SubredditListing::from_str_tuple("pics#new").is_err());
    }

    #[test]
    fn json_url() {
        let listing = SubredditListing::from_url("https://www.reddit.com/r/pics/top/?t=week").unwrap();
        assert_eq!(
            listing.to_url("https://www.reddit.com", true),
            "https://www.reddit.com/r/pics/top/.json?t=week"
        );
        assert_eq!(listing.to_url("https://www.reddit.com/", false), "https://www.reddit.com/r/pics/top/?t=week");
    }
}
