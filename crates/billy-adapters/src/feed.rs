//! Syndication feed adapter.
//!
//! Feed entries rarely link audio directly; most embed a player. Each entry can therefore
//! surface several canonical links: `audio/mpeg` enclosures, plus YouTube and SoundCloud
//! `<iframe>` players found in the entry body.

use std::sync::Arc;

use async_trait::async_trait;
use billy_core::{CandidateItem, CanonicalLink, SourceKind};
use billy_storage::HttpFetcher;
use chrono::DateTime;
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::soundcloud::{extract_soundcloud_id, SoundcloudResolver};
use crate::youtube::extract_youtube_id;
use crate::{FetchError, SourceAdapter};

/// `discovered_at` of entries without a usable publication date.
pub const UNDATED: i64 = -1;

const AUDIO_MIME: &str = "audio/mpeg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddedRef {
    Link(CanonicalLink),
    /// SoundCloud player without a track id; needs the resolve API.
    SoundcloudPermalink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub discovered_at: i64,
    pub image: Option<String>,
    pub refs: Vec<EmbeddedRef>,
}

/// Parses an RSS document, keeping entries published at or after `watermark`.
///
/// Undated entries are only kept on a source's first fetch (`watermark == 0`); afterwards
/// there is no way to tell whether they are new.
pub fn parse_feed(bytes: &[u8], watermark: i64) -> Result<Vec<FeedEntry>, FetchError> {
    let channel = rss::Channel::read_from(bytes)
        .map_err(|e| FetchError::Decode(format!("rss: {e}")))?;

    let mut entries = Vec::new();
    for item in channel.items() {
        let discovered_at = item
            .pub_date()
            .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(UNDATED);

        let keep = if discovered_at == UNDATED {
            watermark == 0
        } else {
            discovered_at >= watermark
        };
        if !keep {
            continue;
        }

        let mut refs = Vec::new();
        for url in audio_enclosures(item) {
            match CanonicalLink::parse(url) {
                Ok(link) => refs.push(EmbeddedRef::Link(link)),
                Err(e) => debug!(error = %e, "skipping enclosure"),
            }
        }
        if let Some(body) = item.description().or_else(|| item.content()) {
            refs.extend(extract_embedded_refs(body)?);
        }

        entries.push(FeedEntry {
            title: item.title().unwrap_or("(untitled)").trim().to_string(),
            discovered_at,
            image: item
                .itunes_ext()
                .and_then(|ext| ext.image())
                .map(str::to_string),
            refs,
        });
    }
    Ok(entries)
}

/// `audio/mpeg` enclosure URLs of one item. RSS allows a single `<enclosure>`; further ones
/// arrive as `<atom:link rel="enclosure">` extension elements.
fn audio_enclosures(item: &rss::Item) -> Vec<&str> {
    let mut urls = Vec::new();
    if let Some(enclosure) = item.enclosure() {
        if enclosure.mime_type().eq_ignore_ascii_case(AUDIO_MIME) {
            urls.push(enclosure.url());
        }
    }
    let atom_links = item
        .extensions()
        .get("atom")
        .and_then(|elements| elements.get("link"))
        .into_iter()
        .flatten();
    for link in atom_links {
        let attrs = link.attrs();
        let is_audio = attrs.get("rel").map(String::as_str) == Some("enclosure")
            && attrs
                .get("type")
                .is_some_and(|t| t.eq_ignore_ascii_case(AUDIO_MIME));
        if let Some(href) = attrs.get("href").filter(|_| is_audio) {
            if !urls.contains(&href.as_str()) {
                urls.push(href.as_str());
            }
        }
    }
    urls
}

/// Finds YouTube and SoundCloud players embedded in an entry body.
pub fn extract_embedded_refs(html: &str) -> Result<Vec<EmbeddedRef>, FetchError> {
    let fragment = Html::parse_fragment(html);
    let iframes = Selector::parse("iframe").map_err(|e| FetchError::Decode(e.to_string()))?;

    let mut refs = Vec::new();
    for iframe in fragment.select(&iframes) {
        let Some(src) = iframe.value().attr("src") else {
            continue;
        };
        let src = if src.starts_with("//") {
            format!("https:{src}")
        } else {
            src.to_string()
        };
        let Some(host) = Url::parse(&src)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            continue;
        };

        if host.ends_with("youtube.com") || host.ends_with("youtube-nocookie.com") {
            if let Some(link) = extract_youtube_id(&src)
                .and_then(|id| CanonicalLink::from_parts("youtube", &id).ok())
            {
                refs.push(EmbeddedRef::Link(link));
            }
        } else if host.ends_with("soundcloud.com") {
            match extract_soundcloud_id(&src)
                .and_then(|id| CanonicalLink::from_parts("soundcloud", &id).ok())
            {
                Some(link) => refs.push(EmbeddedRef::Link(link)),
                None => refs.push(EmbeddedRef::SoundcloudPermalink(player_permalink(&src))),
            }
        }
    }
    Ok(refs)
}

/// The player iframe carries the track permalink in its `url` parameter.
fn player_permalink(src: &str) -> String {
    Url::parse(src)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "url")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or_else(|| src.to_string())
}

#[derive(Debug, Clone)]
pub struct FeedAdapter {
    url: String,
    http: Arc<HttpFetcher>,
    soundcloud: SoundcloudResolver,
}

impl FeedAdapter {
    pub fn new(url: impl Into<String>, http: Arc<HttpFetcher>, soundcloud: SoundcloudResolver) -> Self {
        Self {
            url: url.into(),
            http,
            soundcloud,
        }
    }

    async fn candidates_from_entries(&self, entries: Vec<FeedEntry>) -> Vec<CandidateItem> {
        let mut out = Vec::new();
        for entry in entries {
            for embedded in &entry.refs {
                let link = match embedded {
                    EmbeddedRef::Link(link) => link.clone(),
                    EmbeddedRef::SoundcloudPermalink(permalink) => {
                        match self.soundcloud.resolve(permalink).await {
                            Ok(Some(link)) => link,
                            Ok(None) => {
                                debug!(permalink, "soundcloud permalink not resolved");
                                continue;
                            }
                            Err(err) => {
                                warn!(feed = %self.url, permalink, error = %err, "soundcloud resolve failed");
                                continue;
                            }
                        }
                    }
                };
                out.push(CandidateItem {
                    title: entry.title.clone(),
                    link,
                    discovered_at: entry.discovered_at,
                    image: entry.image.clone(),
                });
            }
        }
        out
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn locator(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, watermark: i64) -> Result<Vec<CandidateItem>, FetchError> {
        let response = self.http.fetch_bytes("feed", &self.url).await?;
        let entries = parse_feed(&response.body, watermark)?;
        Ok(self.candidates_from_entries(entries).await)
    }
}

#[cfg(test)]
mod tests {
    use billy_storage::HttpClientConfig;

    use super::*;
    use crate::test_support::fixture;

    const SINCE_NEW_YEAR: i64 = 1_704_000_000;

    fn link(raw: &str) -> EmbeddedRef {
        EmbeddedRef::Link(CanonicalLink::parse(raw).unwrap())
    }

    #[test]
    fn parses_embeds_enclosures_and_dates() {
        let entries = parse_feed(&fixture("feeds/blog.xml"), SINCE_NEW_YEAR).unwrap();
        let titles: Vec<_> = entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(
            titles,
            [
                "Artist One - First Song",
                "Podcast Episode 12",
                "Text Only Post",
                "Permalink Embed"
            ]
        );

        assert_eq!(entries[0].discovered_at, 1_704_196_800);
        assert_eq!(
            entries[0].refs,
            vec![link("youtube:dQw4w9WgXcQ"), link("soundcloud:123456")]
        );

        assert_eq!(entries[1].discovered_at, 1_704_096_000);
        assert_eq!(entries[1].refs, vec![link("https://example.com/audio/ep12.mp3")]);
        assert_eq!(entries[1].image.as_deref(), Some("https://example.com/ep12.jpg"));

        assert!(entries[2].refs.is_empty());
        assert_eq!(
            entries[3].refs,
            vec![EmbeddedRef::SoundcloudPermalink(
                "https://soundcloud.com/artist/permalink-song".to_string()
            )]
        );
    }

    #[test]
    fn first_fetch_keeps_old_and_undated_entries() {
        let entries = parse_feed(&fixture("feeds/blog.xml"), 0).unwrap();
        assert_eq!(entries.len(), 6);

        let undated = entries.iter().find(|e| e.title == "Undated Post").unwrap();
        assert_eq!(undated.discovered_at, UNDATED);
        assert_eq!(undated.refs, vec![link("youtube:undated01")]);

        let old = entries.iter().find(|e| e.title == "Old Post").unwrap();
        assert_eq!(old.refs, vec![link("youtube:oldvideo1")]);
    }

    #[test]
    fn collects_every_audio_enclosure_of_an_entry() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>Mixes</title>
    <link>https://mixes.example.com</link>
    <description>two parts</description>
    <item>
      <title>Mix Parts</title>
      <pubDate>Tue, 02 Jan 2024 12:00:00 GMT</pubDate>
      <enclosure url="https://cdn.example.com/part1.mp3" length="1" type="audio/mpeg"/>
      <atom:link rel="enclosure" type="audio/mpeg" href="https://cdn.example.com/part2.mp3"/>
      <atom:link rel="enclosure" type="audio/mpeg" href="https://cdn.example.com/part1.mp3"/>
      <atom:link rel="enclosure" type="video/mp4" href="https://cdn.example.com/clip.mp4"/>
      <atom:link rel="alternate" type="text/html" href="https://mixes.example.com/parts"/>
    </item>
  </channel>
</rss>"#;
        let entries = parse_feed(xml.as_bytes(), 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].refs,
            vec![
                link("https://cdn.example.com/part1.mp3"),
                link("https://cdn.example.com/part2.mp3"),
            ]
        );
    }

    #[test]
    fn malformed_feed_is_a_decode_error() {
        let result = parse_feed(b"<html><body>not a feed</body></html>", 0);
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }

    #[test]
    fn ignores_unrelated_iframes() {
        let refs = extract_embedded_refs(
            r#"<p>hi</p><iframe src="https://player.vimeo.com/video/1"></iframe><iframe></iframe>"#,
        )
        .unwrap();
        assert!(refs.is_empty());
    }

    #[tokio::test]
    async fn entries_expand_to_one_candidate_per_link() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter = FeedAdapter::new(
            "https://example.com/feed.xml",
            http.clone(),
            SoundcloudResolver::new(http, None),
        );
        let entries = parse_feed(&fixture("feeds/blog.xml"), SINCE_NEW_YEAR).unwrap();
        let candidates = adapter.candidates_from_entries(entries).await;

        let links: Vec<_> = candidates.iter().map(|c| c.link.as_str()).collect();
        assert_eq!(
            links,
            [
                "youtube:dQw4w9WgXcQ",
                "soundcloud:123456",
                "https://example.com/audio/ep12.mp3"
            ]
        );
        assert!(candidates[..2].iter().all(|c| c.title == "Artist One - First Song"));
    }
}
