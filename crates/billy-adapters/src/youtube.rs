//! YouTube Data API adapters for channel uploads and playlists.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use billy_core::{from_unix_seconds, CandidateItem, CanonicalLink, SourceKind};
use billy_storage::{HttpError, HttpFetcher};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::paging::{collect_pages, Page, PageOrder};
use crate::{FetchError, SourceAdapter};

const SEARCH_URL: &str = "https://www.googleapis.com/youtube/v3/search";
const PLAYLIST_ITEMS_URL: &str = "https://www.googleapis.com/youtube/v3/playlistItems";
const PAGE_SIZE: &str = "50";
/// The search endpoint stops paginating after this many results per query window.
const SEARCH_WINDOW_LIMIT: usize = 500;
const PLACEHOLDER_TITLES: [&str; 2] = ["Deleted video", "Private video"];

pub fn extract_youtube_id(src: &str) -> Option<String> {
    let url = Url::parse(src).ok()?;
    if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v") {
        if !v.is_empty() {
            return Some(v.into_owned());
        }
    }
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let is_marker = |s: &str| matches!(s, "v" | "e" | "embed");
    if !segments.iter().any(|s| is_marker(s)) {
        return None;
    }
    segments
        .last()
        .filter(|s| !is_marker(s))
        .map(|s| s.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    reason: Option<String>,
}

impl ApiErrorBody {
    fn into_fetch_error(self) -> FetchError {
        let reason = self
            .errors
            .into_iter()
            .find_map(|e| e.reason)
            .unwrap_or_else(|| "no reason given".to_string());
        FetchError::Upstream {
            message: self.message,
            reason,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    id: SearchItemId,
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    title: String,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    thumbnails: Thumbnails,
    resource_id: Option<ResourceId>,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

impl Snippet {
    fn into_candidate(self, video_id: &str) -> Option<CandidateItem> {
        let link = CanonicalLink::from_parts("youtube", video_id).ok()?;
        Some(CandidateItem {
            title: self.title,
            link,
            discovered_at: self.published_at.map(|at| at.timestamp()).unwrap_or(-1),
            image: self.thumbnails.default.map(|t| t.url),
        })
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<ApiResponse<T>, FetchError> {
    let response: ApiResponse<T> = serde_json::from_slice(body)
        .map_err(|e| FetchError::Decode(format!("youtube api response: {e}")))?;
    if let Some(error) = response.error {
        return Err(error.into_fetch_error());
    }
    Ok(response)
}

pub fn parse_search_page(body: &[u8]) -> Result<Page, FetchError> {
    let response = decode::<SearchItem>(body)?;
    let items = response
        .items
        .into_iter()
        .filter_map(|item| {
            let video_id = item.id.video_id?;
            item.snippet.into_candidate(&video_id)
        })
        .collect();
    Ok(Page {
        items,
        next_page_token: response.next_page_token,
    })
}

pub fn parse_playlist_page(body: &[u8]) -> Result<Page, FetchError> {
    let response = decode::<PlaylistItem>(body)?;
    let items = response
        .items
        .into_iter()
        .filter(|item| !PLACEHOLDER_TITLES.contains(&item.snippet.title.as_str()))
        .filter_map(|item| {
            let video_id = item.snippet.resource_id.as_ref()?.video_id.clone()?;
            item.snippet.into_candidate(&video_id)
        })
        .collect();
    Ok(Page {
        items,
        next_page_token: response.next_page_token,
    })
}

/// Error responses arrive with a 4xx status; their JSON body names the actual cause.
fn upstream_error(err: HttpError) -> FetchError {
    if let HttpError::HttpStatus { body, .. } = &err {
        if let Ok(ApiResponse::<serde_json::Value> {
            error: Some(error), ..
        }) = serde_json::from_str(body)
        {
            return error.into_fetch_error();
        }
    }
    FetchError::Http(err)
}

fn rfc3339(ts: i64) -> String {
    from_unix_seconds(ts.max(0))
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn require_key(key: &Option<String>) -> Result<&str, FetchError> {
    key.as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| FetchError::Config("YOUTUBE_API_KEY is not set".to_string()))
}

async fn get_page(
    http: &HttpFetcher,
    label: &str,
    base: &str,
    params: &[(&str, &str)],
    parse: fn(&[u8]) -> Result<Page, FetchError>,
) -> Result<Page, FetchError> {
    let url = Url::parse_with_params(base, params)
        .map_err(|e| FetchError::Config(format!("building {label} url: {e}")))?;
    let response = http
        .fetch_bytes(label, url.as_str())
        .await
        .map_err(upstream_error)?;
    parse(&response.body)
}

/// Uploads of one channel via the search endpoint, newest first.
#[derive(Debug, Clone)]
pub struct YoutubeChannelAdapter {
    channel_id: String,
    http: Arc<HttpFetcher>,
    api_key: Option<String>,
}

impl YoutubeChannelAdapter {
    pub fn new(channel_id: impl Into<String>, http: Arc<HttpFetcher>, api_key: Option<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            http,
            api_key,
        }
    }

    async fn search_page(
        &self,
        key: &str,
        watermark: i64,
        before: i64,
        token: Option<String>,
    ) -> Result<Page, FetchError> {
        let published_after = rfc3339(watermark);
        let published_before = rfc3339(before);
        let token = token.unwrap_or_default();
        get_page(
            &self.http,
            "youtube-channel",
            SEARCH_URL,
            &[
                ("key", key),
                ("channelId", self.channel_id.as_str()),
                ("part", "snippet"),
                ("order", "date"),
                ("type", "video"),
                ("publishedAfter", published_after.as_str()),
                ("publishedBefore", published_before.as_str()),
                ("pageToken", token.as_str()),
                ("maxResults", PAGE_SIZE),
            ],
            parse_search_page,
        )
        .await
    }
}

/// Reads a date-ordered search listing in windows bounded above by `publishedBefore`.
///
/// The API stops handing out pages after [`SEARCH_WINDOW_LIMIT`] results, so a window that
/// fills up is followed by a new one starting one second below its oldest item. `page` is
/// called with the window's upper bound and the continuation token.
async fn collect_search_windows<F, Fut>(
    watermark: i64,
    now: i64,
    mut page: F,
) -> Result<Vec<CandidateItem>, FetchError>
where
    F: FnMut(i64, Option<String>) -> Fut,
    Fut: Future<Output = Result<Page, FetchError>>,
{
    let mut before = now;
    let mut results = Vec::new();

    loop {
        let window = collect_pages(watermark, PageOrder::NewestFirst, |token| page(before, token)).await?;

        let oldest = window.items.last().map(|item| item.discovered_at);
        let window_full = !window.stopped_early && window.items.len() >= SEARCH_WINDOW_LIMIT;
        results.extend(window.items);

        // The bound must keep falling and stay above the watermark.
        match oldest {
            Some(oldest) if window_full && oldest - 1 < before && oldest - 1 >= watermark => {
                debug!(oldest, "search window exhausted; continuing below it");
                before = oldest - 1;
            }
            _ => return Ok(results),
        }
    }
}

#[async_trait]
impl SourceAdapter for YoutubeChannelAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Channel
    }

    fn locator(&self) -> &str {
        &self.channel_id
    }

    async fn fetch(&self, watermark: i64) -> Result<Vec<CandidateItem>, FetchError> {
        let key = require_key(&self.api_key)?;
        collect_search_windows(watermark, Utc::now().timestamp(), |before, token| {
            self.search_page(key, watermark, before, token)
        })
        .await
    }
}

/// Items of one playlist. Playlists are ordered by position, so no early stop.
#[derive(Debug, Clone)]
pub struct YoutubePlaylistAdapter {
    playlist_id: String,
    http: Arc<HttpFetcher>,
    api_key: Option<String>,
}

impl YoutubePlaylistAdapter {
    pub fn new(playlist_id: impl Into<String>, http: Arc<HttpFetcher>, api_key: Option<String>) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            http,
            api_key,
        }
    }

    async fn items_page(&self, key: &str, token: Option<String>) -> Result<Page, FetchError> {
        let token = token.unwrap_or_default();
        get_page(
            &self.http,
            "youtube-playlist",
            PLAYLIST_ITEMS_URL,
            &[
                ("key", key),
                ("playlistId", self.playlist_id.as_str()),
                ("part", "snippet"),
                ("pageToken", token.as_str()),
                ("maxResults", PAGE_SIZE),
            ],
            parse_playlist_page,
        )
        .await
    }
}

#[async_trait]
impl SourceAdapter for YoutubePlaylistAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Playlist
    }

    fn locator(&self) -> &str {
        &self.playlist_id
    }

    async fn fetch(&self, watermark: i64) -> Result<Vec<CandidateItem>, FetchError> {
        let key = require_key(&self.api_key)?;
        let collected = collect_pages(watermark, PageOrder::Unordered, |token| {
            self.items_page(key, token)
        })
        .await?;
        Ok(collected.items)
    }
}
