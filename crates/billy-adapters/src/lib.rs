//! Source adapter contract + feed and video-platform adapter implementations.

mod feed;
mod paging;
mod soundcloud;
mod youtube;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use billy_core::{CandidateItem, Source, SourceKind};
use billy_storage::{HttpError, HttpFetcher};
use thiserror::Error;

pub use feed::{extract_embedded_refs, parse_feed, EmbeddedRef, FeedAdapter, FeedEntry};
pub use paging::{collect_pages, Collected, Page, PageOrder};
pub use soundcloud::{extract_soundcloud_id, SoundcloudResolver};
pub use youtube::{
    extract_youtube_id, parse_playlist_page, parse_search_page, YoutubeChannelAdapter,
    YoutubePlaylistAdapter,
};

pub const CRATE_NAME: &str = "billy-adapters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not decode upstream payload: {0}")]
    Decode(String),
    #[error("upstream api error: {message} ({reason})")]
    Upstream { message: String, reason: String },
    #[error("adapter misconfigured: {0}")]
    Config(String),
}

impl FetchError {
    /// Short label for counters and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http(err) if err.is_timeout() => "timeout",
            FetchError::Http(_) => "http",
            FetchError::Timeout(_) => "timeout",
            FetchError::Decode(_) => "decode",
            FetchError::Upstream { .. } => "upstream",
            FetchError::Config(_) => "config",
        }
    }
}

/// Fetch capability of one registered source.
///
/// `fetch` returns the items discovered at or after `watermark` (epoch seconds). Adapters
/// may stop paging early once they pass the watermark; callers stay correct either way
/// because merging is idempotent per canonical link.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn locator(&self) -> &str;

    async fn fetch(&self, watermark: i64) -> Result<Vec<CandidateItem>, FetchError>;
}

/// Chooses the adapter implementation for a source once, at registration time.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, source: &Source) -> Arc<dyn SourceAdapter>;
}

#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub youtube_api_key: Option<String>,
    pub soundcloud_client_id: Option<String>,
}

/// Production factory: every adapter shares one [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpAdapterFactory {
    http: Arc<HttpFetcher>,
    settings: AdapterSettings,
}

impl HttpAdapterFactory {
    pub fn new(http: Arc<HttpFetcher>, settings: AdapterSettings) -> Self {
        Self { http, settings }
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(&self, source: &Source) -> Arc<dyn SourceAdapter> {
        let locator = source.locator.clone();
        match source.kind {
            SourceKind::Feed => Arc::new(FeedAdapter::new(
                locator,
                self.http.clone(),
                SoundcloudResolver::new(self.http.clone(), self.settings.soundcloud_client_id.clone()),
            )),
            SourceKind::Channel => Arc::new(YoutubeChannelAdapter::new(
                locator,
                self.http.clone(),
                self.settings.youtube_api_key.clone(),
            )),
            SourceKind::Playlist => Arc::new(YoutubePlaylistAdapter::new(
                locator,
                self.http.clone(),
                self.settings.youtube_api_key.clone(),
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture(rel: &str) -> Vec<u8> {
        let path = workspace_root().join("fixtures").join(rel);
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billy_core::SourceId;
    use billy_storage::HttpClientConfig;

    #[test]
    fn factory_selects_adapter_by_kind() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let factory = HttpAdapterFactory::new(http, AdapterSettings::default());
        for (kind, locator) in [
            (SourceKind::Feed, "https://example.com/feed.xml"),
            (SourceKind::Channel, "UCabc"),
            (SourceKind::Playlist, "PLxyz"),
        ] {
            let source = Source {
                id: SourceId::new_v4(),
                kind,
                locator: locator.to_string(),
                watermark: 0,
            };
            let adapter = factory.build(&source);
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.locator(), locator);
        }
    }

    #[test]
    fn error_kinds_are_stable_labels() {
        assert_eq!(FetchError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(FetchError::Decode("bad xml".into()).kind(), "decode");
        assert_eq!(FetchError::Config("no key".into()).kind(), "config");
        assert_eq!(
            FetchError::Upstream {
                message: "quota".into(),
                reason: "quotaExceeded".into()
            }
            .kind(),
            "upstream"
        );
    }
}
