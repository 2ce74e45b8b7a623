use std::sync::Arc;

use billy_core::CanonicalLink;
use billy_storage::HttpFetcher;
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::FetchError;

const RESOLVE_URL: &str = "https://api.soundcloud.com/resolve.json";

/// Pulls the numeric track id out of a SoundCloud player/embed URL, looking at the URL
/// itself and at any percent-encoded URL carried in its query string.
pub fn extract_soundcloud_id(src: &str) -> Option<String> {
    let mut candidates = vec![src.to_string()];
    if let Ok(url) = Url::parse(src) {
        candidates.extend(url.query_pairs().map(|(_, value)| value.into_owned()));
    }
    candidates.iter().find_map(|candidate| {
        let (_, rest) = candidate.split_once("/tracks/")?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        (!digits.is_empty()).then_some(digits)
    })
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(default)]
    kind: String,
    id: Option<u64>,
}

/// Resolves SoundCloud permalinks that do not carry a track id.
#[derive(Debug, Clone)]
pub struct SoundcloudResolver {
    http: Arc<HttpFetcher>,
    client_id: Option<String>,
}

impl SoundcloudResolver {
    pub fn new(http: Arc<HttpFetcher>, client_id: Option<String>) -> Self {
        Self { http, client_id }
    }

    /// `Ok(None)` when the URL does not point at a single track.
    pub async fn resolve(&self, permalink: &str) -> Result<Option<CanonicalLink>, FetchError> {
        let Some(client_id) = &self.client_id else {
            return Ok(None);
        };
        let url = Url::parse_with_params(
            RESOLVE_URL,
            &[("url", permalink), ("client_id", client_id.as_str())],
        )
        .map_err(|e| FetchError::Config(format!("building soundcloud resolve url: {e}")))?;

        let response = self.http.fetch_bytes("soundcloud-resolve", url.as_str()).await?;
        let parsed: ResolveResponse = serde_json::from_slice(&response.body)
            .map_err(|e| FetchError::Decode(format!("soundcloud resolve response: {e}")))?;

        match (parsed.kind.as_str(), parsed.id) {
            ("track", Some(id)) => Ok(CanonicalLink::from_parts("soundcloud", &id.to_string()).ok()),
            (kind, _) => {
                debug!(kind, "soundcloud permalink is not a track");
                Ok(None)
            }
        }
    }
}
