//! Downstream notification of catalog changes.

use std::sync::Arc;

use async_trait::async_trait;
use billy_core::Track;
use billy_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bulk requests are split into chunks of this many tracks.
pub const BULK_BATCH_SIZE: usize = 500;

/// Receives batches of tracks affected by one merge.
///
/// Both callbacks are awaited inside the ingestion cycle. Delivery is at-least-once: a
/// notifier that fails must handle its own retry, and re-running ingestion is safe.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_tracks_added(&self, tracks: &[Track]);

    async fn on_tracks_updated(&self, tracks: &[Track]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn on_tracks_added(&self, _tracks: &[Track]) {}

    async fn on_tracks_updated(&self, _tracks: &[Track]) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    Added(Vec<Track>),
    Updated(Vec<Track>),
}

/// Hands events to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<IndexEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<IndexEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IndexEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    async fn send(&self, event: IndexEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("index event receiver dropped");
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn on_tracks_added(&self, tracks: &[Track]) {
        self.send(IndexEvent::Added(tracks.to_vec())).await;
    }

    async fn on_tracks_updated(&self, tracks: &[Track]) {
        self.send(IndexEvent::Updated(tracks.to_vec())).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkOp {
    Create,
    Update,
}

impl BulkOp {
    fn as_str(self) -> &'static str {
        match self {
            BulkOp::Create => "create",
            BulkOp::Update => "update",
        }
    }
}

#[derive(Debug, Serialize)]
struct IndexedTrack<'a> {
    link: &'a str,
    title: &'a str,
    discovered_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    sources: Vec<SourceRef>,
}

#[derive(Debug, Serialize)]
struct SourceRef {
    id: String,
}

impl<'a> From<&'a Track> for IndexedTrack<'a> {
    fn from(track: &'a Track) -> Self {
        Self {
            link: track.link.as_str(),
            title: &track.title,
            discovered_at: track.discovered_at,
            image: track.image.as_deref(),
            sources: track
                .sources
                .iter()
                .map(|id| SourceRef { id: id.to_string() })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Builds the newline-delimited body of one `_bulk` request.
fn bulk_body(index: &str, op: BulkOp, tracks: &[Track]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    for track in tracks {
        let action = json!({ op.as_str(): { "_index": index, "_id": track.id.to_string() } });
        serde_json::to_writer(&mut body, &action)?;
        body.push(b'\n');
        let doc = IndexedTrack::from(track);
        match op {
            BulkOp::Create => serde_json::to_writer(&mut body, &doc)?,
            BulkOp::Update => serde_json::to_writer(&mut body, &json!({ "doc": doc }))?,
        }
        body.push(b'\n');
    }
    Ok(body)
}

/// Number of items the search engine acknowledged with 200/201.
fn acknowledged(op: BulkOp, response: &[u8]) -> usize {
    let Ok(parsed) = serde_json::from_slice::<BulkResponse>(response) else {
        return 0;
    };
    parsed
        .items
        .iter()
        .filter_map(|item| item.get(op.as_str())?.get("status")?.as_u64())
        .filter(|status| matches!(status, 200 | 201))
        .count()
}

/// Posts Elasticsearch-style `_bulk` requests to `<index_url>/_bulk`.
#[derive(Debug, Clone)]
pub struct BulkIndexNotifier {
    http: Arc<HttpFetcher>,
    index_url: String,
    index: String,
}

impl BulkIndexNotifier {
    /// `index_url` points at the index itself, e.g. `http://localhost:9200/billy`.
    pub fn new(http: Arc<HttpFetcher>, index_url: impl Into<String>) -> Self {
        let index_url = index_url.into().trim_end_matches('/').to_string();
        let index = index_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty() && !s.contains(':'))
            .unwrap_or("tracks")
            .to_string();
        Self {
            http,
            index_url,
            index,
        }
    }

    async fn bulk(&self, op: BulkOp, tracks: &[Track]) {
        let url = format!("{}/_bulk", self.index_url);
        let mut indexed = 0;
        for batch in tracks.chunks(BULK_BATCH_SIZE) {
            let body = match bulk_body(&self.index, op, batch) {
                Ok(body) => body,
                Err(err) => {
                    warn!(op = op.as_str(), error = %err, "could not serialize bulk request");
                    continue;
                }
            };
            match self
                .http
                .post_bytes("index-bulk", &url, "application/x-ndjson", body)
                .await
            {
                Ok(response) => indexed += acknowledged(op, &response.body),
                Err(err) => {
                    warn!(op = op.as_str(), tracks = batch.len(), error = %err, "bulk index request failed")
                }
            }
        }
        info!(op = op.as_str(), indexed, total = tracks.len(), "bulk indexed tracks");
    }
}

#[async_trait]
impl Notifier for BulkIndexNotifier {
    async fn on_tracks_added(&self, tracks: &[Track]) {
        self.bulk(BulkOp::Create, tracks).await;
    }

    async fn on_tracks_updated(&self, tracks: &[Track]) {
        self.bulk(BulkOp::Update, tracks).await;
    }
}

/// Forwards every callback to each inner notifier in order.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<Arc<dyn Notifier>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn on_tracks_added(&self, tracks: &[Track]) {
        for notifier in &self.inner {
            notifier.on_tracks_added(tracks).await;
        }
    }

    async fn on_tracks_updated(&self, tracks: &[Track]) {
        for notifier in &self.inner {
            notifier.on_tracks_updated(tracks).await;
        }
    }
}
