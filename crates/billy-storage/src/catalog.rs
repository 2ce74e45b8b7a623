use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use billy_core::{CanonicalLink, NewTrack, Source, SourceId, SourceKind, Track, TrackId};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error("catalog row is corrupt: {0}")]
    Corrupt(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one row of [`CatalogStore::bulk_insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub track: Track,
    /// `false` when a concurrent writer created the link first and the row was folded
    /// into a set-union on the existing track instead.
    pub inserted: bool,
    /// Only meaningful when `inserted` is false.
    pub sources_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub track_id: TrackId,
    pub source_ids: BTreeSet<SourceId>,
}

/// Persistent table of sources and tracks.
///
/// Implementations must tolerate concurrent callers: two mergers may insert or attribute
/// the same link at the same time, and neither may lose the other's source ids.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_by_links(
        &self,
        links: &[CanonicalLink],
    ) -> Result<HashMap<CanonicalLink, Track>, StoreError>;

    /// Inserts unseen links. A link that already exists is upserted by set-union of sources.
    async fn bulk_insert(&self, tracks: Vec<NewTrack>) -> Result<Vec<Upserted>, StoreError>;

    /// Add-if-absent union of source ids. Returns only the tracks whose set changed.
    async fn attribute_sources(&self, updates: &[Attribution]) -> Result<Vec<Track>, StoreError>;

    /// Idempotent on `(kind, locator)`: re-registering returns the existing source.
    async fn register_source(&self, kind: SourceKind, locator: &str) -> Result<Source, StoreError>;

    async fn get_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Never moves a watermark backwards.
    async fn update_source_watermark(&self, id: SourceId, ts: i64) -> Result<(), StoreError>;

    async fn track_counts_by_protocol(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    async fn tracks_from_source(&self, id: SourceId) -> Result<Vec<Track>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<Source>,
    tracks: HashMap<TrackId, Track>,
    by_link: HashMap<CanonicalLink, TrackId>,
}

impl MemoryState {
    fn union_sources(&mut self, id: TrackId, source_ids: &BTreeSet<SourceId>) -> Option<Track> {
        let track = self.tracks.get_mut(&id)?;
        let before = track.sources.len();
        track.sources.extend(source_ids.iter().copied());
        (track.sources.len() != before).then(|| track.clone())
    }
}

/// In-process catalog used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<MemoryState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track_count(&self) -> usize {
        self.state.read().await.tracks.len()
    }

    pub async fn track_by_link(&self, link: &CanonicalLink) -> Option<Track> {
        let state = self.state.read().await;
        state
            .by_link
            .get(link)
            .and_then(|id| state.tracks.get(id))
            .cloned()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn find_by_links(
        &self,
        links: &[CanonicalLink],
    ) -> Result<HashMap<CanonicalLink, Track>, StoreError> {
        let state = self.state.read().await;
        Ok(links
            .iter()
            .filter_map(|link| {
                let id = state.by_link.get(link)?;
                state.tracks.get(id).map(|t| (link.clone(), t.clone()))
            })
            .collect())
    }

    async fn bulk_insert(&self, tracks: Vec<NewTrack>) -> Result<Vec<Upserted>, StoreError> {
        let mut state = self.state.write().await;
        let mut out = Vec::with_capacity(tracks.len());
        for new in tracks {
            if let Some(existing) = state.by_link.get(&new.link).copied() {
                let changed = state.union_sources(existing, &new.sources);
                let sources_changed = changed.is_some();
                let track = match changed {
                    Some(track) => track,
                    None => state
                        .tracks
                        .get(&existing)
                        .cloned()
                        .ok_or_else(|| StoreError::Corrupt(format!("dangling link {}", new.link)))?,
                };
                out.push(Upserted {
                    track,
                    inserted: false,
                    sources_changed,
                });
                continue;
            }
            let id = TrackId::new_v4();
            let track = new.into_track(id);
            state.by_link.insert(track.link.clone(), id);
            state.tracks.insert(id, track.clone());
            out.push(Upserted {
                track,
                inserted: true,
                sources_changed: false,
            });
        }
        Ok(out)
    }

    async fn attribute_sources(&self, updates: &[Attribution]) -> Result<Vec<Track>, StoreError> {
        let mut state = self.state.write().await;
        Ok(updates
            .iter()
            .filter_map(|u| state.union_sources(u.track_id, &u.source_ids))
            .collect())
    }

    async fn register_source(&self, kind: SourceKind, locator: &str) -> Result<Source, StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .sources
            .iter()
            .find(|s| s.kind == kind && s.locator == locator)
        {
            return Ok(existing.clone());
        }
        let source = Source {
            id: SourceId::new_v4(),
            kind,
            locator: locator.to_string(),
            watermark: 0,
        };
        state.sources.push(source.clone());
        Ok(source)
    }

    async fn get_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self.state.read().await.sources.clone())
    }

    async fn update_source_watermark(&self, id: SourceId, ts: i64) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::UnknownSource(id))?;
        source.watermark = source.watermark.max(ts);
        Ok(())
    }

    async fn track_counts_by_protocol(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let state = self.state.read().await;
        let mut counts = BTreeMap::new();
        for track in state.tracks.values() {
            *counts.entry(track.link.protocol().to_string()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn tracks_from_source(&self, id: SourceId) -> Result<Vec<Track>, StoreError> {
        let state = self.state.read().await;
        let mut tracks: Vec<Track> = state
            .tracks
            .values()
            .filter(|t| t.sources.contains(&id))
            .cloned()
            .collect();
        tracks.sort_by(|a, b| a.link.cmp(&b.link));
        Ok(tracks)
    }
}
