use std::collections::BTreeMap;
use std::sync::Arc;

use billy_adapters::{AdapterFactory, SourceAdapter};
use billy_core::{Source, SourceId, SourceKind};
use billy_storage::{CatalogStore, StoreError};
use tracing::info;

/// A source together with the adapter chosen for it at registration time.
#[derive(Clone)]
pub struct RegisteredSource {
    pub source: Source,
    pub adapter: Arc<dyn SourceAdapter>,
    in_flight: bool,
}

impl RegisteredSource {
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Work item handed to a fetch worker: a snapshot of the source at dispatch time.
#[derive(Clone)]
pub struct FetchJob {
    pub source_id: SourceId,
    pub label: String,
    pub watermark: i64,
    pub adapter: Arc<dyn SourceAdapter>,
}

/// In-memory mirror of the persisted sources, owned by the scheduler.
///
/// Workers never see the registry; they receive [`FetchJob`] snapshots and report back, and
/// only the owner flips in-flight flags and advances watermarks.
#[derive(Default)]
pub struct SourceRegistry {
    entries: BTreeMap<SourceId, RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources(sources: Vec<Source>, factory: &dyn AdapterFactory) -> Self {
        let mut registry = Self::new();
        for source in sources {
            let adapter = factory.build(&source);
            registry.insert(source, adapter);
        }
        registry
    }

    /// Loads every persisted source.
    pub async fn load(store: &dyn CatalogStore, factory: &dyn AdapterFactory) -> Result<Self, StoreError> {
        let sources = store.get_sources().await?;
        info!(sources = sources.len(), "loaded source registry");
        Ok(Self::from_sources(sources, factory))
    }

    /// Registers through the store (idempotent on kind + locator) and mirrors the result.
    pub async fn register(
        &mut self,
        store: &dyn CatalogStore,
        factory: &dyn AdapterFactory,
        kind: SourceKind,
        locator: &str,
    ) -> Result<SourceId, StoreError> {
        let source = store.register_source(kind, locator).await?;
        let id = source.id;
        if !self.entries.contains_key(&id) {
            let adapter = factory.build(&source);
            self.insert(source, adapter);
        }
        Ok(id)
    }

    pub fn insert(&mut self, source: Source, adapter: Arc<dyn SourceAdapter>) {
        self.entries.insert(
            source.id,
            RegisteredSource {
                source,
                adapter,
                in_flight: false,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: SourceId) -> Option<&RegisteredSource> {
        self.entries.get(&id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.entries.values().map(|e| &e.source)
    }

    /// Sources whose last clean fetch is at least `interval` seconds old and that are not
    /// already being fetched.
    pub fn due(&self, now: i64, interval: i64) -> Vec<SourceId> {
        self.entries
            .values()
            .filter(|e| !e.in_flight && now.saturating_sub(e.source.watermark) >= interval)
            .map(|e| e.source.id)
            .collect()
    }

    /// Marks the source in flight and snapshots it for a worker. `None` if unknown or
    /// already in flight.
    pub fn dispatch(&mut self, id: SourceId) -> Option<FetchJob> {
        let entry = self.entries.get_mut(&id)?;
        if entry.in_flight {
            return None;
        }
        entry.in_flight = true;
        Some(FetchJob {
            source_id: id,
            label: entry.source.label(),
            watermark: entry.source.watermark,
            adapter: entry.adapter.clone(),
        })
    }

    /// Clears the in-flight flag. `advance_to` is set only for a fetch that completed and was
    /// persisted; the watermark never moves backwards.
    pub fn complete(&mut self, id: SourceId, advance_to: Option<i64>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.in_flight = false;
            if let Some(ts) = advance_to {
                entry.source.watermark = entry.source.watermark.max(ts);
            }
        }
    }

    /// Releases sources whose worker never reported back and returns them. Their watermark
    /// is left alone.
    pub fn release_all(&mut self) -> Vec<SourceId> {
        self.entries
            .values_mut()
            .filter(|e| e.in_flight)
            .map(|entry| {
                entry.in_flight = false;
                entry.source.id
            })
            .collect()
    }
}
