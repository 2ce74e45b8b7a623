use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use billy_core::{CandidateItem, CanonicalLink, NewTrack, SourceId, Track};
use billy_storage::{Attribution, CatalogStore, StoreError};
use metrics::counter;
use serde::Serialize;
use tracing::debug;

use crate::notify::Notifier;

/// Counts produced by one [`Merger::merge`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Distinct links in the batch after collapsing duplicates.
    pub candidates: usize,
    pub inserted: usize,
    /// Existing tracks whose source set grew.
    pub attributed: usize,
    /// Links already attributed to every originating source.
    pub unchanged: usize,
}

impl MergeReport {
    pub fn absorb(&mut self, other: MergeReport) {
        self.candidates += other.candidates;
        self.inserted += other.inserted;
        self.attributed += other.attributed;
        self.unchanged += other.unchanged;
    }
}

struct Pending {
    item: CandidateItem,
    sources: BTreeSet<SourceId>,
}

/// Collapses repeated links; the first item's metadata wins and source ids are unioned.
fn collapse(batch: Vec<(SourceId, CandidateItem)>) -> Vec<Pending> {
    let mut order: Vec<Pending> = Vec::new();
    let mut index: HashMap<CanonicalLink, usize> = HashMap::new();
    for (source_id, item) in batch {
        match index.get(&item.link) {
            Some(&at) => {
                order[at].sources.insert(source_id);
            }
            None => {
                index.insert(item.link.clone(), order.len());
                order.push(Pending {
                    item,
                    sources: BTreeSet::from([source_id]),
                });
            }
        }
    }
    order
}

/// Reconciles fetched candidates against the catalog by canonical link.
#[derive(Clone)]
pub struct Merger {
    store: Arc<dyn CatalogStore>,
    notifier: Arc<dyn Notifier>,
}

impl Merger {
    pub fn new(store: Arc<dyn CatalogStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Inserts unseen links in one bulk call and unions the originating sources into known
    /// ones. Merging the same batch again changes nothing.
    ///
    /// Notifications are sent after the corresponding store write succeeded. A store error
    /// aborts the merge; whatever was already written stays, and a rerun converges.
    pub async fn merge(&self, batch: Vec<(SourceId, CandidateItem)>) -> Result<MergeReport, StoreError> {
        let pending = collapse(batch);
        let mut report = MergeReport {
            candidates: pending.len(),
            ..MergeReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let links: Vec<CanonicalLink> = pending.iter().map(|p| p.item.link.clone()).collect();
        let known = self.store.find_by_links(&links).await?;

        let mut to_insert = Vec::new();
        let mut to_attribute = Vec::new();
        for Pending { item, sources } in pending {
            match known.get(&item.link) {
                Some(track) if sources.is_subset(&track.sources) => report.unchanged += 1,
                Some(track) => to_attribute.push(Attribution {
                    track_id: track.id,
                    source_ids: sources,
                }),
                None => to_insert.push(NewTrack::from_candidate(item, sources)),
            }
        }

        let mut updated: Vec<Track> = Vec::new();
        if !to_insert.is_empty() {
            let mut added = Vec::with_capacity(to_insert.len());
            for row in self.store.bulk_insert(to_insert).await? {
                if row.inserted {
                    added.push(row.track);
                } else if row.sources_changed {
                    // Another merger inserted the link between lookup and insert.
                    updated.push(row.track);
                } else {
                    report.unchanged += 1;
                }
            }
            report.inserted = added.len();
            if !added.is_empty() {
                self.notifier.on_tracks_added(&added).await;
            }
        }

        if !to_attribute.is_empty() {
            let requested = to_attribute.len();
            let changed = self.store.attribute_sources(&to_attribute).await?;
            report.unchanged += requested - changed.len();
            updated.extend(changed);
        }
        report.attributed = updated.len();
        if !updated.is_empty() {
            self.notifier.on_tracks_updated(&updated).await;
        }

        counter!("ingest_tracks_inserted_total").increment(report.inserted as u64);
        counter!("ingest_tracks_attributed_total").increment(report.attributed as u64);
        debug!(
            candidates = report.candidates,
            inserted = report.inserted,
            attributed = report.attributed,
            unchanged = report.unchanged,
            "merged batch"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use billy_core::SourceKind;
    use billy_storage::MemoryCatalog;
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<Vec<Track>>>,
        updated: Mutex<Vec<Vec<Track>>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn on_tracks_added(&self, tracks: &[Track]) {
            self.added.lock().await.push(tracks.to_vec());
        }

        async fn on_tracks_updated(&self, tracks: &[Track]) {
            self.updated.lock().await.push(tracks.to_vec());
        }
    }

    fn candidate(link: &str, ts: i64) -> CandidateItem {
        CandidateItem {
            title: format!("song {link}"),
            link: CanonicalLink::parse(link).unwrap(),
            discovered_at: ts,
            image: None,
        }
    }

    fn link(raw: &str) -> CanonicalLink {
        CanonicalLink::parse(raw).unwrap()
    }

    async fn setup() -> (Arc<MemoryCatalog>, Arc<Recorder>, Merger, SourceId, SourceId) {
        let store = Arc::new(MemoryCatalog::new());
        let recorder = Arc::new(Recorder::default());
        let merger = Merger::new(store.clone(), recorder.clone());
        let a = store
            .register_source(SourceKind::Feed, "https://a.example/feed")
            .await
            .unwrap()
            .id;
        let b = store
            .register_source(SourceKind::Channel, "UCbbb")
            .await
            .unwrap()
            .id;
        (store, recorder, merger, a, b)
    }

    #[tokio::test]
    async fn new_links_are_inserted_and_announced_once() {
        let (store, recorder, merger, s1, _) = setup().await;
        let report = merger
            .merge(vec![
                (s1, candidate("youtube:a", 1050)),
                (s1, candidate("youtube:b", 1040)),
            ])
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.attributed, 0);
        assert_eq!(store.track_count().await, 2);
        let a = store.track_by_link(&link("youtube:a")).await.unwrap();
        assert_eq!(a.sources, BTreeSet::from([s1]));

        let added = recorder.added.lock().await;
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].len(), 2);
        assert!(recorder.updated.lock().await.is_empty());
    }

    #[tokio::test]
    async fn merging_the_same_batch_twice_is_a_no_op() {
        let (store, recorder, merger, s1, _) = setup().await;
        let batch = vec![
            (s1, candidate("youtube:a", 1050)),
            (s1, candidate("youtube:b", 1040)),
        ];
        merger.merge(batch.clone()).await.unwrap();
        let before = store.track_by_link(&link("youtube:a")).await.unwrap();

        let second = merger.merge(batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.attributed, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(store.track_count().await, 2);
        assert_eq!(store.track_by_link(&link("youtube:a")).await.unwrap(), before);
        assert_eq!(recorder.added.lock().await.len(), 1);
        assert!(recorder.updated.lock().await.is_empty());
    }

    #[tokio::test]
    async fn known_link_from_another_source_is_attributed() {
        let (store, recorder, merger, s1, s2) = setup().await;
        merger.merge(vec![(s1, candidate("youtube:a", 1050))]).await.unwrap();

        let report = merger
            .merge(vec![(s2, candidate("youtube:a", 1200))])
            .await
            .unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.attributed, 1);

        let track = store.track_by_link(&link("youtube:a")).await.unwrap();
        assert_eq!(track.sources, BTreeSet::from([s1, s2]));
        assert_eq!(track.discovered_at, 1050);

        let updated = recorder.updated.lock().await;
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0][0].sources, BTreeSet::from([s1, s2]));
        assert_eq!(recorder.added.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn attribution_does_not_depend_on_arrival_order() {
        let (forward, _, forward_merger, a, b) = setup().await;
        forward_merger.merge(vec![(a, candidate("youtube:x", 10))]).await.unwrap();
        forward_merger.merge(vec![(b, candidate("youtube:x", 10))]).await.unwrap();

        let (reverse, _, reverse_merger, _, _) = setup().await;
        reverse_merger.merge(vec![(b, candidate("youtube:x", 10))]).await.unwrap();
        reverse_merger.merge(vec![(a, candidate("youtube:x", 10))]).await.unwrap();

        let expected = BTreeSet::from([a, b]);
        assert_eq!(forward.track_by_link(&link("youtube:x")).await.unwrap().sources, expected);
        assert_eq!(reverse.track_by_link(&link("youtube:x")).await.unwrap().sources, expected);
    }

    #[tokio::test]
    async fn duplicate_links_within_a_batch_collapse() {
        let (store, recorder, merger, s1, s2) = setup().await;
        let mut later = candidate("youtube:a", 2000);
        later.title = "second copy".into();
        let report = merger
            .merge(vec![
                (s1, candidate("youtube:a", 1000)),
                (s2, later),
                (s1, candidate("youtube:a", 1000)),
            ])
            .await
            .unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.inserted, 1);
        let track = store.track_by_link(&link("youtube:a")).await.unwrap();
        assert_eq!(track.title, "song youtube:a");
        assert_eq!(track.sources, BTreeSet::from([s1, s2]));
        assert_eq!(recorder.added.lock().await[0].len(), 1);
    }

    #[tokio::test]
    async fn concurrent_mergers_keep_every_source() {
        let (store, _, merger, s1, s2) = setup().await;
        let batch = |s| (0..50).map(move |i| (s, candidate(&format!("youtube:v{i}"), i))).collect::<Vec<_>>();

        let (left, right) = tokio::join!(merger.merge(batch(s1)), merger.merge(batch(s2)));
        let (left, right) = (left.unwrap(), right.unwrap());

        assert_eq!(left.inserted + right.inserted, 50);
        assert_eq!(store.track_count().await, 50);
        for i in 0..50 {
            let track = store.track_by_link(&link(&format!("youtube:v{i}"))).await.unwrap();
            assert_eq!(track.sources, BTreeSet::from([s1, s2]));
        }
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let (store, recorder, merger, _, _) = setup().await;
        assert_eq!(merger.merge(Vec::new()).await.unwrap(), MergeReport::default());
        assert_eq!(store.track_count().await, 0);
        assert!(recorder.added.lock().await.is_empty());
    }
}
