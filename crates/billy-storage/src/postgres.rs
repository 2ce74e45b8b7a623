use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use billy_core::{CanonicalLink, NewTrack, Source, SourceId, SourceKind, Track, TrackId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{Attribution, CatalogStore, StoreError, Upserted};

const TRACK_COLUMNS: &str = "id, link, title, discovered_at, image, sources";

const INSERT_TRACKS_SQL: &str = r#"
INSERT INTO tracks (id, link, title, discovered_at, image, sources)
SELECT t.id, t.link, t.title, t.discovered_at, t.image, string_to_array(t.sources, ',')::uuid[]
FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::int8[], $5::text[], $6::text[])
    AS t(id, link, title, discovered_at, image, sources)
ON CONFLICT (link) DO NOTHING
RETURNING id, link, title, discovered_at, image, sources
"#;

const UNION_BY_LINK_SQL: &str = r#"
UPDATE tracks
SET sources = ARRAY(SELECT DISTINCT s FROM unnest(sources || $2::uuid[]) AS s ORDER BY s)
WHERE link = $1 AND NOT (sources @> $2::uuid[])
RETURNING id, link, title, discovered_at, image, sources
"#;

const UNION_BY_ID_SQL: &str = r#"
UPDATE tracks
SET sources = ARRAY(SELECT DISTINCT s FROM unnest(sources || $2::uuid[]) AS s ORDER BY s)
WHERE id = $1 AND NOT (sources @> $2::uuid[])
RETURNING id, link, title, discovered_at, image, sources
"#;

/// Postgres-backed catalog. Set-union happens inside single UPDATE statements so
/// concurrent mergers serialize on the row lock instead of overwriting each other.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn track_by_link(
        tx: &mut Transaction<'_, Postgres>,
        link: &CanonicalLink,
    ) -> Result<Option<Track>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE link = $1"))
            .bind(link.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(track_from_row).transpose()
    }
}

fn track_from_row(row: &PgRow) -> Result<Track, StoreError> {
    let link: String = row.try_get("link")?;
    let link = CanonicalLink::parse(link).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let sources: Vec<Uuid> = row.try_get("sources")?;
    Ok(Track {
        id: TrackId(row.try_get("id")?),
        link,
        title: row.try_get("title")?,
        discovered_at: row.try_get("discovered_at")?,
        image: row.try_get("image")?,
        sources: sources.into_iter().map(SourceId).collect(),
    })
}

fn source_from_row(row: &PgRow) -> Result<Source, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = kind
        .parse::<SourceKind>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Source {
        id: SourceId(row.try_get("id")?),
        kind,
        locator: row.try_get("locator")?,
        watermark: row.try_get("watermark")?,
    })
}

fn uuid_vec(ids: &BTreeSet<SourceId>) -> Vec<Uuid> {
    ids.iter().map(|id| id.0).collect()
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn find_by_links(
        &self,
        links: &[CanonicalLink],
    ) -> Result<HashMap<CanonicalLink, Track>, StoreError> {
        if links.is_empty() {
            return Ok(HashMap::new());
        }
        let raw: Vec<&str> = links.iter().map(CanonicalLink::as_str).collect();
        let rows = sqlx::query(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE link = ANY($1)"
        ))
        .bind(&raw)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| track_from_row(row).map(|t| (t.link.clone(), t)))
            .collect()
    }

    async fn bulk_insert(&self, tracks: Vec<NewTrack>) -> Result<Vec<Upserted>, StoreError> {
        if tracks.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = tracks.iter().map(|_| Uuid::new_v4()).collect();
        let links: Vec<&str> = tracks.iter().map(|t| t.link.as_str()).collect();
        let titles: Vec<&str> = tracks.iter().map(|t| t.title.as_str()).collect();
        let discovered: Vec<i64> = tracks.iter().map(|t| t.discovered_at).collect();
        let images: Vec<Option<&str>> = tracks.iter().map(|t| t.image.as_deref()).collect();
        let sources: Vec<String> = tracks
            .iter()
            .map(|t| {
                t.sources
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(INSERT_TRACKS_SQL)
            .bind(&ids)
            .bind(&links)
            .bind(&titles)
            .bind(&discovered)
            .bind(&images)
            .bind(&sources)
            .fetch_all(&mut *tx)
            .await?;

        let mut out = Vec::with_capacity(tracks.len());
        let mut inserted_links = HashSet::new();
        for row in &rows {
            let track = track_from_row(row)?;
            inserted_links.insert(track.link.clone());
            out.push(Upserted {
                track,
                inserted: true,
                sources_changed: false,
            });
        }

        // Links created by a concurrent writer between lookup and insert.
        for lost in tracks.iter().filter(|t| !inserted_links.contains(&t.link)) {
            debug!(link = %lost.link, "insert lost race; folding into existing track");
            let changed = sqlx::query(UNION_BY_LINK_SQL)
                .bind(lost.link.as_str())
                .bind(uuid_vec(&lost.sources))
                .fetch_optional(&mut *tx)
                .await?;
            let (track, sources_changed) = match changed {
                Some(row) => (track_from_row(&row)?, true),
                None => {
                    let existing = Self::track_by_link(&mut tx, &lost.link)
                        .await?
                        .ok_or_else(|| StoreError::Corrupt(format!("link {} vanished", lost.link)))?;
                    (existing, false)
                }
            };
            out.push(Upserted {
                track,
                inserted: false,
                sources_changed,
            });
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn attribute_sources(&self, updates: &[Attribution]) -> Result<Vec<Track>, StoreError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut changed = Vec::new();
        for update in updates {
            let row = sqlx::query(UNION_BY_ID_SQL)
                .bind(update.track_id.0)
                .bind(uuid_vec(&update.source_ids))
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = row {
                changed.push(track_from_row(&row)?);
            }
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn register_source(&self, kind: SourceKind, locator: &str) -> Result<Source, StoreError> {
        sqlx::query(
            "INSERT INTO sources (id, kind, locator) VALUES ($1, $2, $3) ON CONFLICT (kind, locator) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(locator)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, kind, locator, watermark FROM sources WHERE kind = $1 AND locator = $2",
        )
        .bind(kind.as_str())
        .bind(locator)
        .fetch_one(&self.pool)
        .await?;
        source_from_row(&row)
    }

    async fn get_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query("SELECT id, kind, locator, watermark FROM sources ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn update_source_watermark(&self, id: SourceId, ts: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sources SET watermark = GREATEST(watermark, $2) WHERE id = $1")
            .bind(id.0)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownSource(id));
        }
        Ok(())
    }

    async fn track_counts_by_protocol(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            "SELECT split_part(link, ':', 1) AS protocol, COUNT(*) AS n FROM tracks GROUP BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let protocol: String = row.try_get("protocol")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(protocol, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn tracks_from_source(&self, id: SourceId) -> Result<Vec<Track>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE $1 = ANY(sources) ORDER BY link"
        ))
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(track_from_row).collect()
    }
}
