use std::path::Path;

use anyhow::{Context, Result};
use billy_adapters::AdapterFactory;
use billy_core::{SourceId, SourceKind};
use billy_storage::CatalogStore;
use serde::Deserialize;
use tracing::info;

use crate::registry::SourceRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSeedFile {
    pub sources: Vec<SourceSeed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceSeed {
    pub kind: SourceKind,
    pub locator: String,
}

/// Parses a seed file; `.json` files are read as JSON, everything else as YAML.
pub fn parse_seed_file(path: &Path, raw: &str) -> Result<SourceSeedFile> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(raw).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_yaml::from_str(raw).with_context(|| format!("parsing {}", path.display()))
    }
}

pub async fn load_seed_file(path: &Path) -> Result<SourceSeedFile> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_seed_file(path, &raw)
}

/// Registers every seed through the idempotent path. Re-importing the same file is a no-op.
pub async fn import_sources(
    registry: &mut SourceRegistry,
    store: &dyn CatalogStore,
    factory: &dyn AdapterFactory,
    seeds: &SourceSeedFile,
) -> Result<Vec<SourceId>> {
    let before = registry.len();
    let mut ids = Vec::with_capacity(seeds.sources.len());
    for seed in &seeds.sources {
        let locator = seed.locator.trim();
        let id = registry
            .register(store, factory, seed.kind, locator)
            .await
            .with_context(|| format!("registering {}:{locator}", seed.kind))?;
        ids.push(id);
    }
    info!(
        listed = seeds.sources.len(),
        added = registry.len() - before,
        "imported sources"
    );
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use billy_adapters::{AdapterSettings, HttpAdapterFactory};
    use billy_storage::{HttpClientConfig, HttpFetcher, MemoryCatalog};

    use super::*;

    const SEEDS: &str = r#"
sources:
  - kind: feed
    locator: https://blog.example.com/feed.xml
  - kind: channel
    locator: UCabc123
  - kind: playlist
    locator: " PLxyz "
  - kind: feed
    locator: https://blog.example.com/feed.xml
"#;

    fn factory() -> HttpAdapterFactory {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        HttpAdapterFactory::new(http, AdapterSettings::default())
    }

    #[test]
    fn parses_yaml_and_json() {
        let yaml = parse_seed_file(Path::new("sources.yaml"), SEEDS).unwrap();
        assert_eq!(yaml.sources.len(), 4);
        assert_eq!(yaml.sources[1].kind, SourceKind::Channel);

        let json = parse_seed_file(
            Path::new("sources.JSON"),
            r#"{"sources":[{"kind":"playlist","locator":"PL1"}]}"#,
        )
        .unwrap();
        assert_eq!(
            json.sources,
            vec![SourceSeed {
                kind: SourceKind::Playlist,
                locator: "PL1".into()
            }]
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = parse_seed_file(
            Path::new("sources.yaml"),
            "sources:\n  - kind: podcast\n    locator: x\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("sources.yaml"));
    }

    #[tokio::test]
    async fn import_is_idempotent() {
        let store = MemoryCatalog::new();
        let factory = factory();
        let mut registry = SourceRegistry::new();
        let seeds = parse_seed_file(Path::new("sources.yaml"), SEEDS).unwrap();

        let ids = import_sources(&mut registry, &store, &factory, &seeds).await.unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0], ids[3]);
        assert_eq!(registry.len(), 3);

        import_sources(&mut registry, &store, &factory, &seeds).await.unwrap();
        assert_eq!(store.get_sources().await.unwrap().len(), 3);
        assert!(registry.sources().any(|s| s.locator == "PLxyz"));
    }

    #[tokio::test]
    async fn reads_seed_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(&path, SEEDS).unwrap();
        let seeds = load_seed_file(&path).await.unwrap();
        assert_eq!(seeds.sources.len(), 4);

        let missing = load_seed_file(&dir.path().join("nope.yaml")).await;
        assert!(missing.is_err());
    }
}
