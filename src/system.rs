use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::embed::{load_embedder, Embedder};
use crate::ingest::{IngestError, StrategyRegistry};
use crate::pathspec::{PathSpec, SourceKind};
use crate::registry::MetadataRegistry;
use crate::source::{self, FileDescriptor};
use crate::stats::IngestionStats;
use crate::store::{Filter, SearchHit, VectorRow, VectorStore};

// ---------------------------------------------------------------------------
// The System owns every moving part: compiled specs, the store behind one
// readers-writer lock, the embedder, the strategy table, metadata registry,
// and stats. It is built once at startup, shared by the request loop and the
// watcher, and dropped at shutdown.
// ---------------------------------------------------------------------------

pub struct System {
    pub description: String,
    pub watch_default: bool,
    pub specs: Vec<PathSpec>,
    pub store: RwLock<VectorStore>,
    pub embedder: Box<dyn Embedder>,
    pub strategies: StrategyRegistry,
    pub registry: MetadataRegistry,
    pub stats: IngestionStats,
    /// xxh3 of the last content ingested per (spec index, file id); lets the
    /// watcher drop modify events that changed nothing but the mtime. Keyed
    /// per spec so specs matching the same file screen independently.
    fingerprints: Mutex<HashMap<(usize, String), u64>>,
}

impl System {
    pub fn new(config: Config, embedder: Box<dyn Embedder>) -> Self {
        Self {
            description: config.description,
            watch_default: config.watch,
            specs: config.specs,
            store: RwLock::new(VectorStore::new()),
            embedder,
            strategies: StrategyRegistry::with_builtins(),
            registry: MetadataRegistry::new(),
            stats: IngestionStats::new(),
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    /// Build the system with the embedder named in the configuration.
    /// A model that fails to load is an unrecoverable startup error.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = load_embedder(&config.model)?;
        Ok(Self::new(config, embedder))
    }

    fn spec_is_watched(&self, spec: &PathSpec) -> bool {
        spec.source == SourceKind::Filesystem && spec.watch.resolve(self.watch_default)
    }

    /// Filesystem specs whose watch setting resolves to enabled.
    pub fn watched_specs(&self) -> impl Iterator<Item = &PathSpec> {
        self.specs.iter().filter(|spec| self.spec_is_watched(spec))
    }

    /// Enumerate and ingest every configured source. File reads run in
    /// parallel; embedding and store writes stay sequential. Failures are
    /// isolated per file. Returns (files ingested, segments written).
    pub fn ingest_all(&self) -> (usize, usize) {
        let mut files = 0usize;
        let mut segments = 0usize;

        for (spec_index, spec) in self.specs.iter().enumerate() {
            let descriptors = source::enumerate(spec);
            for descriptor in &descriptors {
                self.stats.record_matched(&descriptor.source_path);
                self.stats
                    .record_captures(&descriptor.source_path, &descriptor.captures);
            }

            let loaded: Vec<(FileDescriptor, Result<String, IngestError>)> = descriptors
                .into_par_iter()
                .map(|descriptor| {
                    let content = source::read_content(&descriptor.source);
                    (descriptor, content)
                })
                .collect();

            for (descriptor, content) in loaded {
                match content.and_then(|content| {
                    self.ingest_descriptor(spec_index, spec, &descriptor, &content)
                }) {
                    Ok(count) => {
                        files += 1;
                        segments += count;
                    }
                    Err(e) => self.record_failure(&descriptor, &e),
                }
            }
        }

        self.stats.mark_ingestion_complete();
        tracing::info!(files, segments, "ingestion complete");
        (files, segments)
    }

    /// Dispatch, embed, and atomically swap one file's rows into the store.
    fn ingest_descriptor(
        &self,
        spec_index: usize,
        spec: &PathSpec,
        descriptor: &FileDescriptor,
        content: &str,
    ) -> Result<usize, IngestError> {
        let segments = self.strategies.process_document(
            &spec.strategy,
            &descriptor.file_id,
            content,
            &descriptor.metadata,
        )?;

        let texts: Vec<String> = segments.iter().map(|s| s.text_to_embed.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .map_err(|e| IngestError::Embedding(e.to_string()))?;
        if vectors.len() != segments.len() {
            return Err(IngestError::Embedding(format!(
                "model returned {} vectors for {} segments",
                vectors.len(),
                segments.len()
            )));
        }

        for segment in &segments {
            self.registry.observe(&segment.metadata);
        }

        let count = segments.len();
        let rows: Vec<VectorRow> = segments
            .into_iter()
            .zip(vectors)
            .map(|(segment, embedding)| VectorRow {
                file_id: segment.file_id,
                segment_id: segment.segment_id,
                embedding,
                text: segment.content_to_store,
                metadata: segment.metadata,
            })
            .collect();

        // One write-lock acquisition: no search sees the file half-replaced.
        self.store
            .write()
            .expect("vector store poisoned")
            .replace_file(&descriptor.file_id, rows);

        self.fingerprints
            .lock()
            .expect("fingerprints poisoned")
            .insert(
                (spec_index, descriptor.file_id.clone()),
                xxhash_rust::xxh3::xxh3_64(content.as_bytes()),
            );

        self.stats
            .record_processed(&descriptor.source_path, count);
        Ok(count)
    }

    fn record_failure(&self, descriptor: &FileDescriptor, error: &IngestError) {
        tracing::warn!(
            file = %descriptor.file_id,
            source = %descriptor.source_path,
            kind = error.kind(),
            "ingestion failure: {error}"
        );
        self.stats.record_failure(
            &descriptor.source_path,
            &descriptor.file_id,
            error.kind(),
            &error.to_string(),
        );
    }

    // ── Watcher protocol ────────────────────────────────────────────────

    /// Re-ingest `path` against every watched spec it matches, replacing any
    /// previous rows. A modify whose content fingerprint is unchanged is a
    /// no-op. Returns true when at least one spec matched.
    pub fn upsert_path(&self, path: &Path) -> bool {
        let file_id = source::canonical_file_id(path);
        let mut matched = false;

        for (spec_index, spec) in self.specs.iter().enumerate() {
            if !self.spec_is_watched(spec) {
                continue;
            }
            let Some(descriptor) = source::descriptor_for_path(spec, path) else {
                continue;
            };
            matched = true;
            self.stats.record_matched(&descriptor.source_path);
            self.stats
                .record_captures(&descriptor.source_path, &descriptor.captures);

            let outcome = source::read_content(&descriptor.source).and_then(|content| {
                let hash = xxhash_rust::xxh3::xxh3_64(content.as_bytes());
                let unchanged = self
                    .fingerprints
                    .lock()
                    .expect("fingerprints poisoned")
                    .get(&(spec_index, file_id.clone()))
                    .is_some_and(|h| *h == hash);
                if unchanged {
                    tracing::debug!(file = %file_id, "content unchanged; skipping re-embed");
                    return Ok(0);
                }
                self.ingest_descriptor(spec_index, spec, &descriptor, &content)
            });
            match outcome {
                Ok(count) if count > 0 => {
                    self.stats.record_watch_update(&descriptor.source_path)
                }
                Ok(_) => {}
                Err(e) => self.record_failure(&descriptor, &e),
            }
        }
        matched
    }

    /// Drop every row of the file at `path`. Uses the same canonicalization
    /// as ingestion so the deletion key always lines up.
    pub fn remove_path(&self, path: &Path) -> usize {
        let file_id = source::canonical_file_id(path);
        self.fingerprints
            .lock()
            .expect("fingerprints poisoned")
            .retain(|(_, fid), _| fid != &file_id);
        let removed = self
            .store
            .write()
            .expect("vector store poisoned")
            .remove_all(&file_id);
        if removed > 0 {
            tracing::debug!(file = %file_id, removed, "rows removed");
        }
        removed
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// Validated search: embed the query, build the equality conjunction,
    /// scan the store. Ingestion errors never surface here.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<SearchHit>, IngestError> {
        if query.trim().is_empty() {
            return Err(IngestError::Validation("query must not be empty".into()));
        }
        if limit == 0 {
            return Err(IngestError::Validation("limit must be positive".into()));
        }
        for (key, value) in metadata {
            if !self.registry.contains(key, value) {
                return Err(IngestError::Validation(format!(
                    "unknown metadata filter `{key}` = `{value}`"
                )));
            }
        }

        let query_vec = self
            .embedder
            .embed_one(query)
            .map_err(|e| IngestError::Embedding(e.to_string()))?;
        let filter = Filter::conjunction(metadata.clone());

        Ok(self
            .store
            .read()
            .expect("vector store poisoned")
            .search(&query_vec, limit, filter.as_ref()))
    }

    // ── Resources ───────────────────────────────────────────────────────

    pub fn resource_json(&self, uri: &str) -> Option<serde_json::Value> {
        match uri {
            "ingestion://status" => {
                let store = self.store.read().expect("vector store poisoned");
                Some(
                    self.stats
                        .status_json(store.document_count(), store.segment_count()),
                )
            }
            "ingestion://stats" => Some(self.stats.stats_json()),
            "ingestion://failures" => Some(self.stats.failures_json()),
            "ingestion://metadata" => Some(self.stats.metadata_json()),
            "ingestion://watch-stats" => Some(self.stats.watch_json()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::embed::HashedBowEmbedder;

    fn system_for(dir: &Path, source_lines: &str) -> System {
        let text = format!("model = \"bow\"\n{source_lines}");
        let text = text.replace("<tmp>", &dir.display().to_string());
        let cfg = config::parse(&text).expect("config parses");
        System::new(cfg, Box::new(HashedBowEmbedder::new()))
    }

    fn no_filters() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn filters(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn ranked_search_over_two_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("football.md"), "I love playing football and soccer")
            .unwrap();
        std::fs::write(dir.path().join("cooking.md"), "Cooking pasta is delicious").unwrap();

        let system = system_for(dir.path(), "[[sources]]\npath = \"<tmp>/*.md\"\n");
        let (files, segments) = system.ingest_all();
        assert_eq!((files, segments), (2, 2));

        let hits = system
            .search("playing football", 2, &no_filters())
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "I love playing football and soccer");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn name_metadata_filters_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cooking.md"), "Cooking pasta is delicious").unwrap();

        let system = system_for(
            dir.path(),
            "[[sources]]\npath = \"<tmp>/*.md\"\nname = \"test-docs\"\n",
        );
        system.ingest_all();

        let hits = system
            .search("delicious pasta", 10, &filters(&[("name", "test-docs")]))
            .expect("search");
        assert!(!hits.is_empty());
        assert!(hits[0].text.contains("pasta"));
    }

    #[test]
    fn captures_work_as_filters() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("v1")).unwrap();
        std::fs::create_dir(dir.path().join("v2")).unwrap();
        std::fs::write(dir.path().join("v1/guide.md"), "Version 1 guide content").unwrap();
        std::fs::write(dir.path().join("v2/guide.md"), "Version 2 guide content").unwrap();

        let system = system_for(
            dir.path(),
            "[[sources]]\npath = \"<tmp>/(?<version>v[0-9]+)/guide.md\"\n",
        );
        system.ingest_all();

        let all = system.search("guide content", 10, &no_filters()).expect("search");
        assert_eq!(all.len(), 2);

        let v1 = system
            .search("guide content", 10, &filters(&[("version", "v1")]))
            .expect("search");
        assert_eq!(v1.len(), 1);
        assert!(v1[0].text.contains("Version 1"));

        let v2 = system
            .search("guide content", 10, &filters(&[("version", "v2")]))
            .expect("search");
        assert_eq!(v2.len(), 1);
        assert!(v2[0].text.contains("Version 2"));
    }

    #[test]
    fn unknown_filter_key_or_value_is_a_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
        let system = system_for(
            dir.path(),
            "[[sources]]\npath = \"<tmp>/*.md\"\nname = \"docs\"\n",
        );
        system.ingest_all();

        let err = system
            .search("alpha", 10, &filters(&[("nope", "docs")]))
            .unwrap_err();
        assert_eq!(err.kind(), "validation-error");

        let err = system
            .search("alpha", 10, &filters(&[("name", "other")]))
            .unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn empty_query_and_zero_limit_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
        let system = system_for(dir.path(), "[[sources]]\npath = \"<tmp>/*.md\"\n");
        system.ingest_all();

        assert_eq!(
            system.search("  ", 10, &no_filters()).unwrap_err().kind(),
            "validation-error"
        );
        assert_eq!(
            system.search("alpha", 0, &no_filters()).unwrap_err().kind(),
            "validation-error"
        );
    }

    #[test]
    fn segment_metadata_is_a_superset_of_the_descriptor() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.md"), "alpha beta gamma").unwrap();
        let system = system_for(
            dir.path(),
            "[[sources]]\npath = \"<tmp>/*.md\"\nname = \"docs\"\nteam = \"core\"\n",
        );
        system.ingest_all();

        let hits = system.search("alpha", 1, &no_filters()).expect("search");
        let meta = &hits[0].metadata;
        for key in ["name", "team", "doc-id", "file-id", "segment-id"] {
            assert!(meta.contains_key(key), "missing `{key}` in {meta:?}");
        }
    }

    #[test]
    fn failures_are_isolated_and_recorded() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("good.clj"), "(ns app.good \"Fine doc\")").unwrap();
        std::fs::write(dir.path().join("bad.clj"), "(defn no-ns [])").unwrap();

        let system = system_for(
            dir.path(),
            "[[sources]]\npath = \"<tmp>/*.clj\"\ningest = \"namespace-doc\"\n",
        );
        let (files, _) = system.ingest_all();
        assert_eq!(files, 1);
        assert_eq!(system.stats.total_errors(), 1);

        let failures = system.resource_json("ingestion://failures").expect("doc");
        assert_eq!(failures[0]["error_type"], "parse-error");
        assert!(failures[0]["file_path"]
            .as_str()
            .expect("path")
            .ends_with("bad.clj"));

        // Searches never surface ingestion errors.
        let hits = system.search("fine doc", 10, &no_filters()).expect("search");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn upsert_and_remove_follow_canonical_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.md");
        std::fs::write(&file, "alpha").unwrap();

        let system = system_for(
            dir.path(),
            "watch = true\n[[sources]]\npath = \"<tmp>/*.md\"\n",
        );
        system.ingest_all();
        assert_eq!(system.search("alpha", 1, &no_filters()).expect("s").len(), 1);

        std::fs::write(&file, "beta").unwrap();
        assert!(system.upsert_path(&file));
        let hits = system.search("alpha beta", 10, &no_filters()).expect("s");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "beta");

        assert_eq!(system.remove_path(&file), 1);
        assert!(system.search("beta", 10, &no_filters()).expect("s").is_empty());
    }

    #[test]
    fn unchanged_modify_skips_re_embedding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.md");
        std::fs::write(&file, "alpha").unwrap();

        let system = system_for(
            dir.path(),
            "watch = true\n[[sources]]\npath = \"<tmp>/*.md\"\n",
        );
        system.ingest_all();

        // Touch without change: matched, but no watch update recorded.
        assert!(system.upsert_path(&file));
        let watch = system.resource_json("ingestion://watch-stats").expect("doc");
        assert_eq!(watch["sources"][0]["updates_applied"], 0);
    }

    #[test]
    fn later_spec_wins_for_watcher_updates_too() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.md");
        std::fs::write(&file, "alpha").unwrap();

        // Two specs match the same file; configuration order decides whose
        // rows stay, for startup ingestion and watcher updates alike.
        let system = system_for(
            dir.path(),
            "watch = true\n\
             [[sources]]\npath = \"<tmp>/*.md\"\nname = \"first\"\n\n\
             [[sources]]\npath = \"<tmp>/*.md\"\nname = \"second\"\n",
        );
        system.ingest_all();

        let hits = system.search("alpha", 10, &no_filters()).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].metadata.get("name").and_then(|v| v.as_str()),
            Some("second")
        );

        std::fs::write(&file, "alpha beta").unwrap();
        assert!(system.upsert_path(&file));
        let hits = system.search("alpha beta", 10, &no_filters()).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "alpha beta");
        assert_eq!(
            hits[0].metadata.get("name").and_then(|v| v.as_str()),
            Some("second")
        );

        // An unchanged touch keeps the later spec's rows in place.
        assert!(system.upsert_path(&file));
        let hits = system.search("alpha beta", 10, &no_filters()).expect("search");
        assert_eq!(
            hits[0].metadata.get("name").and_then(|v| v.as_str()),
            Some("second")
        );
    }

    #[test]
    fn status_resource_tracks_live_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.md");
        std::fs::write(&file, "alpha").unwrap();
        let system = system_for(
            dir.path(),
            "watch = true\n[[sources]]\npath = \"<tmp>/*.md\"\n",
        );
        system.ingest_all();

        let status = system.resource_json("ingestion://status").expect("doc");
        assert_eq!(status["total_documents"], 1);
        assert_eq!(status["total_segments"], 1);

        system.remove_path(&file);
        let status = system.resource_json("ingestion://status").expect("doc");
        assert_eq!(status["total_documents"], 0);
        assert_eq!(status["total_segments"], 0);
    }

    #[test]
    fn code_analysis_source_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("lib.rs"),
            "/// Talks to the scheduler.\npub fn public_fn() {}\n\nfn private_fn() {}\n",
        )
        .unwrap();

        let system = system_for(
            dir.path(),
            "[[sources]]\npath = \"<tmp>/*.rs\"\ningest = \"code-analysis\"\nvisibility = \"public-only\"\n",
        );
        system.ingest_all();

        let hits = system
            .search("talks to the scheduler", 10, &no_filters())
            .expect("search");
        assert!(!hits.is_empty());
        for hit in &hits {
            assert_ne!(
                hit.metadata.get("element-name").and_then(|v| v.as_str()),
                Some("private_fn")
            );
        }

        // element-type made it into the advertised enum values.
        assert!(system.registry.contains("element-type", "method"));
    }

    #[test]
    fn bundled_sources_ingest_from_the_embedded_tree() {
        let cfg = config::parse("model = \"bow\"\n[[sources]]\nresource = \"docs/*.md\"\n")
            .expect("config");
        let system = System::new(cfg, Box::new(HashedBowEmbedder::new()));
        let (files, _) = system.ingest_all();
        assert!(files >= 1);

        let hits = system
            .search("path spec wildcards capture", 5, &no_filters())
            .expect("search");
        assert!(!hits.is_empty());

        // Bundled sources are read-only: never watched.
        assert_eq!(system.watched_specs().count(), 0);
    }
}
