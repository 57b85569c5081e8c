use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};
use text_splitter::{ChunkConfig, TextSplitter};
use thiserror::Error;

use crate::analysis;

// ---------------------------------------------------------------------------
// Ingestion: one file in, zero or more embeddable segments out.
//
// Strategies are registered under string tags in an open table; the
// dispatcher validates every descriptor before anything is embedded. Errors
// are isolated per file — the caller records the failure and moves on.
// ---------------------------------------------------------------------------

/// Scalar metadata value. Everything is a string except the numeric chunk
/// bookkeeping (`chunk-index`, `chunk-count`, `chunk-offset`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    Num(i64),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            MetaValue::Num(_) => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        MetaValue::Num(n)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// Tagged ingestion failure. The tag names double as the `error_type` field
/// of failure records surfaced through `ingestion://failures`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("read error: {0}")]
    Read(String),
    #[error("analysis error: {0}")]
    Analysis(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("embedding error: {0}")]
    Embedding(String),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Parse(_) => "parse-error",
            IngestError::Read(_) => "read-error",
            IngestError::Analysis(_) => "analysis-error",
            IngestError::Validation(_) => "validation-error",
            IngestError::Embedding(_) => "embedding-error",
        }
    }
}

/// Strategy-specific knobs, parsed out of the source configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyParams {
    pub embedding: Option<String>,
    pub content_strategy: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub visibility: Option<String>,
    pub element_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub tag: String,
    pub params: StrategyParams,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            tag: "whole-document".to_string(),
            params: StrategyParams::default(),
        }
    }
}

/// One addressable unit headed for the vector store.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub file_id: String,
    pub segment_id: String,
    pub text_to_embed: String,
    pub content_to_store: String,
    pub metadata: Metadata,
}

/// Everything a strategy may look at for one document.
pub struct DocumentInput<'a> {
    pub file_id: &'a str,
    pub content: &'a str,
    pub metadata: &'a Metadata,
    pub params: &'a StrategyParams,
}

pub trait Strategy: Send + Sync {
    fn process(&self, input: &DocumentInput<'_>) -> Result<Vec<SegmentDescriptor>, IngestError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct StrategyRegistry {
    by_tag: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn with_builtins() -> Self {
        let mut reg = Self {
            by_tag: HashMap::new(),
        };
        reg.register("whole-document", Arc::new(WholeDocument));
        reg.register("file-path", Arc::new(FilePath));
        reg.register("namespace-doc", Arc::new(NamespaceDoc));
        reg.register("single-segment", Arc::new(SingleSegment));
        reg.register("chunked", Arc::new(Chunked));
        reg.register("code-analysis", Arc::new(CodeAnalysis));
        reg
    }

    /// Extension hook: add or replace a strategy under `tag`.
    pub fn register(&mut self, tag: &str, strategy: Arc<dyn Strategy>) {
        self.by_tag.insert(tag.to_string(), strategy);
    }

    pub fn known_tags(&self) -> Vec<&str> {
        self.by_tag.keys().map(|k| k.as_str()).collect()
    }

    /// Dispatch `content` through the strategy named by `config`, validating
    /// every produced descriptor before it is handed to the embedder.
    pub fn process_document(
        &self,
        config: &StrategyConfig,
        file_id: &str,
        content: &str,
        metadata: &Metadata,
    ) -> Result<Vec<SegmentDescriptor>, IngestError> {
        let strategy = self.by_tag.get(&config.tag).ok_or_else(|| {
            IngestError::Validation(format!("unknown ingestion strategy `{}`", config.tag))
        })?;

        let input = DocumentInput {
            file_id,
            content,
            metadata,
            params: &config.params,
        };
        let segments = strategy.process(&input)?;

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for segment in &segments {
            validate_segment(segment, file_id)?;
            if !seen_ids.insert(segment.segment_id.as_str()) {
                return Err(IngestError::Validation(format!(
                    "duplicate segment id `{}` for `{file_id}`",
                    segment.segment_id
                )));
            }
        }
        Ok(segments)
    }
}

fn validate_segment(segment: &SegmentDescriptor, file_id: &str) -> Result<(), IngestError> {
    if segment.file_id != file_id {
        return Err(IngestError::Validation(format!(
            "segment file id `{}` does not match `{file_id}`",
            segment.file_id
        )));
    }
    if segment.text_to_embed.is_empty() {
        return Err(IngestError::Validation(format!(
            "segment `{}` has an empty text-to-embed",
            segment.segment_id
        )));
    }
    if segment.content_to_store.is_empty() {
        return Err(IngestError::Validation(format!(
            "segment `{}` has an empty content-to-store",
            segment.segment_id
        )));
    }
    for key in ["segment-id", "file-id", "doc-id"] {
        if !segment.metadata.contains_key(key) {
            return Err(IngestError::Validation(format!(
                "segment `{}` is missing the `{key}` metadata key",
                segment.segment_id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// single-segment composer + extension tables
// ---------------------------------------------------------------------------

/// Extractor: produce text plus any extra metadata from a document.
pub type Extractor =
    dyn Fn(&DocumentInput<'_>) -> Result<(String, Metadata), IngestError> + Send + Sync;

fn embed_extractors() -> &'static RwLock<HashMap<String, Arc<Extractor>>> {
    static TABLE: OnceLock<RwLock<HashMap<String, Arc<Extractor>>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn content_extractors() -> &'static RwLock<HashMap<String, Arc<Extractor>>> {
    static TABLE: OnceLock<RwLock<HashMap<String, Arc<Extractor>>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Extension hook for `single-segment` sources with a custom `embedding` tag.
pub fn register_embedding_extractor(tag: &str, extractor: Arc<Extractor>) {
    embed_extractors()
        .write()
        .expect("extractor table poisoned")
        .insert(tag.to_string(), extractor);
}

/// Extension hook for `single-segment` sources with a custom
/// `content-strategy` tag.
pub fn register_content_extractor(tag: &str, extractor: Arc<Extractor>) {
    content_extractors()
        .write()
        .expect("extractor table poisoned")
        .insert(tag.to_string(), extractor);
}

fn run_embed_extractor(
    tag: &str,
    input: &DocumentInput<'_>,
) -> Result<(String, Metadata), IngestError> {
    match tag {
        "whole-document" => Ok((input.content.to_string(), Metadata::new())),
        "namespace-doc" => {
            let (namespace, doc) = parse_ns_form(input.content)?;
            let mut extra = Metadata::new();
            extra.insert("namespace".to_string(), namespace.into());
            Ok((doc, extra))
        }
        custom => {
            let table = embed_extractors().read().expect("extractor table poisoned");
            let extractor = table.get(custom).ok_or_else(|| {
                IngestError::Validation(format!("unknown embedding selector `{custom}`"))
            })?;
            extractor(input)
        }
    }
}

fn run_content_extractor(
    tag: &str,
    input: &DocumentInput<'_>,
) -> Result<(String, Metadata), IngestError> {
    match tag {
        "whole-document" => Ok((input.content.to_string(), Metadata::new())),
        "file-path" => Ok((input.file_id.to_string(), Metadata::new())),
        custom => {
            let table = content_extractors()
                .read()
                .expect("extractor table poisoned");
            let extractor = table.get(custom).ok_or_else(|| {
                IngestError::Validation(format!("unknown content selector `{custom}`"))
            })?;
            extractor(input)
        }
    }
}

/// Build the single segment shared by every one-segment-per-file strategy.
fn compose_single_segment(
    input: &DocumentInput<'_>,
    embed_tag: &str,
    content_tag: &str,
) -> Result<Vec<SegmentDescriptor>, IngestError> {
    let (text_to_embed, embed_extra) = run_embed_extractor(embed_tag, input)?;
    let (content_to_store, content_extra) = run_content_extractor(content_tag, input)?;

    let mut metadata = input.metadata.clone();
    metadata.extend(embed_extra);
    metadata.extend(content_extra);
    metadata.insert("segment-id".to_string(), input.file_id.into());

    Ok(vec![SegmentDescriptor {
        file_id: input.file_id.to_string(),
        segment_id: input.file_id.to_string(),
        text_to_embed,
        content_to_store,
        metadata,
    }])
}

struct SingleSegment;

impl Strategy for SingleSegment {
    fn process(&self, input: &DocumentInput<'_>) -> Result<Vec<SegmentDescriptor>, IngestError> {
        let embed_tag = input.params.embedding.as_deref().unwrap_or("whole-document");
        let content_tag = input
            .params
            .content_strategy
            .as_deref()
            .unwrap_or("whole-document");
        compose_single_segment(input, embed_tag, content_tag)
    }
}

struct WholeDocument;

impl Strategy for WholeDocument {
    fn process(&self, input: &DocumentInput<'_>) -> Result<Vec<SegmentDescriptor>, IngestError> {
        compose_single_segment(input, "whole-document", "whole-document")
    }
}

struct FilePath;

impl Strategy for FilePath {
    fn process(&self, input: &DocumentInput<'_>) -> Result<Vec<SegmentDescriptor>, IngestError> {
        compose_single_segment(input, "whole-document", "file-path")
    }
}

struct NamespaceDoc;

impl Strategy for NamespaceDoc {
    fn process(&self, input: &DocumentInput<'_>) -> Result<Vec<SegmentDescriptor>, IngestError> {
        compose_single_segment(input, "namespace-doc", "whole-document")
    }
}

/// Parse the leading `(ns NAME "DOC" …)` form: first token after `ns` is the
/// namespace, the next string literal is the docstring.
fn parse_ns_form(content: &str) -> Result<(String, String), IngestError> {
    let mut rest = content;
    loop {
        rest = rest.trim_start();
        if rest.starts_with(';') {
            rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
        } else {
            break;
        }
    }

    let rest = rest
        .strip_prefix('(')
        .ok_or_else(|| IngestError::Parse("no namespace form at start of file".to_string()))?;
    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix("ns")
        .filter(|r| r.starts_with(char::is_whitespace))
        .ok_or_else(|| IngestError::Parse("no namespace form at start of file".to_string()))?;

    let rest = rest.trim_start();
    let name_len = rest
        .find(|c: char| c.is_whitespace() || c == ')' || c == '"')
        .unwrap_or(rest.len());
    let name = &rest[..name_len];
    if name.is_empty() {
        return Err(IngestError::Parse(
            "namespace form has no name".to_string(),
        ));
    }

    let rest = rest[name_len..].trim_start();
    let rest = rest
        .strip_prefix('"')
        .ok_or_else(|| IngestError::Parse(format!("namespace `{name}` has no docstring")))?;

    let mut doc = String::new();
    let mut chars = rest.chars();
    loop {
        match chars.next() {
            None => {
                return Err(IngestError::Parse(format!(
                    "unterminated docstring in namespace `{name}`"
                )))
            }
            Some('\\') => match chars.next() {
                Some('n') => doc.push('\n'),
                Some('t') => doc.push('\t'),
                Some(other) => doc.push(other),
                None => {
                    return Err(IngestError::Parse(format!(
                        "unterminated docstring in namespace `{name}`"
                    )))
                }
            },
            Some('"') => break,
            Some(c) => doc.push(c),
        }
    }

    if doc.trim().is_empty() {
        return Err(IngestError::Parse(format!(
            "namespace `{name}` has an empty docstring"
        )));
    }
    Ok((name.to_string(), doc))
}

// ---------------------------------------------------------------------------
// chunked
// ---------------------------------------------------------------------------

const DEFAULT_CHUNK_SIZE: usize = 512;
const DEFAULT_CHUNK_OVERLAP: usize = 100;

struct Chunked;

impl Strategy for Chunked {
    fn process(&self, input: &DocumentInput<'_>) -> Result<Vec<SegmentDescriptor>, IngestError> {
        let size = input.params.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let overlap = input.params.chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP);
        if size < 1 {
            return Err(IngestError::Validation(
                "chunk-size must be at least 1".to_string(),
            ));
        }
        if overlap >= size {
            return Err(IngestError::Validation(format!(
                "chunk-overlap ({overlap}) must be smaller than chunk-size ({size})"
            )));
        }

        let config = ChunkConfig::new(size)
            .with_overlap(overlap)
            .map_err(|e| IngestError::Validation(e.to_string()))?;
        let splitter = TextSplitter::new(config);

        let chunks: Vec<(usize, &str)> = splitter.chunk_indices(input.content).collect();
        let count = chunks.len() as i64;

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(index, (offset, chunk))| {
                let segment_id = format!("{}#{index}", input.file_id);
                let mut metadata = input.metadata.clone();
                metadata.insert("segment-id".to_string(), segment_id.clone().into());
                metadata.insert("chunk-index".to_string(), (index as i64).into());
                metadata.insert("chunk-count".to_string(), count.into());
                metadata.insert("chunk-offset".to_string(), (offset as i64).into());
                SegmentDescriptor {
                    file_id: input.file_id.to_string(),
                    segment_id,
                    text_to_embed: chunk.to_string(),
                    content_to_store: chunk.to_string(),
                    metadata,
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// code-analysis
// ---------------------------------------------------------------------------

const VALID_ELEMENT_TYPES: &[&str] = &[
    "namespace",
    "class",
    "var",
    "macro",
    "method",
    "field",
    "constructor",
];

struct CodeAnalysis;

impl Strategy for CodeAnalysis {
    fn process(&self, input: &DocumentInput<'_>) -> Result<Vec<SegmentDescriptor>, IngestError> {
        let visibility = input.params.visibility.as_deref().unwrap_or("all");
        if !matches!(visibility, "all" | "public-only") {
            return Err(IngestError::Validation(format!(
                "unknown visibility `{visibility}` (expected `all` or `public-only`)"
            )));
        }

        let allowed_types: Option<HashSet<&str>> = match &input.params.element_types {
            None => None,
            Some(types) => {
                for t in types {
                    if !VALID_ELEMENT_TYPES.contains(&t.as_str()) {
                        return Err(IngestError::Validation(format!(
                            "unknown element type `{t}`"
                        )));
                    }
                }
                Some(types.iter().map(|t| t.as_str()).collect())
            }
        };

        let elements = analysis::extract_elements(input.file_id, input.content)?;

        let mut segments = Vec::new();
        for element in &elements {
            if visibility == "public-only" && element.visibility != "public" {
                continue;
            }
            if let Some(allowed) = &allowed_types {
                if !allowed.contains(element.element_type.as_str()) {
                    continue;
                }
            }

            let index = segments.len();
            let segment_id = format!("{}#{index}", input.file_id);
            let doc = element.doc.as_deref().unwrap_or("").trim();
            let text_to_embed = if doc.is_empty() {
                element.qualified_name.clone()
            } else {
                doc.to_string()
            };
            let content_to_store = serde_json::to_string_pretty(element)
                .map_err(|e| IngestError::Analysis(e.to_string()))?;

            let mut metadata = input.metadata.clone();
            metadata.insert("segment-id".to_string(), segment_id.clone().into());
            metadata.insert(
                "element-type".to_string(),
                element.element_type.clone().into(),
            );
            metadata.insert(
                "element-name".to_string(),
                element.qualified_name.clone().into(),
            );
            metadata.insert("language".to_string(), element.language.clone().into());
            metadata.insert("visibility".to_string(), element.visibility.clone().into());
            // Only ever present when the element actually sits in a namespace.
            if let Some(ns) = &element.namespace {
                metadata.insert("namespace".to_string(), ns.clone().into());
            }

            segments.push(SegmentDescriptor {
                file_id: input.file_id.to_string(),
                segment_id,
                text_to_embed,
                content_to_store,
                metadata,
            });
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_metadata(file_id: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("doc-id".to_string(), file_id.into());
        m.insert("file-id".to_string(), file_id.into());
        m
    }

    fn process(
        tag: &str,
        params: StrategyParams,
        file_id: &str,
        content: &str,
    ) -> Result<Vec<SegmentDescriptor>, IngestError> {
        let registry = StrategyRegistry::with_builtins();
        let config = StrategyConfig {
            tag: tag.to_string(),
            params,
        };
        registry.process_document(&config, file_id, content, &base_metadata(file_id))
    }

    #[test]
    fn whole_document_embeds_and_stores_content() {
        let segments =
            process("whole-document", StrategyParams::default(), "/d/a.md", "hello world")
                .expect("segments");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].segment_id, "/d/a.md");
        assert_eq!(segments[0].text_to_embed, "hello world");
        assert_eq!(segments[0].content_to_store, "hello world");
        assert_eq!(
            segments[0].metadata.get("segment-id"),
            Some(&MetaValue::from("/d/a.md"))
        );
    }

    #[test]
    fn file_path_stores_the_file_id() {
        let segments =
            process("file-path", StrategyParams::default(), "/d/a.md", "hello").expect("segments");
        assert_eq!(segments[0].text_to_embed, "hello");
        assert_eq!(segments[0].content_to_store, "/d/a.md");
    }

    #[test]
    fn namespace_doc_extracts_name_and_docstring() {
        let content = "(ns app.core \"Core plumbing.\"\n  (:require [x]))\n(defn f [])";
        let segments =
            process("namespace-doc", StrategyParams::default(), "/s/core.clj", content)
                .expect("segments");
        assert_eq!(segments[0].text_to_embed, "Core plumbing.");
        assert_eq!(segments[0].content_to_store, content);
        assert_eq!(
            segments[0].metadata.get("namespace"),
            Some(&MetaValue::from("app.core"))
        );
    }

    #[test]
    fn namespace_doc_skips_leading_comments() {
        let content = "; vim: ft=clojure\n(ns app.util \"Helpers\")";
        let segments =
            process("namespace-doc", StrategyParams::default(), "/s/u.clj", content)
                .expect("segments");
        assert_eq!(segments[0].text_to_embed, "Helpers");
    }

    #[test]
    fn namespace_doc_without_form_is_a_parse_error() {
        let err = process("namespace-doc", StrategyParams::default(), "/s/x.clj", "(defn f [])")
            .unwrap_err();
        assert_eq!(err.kind(), "parse-error");
    }

    #[test]
    fn namespace_doc_without_docstring_is_a_parse_error() {
        let err = process(
            "namespace-doc",
            StrategyParams::default(),
            "/s/x.clj",
            "(ns app.core (:require [y]))",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "parse-error");
    }

    #[test]
    fn docstring_escapes_are_decoded() {
        let (name, doc) = parse_ns_form("(ns a.b \"line one\\nline \\\"two\\\"\")").expect("ok");
        assert_eq!(name, "a.b");
        assert_eq!(doc, "line one\nline \"two\"");
    }

    #[test]
    fn single_segment_composes_selectors() {
        let params = StrategyParams {
            embedding: Some("namespace-doc".to_string()),
            content_strategy: Some("file-path".to_string()),
            ..Default::default()
        };
        let segments = process(
            "single-segment",
            params,
            "/s/core.clj",
            "(ns app.core \"Doc text\")",
        )
        .expect("segments");
        assert_eq!(segments[0].text_to_embed, "Doc text");
        assert_eq!(segments[0].content_to_store, "/s/core.clj");
    }

    #[test]
    fn unknown_selector_is_a_validation_error() {
        let params = StrategyParams {
            embedding: Some("no-such-selector".to_string()),
            ..Default::default()
        };
        let err = process("single-segment", params, "/d/a.md", "x").unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn registered_custom_extractor_is_picked_up() {
        register_embedding_extractor(
            "first-line",
            Arc::new(|input: &DocumentInput<'_>| {
                let line = input.content.lines().next().unwrap_or("").to_string();
                Ok((line, Metadata::new()))
            }),
        );
        let params = StrategyParams {
            embedding: Some("first-line".to_string()),
            ..Default::default()
        };
        let segments = process("single-segment", params, "/d/a.md", "title\nbody").expect("ok");
        assert_eq!(segments[0].text_to_embed, "title");
        assert_eq!(segments[0].content_to_store, "title\nbody");
    }

    #[test]
    fn unknown_strategy_tag_is_a_validation_error() {
        let err = process("no-such-strategy", StrategyParams::default(), "/d/a.md", "x")
            .unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn chunked_rejects_overlap_not_below_size() {
        let params = StrategyParams {
            chunk_size: Some(100),
            chunk_overlap: Some(100),
            ..Default::default()
        };
        let err = process("chunked", params, "/d/a.md", "text").unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn chunked_rejects_zero_size() {
        let params = StrategyParams {
            chunk_size: Some(0),
            ..Default::default()
        };
        let err = process("chunked", params, "/d/a.md", "text").unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn chunked_preserves_offsets_and_counts() {
        // Three 500-char paragraphs; chunk-size 512 forces multiple chunks.
        let para = "lorem ipsum dolor sit amet ".repeat(19); // 513 chars
        let para = &para[..500];
        let content = format!("{para}\n\n{para}\n\n{para}");
        let params = StrategyParams {
            chunk_size: Some(512),
            chunk_overlap: Some(100),
            ..Default::default()
        };
        let segments = process("chunked", params, "/d/a.md", &content).expect("segments");
        assert!(segments.len() >= 2, "expected multiple chunks");

        let count = MetaValue::Num(segments.len() as i64);
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.segment_id, format!("/d/a.md#{i}"));
            assert_eq!(segment.metadata.get("chunk-index"), Some(&MetaValue::Num(i as i64)));
            assert_eq!(segment.metadata.get("chunk-count"), Some(&count));
            let offset = match segment.metadata.get("chunk-offset") {
                Some(MetaValue::Num(n)) => *n as usize,
                other => panic!("bad chunk-offset: {other:?}"),
            };
            // The recorded window must reproduce the chunk exactly.
            assert_eq!(
                &content[offset..offset + segment.text_to_embed.len()],
                segment.text_to_embed
            );
        }
    }

    #[test]
    fn chunked_neighbors_share_text() {
        let body = "word ".repeat(300);
        let params = StrategyParams {
            chunk_size: Some(256),
            chunk_overlap: Some(64),
            ..Default::default()
        };
        let segments = process("chunked", params, "/d/a.md", &body).expect("segments");
        assert!(segments.len() >= 2);
        // Uniform word soup has no semantic boundaries, so the configured
        // overlap shows up as shared text between every adjacent pair.
        for pair in segments.windows(2) {
            let tail: String = pair[0]
                .text_to_embed
                .chars()
                .rev()
                .take(32)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            assert!(
                pair[1].text_to_embed.contains(tail.trim()),
                "no overlap between adjacent chunks"
            );
        }
    }

    #[test]
    fn code_analysis_rejects_unknown_visibility() {
        let params = StrategyParams {
            visibility: Some("friends-only".to_string()),
            ..Default::default()
        };
        let err = process("code-analysis", params, "/s/lib.rs", "pub fn a() {}").unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn code_analysis_rejects_unknown_element_type() {
        let params = StrategyParams {
            element_types: Some(vec!["gadget".to_string()]),
            ..Default::default()
        };
        let err = process("code-analysis", params, "/s/lib.rs", "pub fn a() {}").unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn code_analysis_public_only_drops_private_elements() {
        let source = "/// Adds numbers.\npub fn public_fn(a: i32) -> i32 { a }\n\nfn private_fn() {}\n";
        let params = StrategyParams {
            visibility: Some("public-only".to_string()),
            ..Default::default()
        };
        let segments = process("code-analysis", params, "/s/lib.rs", source).expect("segments");
        assert!(!segments.is_empty());
        for segment in &segments {
            let name = segment.metadata.get("element-name").and_then(|v| v.as_str());
            assert_ne!(name, Some("private_fn"));
        }
        assert!(segments.iter().any(|s| {
            s.metadata.get("element-name").and_then(|v| v.as_str()) == Some("public_fn")
        }));
    }

    #[test]
    fn code_analysis_prefers_docstring_over_name() {
        let source = "/// Adds numbers.\npub fn public_fn(a: i32) -> i32 { a }\n";
        let segments =
            process("code-analysis", StrategyParams::default(), "/s/lib.rs", source)
                .expect("segments");
        let f = segments
            .iter()
            .find(|s| {
                s.metadata.get("element-name").and_then(|v| v.as_str()) == Some("public_fn")
            })
            .expect("public_fn segment");
        assert_eq!(f.text_to_embed, "Adds numbers.");
        assert_eq!(f.metadata.get("language"), Some(&MetaValue::from("rust")));
        // Top-level item in a file: no namespace key at all, never "nil".
        assert!(!f.metadata.contains_key("namespace"));
    }

    #[test]
    fn empty_embed_text_is_a_validation_error() {
        let err = process("whole-document", StrategyParams::default(), "/d/a.md", "")
            .unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }
}
