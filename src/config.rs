use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::embed::DEFAULT_MODEL;
use crate::ingest::{Metadata, StrategyConfig, StrategyParams};
use crate::pathspec::{PathSpec, PathSpecError, SourceKind, WatchMode};
use crate::source::{read_content, ContentSource};

// ---------------------------------------------------------------------------
// Configuration. A TOML document looked up at well-known locations, in order:
// bundled resource, project directory, user home. Source tables partition
// into recognized keys; everything left over becomes base metadata.
// ---------------------------------------------------------------------------

pub const CONFIG_DIR: &str = ".mcp-vector-search";
pub const CONFIG_FILE: &str = "config.toml";

/// Fatal at startup; the process exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no {CONFIG_DIR}/{CONFIG_FILE} found (bundled, project, or home)")]
    NotFound,
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid source configuration: {0}")]
    Source(String),
    #[error("invalid source path: {0}")]
    PathSpec(#[from] PathSpecError),
}

#[derive(Debug)]
pub struct Config {
    pub description: String,
    pub watch: bool,
    pub model: String,
    pub specs: Vec<PathSpec>,
}

const DEFAULT_DESCRIPTION: &str =
    "Semantic search over the configured document sources. Optionally filter \
     by metadata equality.";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    description: Option<String>,
    watch: Option<bool>,
    model: Option<String>,
    sources: Option<Vec<RawSource>>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    path: Option<String>,
    resource: Option<String>,
    name: Option<String>,
    ingest: Option<String>,
    watch: Option<bool>,
    embedding: Option<String>,
    #[serde(rename = "content-strategy")]
    content_strategy: Option<String>,
    #[serde(rename = "chunk-size")]
    chunk_size: Option<i64>,
    #[serde(rename = "chunk-overlap")]
    chunk_overlap: Option<i64>,
    visibility: Option<String>,
    #[serde(rename = "element-types")]
    element_types: Option<Vec<String>>,
    /// Whatever the source table carries beyond the recognized keys.
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

/// Locate and parse the configuration, starting from `project_dir`.
pub fn load(project_dir: &Path) -> Result<Config, ConfigError> {
    let bundled = ContentSource::Bundled(format!("{CONFIG_DIR}/{CONFIG_FILE}"));
    if let Ok(text) = read_content(&bundled) {
        return parse(&text);
    }

    for dir in [Some(project_dir.to_path_buf()), dirs::home_dir()]
        .into_iter()
        .flatten()
    {
        let path = dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::Io { path, source })?;
            return parse(&text);
        }
    }

    Err(ConfigError::NotFound)
}

pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;

    let sources = raw
        .sources
        .ok_or_else(|| ConfigError::Source("at least one [[sources]] entry is required".into()))?;
    if sources.is_empty() {
        return Err(ConfigError::Source(
            "at least one [[sources]] entry is required".into(),
        ));
    }

    let mut specs = Vec::with_capacity(sources.len());
    for source in sources {
        specs.push(compile_source(source)?);
    }

    Ok(Config {
        description: raw
            .description
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        watch: raw.watch.unwrap_or(false),
        model: raw.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        specs,
    })
}

fn compile_source(raw: RawSource) -> Result<PathSpec, ConfigError> {
    let (kind, raw_path) = match (raw.path, raw.resource) {
        (Some(path), None) => {
            if !path.starts_with('/') {
                return Err(ConfigError::Source(format!(
                    "`path` must be absolute: `{path}`"
                )));
            }
            (SourceKind::Filesystem, path)
        }
        (None, Some(resource)) => {
            if resource.starts_with('/') {
                return Err(ConfigError::Source(format!(
                    "`resource` must be relative: `{resource}`"
                )));
            }
            (SourceKind::Bundled, resource)
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::Source(
                "a source takes `path` or `resource`, not both".into(),
            ))
        }
        (None, None) => {
            return Err(ConfigError::Source(
                "a source needs either `path` or `resource`".into(),
            ))
        }
    };

    let mut base_metadata = Metadata::new();
    if let Some(name) = raw.name {
        base_metadata.insert("name".to_string(), name.into());
    }
    for (key, value) in raw.extra {
        base_metadata.insert(key.clone(), scalar_metadata(&key, value)?);
    }

    let params = StrategyParams {
        embedding: raw.embedding,
        content_strategy: raw.content_strategy,
        chunk_size: positive_param("chunk-size", raw.chunk_size)?,
        chunk_overlap: positive_param("chunk-overlap", raw.chunk_overlap)?,
        visibility: raw.visibility,
        element_types: raw.element_types,
    };
    let strategy = StrategyConfig {
        tag: raw.ingest.unwrap_or_else(|| "whole-document".to_string()),
        params,
    };

    let watch = match raw.watch {
        Some(true) => WatchMode::Enabled,
        Some(false) => WatchMode::Disabled,
        None => WatchMode::Default,
    };

    Ok(PathSpec::compile(kind, &raw_path, base_metadata, strategy, watch)?)
}

fn positive_param(key: &str, value: Option<i64>) -> Result<Option<usize>, ConfigError> {
    match value {
        None => Ok(None),
        Some(n) if n >= 0 => Ok(Some(n as usize)),
        Some(n) => Err(ConfigError::Source(format!(
            "`{key}` must not be negative (got {n})"
        ))),
    }
}

fn scalar_metadata(key: &str, value: toml::Value) -> Result<crate::ingest::MetaValue, ConfigError> {
    use toml::Value;
    let text = match value {
        Value::String(s) => s,
        Value::Integer(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Datetime(d) => d.to_string(),
        Value::Array(_) | Value::Table(_) => {
            return Err(ConfigError::Source(format!(
                "metadata value for `{key}` must be a scalar"
            )))
        }
    };
    Ok(text.into())
}
