use ignore::WalkBuilder;
use include_dir::{include_dir, Dir, File};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};

use crate::ingest::{IngestError, Metadata};
use crate::pathspec::{PathSpec, SourceKind};

// ---------------------------------------------------------------------------
// Source enumeration: turn one compiled PathSpec into FileDescriptors.
//
// Filesystem specs walk from the spec's base prefix with every filter off —
// the anchored regex is the only gatekeeper. Bundled specs scan resource
// trees compiled into the binary.
// ---------------------------------------------------------------------------

static BUNDLED: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/resources");

fn extra_trees() -> &'static RwLock<Vec<&'static Dir<'static>>> {
    static TREES: OnceLock<RwLock<Vec<&'static Dir<'static>>>> = OnceLock::new();
    TREES.get_or_init(|| RwLock::new(Vec::new()))
}

/// Extension hook: make an additional embedded tree visible to bundled
/// sources. Trees are searched after the crate's own `resources/`.
pub fn register_resources(dir: &'static Dir<'static>) {
    extra_trees()
        .write()
        .expect("resource table poisoned")
        .push(dir);
}

fn resource_trees() -> Vec<&'static Dir<'static>> {
    let mut trees: Vec<&'static Dir<'static>> = vec![&BUNDLED];
    trees.extend(extra_trees().read().expect("resource table poisoned").iter());
    trees
}

/// Where one matched file's bytes come from.
#[derive(Debug, Clone)]
pub enum ContentSource {
    Filesystem(PathBuf),
    /// Resource-relative path inside an embedded tree.
    Bundled(String),
}

/// One file matched by a spec; transient, rebuilt on every enumeration.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Canonical absolute path (filesystem) or resource-relative path
    /// (bundled). This is the deletion key for the vector store.
    pub file_id: String,
    pub source: ContentSource,
    pub captures: BTreeMap<String, String>,
    pub metadata: Metadata,
    /// The configured path string, for stats attribution.
    pub source_path: String,
}

/// Canonical deletion key for a filesystem path. Resolves symlinks; for paths
/// that no longer exist (delete events) the parent is resolved and the file
/// name re-attached, so removals hit the same key ingestion used.
pub fn canonical_file_id(path: &Path) -> String {
    let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => std::fs::canonicalize(parent)
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf()),
            _ => path.to_path_buf(),
        }
    });
    resolved.to_string_lossy().replace('\\', "/")
}

/// Enumerate every file matching `spec`. Ordering is not guaranteed.
pub fn enumerate(spec: &PathSpec) -> Vec<FileDescriptor> {
    match spec.source {
        SourceKind::Filesystem => enumerate_filesystem(spec),
        SourceKind::Bundled => enumerate_bundled(spec),
    }
}

fn enumerate_filesystem(spec: &PathSpec) -> Vec<FileDescriptor> {
    let prefix = spec.base_prefix.trim_end_matches('/');
    let base = if prefix.is_empty() {
        Path::new("/")
    } else {
        Path::new(prefix)
    };

    if base.is_file() {
        return descriptor_for_path(spec, base).into_iter().collect();
    }

    let walk_root = if base.is_dir() {
        base.to_path_buf()
    } else {
        // Prefix ends mid-filename (`/docs/guide-` + capture): walk its parent.
        match base.parent() {
            Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("/"),
            Some(parent) => parent.to_path_buf(),
            None => return Vec::new(),
        }
    };
    if !walk_root.is_dir() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let walker = WalkBuilder::new(&walk_root)
        .standard_filters(false)
        .follow_links(true)
        .build();
    for entry in walker {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        out.extend(descriptor_for_path(spec, entry.path()));
    }
    out
}

/// Test one concrete path against a filesystem spec, emitting a descriptor on
/// a match. Shared by bulk enumeration and watch-event ingestion.
pub fn descriptor_for_path(spec: &PathSpec, path: &Path) -> Option<FileDescriptor> {
    let file_id = canonical_file_id(path);
    let captures = match_captures(spec, &file_id)?;
    Some(build_descriptor(
        spec,
        file_id.clone(),
        ContentSource::Filesystem(PathBuf::from(&file_id)),
        captures,
    ))
}

fn enumerate_bundled(spec: &PathSpec) -> Vec<FileDescriptor> {
    // Trim a trailing filename from the prefix so `docs/guide.md` scans
    // everything under `docs/`.
    let parent_prefix = match spec.base_prefix.rfind('/') {
        Some(slash) => &spec.base_prefix[..=slash],
        None => "",
    };

    let mut out = Vec::new();
    for tree in resource_trees() {
        let mut files = Vec::new();
        collect_files(tree, &mut files);
        for file in files {
            let rel = file.path().to_string_lossy().replace('\\', "/");
            if !rel.starts_with(parent_prefix) {
                continue;
            }
            let Some(captures) = match_captures(spec, &rel) else {
                continue;
            };
            out.push(build_descriptor(
                spec,
                rel.clone(),
                ContentSource::Bundled(rel),
                captures,
            ));
        }
    }
    out
}

fn collect_files(dir: &Dir<'static>, out: &mut Vec<&'static File<'static>>) {
    out.extend(dir.files());
    for sub in dir.dirs() {
        collect_files(sub, out);
    }
}

fn match_captures(spec: &PathSpec, candidate: &str) -> Option<BTreeMap<String, String>> {
    let caps = spec.pattern.captures(candidate)?;
    let mut out = BTreeMap::new();
    for name in spec.pattern.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            out.insert(name.to_string(), m.as_str().to_string());
        }
    }
    Some(out)
}

fn build_descriptor(
    spec: &PathSpec,
    file_id: String,
    source: ContentSource,
    captures: BTreeMap<String, String>,
) -> FileDescriptor {
    let mut metadata = spec.base_metadata.clone();
    // Captures win over base metadata on key conflicts.
    for (name, value) in &captures {
        metadata.insert(name.clone(), value.clone().into());
    }
    metadata.insert("doc-id".to_string(), file_id.clone().into());
    metadata.insert("file-id".to_string(), file_id.clone().into());

    FileDescriptor {
        file_id,
        source,
        captures,
        metadata,
        source_path: spec.raw.clone(),
    }
}

/// Load the bytes behind a descriptor. Binary content is decoded lossily;
/// I/O failures surface as `read-error`.
pub fn read_content(source: &ContentSource) -> Result<String, IngestError> {
    match source {
        ContentSource::Filesystem(path) => {
            let bytes = std::fs::read(path)
                .map_err(|e| IngestError::Read(format!("{}: {e}", path.display())))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        ContentSource::Bundled(rel) => {
            for tree in resource_trees() {
                if let Some(file) = tree.get_file(rel) {
                    return Ok(String::from_utf8_lossy(file.contents()).into_owned());
                }
            }
            Err(IngestError::Read(format!("no bundled resource `{rel}`")))
        }
    }
}
