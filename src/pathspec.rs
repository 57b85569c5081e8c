use regex::Regex;
use std::path::Path;
use thiserror::Error;

use crate::ingest::{Metadata, StrategyConfig};

// ---------------------------------------------------------------------------
// Path-spec language: literals + globs + named captures.
//
//   path-spec ::= segment*
//   segment   ::= literal | glob | capture
//   literal   ::= [^(*]+
//   glob      ::= '**' | '*'
//   capture   ::= '(?<' name '>' pattern ')'
//
// A spec compiles to one anchored regex over '/'-separated paths. Captured
// groups become per-file metadata. The maximal leading literal is the base
// prefix used as the walk root.
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PathSpecError {
    #[error("capture at byte {0} must start with `(?<`")]
    MalformedCapture(usize),
    #[error("capture at byte {0} is missing the closing `>` of its name")]
    UnclosedName(usize),
    #[error("capture `{0}` is missing its closing `)`")]
    UnclosedCapture(String),
    #[error("capture at byte {0} has an empty name")]
    EmptyName(usize),
    #[error("capture `{name}` has an invalid pattern: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate capture name `{0}`")]
    DuplicateName(String),
    #[error("path spec does not compile: {0}")]
    Compile(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobKind {
    /// `*` — any run of characters within one path segment.
    Single,
    /// `**` — any run of characters across segments.
    Recursive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Glob(GlobKind),
    Capture { name: String, pattern: String },
}

/// Where the matched files live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Filesystem,
    /// Resource tree compiled into the binary. Read-only, never watched.
    Bundled,
}

/// Per-source watch setting; `Default` inherits the global flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Enabled,
    Disabled,
    Default,
}

impl WatchMode {
    pub fn resolve(self, global: bool) -> bool {
        match self {
            WatchMode::Enabled => true,
            WatchMode::Disabled => false,
            WatchMode::Default => global,
        }
    }
}

/// A compiled source path. Built once at configuration time, never mutated.
#[derive(Debug, Clone)]
pub struct PathSpec {
    pub source: SourceKind,
    /// The path string exactly as configured; stats are attributed to it.
    pub raw: String,
    pub segments: Vec<Segment>,
    /// Concatenated leading literals, canonicalized for filesystem sources.
    pub base_prefix: String,
    pub pattern: Regex,
    pub base_metadata: Metadata,
    pub strategy: StrategyConfig,
    pub watch: WatchMode,
}

impl PathSpec {
    pub fn compile(
        source: SourceKind,
        raw: &str,
        base_metadata: Metadata,
        strategy: StrategyConfig,
        watch: WatchMode,
    ) -> Result<Self, PathSpecError> {
        let mut segments = parse_segments(raw)?;

        // Follow symlinks in the walk root up front (/var → /private/var on
        // macOS) so that matching and deletion see the same canonical paths
        // the enumerator and watcher produce.
        if source == SourceKind::Filesystem {
            if let Some(Segment::Literal(first)) = segments.first_mut() {
                let canonical = canonical_prefix(first);
                if canonical != *first {
                    *first = canonical;
                }
            }
        }

        let base_prefix = match segments.first() {
            Some(Segment::Literal(text)) => text.clone(),
            _ => String::new(),
        };
        let pattern = compile_pattern(&segments)?;

        Ok(Self {
            source,
            raw: raw.to_string(),
            segments,
            base_prefix,
            pattern,
            base_metadata,
            strategy,
            watch,
        })
    }

    /// Names of the capture groups, in declaration order.
    pub fn capture_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Capture { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

fn parse_segments(input: &str) -> Result<Vec<Segment>, PathSpecError> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut seen_names: Vec<String> = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        if bytes[pos] == b'(' {
            let (segment, next) = parse_capture(input, pos)?;
            if let Segment::Capture { ref name, .. } = segment {
                if seen_names.iter().any(|n| n == name) {
                    return Err(PathSpecError::DuplicateName(name.clone()));
                }
                seen_names.push(name.clone());
            }
            segments.push(segment);
            pos = next;
        } else if input[pos..].starts_with("**") {
            segments.push(Segment::Glob(GlobKind::Recursive));
            pos += 2;
        } else if bytes[pos] == b'*' {
            segments.push(Segment::Glob(GlobKind::Single));
            pos += 1;
        } else {
            let rest = &input[pos..];
            let len = rest
                .find(|c| c == '(' || c == '*')
                .unwrap_or(rest.len());
            segments.push(Segment::Literal(rest[..len].to_string()));
            pos += len;
        }
    }

    Ok(segments)
}

/// Parse one `(?<name>pattern)` starting at `start`. Returns the segment and
/// the byte position just past the closing `)`. The inner pattern is scanned
/// balance-free: the first `)` terminates it.
fn parse_capture(input: &str, start: usize) -> Result<(Segment, usize), PathSpecError> {
    let rest = &input[start..];
    if !rest.starts_with("(?<") {
        return Err(PathSpecError::MalformedCapture(start));
    }

    let name_start = start + 3;
    let name_end = input[name_start..]
        .find('>')
        .map(|i| name_start + i)
        .ok_or(PathSpecError::UnclosedName(start))?;
    let name = &input[name_start..name_end];
    if name.is_empty() {
        return Err(PathSpecError::EmptyName(start));
    }

    let pat_start = name_end + 1;
    let pat_end = input[pat_start..]
        .find(')')
        .map(|i| pat_start + i)
        .ok_or_else(|| PathSpecError::UnclosedCapture(name.to_string()))?;
    let pattern = &input[pat_start..pat_end];

    // Validate the inner pattern on its own, once, at parse time.
    Regex::new(pattern).map_err(|source| PathSpecError::InvalidPattern {
        name: name.to_string(),
        source,
    })?;

    Ok((
        Segment::Capture {
            name: name.to_string(),
            pattern: pattern.to_string(),
        },
        pat_end + 1,
    ))
}

fn compile_pattern(segments: &[Segment]) -> Result<Regex, PathSpecError> {
    let mut out = String::from("^");
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&regex::escape(text)),
            Segment::Glob(GlobKind::Single) => out.push_str("[^/]*"),
            Segment::Glob(GlobKind::Recursive) => out.push_str(".*?"),
            Segment::Capture { name, pattern } => {
                out.push_str("(?<");
                out.push_str(name);
                out.push('>');
                out.push_str(pattern);
                out.push(')');
            }
        }
    }
    out.push('$');
    Ok(Regex::new(&out)?)
}

/// Canonicalize the leading literal of a filesystem spec. When the literal
/// ends mid-filename (a glob or capture follows), only the directory part is
/// resolved and the dangling filename piece is re-attached.
fn canonical_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }

    if let Ok(canon) = std::fs::canonicalize(Path::new(prefix.trim_end_matches('/'))) {
        let mut s = canon.to_string_lossy().replace('\\', "/");
        if prefix.ends_with('/') {
            s.push('/');
        }
        return s;
    }

    // `/data/docs/guide-` — resolve `/data/docs`, keep `guide-`.
    if let Some(slash) = prefix.rfind('/') {
        let (dir, tail) = prefix.split_at(slash);
        if !dir.is_empty() {
            if let Ok(canon) = std::fs::canonicalize(Path::new(dir)) {
                let dir = canon.to_string_lossy().replace('\\', "/");
                return format!("{dir}{tail}");
            }
        }
    }

    prefix.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::StrategyConfig;

    fn spec(raw: &str) -> PathSpec {
        PathSpec::compile(
            SourceKind::Bundled,
            raw,
            Metadata::new(),
            StrategyConfig::default(),
            WatchMode::Default,
        )
        .expect("spec compiles")
    }

    #[test]
    fn literal_only_spec_matches_itself() {
        let s = spec("docs/guide.md");
        assert_eq!(s.segments.len(), 1);
        assert_eq!(s.base_prefix, "docs/guide.md");
        assert!(s.pattern.is_match("docs/guide.md"));
        assert!(!s.pattern.is_match("docs/guide.md.bak"));
        assert!(!s.pattern.is_match("prefix/docs/guide.md"));
    }

    #[test]
    fn single_glob_stays_within_one_segment() {
        let s = spec("docs/*.md");
        assert!(s.pattern.is_match("docs/a.md"));
        assert!(s.pattern.is_match("docs/.md"));
        assert!(!s.pattern.is_match("docs/sub/a.md"));
        assert_eq!(s.base_prefix, "docs/");
    }

    #[test]
    fn recursive_glob_crosses_segments() {
        let s = spec("docs/**.md");
        assert!(s.pattern.is_match("docs/a.md"));
        assert!(s.pattern.is_match("docs/sub/deep/a.md"));
        assert!(!s.pattern.is_match("docs/a.txt"));
    }

    #[test]
    fn capture_extracts_named_groups() {
        let s = spec("docs/(?<version>v[0-9]+)/guide.md");
        let caps = s.pattern.captures("docs/v12/guide.md").expect("match");
        assert_eq!(&caps["version"], "v12");
        assert!(!s.pattern.is_match("docs/vx/guide.md"));
        assert_eq!(s.capture_names(), vec!["version"]);
        assert_eq!(s.base_prefix, "docs/");
    }

    #[test]
    fn mixed_spec_compiles_in_order() {
        let s = spec("src/**/(?<module>[a-z_]+)/*.rs");
        assert_eq!(s.segments.len(), 7);
        let caps = s.pattern.captures("src/a/b/core/lib.rs").expect("match");
        assert_eq!(&caps["module"], "core");
    }

    #[test]
    fn leading_glob_means_empty_base_prefix() {
        let s = spec("**/notes.md");
        assert_eq!(s.base_prefix, "");
    }

    #[test]
    fn missing_name_terminator_is_reported() {
        let err = parse_segments("docs/(?<version").unwrap_err();
        assert!(matches!(err, PathSpecError::UnclosedName(5)));
    }

    #[test]
    fn missing_closing_paren_is_reported() {
        let err = parse_segments("docs/(?<v>x+").unwrap_err();
        assert!(matches!(err, PathSpecError::UnclosedCapture(name) if name == "v"));
    }

    #[test]
    fn empty_capture_name_is_reported() {
        let err = parse_segments("docs/(?<>x)").unwrap_err();
        assert!(matches!(err, PathSpecError::EmptyName(5)));
    }

    #[test]
    fn invalid_inner_regex_is_reported() {
        let err = parse_segments("docs/(?<v>[unterminated)").unwrap_err();
        assert!(matches!(err, PathSpecError::InvalidPattern { name, .. } if name == "v"));
    }

    #[test]
    fn duplicate_capture_name_is_reported() {
        let err = parse_segments("(?<v>a)/(?<v>b)").unwrap_err();
        assert!(matches!(err, PathSpecError::DuplicateName(name) if name == "v"));
    }

    #[test]
    fn bare_paren_is_a_malformed_capture() {
        let err = parse_segments("docs/(v1)/guide.md").unwrap_err();
        assert!(matches!(err, PathSpecError::MalformedCapture(5)));
    }

    #[test]
    fn regex_metacharacters_in_literals_are_quoted() {
        let s = spec("docs/release+notes.md");
        assert!(s.pattern.is_match("docs/release+notes.md"));
        assert!(!s.pattern.is_match("docs/releaseenotes.md"));
    }

    #[test]
    fn filesystem_prefix_is_canonicalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = format!("{}/*.md", dir.path().display());
        let s = PathSpec::compile(
            SourceKind::Filesystem,
            &raw,
            Metadata::new(),
            StrategyConfig::default(),
            WatchMode::Default,
        )
        .expect("spec compiles");
        let canon = std::fs::canonicalize(dir.path()).expect("canonicalize");
        let expected = format!("{}/", canon.to_string_lossy().replace('\\', "/"));
        assert_eq!(s.base_prefix, expected);
    }
}
