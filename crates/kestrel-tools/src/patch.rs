//! `*** Begin Patch` / `*** End Patch` sections carrying unified-diff hunks.
//!
//! A patch is parsed and applied to an in-memory overlay first; the
//! filesystem is only touched once every section has validated, so a bad
//! section leaves the workspace as it was.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use kestrel_runtime::PathGuard;
use kestrel_types::{ToolResult, ToolSchema};
use serde_json::{json, Value};
use tokio::fs;

use crate::{Tool, ToolContext};

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";
const UPDATE_HEADER: &str = "*** Update File:";
const ADD_HEADER: &str = "*** Add File:";
const DELETE_HEADER: &str = "*** Delete File:";
const NO_NEWLINE_MARKER: char = '\\';

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("invalid patch at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid patch path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("{path}: update section contains no hunks")]
    NoHunks { path: String },
    #[error("{path}: malformed hunk header `{header}`")]
    BadHunkHeader { path: String, header: String },
    #[error("{path}: unexpected line in hunk: `{line}`")]
    BadHunkLine { path: String, line: String },
    #[error("{path}: hunk at original line {start} overlaps the previous hunk")]
    OverlappingHunk { path: String, start: usize },
    #[error("{path}: {kind} mismatch at line {line}: expected `{expected}`, found `{found}`")]
    Mismatch {
        path: String,
        kind: &'static str,
        line: usize,
        expected: String,
        found: String,
    },
    #[error("{path}: file already exists")]
    TargetExists { path: String },
    #[error("{path}: file does not exist")]
    TargetMissing { path: String },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOperation {
    Add,
    Update,
    Delete,
}

impl PatchOperation {
    fn letter(self) -> char {
        match self {
            PatchOperation::Add => 'A',
            PatchOperation::Update => 'M',
            PatchOperation::Delete => 'D',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSection {
    pub operation: PatchOperation,
    pub path: String,
    pub body: Vec<String>,
    /// 1-based line of the section's `*** Begin Patch`.
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffLineKind {
    Context,
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    pub text: String,
    /// Followed by `\ No newline at end of file`.
    pub no_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub orig_start: usize,
    pub orig_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub operation: PatchOperation,
    pub path: String,
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub changes: Vec<FileChange>,
}

impl std::fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Success. Updated the following files:")?;
        for change in &self.changes {
            writeln!(f, "{} {}", change.operation.letter(), change.path)?;
        }
        Ok(())
    }
}

struct OpenSection {
    line: usize,
    header: Option<(PatchOperation, String)>,
    body: Vec<String>,
}

/// Splits a patch blob into sections in document order.
pub fn parse_patch(text: &str) -> Result<Vec<PatchSection>, PatchError> {
    let mut sections = Vec::new();
    let mut open: Option<OpenSection> = None;
    let mut last_was_end = false;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let marker = raw.trim_end();

        if marker == BEGIN_MARKER {
            if open.is_some() {
                return Err(parse_error(line_no, "nested `*** Begin Patch`"));
            }
            open = Some(OpenSection {
                line: line_no,
                header: None,
                body: Vec::new(),
            });
            last_was_end = false;
            continue;
        }

        if marker == END_MARKER {
            match open.take() {
                Some(section) => sections.push(close_section(section, line_no)?),
                // A repeated end marker right after a closed section is noise.
                None if last_was_end => {}
                None => {
                    return Err(parse_error(
                        line_no,
                        "`*** End Patch` without a matching `*** Begin Patch`",
                    ))
                }
            }
            last_was_end = true;
            continue;
        }

        let Some(section) = open.as_mut() else {
            if marker.trim().is_empty() {
                continue;
            }
            return Err(parse_error(line_no, "content outside of a patch section"));
        };
        last_was_end = false;

        if let Some(header) = parse_header(marker) {
            if section.header.is_some() {
                return Err(parse_error(
                    line_no,
                    "a section may contain only one file header",
                ));
            }
            let (operation, path) = header;
            if path.is_empty() {
                return Err(parse_error(line_no, "file header has an empty path"));
            }
            section.header = Some((operation, path));
            continue;
        }

        if section.header.is_none() {
            if marker.trim().is_empty() {
                continue;
            }
            return Err(parse_error(
                line_no,
                "expected `*** Update File:`, `*** Add File:` or `*** Delete File:`",
            ));
        }
        section.body.push(raw.to_string());
    }

    if let Some(section) = open {
        return Err(parse_error(
            section.line,
            "`*** Begin Patch` is never closed by `*** End Patch`",
        ));
    }
    if sections.is_empty() {
        return Err(parse_error(1, "no `*** Begin Patch` section found"));
    }
    Ok(sections)
}

fn parse_header(line: &str) -> Option<(PatchOperation, String)> {
    [
        (UPDATE_HEADER, PatchOperation::Update),
        (ADD_HEADER, PatchOperation::Add),
        (DELETE_HEADER, PatchOperation::Delete),
    ]
    .into_iter()
    .find_map(|(prefix, operation)| {
        line.strip_prefix(prefix)
            .map(|path| (operation, path.trim().to_string()))
    })
}

fn close_section(section: OpenSection, end_line: usize) -> Result<PatchSection, PatchError> {
    let Some((operation, path)) = section.header else {
        return Err(parse_error(end_line, "section has no file header"));
    };
    Ok(PatchSection {
        operation,
        path,
        body: section.body,
        line: section.line,
    })
}

fn parse_error(line: usize, message: &str) -> PatchError {
    PatchError::Parse {
        line,
        message: message.to_string(),
    }
}

pub fn has_hunks(body: &[String]) -> bool {
    body.iter().any(|line| line.starts_with("@@"))
}

/// Parses the unified-diff body of one section. Counts in the header are
/// informational; the hunk lines are authoritative.
pub fn parse_hunks(path: &str, body: &[String]) -> Result<Vec<DiffHunk>, PatchError> {
    let mut hunks: Vec<DiffHunk> = Vec::new();
    for line in body {
        if line.starts_with("@@") {
            hunks.push(parse_hunk_header(path, line)?);
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            if line.starts_with("--- ") || line.starts_with("+++ ") || line.trim().is_empty() {
                continue;
            }
            return Err(PatchError::BadHunkLine {
                path: path.to_string(),
                line: line.clone(),
            });
        };
        let (kind, text) = match line.chars().next() {
            Some(' ') => (DiffLineKind::Context, &line[1..]),
            Some('+') => (DiffLineKind::Add, &line[1..]),
            Some('-') => (DiffLineKind::Delete, &line[1..]),
            Some(NO_NEWLINE_MARKER) => {
                let Some(previous) = hunk.lines.last_mut() else {
                    return Err(PatchError::BadHunkLine {
                        path: path.to_string(),
                        line: line.clone(),
                    });
                };
                previous.no_newline = true;
                continue;
            }
            // Editors strip the lone space from empty context lines.
            None => (DiffLineKind::Context, ""),
            Some(_) => {
                return Err(PatchError::BadHunkLine {
                    path: path.to_string(),
                    line: line.clone(),
                })
            }
        };
        hunk.lines.push(DiffLine {
            kind,
            text: text.to_string(),
            no_newline: false,
        });
    }
    if hunks.is_empty() {
        return Err(PatchError::NoHunks {
            path: path.to_string(),
        });
    }
    Ok(hunks)
}

fn parse_hunk_header(path: &str, line: &str) -> Result<DiffHunk, PatchError> {
    let bad = || PatchError::BadHunkHeader {
        path: path.to_string(),
        header: line.to_string(),
    };
    let ranges = line
        .strip_prefix("@@ -")
        .and_then(|rest| rest.split_once(" @@"))
        .map(|(ranges, _)| ranges)
        .ok_or_else(bad)?;
    let (orig, new) = ranges.split_once(" +").ok_or_else(bad)?;
    let (orig_start, orig_count) = parse_range(orig).ok_or_else(bad)?;
    let (new_start, new_count) = parse_range(new).ok_or_else(bad)?;
    Ok(DiffHunk {
        orig_start,
        orig_count,
        new_start,
        new_count,
        lines: Vec::new(),
    })
}

/// `start[,count]`, count defaulting to 1.
fn parse_range(raw: &str) -> Option<(usize, usize)> {
    match raw.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((raw.parse().ok()?, 1)),
    }
}

struct SourceLine<'a> {
    text: &'a str,
    /// `"\n"`, `"\r\n"`, or empty for a final line without a newline.
    eol: &'a str,
}

struct SplitText<'a> {
    lines: Vec<SourceLine<'a>>,
    trailing_newline: bool,
    default_eol: &'a str,
}

fn split_text(content: &str) -> SplitText<'_> {
    let mut lines = Vec::new();
    let mut rest = content;
    while !rest.is_empty() {
        match rest.find('\n') {
            Some(idx) => {
                let raw = &rest[..idx];
                let line = match raw.strip_suffix('\r') {
                    Some(text) => SourceLine {
                        text,
                        eol: &rest[idx - 1..=idx],
                    },
                    None => SourceLine {
                        text: raw,
                        eol: &rest[idx..=idx],
                    },
                };
                lines.push(line);
                rest = &rest[idx + 1..];
            }
            None => {
                lines.push(SourceLine { text: rest, eol: "" });
                break;
            }
        }
    }
    let default_eol = lines
        .iter()
        .map(|line| line.eol)
        .find(|eol| !eol.is_empty())
        .unwrap_or("\n");
    SplitText {
        lines,
        trailing_newline: content.is_empty() || content.ends_with('\n'),
        default_eol,
    }
}

/// Applies `hunks` to `original`, walking it with a single cursor.
pub fn apply_hunks(path: &str, original: &str, hunks: &[DiffHunk]) -> Result<String, PatchError> {
    let source = split_text(original);
    let mut out: Vec<(&str, &str)> = Vec::with_capacity(source.lines.len());
    let mut replaced_eols: VecDeque<&str> = VecDeque::new();
    let mut cursor = 0usize;
    let mut trailing_newline = source.trailing_newline;
    let mut marker_on_new_side = false;
    let mut marker_on_old_side = false;

    for hunk in hunks {
        let target = if hunk.orig_count == 0 {
            hunk.orig_start
        } else {
            hunk.orig_start.saturating_sub(1)
        };
        if target < cursor {
            return Err(PatchError::OverlappingHunk {
                path: path.to_string(),
                start: hunk.orig_start,
            });
        }
        if target > source.lines.len() {
            return Err(PatchError::Mismatch {
                path: path.to_string(),
                kind: "hunk start",
                line: target + 1,
                expected: format!("at most {} lines", source.lines.len()),
                found: "end of file".to_string(),
            });
        }
        out.extend(source.lines[cursor..target].iter().map(|l| (l.text, l.eol)));
        cursor = target;
        replaced_eols.clear();

        for line in &hunk.lines {
            match line.kind {
                DiffLineKind::Context | DiffLineKind::Delete => {
                    let found = source.lines.get(cursor);
                    if found.map(|l| l.text) != Some(line.text.as_str()) {
                        return Err(PatchError::Mismatch {
                            path: path.to_string(),
                            kind: if line.kind == DiffLineKind::Context {
                                "context"
                            } else {
                                "delete"
                            },
                            line: cursor + 1,
                            expected: line.text.clone(),
                            found: found.map_or("<end of file>", |l| l.text).to_string(),
                        });
                    }
                    let eol = source.lines[cursor].eol;
                    if line.kind == DiffLineKind::Context {
                        out.push((line.text.as_str(), eol));
                        replaced_eols.clear();
                    } else {
                        replaced_eols.push_back(eol);
                    }
                    cursor += 1;
                }
                DiffLineKind::Add => {
                    // A replacement takes the ending of the line it replaces,
                    // an insertion the ending of its neighbours.
                    let eol = replaced_eols
                        .pop_front()
                        .filter(|eol| !eol.is_empty())
                        .or_else(|| out.last().map(|(_, eol)| *eol).filter(|e| !e.is_empty()))
                        .or_else(|| {
                            source
                                .lines
                                .get(cursor)
                                .map(|l| l.eol)
                                .filter(|e| !e.is_empty())
                        })
                        .unwrap_or(source.default_eol);
                    out.push((line.text.as_str(), eol));
                }
            }
            if line.no_newline {
                match line.kind {
                    DiffLineKind::Delete => marker_on_old_side = true,
                    DiffLineKind::Context | DiffLineKind::Add => marker_on_new_side = true,
                }
            }
        }
    }
    out.extend(source.lines[cursor..].iter().map(|l| (l.text, l.eol)));

    if marker_on_old_side {
        trailing_newline = true;
    }
    if marker_on_new_side {
        trailing_newline = false;
    }
    if out.is_empty() {
        return Ok(String::new());
    }
    let last = out.len() - 1;
    let mut text = String::with_capacity(original.len());
    for (idx, (line, eol)) in out.iter().enumerate() {
        text.push_str(line);
        if idx < last || trailing_newline {
            text.push_str(if eol.is_empty() { source.default_eol } else { eol });
        }
    }
    Ok(text)
}

/// Content of an `*** Add File` section: hunks against an empty file, or
/// literal lines with one optional leading `+` stripped.
pub fn added_content(path: &str, body: &[String]) -> Result<String, PatchError> {
    if has_hunks(body) {
        let hunks = parse_hunks(path, body)?;
        return apply_hunks(path, "", &hunks);
    }
    let mut text = String::new();
    for line in body {
        text.push_str(line.strip_prefix('+').unwrap_or(line));
        text.push('\n');
    }
    Ok(text)
}

fn validate_path(guard: &PathGuard, raw: &str) -> Result<PathBuf, PatchError> {
    let invalid = |reason: String| PatchError::InvalidPath {
        path: raw.to_string(),
        reason,
    };
    if raw.trim().is_empty() {
        return Err(invalid("path is empty".to_string()));
    }
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Err(invalid("path must be relative to the workspace".to_string()));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(invalid("path must not contain `..`".to_string()));
    }
    guard.resolve(raw).map_err(|err| invalid(err.to_string()))
}

async fn read_existing(abs: &Path, display: &str) -> Result<Option<String>, PatchError> {
    match fs::read_to_string(abs).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PatchError::Io {
            path: display.to_string(),
            source,
        }),
    }
}

/// Final content per path, in first-touched order. `None` means absent.
#[derive(Default)]
struct Overlay {
    order: Vec<PathBuf>,
    staged: HashMap<PathBuf, Option<String>>,
}

impl Overlay {
    async fn current(&self, abs: &Path, display: &str) -> Result<Option<String>, PatchError> {
        match self.staged.get(abs) {
            Some(content) => Ok(content.clone()),
            None => read_existing(abs, display).await,
        }
    }

    fn stage(&mut self, abs: PathBuf, content: Option<String>) {
        if !self.staged.contains_key(&abs) {
            self.order.push(abs.clone());
        }
        self.staged.insert(abs, content);
    }

    async fn commit(self, guard: &PathGuard) -> Result<(), PatchError> {
        let Overlay { order, mut staged } = self;
        for abs in order {
            let display = guard.rel(&abs);
            let io = |source: std::io::Error| PatchError::Io {
                path: display.clone(),
                source,
            };
            match staged.remove(&abs).flatten() {
                Some(content) => {
                    if let Some(parent) = abs.parent() {
                        fs::create_dir_all(parent).await.map_err(io)?;
                    }
                    fs::write(&abs, content).await.map_err(io)?;
                }
                None => match fs::remove_file(&abs).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(io(err)),
                },
            }
        }
        Ok(())
    }
}

/// Parses and applies `text` inside `guard`'s workspace.
pub async fn apply_patch(guard: &PathGuard, text: &str) -> Result<PatchSummary, PatchError> {
    let sections = parse_patch(text)?;
    let mut overlay = Overlay::default();
    let mut summary = PatchSummary::default();

    for section in &sections {
        let abs = validate_path(guard, &section.path)?;
        let display = guard.rel(&abs);
        let current = overlay.current(&abs, &display).await?;
        let change = match section.operation {
            PatchOperation::Add => {
                if current.is_some() {
                    return Err(PatchError::TargetExists { path: display });
                }
                let content = added_content(&display, &section.body)?;
                let added = split_text(&content).lines.len();
                overlay.stage(abs, Some(content));
                FileChange {
                    operation: PatchOperation::Add,
                    path: display,
                    added,
                    removed: 0,
                }
            }
            PatchOperation::Delete => {
                let Some(existing) = current else {
                    return Err(PatchError::TargetMissing { path: display });
                };
                let removed = split_text(&existing).lines.len();
                overlay.stage(abs, None);
                FileChange {
                    operation: PatchOperation::Delete,
                    path: display,
                    added: 0,
                    removed,
                }
            }
            PatchOperation::Update => {
                let Some(existing) = current else {
                    return Err(PatchError::TargetMissing { path: display });
                };
                let hunks = parse_hunks(&display, &section.body)?;
                let updated = apply_hunks(&display, &existing, &hunks)?;
                let (added, removed) = count_changes(&hunks);
                overlay.stage(abs, Some(updated));
                FileChange {
                    operation: PatchOperation::Update,
                    path: display,
                    added,
                    removed,
                }
            }
        };
        summary.changes.push(change);
    }

    overlay.commit(guard).await?;
    Ok(summary)
}

fn count_changes(hunks: &[DiffHunk]) -> (usize, usize) {
    hunks
        .iter()
        .flat_map(|hunk| hunk.lines.iter())
        .fold((0, 0), |(added, removed), line| match line.kind {
            DiffLineKind::Add => (added + 1, removed),
            DiffLineKind::Delete => (added, removed + 1),
            DiffLineKind::Context => (added, removed),
        })
}

pub struct ApplyPatchTool {
    guard: PathGuard,
}

impl ApplyPatchTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "apply_patch".to_string(),
            description: "Apply one or more `*** Begin Patch` / `*** End Patch` sections. Each \
                          section has one header (`*** Update File: p`, `*** Add File: p`, \
                          `*** Delete File: p`); updates carry unified-diff hunks \
                          (`@@ -a,b +c,d @@`). Nothing is written unless every section applies."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "patch":{"type":"string","description":"Full patch text"}
                },
                "required":["patch"]
            }),
        }
    }

    fn mutates_files(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let patch = args
            .get("patch")
            .or_else(|| args.get("input"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required string argument `patch`"))?;
        let summary = apply_patch(&self.guard, patch).await?;
        let files = summary
            .changes
            .iter()
            .map(|c| {
                json!({
                    "op": c.operation.letter().to_string(),
                    "path": c.path,
                    "added": c.added,
                    "removed": c.removed,
                })
            })
            .collect::<Vec<_>>();
        Ok(ToolResult::new(summary.to_string(), json!({ "files": files })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn parse_reads_sections_in_order() {
        let sections = parse_patch(
            "*** Begin Patch\n*** Add File: a.txt\n+x\n*** End Patch\n\
             *** Begin Patch\n*** Delete File: b.txt\n*** End Patch\n",
        )
        .expect("parse");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].operation, PatchOperation::Add);
        assert_eq!(sections[0].body, body(&["+x"]));
        assert_eq!(sections[1].operation, PatchOperation::Delete);
        assert_eq!(sections[1].path, "b.txt");
    }

    #[test]
    fn parse_rejects_nested_begin() {
        let err = parse_patch("*** Begin Patch\n*** Begin Patch\n*** End Patch").expect_err("nested");
        assert!(matches!(err, PatchError::Parse { line: 2, .. }));
    }

    #[test]
    fn parse_rejects_end_before_begin() {
        let err = parse_patch("*** End Patch\n").expect_err("dangling");
        assert!(err.to_string().contains("without a matching"));
    }

    #[test]
    fn parse_tolerates_repeated_end_marker() {
        let sections = parse_patch(
            "*** Begin Patch\n*** Delete File: a\n*** End Patch\n*** End Patch\n",
        )
        .expect("parse");
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn parse_rejects_two_headers_in_one_section() {
        let err = parse_patch(
            "*** Begin Patch\n*** Add File: a\n+x\n*** Add File: b\n+y\n*** End Patch",
        )
        .expect_err("two headers");
        assert!(err.to_string().contains("only one file header"));
    }

    #[test]
    fn parse_rejects_missing_header_and_unclosed_section() {
        assert!(parse_patch("*** Begin Patch\n*** End Patch").is_err());
        assert!(parse_patch("*** Begin Patch\n*** Add File: a\n+x\n").is_err());
        assert!(parse_patch("*** Begin Patch\n*** Add File:   \n*** End Patch").is_err());
    }

    #[test]
    fn hunk_header_counts_default_to_one() {
        let hunks = parse_hunks("f", &body(&["@@ -3 +4 @@ fn main", " x"])).expect("hunks");
        assert_eq!(hunks[0].orig_start, 3);
        assert_eq!(hunks[0].orig_count, 1);
        assert_eq!(hunks[0].new_start, 4);
        assert_eq!(hunks[0].new_count, 1);
    }

    #[test]
    fn update_without_hunks_is_rejected() {
        let err = parse_hunks("f", &body(&["+x"])).expect_err("no hunks");
        assert!(matches!(err, PatchError::BadHunkLine { .. }));
        let err = parse_hunks("f", &[]).expect_err("no hunks");
        assert!(matches!(err, PatchError::NoHunks { .. }));
    }

    #[test]
    fn apply_copies_untouched_regions() {
        let hunks = parse_hunks(
            "f",
            &body(&["@@ -2,2 +2,2 @@", " b", "-c", "+C", "@@ -5,1 +5,2 @@", " e", "+f"]),
        )
        .expect("hunks");
        let out = apply_hunks("f", "a\nb\nc\nd\ne\n", &hunks).expect("apply");
        assert_eq!(out, "a\nb\nC\nd\ne\nf\n");
    }

    #[test]
    fn apply_rejects_overlapping_hunks() {
        let hunks = parse_hunks(
            "f",
            &body(&["@@ -1,2 +1,2 @@", " a", "-b", "+B", "@@ -2,1 +2,1 @@", "-b", "+X"]),
        )
        .expect("hunks");
        let err = apply_hunks("f", "a\nb\nc\n", &hunks).expect_err("overlap");
        assert!(matches!(err, PatchError::OverlappingHunk { start: 2, .. }));
    }

    #[test]
    fn apply_reports_context_and_delete_mismatches() {
        let hunks = parse_hunks("f", &body(&["@@ -1,1 +1,1 @@", " nope"])).expect("hunks");
        let err = apply_hunks("f", "a\n", &hunks).expect_err("context mismatch");
        assert!(matches!(err, PatchError::Mismatch { kind: "context", line: 1, .. }));

        let hunks = parse_hunks("f", &body(&["@@ -2,1 +2,0 @@", "-zzz"])).expect("hunks");
        let err = apply_hunks("f", "a\nb\n", &hunks).expect_err("delete mismatch");
        assert!(matches!(err, PatchError::Mismatch { kind: "delete", line: 2, .. }));
    }

    #[test]
    fn pure_insertion_uses_orig_start_as_position() {
        let hunks = parse_hunks("f", &body(&["@@ -1,0 +2,1 @@", "+inserted"])).expect("hunks");
        let out = apply_hunks("f", "a\nb\n", &hunks).expect("apply");
        assert_eq!(out, "a\ninserted\nb\n");
    }

    #[test]
    fn trailing_newline_follows_original_and_markers() {
        let hunks = parse_hunks("f", &body(&["@@ -1 +1 @@", "-a", "+b"])).expect("hunks");
        assert_eq!(apply_hunks("f", "a", &hunks).expect("apply"), "b");

        let hunks = parse_hunks(
            "f",
            &body(&["@@ -1 +1 @@", "-a", "+b", "\\ No newline at end of file"]),
        )
        .expect("hunks");
        assert_eq!(apply_hunks("f", "a\n", &hunks).expect("apply"), "b");

        let hunks = parse_hunks(
            "f",
            &body(&["@@ -1 +1 @@", "-a", "\\ No newline at end of file", "+b"]),
        )
        .expect("hunks");
        assert_eq!(apply_hunks("f", "a", &hunks).expect("apply"), "b\n");
    }

    #[test]
    fn crlf_files_keep_their_line_endings() {
        let hunks = parse_hunks("f", &body(&["@@ -2 +2 @@", "-b", "+B"])).expect("hunks");
        let out = apply_hunks("f", "a\r\nb\r\nc\r\n", &hunks).expect("apply");
        assert_eq!(out, "a\r\nB\r\nc\r\n");
    }

    #[test]
    fn mixed_line_endings_are_kept_per_line() {
        let hunks = parse_hunks("f", &body(&["@@ -3 +3 @@", "-c", "+C"])).expect("hunks");
        let out = apply_hunks("f", "a\nb\r\nc\n", &hunks).expect("apply");
        assert_eq!(out, "a\nb\r\nC\n");

        let hunks = parse_hunks("f", &body(&["@@ -1,2 +1,3 @@", " a", "+new", " b"])).expect("hunks");
        let out = apply_hunks("f", "a\r\nb\nc\n", &hunks).expect("apply");
        assert_eq!(out, "a\r\nnew\r\nb\nc\n");
    }

    #[test]
    fn appending_after_a_final_line_without_newline() {
        let hunks = parse_hunks("f", &body(&["@@ -1 +1,2 @@", " a", "+b"])).expect("hunks");
        assert_eq!(apply_hunks("f", "a\r\nz", &hunks).expect("apply"), "a\r\nb\r\nz");
    }

    #[test]
    fn added_content_strips_one_plus() {
        let text = added_content("f", &body(&["+one", "++two", "three"])).expect("content");
        assert_eq!(text, "one\n+two\nthree\n");
        let text = added_content("f", &body(&["@@ -0,0 +1,2 @@", "+x", "+y"])).expect("content");
        assert_eq!(text, "x\ny\n");
    }
}
