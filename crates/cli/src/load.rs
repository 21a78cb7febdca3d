//! Manifest directory loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use manifold_core::{Collection, Record, SourceEvent};

fn is_manifest(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

/// Forward-slash path of `file` relative to `root`; relative-path rules
/// resolve against these.
pub fn relative_key(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/")
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect(&path, out)?;
        } else if is_manifest(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// One `Added` event per manifest under `root`, in path order.
pub fn manifest_events(root: &Path) -> Result<Vec<SourceEvent>> {
    let mut files = Vec::new();
    collect(root, &mut files)?;
    files.sort();
    let mut events = Vec::with_capacity(files.len());
    for file in files {
        let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        let path = relative_key(root, &file);
        debug!(path = %path, bytes = text.len(), "manifest loaded");
        events.push(SourceEvent::Added { path, text });
    }
    Ok(events)
}

/// `Added` event for a single manifest file, keyed by its file name.
pub fn file_event(file: &Path) -> Result<SourceEvent> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    Ok(SourceEvent::Added { path: file_key(file), text })
}

pub fn file_key(file: &Path) -> String {
    file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| file.display().to_string())
}

/// Records that came from `path`, in document order.
pub fn file_records<'a>(collection: &'a Collection, path: &str) -> Vec<&'a Record> {
    let mut out: Vec<&Record> = collection.iter().filter(|r| r.file_path() == Some(path)).collect();
    out.sort_by_key(|r| r.origin.as_ref().map(|o| o.doc_index).unwrap_or(usize::MAX));
    out
}

/// Multi-document text for `records`.
pub fn render(records: &[&Record]) -> String {
    records.iter().map(|r| r.text().trim_end().to_string()).collect::<Vec<_>>().join("\n---\n") + "\n"
}
