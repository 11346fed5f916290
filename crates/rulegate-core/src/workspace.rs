use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::{FetchError, FileRecord, RepositoryContent};

/// Local checkout for a `file://` URL or a plain path.
pub fn path_from_url(url: &str) -> Option<PathBuf> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url.contains("://") {
        return None;
    }
    Some(PathBuf::from(url))
}

/// Service id for a repository URL: its last path segment without `.git`.
pub fn service_id_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => trimmed,
    };
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let last = path.rsplit('/').next()?.trim();
    let id = last.strip_suffix(".git").unwrap_or(last);
    (!id.is_empty()).then(|| id.to_string())
}

/// Walk a local checkout the way git sees it (`.gitignore` respected, `.git/`
/// skipped) and render every UTF-8 text file. Binary files and files over
/// `max_file_bytes` get no text but still appear in the tree.
pub fn load_local(root: &Path, max_file_bytes: u64) -> Result<RepositoryContent, FetchError> {
    if !root.is_dir() {
        return Err(FetchError::Io {
            path: root.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut paths = Vec::new();
    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        let rel = relative_path(root, path);
        paths.push(rel.clone());

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > max_file_bytes {
            tracing::debug!(path = %rel, size, "oversized file listed without text");
            continue;
        }

        let bytes = fs::read(path).map_err(|source| FetchError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if bytes.contains(&0) {
            continue;
        }
        match String::from_utf8(bytes) {
            Ok(text) => files.push(FileRecord { path: rel, text }),
            Err(_) => tracing::debug!(path = %rel, "non-UTF-8 file listed without text"),
        }
    }

    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string());

    tracing::info!(
        root = %root.display(),
        listed = paths.len(),
        files = files.len(),
        "loaded local repository"
    );

    Ok(RepositoryContent {
        tree: tree_summary(&name, &paths),
        files,
        unread: Vec::new(),
    })
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Render an indented directory tree from relative `/`-separated paths.
pub fn tree_summary(root_name: &str, paths: &[String]) -> String {
    let mut sorted: Vec<&str> = paths.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = format!("{root_name}/\n");
    let mut printed: BTreeSet<String> = BTreeSet::new();

    for path in sorted {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let Some((file, dirs)) = parts.split_last() else {
            continue;
        };
        for depth in 0..dirs.len() {
            let dir = dirs[..=depth].join("/");
            if printed.insert(dir) {
                out.push_str(&"  ".repeat(depth + 1));
                out.push_str(dirs[depth]);
                out.push_str("/\n");
            }
        }
        out.push_str(&"  ".repeat(dirs.len() + 1));
        out.push_str(file);
        out.push('\n');
    }

    out
}
