//! Glob-based path enumeration.
//!
//! A pattern such as `out/logs/*.log` is split into a literal base
//! directory (`out/logs`) and a glob tail (`*.log`). A non-recursive walk
//! matches the tail against the base directory only; a recursive walk
//! matches it in the base directory and every directory below it.

use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::warn;

use crate::protocol::{EnumeratedItem, FailureKind, ItemKind, OperationFailure};

const GLOB_METACHARS: &[char] = &['*', '?', '['];

/// Literal base directory and glob tail of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPattern {
    /// Directory the walk starts from.
    pub base: PathBuf,
    /// `/`-joined glob applied below `base`.
    pub tail: String,
}

/// Split `pattern` at its first component containing a glob metacharacter.
///
/// A pattern without metacharacters names a single path: its parent is the
/// base and its file name the tail. Relative bases resolve against `root`.
///
/// # Errors
///
/// Returns [`FailureKind::InvalidRequest`] for an empty pattern or one that
/// ends in a directory separator only.
pub fn split_pattern(root: &Path, pattern: &str) -> Result<SplitPattern, OperationFailure> {
    if pattern.trim().is_empty() {
        return Err(OperationFailure::new(
            FailureKind::InvalidRequest,
            "enumerate pattern must not be empty",
        ));
    }

    let mut base = PathBuf::new();
    let mut tail: Vec<String> = Vec::new();

    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        let in_tail = !tail.is_empty()
            || (matches!(component, Component::Normal(_)) && text.contains(GLOB_METACHARS));
        if in_tail {
            tail.push(text.into_owned());
        } else {
            base.push(component);
        }
    }

    if tail.is_empty() {
        let name = base
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                OperationFailure::new(
                    FailureKind::InvalidRequest,
                    format!("enumerate pattern `{pattern}` names no entry"),
                )
            })?;
        tail.push(Pattern::escape(&name));
        base.pop();
    }

    let base = if base.is_absolute() {
        base
    } else {
        root.join(base)
    };

    Ok(SplitPattern {
        base,
        tail: tail.join("/"),
    })
}

/// Enumerate entries matching `pattern`, relative paths taken from its base.
///
/// Entries that cannot be read while walking are logged and skipped.
///
/// # Errors
///
/// - [`FailureKind::InvalidRequest`]: unusable pattern.
/// - [`FailureKind::NotFound`]: the base directory does not exist or is not
///   a directory.
pub fn enumerate(
    root: &Path,
    pattern: &str,
    recursive: bool,
) -> Result<Vec<EnumeratedItem>, OperationFailure> {
    let split = split_pattern(root, pattern)?;

    if !split.base.is_dir() {
        return Err(OperationFailure::new(
            FailureKind::NotFound,
            format!("base directory {} does not exist", split.base.display()),
        ));
    }

    let escaped_base = Pattern::escape(&split.base.to_string_lossy());
    let full = if recursive {
        format!("{escaped_base}/**/{}", split.tail)
    } else {
        format!("{escaped_base}/{}", split.tail)
    };

    let options = MatchOptions {
        case_sensitive: !cfg!(windows),
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let paths = glob::glob_with(&full, options).map_err(|err| {
        OperationFailure::new(
            FailureKind::InvalidRequest,
            format!("invalid glob pattern `{pattern}`"),
        )
        .with_detail(err.to_string())
    })?;

    let mut items = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => {
                if let Some(item) = to_item(&split.base, &path) {
                    items.push(item);
                }
            }
            Err(err) => {
                warn!(path = %err.path().display(), error = %err.error(), "skipping unreadable entry");
            }
        }
    }

    Ok(items)
}

fn to_item(base: &Path, path: &Path) -> Option<EnumeratedItem> {
    let relative = path.strip_prefix(base).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }

    let kind = if path.is_dir() {
        ItemKind::Directory
    } else {
        ItemKind::File
    };

    let relative_path = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");

    Some(EnumeratedItem {
        kind,
        relative_path,
        absolute_path: path.to_string_lossy().into_owned(),
    })
}
