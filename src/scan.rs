use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StructuralError;

pub const CLASS_EXTENSION: &str = "class";
pub const SOURCE_EXTENSION: &str = "java";

#[derive(Debug, Clone)]
pub struct ScannedUnit {
    pub relative_path: PathBuf,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl ScannedUnit {
    pub fn qualified_name(&self) -> String {
        relative_path_to_qualified_name(&self.relative_path)
    }
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub units: Vec<ScannedUnit>,
    pub errors: Vec<StructuralError>,
    pub misplaced_sources: Vec<PathBuf>,
    /// Entries left unvisited because an earlier entry in the same directory failed.
    pub abandoned: usize,
}

/// A read failure ends the listing of the directory it happened in.
pub fn walk(root: &Path, recursive: bool) -> Result<ScanReport, StructuralError> {
    if !root.exists() {
        return Err(StructuralError::MissingRoot {
            path: root.to_path_buf(),
        });
    }
    if !root.is_dir() {
        return Err(StructuralError::NotADirectory {
            path: root.to_path_buf(),
        });
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .follow_links(true)
        .max_depth(if recursive { None } else { Some(1) })
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut report = ScanReport::default();
    let mut abandoned_dirs: Vec<PathBuf> = Vec::new();

    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                let path = error_path(&err).unwrap_or_else(|| root.to_path_buf());
                if is_abandoned(&abandoned_dirs, &path) {
                    report.abandoned += 1;
                    continue;
                }
                warn!(path = %path.display(), error = %err, "failed to enumerate entry");
                if let Some(parent) = path.parent() {
                    abandoned_dirs.push(parent.to_path_buf());
                }
                report.errors.push(StructuralError::UnreadableEntry {
                    path,
                    message: err.to_string(),
                });
                continue;
            }
        };

        if entry.depth() == 0 {
            continue;
        }
        let path = entry.path();
        if is_abandoned(&abandoned_dirs, path) {
            report.abandoned += 1;
            continue;
        }
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some(CLASS_EXTENSION) => match std::fs::read(path) {
                Ok(bytes) => {
                    let relative_path = path.strip_prefix(root).unwrap_or(path).to_path_buf();
                    report.units.push(ScannedUnit {
                        relative_path,
                        path: path.to_path_buf(),
                        bytes,
                    });
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read class file");
                    if let Some(parent) = path.parent() {
                        abandoned_dirs.push(parent.to_path_buf());
                    }
                    report.errors.push(StructuralError::UnreadableEntry {
                        path: path.to_path_buf(),
                        message: err.to_string(),
                    });
                }
            },
            Some(SOURCE_EXTENSION) => {
                warn!(
                    path = %path.display(),
                    "source found where a compiled unit was expected, ignoring"
                );
                report.misplaced_sources.push(path.to_path_buf());
            }
            _ => {
                debug!(path = %path.display(), "not a class file, ignoring");
            }
        }
    }

    Ok(report)
}

/// `a/b/Foo.class` -> `a.b.Foo`
pub fn relative_path_to_qualified_name(relative: &Path) -> String {
    let trimmed = relative.with_extension("");
    trimmed
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(".")
}

pub fn class_name_to_class_path(class_name: &str) -> String {
    format!("{}.{CLASS_EXTENSION}", class_name.replace('.', "/"))
}

fn is_abandoned(abandoned_dirs: &[PathBuf], path: &Path) -> bool {
    abandoned_dirs.iter().any(|dir| path.starts_with(dir))
}

fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        ignore::Error::Partial(errs) => errs.iter().find_map(error_path),
        _ => None,
    }
}
