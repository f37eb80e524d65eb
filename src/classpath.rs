//! Parent resolvers for the reloading loader.
//!
//! Units found here are dependencies of the project, not part of it: they are
//! handed to the loader as-is and never enhanced.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::LoadError;
use crate::scan::class_name_to_class_path;

/// Fallback lookup used when a name cannot be resolved from the project's
/// own class tree.
pub trait ParentResolver: Send + Sync {
    /// `Ok(None)` when this resolver does not know the name.
    fn resolve(&self, qualified_name: &str) -> Result<Option<Vec<u8>>, LoadError>;
}

/// A parent that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParent;

impl ParentResolver for NoParent {
    fn resolve(&self, _qualified_name: &str) -> Result<Option<Vec<u8>>, LoadError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClasspathEntry {
    Directory(PathBuf),
    Archive(PathBuf),
}

impl ClasspathEntry {
    pub fn from_path(path: PathBuf) -> Self {
        let is_archive = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jar") || e.eq_ignore_ascii_case("zip"));
        if is_archive {
            ClasspathEntry::Archive(path)
        } else {
            ClasspathEntry::Directory(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ClasspathEntry::Directory(p) | ClasspathEntry::Archive(p) => p,
        }
    }
}

/// Ordered directories and jar archives; the first entry holding a name wins.
#[derive(Debug, Clone, Default)]
pub struct Classpath {
    entries: Vec<ClasspathEntry>,
}

impl Classpath {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            entries: paths.into_iter().map(ClasspathEntry::from_path).collect(),
        }
    }

    pub fn entries(&self) -> &[ClasspathEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ParentResolver for Classpath {
    fn resolve(&self, qualified_name: &str) -> Result<Option<Vec<u8>>, LoadError> {
        let class_path = class_name_to_class_path(qualified_name);
        for entry in &self.entries {
            let found = match entry {
                ClasspathEntry::Directory(dir) => read_from_dir(dir, &class_path).map_err(|source| {
                    LoadError::Read {
                        name: qualified_name.to_string(),
                        path: dir.join(&class_path),
                        source,
                    }
                })?,
                ClasspathEntry::Archive(jar) => {
                    read_from_jar(jar, &class_path).map_err(|source| LoadError::Archive {
                        name: qualified_name.to_string(),
                        path: jar.clone(),
                        source,
                    })?
                }
            };
            if let Some(bytes) = found {
                debug!(unit = qualified_name, entry = %entry.path().display(), "resolved from classpath");
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }
}

fn read_from_dir(dir: &Path, class_path: &str) -> std::io::Result<Option<Vec<u8>>> {
    match std::fs::read(dir.join(class_path)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Missing archives are treated like archives without the entry.
pub fn read_from_jar(jar_path: &Path, class_path: &str) -> Result<Option<Vec<u8>>> {
    if !jar_path.is_file() {
        return Ok(None);
    }
    let file = File::open(jar_path).with_context(|| format!("Failed to open jar: {}", jar_path.display()))?;
    // SAFETY: the mapping is read-only and dropped before returning.
    let mmap = unsafe { Mmap::map(&file).with_context(|| format!("Failed to mmap jar: {}", jar_path.display()))? };
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", jar_path.display()))?;

    let mut entry = match archive.by_name(class_path) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {class_path} from {}", jar_path.display()));
        }
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("Failed to inflate {class_path} from {}", jar_path.display()))?;
    Ok(Some(bytes))
}
