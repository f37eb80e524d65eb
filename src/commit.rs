use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::descriptor::{EnhancementState, ProgressGuard};
use crate::error::PersistenceError;
use crate::marker::sha256_hex;

#[derive(Debug, Clone, Serialize)]
pub struct CommitReceipt {
    pub path: PathBuf,
    pub bytes: usize,
    pub sha256: String,
}

/// Writes enhanced bytes back to a unit's output location.
#[derive(Debug, Clone, Default)]
pub struct Committer;

impl Committer {
    pub fn new() -> Self {
        Self
    }

    /// Returns `Ok(None)` when there is nothing to write: the unit was skipped,
    /// failed, or never produced enhanced bytes.
    pub fn commit(&self, unit: &ProgressGuard<'_>) -> Result<Option<CommitReceipt>, PersistenceError> {
        if unit.state() != EnhancementState::Enhanced {
            return Ok(None);
        }
        let Some(bytes) = unit.enhanced().filter(|b| !b.is_empty()) else {
            return Ok(None);
        };

        let path = unit.descriptor().output_path();
        write_atomically(path, bytes).map_err(|source| PersistenceError {
            unit: unit.qualified_name().to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        debug!(unit = unit.qualified_name(), path = %path.display(), bytes = bytes.len(), "committed");

        Ok(Some(CommitReceipt {
            path: path.to_path_buf(),
            bytes: bytes.len(),
            sha256: sha256_hex(bytes),
        }))
    }
}

/// Write to a sibling temp file, then rename over the target, so a reader
/// never observes a half-written class file.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_os = path.as_os_str().to_os_string();
    tmp_os.push(".enhancing");
    let tmp = PathBuf::from(tmp_os);
    std::fs::write(&tmp, bytes)?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{UnitDescriptor, UnitLocation};
    use crate::eligibility::{ExemptReason, SkipReason};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "class_enhancer_commit_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    #[test]
    fn enhanced_unit_overwrites_output() -> anyhow::Result<()> {
        let base = temp_dir("overwrite");
        let path = base.join("a/Foo.class");
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(&path, b"old")?;

        let d = UnitDescriptor::new("a.Foo", UnitLocation::in_place(path.clone()), b"old".to_vec());
        let mut p = d.lock();
        p.advance(EnhancementState::InProgress)?;
        p.install(b"new bytes".to_vec());
        p.advance(EnhancementState::Enhanced)?;

        let receipt = Committer::new().commit(&p)?.expect("written");
        assert_eq!(receipt.bytes, 9);
        assert_eq!(std::fs::read(&path)?, b"new bytes");
        assert!(!base.join("a/Foo.class.enhancing").exists());

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn skipped_unit_is_not_written() -> anyhow::Result<()> {
        let base = temp_dir("skipped");
        let path = base.join("Bar.class");
        let d = UnitDescriptor::new("Bar", UnitLocation::in_place(path.clone()), b"bar".to_vec());
        let mut p = d.lock();
        p.skip(SkipReason::Exempt(ExemptReason::Interface))?;
        assert!(Committer::new().commit(&p)?.is_none());
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn separate_destination_gets_parent_dirs() -> anyhow::Result<()> {
        let base = temp_dir("destination");
        let location = UnitLocation {
            source: base.join("classes/a/Foo.class"),
            output: base.join("enhanced/a/Foo.class"),
        };
        let d = UnitDescriptor::new("a.Foo", location.clone(), b"src".to_vec());
        let mut p = d.lock();
        p.advance(EnhancementState::InProgress)?;
        p.install(b"out".to_vec());
        p.advance(EnhancementState::Enhanced)?;
        Committer::new().commit(&p)?;
        assert_eq!(std::fs::read(&location.output)?, b"out");

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn unwritable_output_is_persistence_error() -> anyhow::Result<()> {
        let base = temp_dir("unwritable");
        std::fs::create_dir_all(&base)?;
        // a regular file where the package directory should be
        std::fs::write(base.join("a"), b"blocker")?;
        let d = UnitDescriptor::new(
            "a.Foo",
            UnitLocation::in_place(base.join("a/Foo.class")),
            b"x".to_vec(),
        );
        let mut p = d.lock();
        p.advance(EnhancementState::InProgress)?;
        p.install(b"y".to_vec());
        p.advance(EnhancementState::Enhanced)?;
        let err = Committer::new().commit(&p).unwrap_err();
        assert_eq!(err.unit, "a.Foo");
        assert_eq!(err.path, base.join("a/Foo.class"));

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }
}
