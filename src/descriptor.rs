//! In-memory record of one compiled unit.
//!
//! A descriptor owns the unit's original bytes (immutable, set once), the
//! current enhanced bytes (replaced wholesale by each pass) and the
//! processing state. All mutable parts sit behind one lock: whoever holds the
//! [`ProgressGuard`] owns the unit until it reaches a terminal state, and any
//! concurrent caller for the same unit waits on that lock.

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::eligibility::SkipReason;
use crate::error::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementState {
    Unprocessed,
    InProgress,
    Enhanced,
    Skipped,
    Failed,
}

impl EnhancementState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnhancementState::Enhanced | EnhancementState::Skipped | EnhancementState::Failed
        )
    }

    fn can_advance_to(self, next: EnhancementState) -> bool {
        use EnhancementState::*;
        matches!(
            (self, next),
            (Unprocessed, InProgress)
                | (Unprocessed, Skipped)
                | (InProgress, Enhanced)
                | (InProgress, Failed)
        )
    }
}

/// Where a unit is read from and where its enhanced form is written.
/// Both are the same file unless a separate destination tree is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitLocation {
    pub source: PathBuf,
    pub output: PathBuf,
}

impl UnitLocation {
    pub fn in_place(path: PathBuf) -> Self {
        Self {
            output: path.clone(),
            source: path,
        }
    }

    pub fn is_in_place(&self) -> bool {
        self.source == self.output
    }
}

#[derive(Debug)]
struct Progress {
    state: EnhancementState,
    enhanced: Option<Arc<[u8]>>,
    skip_reason: Option<SkipReason>,
    failure: Option<String>,
}

#[derive(Debug)]
pub struct UnitDescriptor {
    qualified_name: String,
    location: UnitLocation,
    original: Arc<[u8]>,
    progress: Mutex<Progress>,
}

impl UnitDescriptor {
    pub fn new(qualified_name: impl Into<String>, location: UnitLocation, original: Vec<u8>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            location,
            original: original.into(),
            progress: Mutex::new(Progress {
                state: EnhancementState::Unprocessed,
                enhanced: None,
                skip_reason: None,
                failure: None,
            }),
        }
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn location(&self) -> &UnitLocation {
        &self.location
    }

    pub fn output_path(&self) -> &Path {
        &self.location.output
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Blocks while another caller holds the unit.
    pub fn lock(&self) -> ProgressGuard<'_> {
        ProgressGuard {
            descriptor: self,
            inner: self.progress.lock(),
        }
    }

    pub fn state(&self) -> EnhancementState {
        self.progress.lock().state
    }

    /// Enhanced bytes if a pass produced any, otherwise the original bytes.
    pub fn current_bytes(&self) -> Arc<[u8]> {
        self.lock().current_shared()
    }

    pub fn snapshot(&self) -> DescriptorSnapshot {
        self.lock().snapshot()
    }
}

pub struct ProgressGuard<'a> {
    descriptor: &'a UnitDescriptor,
    inner: MutexGuard<'a, Progress>,
}

impl<'a> ProgressGuard<'a> {
    pub fn descriptor(&self) -> &'a UnitDescriptor {
        self.descriptor
    }

    pub fn qualified_name(&self) -> &'a str {
        self.descriptor.qualified_name()
    }

    pub fn state(&self) -> EnhancementState {
        self.inner.state
    }

    pub fn original(&self) -> &'a [u8] {
        self.descriptor.original()
    }

    pub fn enhanced(&self) -> Option<&[u8]> {
        self.inner.enhanced.as_deref()
    }

    pub fn current(&self) -> &[u8] {
        match self.inner.enhanced.as_deref() {
            Some(bytes) => bytes,
            None => self.descriptor.original(),
        }
    }

    pub fn current_shared(&self) -> Arc<[u8]> {
        match self.inner.enhanced.as_ref() {
            Some(bytes) => Arc::clone(bytes),
            None => Arc::clone(&self.descriptor.original),
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        self.inner.skip_reason.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.inner.failure.as_deref()
    }

    /// Installs a whole new enhanced buffer; the previous one is dropped.
    pub fn install(&mut self, bytes: Vec<u8>) {
        self.inner.enhanced = Some(bytes.into());
    }

    pub fn advance(&mut self, next: EnhancementState) -> Result<(), StateError> {
        let from = self.inner.state;
        if !from.can_advance_to(next) {
            return Err(StateError {
                unit: self.descriptor.qualified_name.clone(),
                from,
                to: next,
            });
        }
        self.inner.state = next;
        Ok(())
    }

    pub fn skip(&mut self, reason: SkipReason) -> Result<(), StateError> {
        self.advance(EnhancementState::Skipped)?;
        self.inner.skip_reason = Some(reason);
        Ok(())
    }

    pub fn fail(&mut self, reason: String) -> Result<(), StateError> {
        if self.inner.state == EnhancementState::Unprocessed {
            self.advance(EnhancementState::InProgress)?;
        }
        self.advance(EnhancementState::Failed)?;
        self.inner.failure = Some(reason);
        Ok(())
    }

    pub fn snapshot(&self) -> DescriptorSnapshot {
        DescriptorSnapshot {
            qualified_name: self.descriptor.qualified_name.clone(),
            location: self.descriptor.location.clone(),
            state: self.inner.state,
            original_len: self.descriptor.original.len(),
            enhanced_len: self.inner.enhanced.as_ref().map(|b| b.len()),
            skip_reason: self.inner.skip_reason.clone(),
            failure: self.inner.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DescriptorSnapshot {
    pub qualified_name: String,
    pub location: UnitLocation,
    pub state: EnhancementState,
    pub original_len: usize,
    pub enhanced_len: Option<usize>,
    pub skip_reason: Option<SkipReason>,
    pub failure: Option<String>,
}
