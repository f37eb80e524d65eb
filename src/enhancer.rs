//! Enhancer passes and the ordered chain that runs them.

use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::classfile::ClassFile;
use crate::descriptor::ProgressGuard;
use crate::error::EnhancingError;
use crate::marker::{self, MarkerRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EnhancerId {
    pub name: String,
    pub version: String,
}

impl EnhancerId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.rsplit_once('@') {
            Some((name, version)) => Self::new(name, version),
            None => Self::new(raw, ""),
        }
    }
}

impl fmt::Display for EnhancerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

pub struct UnitView<'a> {
    pub qualified_name: &'a str,
    pub original: &'a [u8],
    /// Output of the previous pass, or the original bytes for the first one.
    pub current: &'a [u8],
}

impl UnitView<'_> {
    pub fn class_file(&self) -> anyhow::Result<ClassFile> {
        ClassFile::parse(self.current)
            .with_context(|| format!("failed to parse current bytes of {}", self.qualified_name))
    }
}

/// One transformation pass.
///
/// Returning `Ok(None)` means the pass has nothing to do for this unit; a
/// pass must be a safe no-op on units it does not apply to. `Ok(Some(bytes))`
/// replaces the unit's enhanced bytes wholesale.
pub trait Enhancer: Send + Sync {
    fn id(&self) -> &EnhancerId;

    fn enhance(&self, unit: &UnitView<'_>) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Capability handed to the batch driver and the on-demand loader: given a
/// unit that passed the eligibility filter, leave its enhanced bytes installed.
pub trait EnhancementSink: Send + Sync {
    fn enhance(&self, unit: &mut ProgressGuard<'_>) -> Result<(), EnhancingError>;

    fn enhancer_ids(&self) -> Vec<EnhancerId>;
}

#[derive(Clone, Default)]
pub struct EnhancerChain {
    enhancers: Vec<Arc<dyn Enhancer>>,
}

impl fmt::Debug for EnhancerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.enhancers.iter().map(|e| e.id().to_string()))
            .finish()
    }
}

impl EnhancerChain {
    pub fn new(enhancers: Vec<Arc<dyn Enhancer>>) -> Self {
        Self { enhancers }
    }

    pub fn push(&mut self, enhancer: Arc<dyn Enhancer>) {
        self.enhancers.push(enhancer);
    }

    pub fn len(&self) -> usize {
        self.enhancers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enhancers.is_empty()
    }

    pub fn ids(&self) -> Vec<EnhancerId> {
        self.enhancers.iter().map(|e| e.id().clone()).collect()
    }

    /// The first failing pass aborts the rest of the chain for this unit.
    pub fn apply(&self, unit: &mut ProgressGuard<'_>) -> Result<(), EnhancingError> {
        let name = unit.qualified_name();
        for enhancer in &self.enhancers {
            let start = Instant::now();
            let produced = {
                let view = UnitView {
                    qualified_name: name,
                    original: unit.original(),
                    current: unit.current(),
                };
                enhancer.enhance(&view)
            };
            let produced = produced.map_err(|e| EnhancingError::new(name, enhancer.id().clone(), e))?;

            if let Some(bytes) = produced {
                ClassFile::parse(&bytes)
                    .context("pass produced a malformed class file")
                    .map_err(|e| EnhancingError::new(name, enhancer.id().clone(), e))?;
                unit.install(bytes);
            }

            debug!(
                unit = name,
                enhancer = %enhancer.id(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "applied enhancer"
            );
        }

        let record = MarkerRecord {
            enhancers: self.ids(),
            source_sha256: Some(marker::sha256_hex(unit.original())),
        };
        let stamped = marker::stamp(unit.current(), &record)
            .context("failed to stamp enhancement marker")
            .map_err(|e| EnhancingError::new(name, marker_id(), e))?;
        unit.install(stamped);
        Ok(())
    }
}

impl EnhancementSink for EnhancerChain {
    fn enhance(&self, unit: &mut ProgressGuard<'_>) -> Result<(), EnhancingError> {
        self.apply(unit)
    }

    fn enhancer_ids(&self) -> Vec<EnhancerId> {
        self.ids()
    }
}

fn marker_id() -> EnhancerId {
    EnhancerId::new("marker", env!("CARGO_PKG_VERSION"))
}
