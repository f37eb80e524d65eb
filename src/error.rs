use std::io;
use std::path::PathBuf;

use crate::classfile::ClassFormatError;
use crate::descriptor::EnhancementState;
use crate::enhancer::EnhancerId;

/// A problem with the tree being walked rather than with any one unit.
#[derive(Debug, thiserror::Error)]
pub enum StructuralError {
    #[error("class root not found: {}", path.display())]
    MissingRoot { path: PathBuf },
    #[error("class root is not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },
    #[error("failed to read {}: {message}", path.display())]
    UnreadableEntry { path: PathBuf, message: String },
}

impl StructuralError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            StructuralError::MissingRoot { path }
            | StructuralError::NotADirectory { path }
            | StructuralError::UnreadableEntry { path, .. } => path,
        }
    }
}

/// A named pass failed against a named unit.
#[derive(Debug, thiserror::Error)]
#[error("while applying {enhancer} on {unit}")]
pub struct EnhancingError {
    pub unit: String,
    pub enhancer: EnhancerId,
    #[source]
    pub source: anyhow::Error,
}

impl EnhancingError {
    pub fn new(unit: impl Into<String>, enhancer: EnhancerId, source: anyhow::Error) -> Self {
        Self {
            unit: unit.into(),
            enhancer,
            source,
        }
    }
}

/// Writing enhanced bytes back failed. Reported per unit, never fatal to a run.
#[derive(Debug, thiserror::Error)]
#[error("failed to write enhanced {unit} to {}", path.display())]
pub struct PersistenceError {
    pub unit: String,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
#[error("illegal state transition for {unit}: {from:?} -> {to:?}")]
pub struct StateError {
    pub unit: String,
    pub from: EnhancementState,
    pub to: EnhancementState,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("class not found: {name}")]
    NotFound { name: String },
    #[error("invalid class name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("failed to read {name} from {}", path.display())]
    Read {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {name} from archive {}", path.display())]
    Archive {
        name: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("malformed class file for {name}")]
    Malformed {
        name: String,
        #[source]
        source: ClassFormatError,
    },
    #[error("{requested} resolved to bytes declaring {found}")]
    WrongName { requested: String, found: String },
    #[error("enhancement of {name} failed: {reason}")]
    Enhancement { name: String, reason: String },
}
