//! On-demand enhancement at load time.
//!
//! A [`ReloadingLoader`] resolves names against the project's own class tree
//! first, running each unit through the shared [`UnitProcessor`] on first
//! request. Names it cannot find locally, and platform names, go to the
//! parent resolver and come back untouched.

use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::cache::DescriptorCache;
use crate::classfile::{ClassFile, internal_to_qualified};
use crate::classpath::ParentResolver;
use crate::descriptor::{EnhancementState, UnitDescriptor, UnitLocation};
use crate::error::LoadError;
use crate::marker::sha256_hex;
use crate::pipeline::UnitProcessor;
use crate::scan::class_name_to_class_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassOrigin {
    Local { state: EnhancementState },
    Parent,
}

/// A resolved runtime type: validated bytes plus the header a host needs to
/// define it.
#[derive(Debug, Clone, Serialize)]
pub struct DefinedClass {
    pub name: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub access_flags: u16,
    pub origin: ClassOrigin,
    pub size: usize,
    pub sha256: String,
    #[serde(skip)]
    pub bytes: Arc<[u8]>,
}

impl DefinedClass {
    fn define(requested: &str, bytes: Arc<[u8]>, origin: ClassOrigin) -> Result<Self, LoadError> {
        let class = ClassFile::parse(&bytes).map_err(|source| LoadError::Malformed {
            name: requested.to_string(),
            source,
        })?;
        let found = class.qualified_name();
        if found != requested {
            return Err(LoadError::WrongName {
                requested: requested.to_string(),
                found,
            });
        }
        Ok(Self {
            name: found,
            super_class: class.super_class.as_deref().map(internal_to_qualified),
            interfaces: class.interfaces.iter().map(|i| internal_to_qualified(i)).collect(),
            access_flags: class.access_flags,
            origin,
            size: bytes.len(),
            sha256: sha256_hex(&bytes),
            bytes,
        })
    }
}

pub struct ReloadingLoader {
    source: PathBuf,
    destination: PathBuf,
    processor: Arc<UnitProcessor>,
    parent: Arc<dyn ParentResolver>,
    cache: Arc<DescriptorCache>,
    delegated: DashMap<String, DefinedClass>,
    generation: u64,
}

impl ReloadingLoader {
    pub fn new(
        source: PathBuf,
        destination: Option<PathBuf>,
        processor: Arc<UnitProcessor>,
        parent: Arc<dyn ParentResolver>,
    ) -> Self {
        Self {
            destination: destination.unwrap_or_else(|| source.clone()),
            source,
            processor,
            parent,
            cache: Arc::new(DescriptorCache::new()),
            delegated: DashMap::new(),
            generation: 0,
        }
    }

    pub fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A new generation with empty caches over the same processor and
    /// parent. Units changed on disk since are picked up on next resolve.
    pub fn renew(&self) -> Self {
        Self {
            source: self.source.clone(),
            destination: self.destination.clone(),
            processor: Arc::clone(&self.processor),
            parent: Arc::clone(&self.parent),
            cache: Arc::new(DescriptorCache::new()),
            delegated: DashMap::new(),
            generation: self.generation + 1,
        }
    }

    /// Accepts dotted or internal (`a/b/Foo`) names.
    pub fn resolve(&self, name: &str) -> Result<DefinedClass, LoadError> {
        let name = internal_to_qualified(name.trim());
        if name.starts_with('[') {
            return self.delegate(&name);
        }
        check_name(&name)?;
        if self.processor.filter().platform_prefix(&name).is_some() {
            return self.delegate(&name);
        }

        let descriptor = match self.cache.get(&name) {
            Some(descriptor) => {
                debug!(unit = %name, generation = self.generation, "cache hit");
                descriptor
            }
            None => match self.cache.get_or_create(&name, || self.read_local(&name)) {
                Ok(descriptor) => descriptor,
                Err(LoadError::NotFound { .. }) => return self.delegate(&name),
                Err(err) => return Err(err),
            },
        };

        let report = self.processor.process(&descriptor);
        if report.state == EnhancementState::Failed {
            return Err(LoadError::Enhancement {
                name,
                reason: report.failure.unwrap_or_default(),
            });
        }
        DefinedClass::define(
            &name,
            descriptor.current_bytes(),
            ClassOrigin::Local {
                state: report.state,
            },
        )
    }

    fn read_local(&self, name: &str) -> Result<UnitDescriptor, LoadError> {
        let relative = class_name_to_class_path(name);
        let path = self.source.join(&relative);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(source) => {
                return Err(LoadError::Read {
                    name: name.to_string(),
                    path,
                    source,
                });
            }
        };
        // Malformed bytes still go through the processor, which fails the unit.
        if let Ok(class) = ClassFile::parse(&bytes) {
            let found = class.qualified_name();
            if found != name {
                return Err(LoadError::WrongName {
                    requested: name.to_string(),
                    found,
                });
            }
        }
        let location = UnitLocation {
            output: self.destination.join(&relative),
            source: path,
        };
        Ok(UnitDescriptor::new(name, location, bytes))
    }

    fn delegate(&self, name: &str) -> Result<DefinedClass, LoadError> {
        if let Some(defined) = self.delegated.get(name) {
            return Ok(defined.clone());
        }
        let Some(bytes) = self.parent.resolve(name)? else {
            return Err(LoadError::NotFound {
                name: name.to_string(),
            });
        };
        debug!(unit = name, "delegated to parent");
        let defined = DefinedClass::define(name, bytes.into(), ClassOrigin::Parent)?;
        Ok(self
            .delegated
            .entry(name.to_string())
            .or_insert(defined)
            .clone())
    }
}

/// Names are turned into paths under the class root, so anything that could
/// leave it is refused before the filesystem is touched.
fn check_name(name: &str) -> Result<(), LoadError> {
    let invalid = |reason: &'static str| -> Result<(), LoadError> {
        Err(LoadError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("empty name");
    }
    if name.contains(['\\', '\0', ':']) {
        return invalid("contains a path separator or reserved character");
    }
    if name.split('.').any(str::is_empty) {
        return invalid("empty segment");
    }
    Ok(())
}
