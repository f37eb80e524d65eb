use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::classfile;
use crate::config::EnhancerSpec;
use crate::enhancer::{Enhancer, EnhancerChain, EnhancerId, UnitView};
use crate::marker::sha256_hex;

pub const RELOAD_STAMP_ATTRIBUTE: &str = "org.classenhancer.ReloadStamp";

pub type EnhancerFactory = Box<dyn Fn(&EnhancerSpec) -> Result<Arc<dyn Enhancer>> + Send + Sync>;

pub struct EnhancerRegistry {
    factories: BTreeMap<String, EnhancerFactory>,
}

impl Default for EnhancerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl EnhancerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("attribute", |spec| {
            Ok(Arc::new(AttributeEnhancer::from_spec(spec)?) as Arc<dyn Enhancer>)
        });
        registry.register("reload-stamp", |spec| {
            Ok(Arc::new(ReloadStampEnhancer::new(spec.id())) as Arc<dyn Enhancer>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&EnhancerSpec) -> Result<Arc<dyn Enhancer>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    // registration names must be unique
    pub fn build_chain(&self, specs: &[EnhancerSpec]) -> Result<EnhancerChain> {
        let mut seen = HashSet::new();
        let mut chain = EnhancerChain::default();
        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                bail!("enhancer `{}` is registered more than once", spec.name);
            }
            let kind = spec.kind();
            let Some(factory) = self.factories.get(kind) else {
                bail!(
                    "unknown enhancer kind `{kind}` for `{}` (known: {})",
                    spec.name,
                    self.kinds().join(", ")
                );
            };
            let enhancer = factory(spec)
                .with_context(|| format!("Failed to build enhancer `{}`", spec.id()))?;
            chain.push(enhancer);
        }
        Ok(chain)
    }
}

/// Adds a fixed class-level attribute; no-op when the attribute is present.
#[derive(Debug, Clone)]
pub struct AttributeEnhancer {
    id: EnhancerId,
    attribute: String,
    payload: Vec<u8>,
}

impl AttributeEnhancer {
    pub fn new(id: EnhancerId, attribute: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            attribute: attribute.into(),
            payload: payload.into(),
        }
    }

    fn from_spec(spec: &EnhancerSpec) -> Result<Self> {
        let attribute = spec
            .option_str("attribute")
            .with_context(|| format!("enhancer `{}` needs an `attribute` key", spec.name))?;
        if attribute.is_empty() {
            bail!("enhancer `{}` has an empty `attribute`", spec.name);
        }
        let payload = spec.option_str("payload").unwrap_or_default();
        Ok(Self::new(spec.id(), attribute, payload.as_bytes().to_vec()))
    }
}

impl Enhancer for AttributeEnhancer {
    fn id(&self) -> &EnhancerId {
        &self.id
    }

    fn enhance(&self, unit: &UnitView<'_>) -> Result<Option<Vec<u8>>> {
        if unit.class_file()?.has_attribute(&self.attribute) {
            return Ok(None);
        }
        Ok(Some(classfile::with_attribute(
            unit.current,
            &self.attribute,
            &self.payload,
        )?))
    }
}

/// Stamps the digest of the unit's original bytes so a reloading host can
/// tell whether the class it holds came from the same compilation.
#[derive(Debug, Clone)]
pub struct ReloadStampEnhancer {
    id: EnhancerId,
}

impl ReloadStampEnhancer {
    pub fn new(id: EnhancerId) -> Self {
        Self { id }
    }
}

impl Enhancer for ReloadStampEnhancer {
    fn id(&self) -> &EnhancerId {
        &self.id
    }

    fn enhance(&self, unit: &UnitView<'_>) -> Result<Option<Vec<u8>>> {
        if unit.class_file()?.has_attribute(RELOAD_STAMP_ATTRIBUTE) {
            return Ok(None);
        }
        let digest = sha256_hex(unit.original);
        Ok(Some(classfile::with_attribute(
            unit.current,
            RELOAD_STAMP_ATTRIBUTE,
            digest.as_bytes(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ClassFile, access, skeleton};

    fn spec(toml_src: &str) -> EnhancerSpec {
        toml::from_str(toml_src).unwrap()
    }

    fn view<'a>(bytes: &'a [u8]) -> UnitView<'a> {
        UnitView {
            qualified_name: "a.Foo",
            original: bytes,
            current: bytes,
        }
    }

    #[test]
    fn builds_chain_in_registration_order() -> Result<()> {
        let registry = EnhancerRegistry::with_builtins();
        let specs = vec![
            spec("name = \"stamp\"\nkind = \"reload-stamp\"\nversion = \"2\""),
            spec("name = \"tag\"\nkind = \"attribute\"\nattribute = \"Tag\"\npayload = \"v\""),
        ];
        let chain = registry.build_chain(&specs)?;
        assert_eq!(
            chain.ids(),
            vec![EnhancerId::new("stamp", "2"), EnhancerId::new("tag", "1")]
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_kind_and_duplicates() {
        let registry = EnhancerRegistry::with_builtins();
        let err = registry
            .build_chain(&[spec("name = \"orm\"\nkind = \"ebean\"")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown enhancer kind `ebean`"));

        let dup = spec("name = \"stamp\"\nkind = \"reload-stamp\"");
        let err = registry.build_chain(&[dup.clone(), dup]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn attribute_kind_requires_attribute_key() {
        let registry = EnhancerRegistry::with_builtins();
        let err = registry
            .build_chain(&[spec("name = \"tag\"\nkind = \"attribute\"")])
            .unwrap_err();
        assert!(format!("{err:#}").contains("needs an `attribute` key"));
    }

    #[test]
    fn attribute_enhancer_is_noop_when_present() -> Result<()> {
        let e = AttributeEnhancer::new(EnhancerId::new("tag", "1"), "Tag", b"v".to_vec());
        let bytes = skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC);
        let once = e.enhance(&view(&bytes))?.expect("applies");
        assert!(ClassFile::parse(&once)?.has_attribute("Tag"));
        assert!(e.enhance(&view(&once))?.is_none());
        Ok(())
    }

    #[test]
    fn reload_stamp_records_original_digest() -> Result<()> {
        let e = ReloadStampEnhancer::new(EnhancerId::new("stamp", "1"));
        let bytes = skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC);
        let out = e.enhance(&view(&bytes))?.expect("applies");
        let class = ClassFile::parse(&out)?;
        let stamp = class.attribute(RELOAD_STAMP_ATTRIBUTE).expect("stamp");
        assert_eq!(stamp.data, sha256_hex(&bytes).into_bytes());
        Ok(())
    }

    #[test]
    fn custom_kinds_can_be_registered() -> Result<()> {
        let mut registry = EnhancerRegistry::empty();
        registry.register("noop-tag", |spec| {
            Ok(Arc::new(AttributeEnhancer::new(spec.id(), "Noop", Vec::new())) as Arc<dyn Enhancer>)
        });
        let chain = registry.build_chain(&[spec("name = \"noop-tag\"")])?;
        assert_eq!(chain.len(), 1);
        Ok(())
    }
}
