//! Decides whether a unit enters the enhancer chain.
//!
//! Exemptions are read from the class file's structural metadata; only the
//! platform namespace check looks at the name. Already-enhanced units are
//! recognized by the marker attribute, either on the unit itself or on the
//! copy already sitting at its output location.

use serde::Serialize;
use tracing::{debug, warn};

use crate::classfile::{ClassFile, ClassFormatError};
use crate::descriptor::UnitDescriptor;
use crate::enhancer::EnhancerId;
use crate::marker::{self, MarkerRecord};

pub const DEFAULT_PLATFORM_PREFIXES: &[&str] =
    &["java.", "javax.", "jdk.", "sun.", "com.sun.", "org.w3c.dom.", "org.xml.sax."];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExemptReason {
    Interface,
    Enum,
    Annotation,
    Array,
    Module,
    PackageInfo,
    Platform { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorEnhancement {
    Marker,
    OutputCopy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Proceed,
    Exempt { reason: ExemptReason },
    AlreadyEnhanced { by: PriorEnhancement },
}

/// Why a descriptor ended up `Skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Exempt(ExemptReason),
    AlreadyEnhanced(PriorEnhancement),
}

impl SkipReason {
    pub fn from_verdict(verdict: &Verdict) -> Option<Self> {
        match verdict {
            Verdict::Proceed => None,
            Verdict::Exempt { reason } => Some(SkipReason::Exempt(reason.clone())),
            Verdict::AlreadyEnhanced { by } => Some(SkipReason::AlreadyEnhanced(by.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    platform_prefixes: Vec<String>,
    expected: Vec<EnhancerId>,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl EligibilityFilter {
    /// `extra_prefixes` are appended to [`DEFAULT_PLATFORM_PREFIXES`];
    /// `expected` is the pass list of the current chain, compared against
    /// the one recorded in markers of previously enhanced units.
    pub fn new(extra_prefixes: Vec<String>, expected: Vec<EnhancerId>) -> Self {
        let mut platform_prefixes: Vec<String> = DEFAULT_PLATFORM_PREFIXES
            .iter()
            .map(|s| s.to_string())
            .collect();
        for prefix in extra_prefixes {
            let prefix = if prefix.ends_with('.') {
                prefix
            } else {
                format!("{prefix}.")
            };
            if !platform_prefixes.contains(&prefix) {
                platform_prefixes.push(prefix);
            }
        }
        Self {
            platform_prefixes,
            expected,
        }
    }

    pub fn platform_prefix(&self, qualified_name: &str) -> Option<&str> {
        self.platform_prefixes
            .iter()
            .find(|p| qualified_name.starts_with(p.as_str()))
            .map(String::as_str)
    }

    pub fn classify(&self, descriptor: &UnitDescriptor) -> Result<Verdict, ClassFormatError> {
        let name = descriptor.qualified_name();
        if let Some(verdict) = self.classify_name(name) {
            return Ok(verdict);
        }

        let class = ClassFile::parse(descriptor.original())?;
        if let Some(reason) = structural_exemption(&class) {
            return Ok(Verdict::Exempt { reason });
        }

        if let Some(record) = marker::read(&class) {
            self.check_compat(name, &record);
            return Ok(Verdict::AlreadyEnhanced {
                by: PriorEnhancement::Marker,
            });
        }

        let location = descriptor.location();
        if !location.is_in_place()
            && let Some(record) = read_output_marker(&location.output)
        {
            let source_sha256 = marker::sha256_hex(descriptor.original());
            if record.source_sha256.as_deref() == Some(source_sha256.as_str()) {
                self.check_compat(name, &record);
                return Ok(Verdict::AlreadyEnhanced {
                    by: PriorEnhancement::OutputCopy,
                });
            }
            debug!(unit = name, output = %location.output.display(), "output copy is stale, re-enhancing");
        }

        Ok(Verdict::Proceed)
    }

    /// Name-only checks, usable before any bytes are read.
    pub fn classify_name(&self, qualified_name: &str) -> Option<Verdict> {
        if qualified_name.starts_with('[') || qualified_name.ends_with("[]") {
            return Some(Verdict::Exempt {
                reason: ExemptReason::Array,
            });
        }
        if let Some(prefix) = self.platform_prefix(qualified_name) {
            return Some(Verdict::Exempt {
                reason: ExemptReason::Platform {
                    prefix: prefix.to_string(),
                },
            });
        }
        let simple = qualified_name.rsplit('.').next().unwrap_or(qualified_name);
        match simple {
            "package-info" | "package" => Some(Verdict::Exempt {
                reason: ExemptReason::PackageInfo,
            }),
            "module-info" => Some(Verdict::Exempt {
                reason: ExemptReason::Module,
            }),
            _ => None,
        }
    }

    fn check_compat(&self, name: &str, record: &MarkerRecord) {
        if !self.expected.is_empty() && record.enhancers != self.expected {
            let recorded = record
                .enhancers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let expected = self
                .expected
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            warn!(
                unit = name,
                recorded = %recorded,
                expected = %expected,
                "unit was enhanced by a different enhancer set; rebuild it to re-enhance"
            );
        }
    }
}

fn structural_exemption(class: &ClassFile) -> Option<ExemptReason> {
    if class.is_module() {
        return Some(ExemptReason::Module);
    }
    // annotation types also carry ACC_INTERFACE
    if class.is_annotation() {
        return Some(ExemptReason::Annotation);
    }
    if class.is_interface() {
        return Some(ExemptReason::Interface);
    }
    if class.is_enum() {
        return Some(ExemptReason::Enum);
    }
    let simple = class.this_class.rsplit('/').next().unwrap_or(&class.this_class);
    if simple == "package-info" {
        return Some(ExemptReason::PackageInfo);
    }
    None
}

fn read_output_marker(output: &std::path::Path) -> Option<MarkerRecord> {
    let bytes = std::fs::read(output).ok()?;
    let class = ClassFile::parse(&bytes).ok()?;
    marker::read(&class)
}
