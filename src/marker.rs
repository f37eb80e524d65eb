//! The enhancement marker.
//!
//! Every enhanced class carries a class-level attribute named
//! [`MARKER_ATTRIBUTE`]. The JVM ignores unknown attributes, so the marker
//! survives class loading untouched. Its payload is UTF-8 text:
//!
//! ```text
//! enhancers=orm@2,reload-stamp@1
//! source-sha256=<hex digest of the bytes before enhancement>
//! ```

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::classfile::{self, ClassFile, ClassFormatError};
use crate::enhancer::EnhancerId;

pub const MARKER_ATTRIBUTE: &str = "org.classenhancer.Enhanced";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MarkerRecord {
    pub enhancers: Vec<EnhancerId>,
    pub source_sha256: Option<String>,
}

impl MarkerRecord {
    pub fn encode(&self) -> Vec<u8> {
        let passes = self
            .enhancers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut out = format!("enhancers={passes}\n");
        if let Some(hash) = self.source_sha256.as_deref() {
            out.push_str(&format!("source-sha256={hash}\n"));
        }
        out.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut record = MarkerRecord::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "enhancers" => {
                    record.enhancers = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(EnhancerId::parse)
                        .collect();
                }
                "source-sha256" => record.source_sha256 = Some(value.trim().to_string()),
                _ => {}
            }
        }
        record
    }
}

pub fn is_marked(class: &ClassFile) -> bool {
    class.has_attribute(MARKER_ATTRIBUTE)
}

pub fn read(class: &ClassFile) -> Option<MarkerRecord> {
    class
        .attribute(MARKER_ATTRIBUTE)
        .map(|a| MarkerRecord::decode(&a.data))
}

pub fn stamp(bytes: &[u8], record: &MarkerRecord) -> Result<Vec<u8>, ClassFormatError> {
    classfile::with_attribute(bytes, MARKER_ATTRIBUTE, &record.encode())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
