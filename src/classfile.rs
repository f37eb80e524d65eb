//! Class file introspection.
//!
//! Parses just enough of the JVM class file format to classify a unit
//! (access flags, this/super/interface names, class-level attributes) and to
//! append a class-level attribute without disturbing the rest of the file.
//! Field and method tables are walked but not retained.

use std::ops::Range;

pub const MAGIC: u32 = 0xCAFE_BABE;

/// Class access flags relevant to eligibility.
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
    pub const ANNOTATION: u16 = 0x2000;
    pub const ENUM: u16 = 0x4000;
    pub const MODULE: u16 = 0x8000;
}

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClassFormatError {
    #[error("not a class file (magic {found:#010x})")]
    BadMagic { found: u32 },
    #[error("truncated class file: {needed} bytes needed at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownTag { tag: u8, index: u16 },
    #[error("constant pool index {index} is not a {expected} entry")]
    BadReference { index: u16, expected: &'static str },
    #[error("constant pool is full")]
    PoolFull,
    #[error("attribute `{name}` is too large ({len} bytes)")]
    AttributeTooLarge { name: String, len: usize },
    #[error("{count} trailing bytes after class attributes")]
    TrailingBytes { count: usize },
}

#[derive(Debug, Clone)]
enum Constant {
    Unusable,
    Utf8(String),
    Class(u16),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassAttribute {
    pub name: String,
    pub data: Vec<u8>,
}

/// Parsed view of one class file. Names are kept in internal form
/// (`a/b/Foo`); use [`ClassFile::qualified_name`] for the dotted form.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub access_flags: u16,
    pub this_class: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub field_count: u16,
    pub method_count: u16,
    pub attributes: Vec<ClassAttribute>,
    pool: Vec<Constant>,
    pool_end: usize,
    attributes_at: usize,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFormatError> {
        let mut r = Reader::new(bytes);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ClassFormatError::BadMagic { found: magic });
        }
        let minor_version = r.u16()?;
        let major_version = r.u16()?;
        let pool = read_pool(&mut r)?;
        let pool_end = r.pos;

        let access_flags = r.u16()?;
        let this_index = r.u16()?;
        let super_index = r.u16()?;
        let this_class = class_name(&pool, this_index)?.to_string();
        let super_class = if super_index == 0 {
            None
        } else {
            Some(class_name(&pool, super_index)?.to_string())
        };

        let interface_count = r.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            let idx = r.u16()?;
            interfaces.push(class_name(&pool, idx)?.to_string());
        }

        let field_count = r.u16()?;
        skip_members(&mut r, field_count)?;
        let method_count = r.u16()?;
        skip_members(&mut r, method_count)?;

        let attributes_at = r.pos;
        let attribute_count = r.u16()?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            let name_index = r.u16()?;
            let len = r.u32()? as usize;
            let data = r.take(len)?.to_vec();
            attributes.push(ClassAttribute {
                name: utf8(&pool, name_index)?.to_string(),
                data,
            });
        }

        if r.remaining() > 0 {
            return Err(ClassFormatError::TrailingBytes {
                count: r.remaining(),
            });
        }

        Ok(Self {
            minor_version,
            major_version,
            access_flags,
            this_class,
            super_class,
            interfaces,
            field_count,
            method_count,
            attributes,
            pool,
            pool_end,
            attributes_at,
        })
    }

    pub fn qualified_name(&self) -> String {
        internal_to_qualified(&self.this_class)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.access_flags & flag != 0
    }

    pub fn is_interface(&self) -> bool {
        self.has_flag(access::INTERFACE)
    }

    pub fn is_annotation(&self) -> bool {
        self.has_flag(access::ANNOTATION)
    }

    pub fn is_enum(&self) -> bool {
        self.has_flag(access::ENUM)
    }

    pub fn is_module(&self) -> bool {
        self.has_flag(access::MODULE)
    }

    pub fn attribute(&self, name: &str) -> Option<&ClassAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    fn find_utf8(&self, value: &str) -> Option<u16> {
        self.pool.iter().enumerate().find_map(|(i, c)| match c {
            Constant::Utf8(s) if s == value => u16::try_from(i).ok(),
            _ => None,
        })
    }
}

/// Returns a copy of `bytes` with one more class-level attribute appended.
///
/// The attribute name is added to the end of the constant pool unless an
/// identical UTF-8 entry already exists; no existing index moves, so code,
/// fields and methods are copied through untouched.
pub fn with_attribute(bytes: &[u8], name: &str, payload: &[u8]) -> Result<Vec<u8>, ClassFormatError> {
    let class = ClassFile::parse(bytes)?;
    let payload_len = u32::try_from(payload.len()).map_err(|_| ClassFormatError::AttributeTooLarge {
        name: name.to_string(),
        len: payload.len(),
    })?;
    let name_len = u16::try_from(name.len()).map_err(|_| ClassFormatError::AttributeTooLarge {
        name: name.to_string(),
        len: name.len(),
    })?;
    let attribute_count = u16::try_from(class.attributes.len() + 1)
        .map_err(|_| ClassFormatError::AttributeTooLarge {
            name: name.to_string(),
            len: class.attributes.len() + 1,
        })?;

    let pool_count = class.pool.len();
    let (name_index, new_entry) = match class.find_utf8(name) {
        Some(idx) => (idx, None),
        None => {
            let idx = u16::try_from(pool_count).map_err(|_| ClassFormatError::PoolFull)?;
            if idx == u16::MAX {
                return Err(ClassFormatError::PoolFull);
            }
            let mut entry = Vec::with_capacity(3 + name.len());
            entry.push(TAG_UTF8);
            entry.extend_from_slice(&name_len.to_be_bytes());
            entry.extend_from_slice(name.as_bytes());
            (idx, Some(entry))
        }
    };

    let mut out = Vec::with_capacity(bytes.len() + payload.len() + name.len() + 12);
    out.extend_from_slice(&bytes[..8]);
    let new_pool_count = if new_entry.is_some() {
        name_index + 1
    } else {
        pool_count as u16
    };
    out.extend_from_slice(&new_pool_count.to_be_bytes());
    out.extend_from_slice(&bytes[10..class.pool_end]);
    if let Some(entry) = new_entry {
        out.extend_from_slice(&entry);
    }
    out.extend_from_slice(&bytes[class.pool_end..class.attributes_at]);
    out.extend_from_slice(&attribute_count.to_be_bytes());
    out.extend_from_slice(&bytes[class.attributes_at + 2..]);
    out.extend_from_slice(&name_index.to_be_bytes());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Emits a minimal, memberless class file (Java 8 format) declaring
/// `internal_name` with the given super class and access flags.
pub fn skeleton(internal_name: &str, super_name: Option<&str>, access_flags: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&52u16.to_be_bytes());

    let pool_count: u16 = if super_name.is_some() { 5 } else { 3 };
    out.extend_from_slice(&pool_count.to_be_bytes());
    push_utf8(&mut out, internal_name);
    out.push(TAG_CLASS);
    out.extend_from_slice(&1u16.to_be_bytes());
    if let Some(super_name) = super_name {
        push_utf8(&mut out, super_name);
        out.push(TAG_CLASS);
        out.extend_from_slice(&3u16.to_be_bytes());
    }

    out.extend_from_slice(&access_flags.to_be_bytes());
    out.extend_from_slice(&2u16.to_be_bytes());
    let super_index: u16 = if super_name.is_some() { 4 } else { 0 };
    out.extend_from_slice(&super_index.to_be_bytes());
    // interfaces, fields, methods, attributes
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
    out
}

pub fn internal_to_qualified(internal: &str) -> String {
    internal.replace('/', ".")
}

pub fn qualified_to_internal(qualified: &str) -> String {
    qualified.replace('.', "/")
}

fn push_utf8(out: &mut Vec<u8>, value: &str) {
    out.push(TAG_UTF8);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn read_pool(r: &mut Reader<'_>) -> Result<Vec<Constant>, ClassFormatError> {
    let count = r.u16()?;
    let mut pool = vec![Constant::Unusable; count as usize];
    let mut index = 1u16;
    while index < count {
        let tag = r.u8()?;
        let mut width = 1u16;
        let constant = match tag {
            TAG_UTF8 => {
                let len = r.u16()? as usize;
                Constant::Utf8(String::from_utf8_lossy(r.take(len)?).into_owned())
            }
            TAG_CLASS => Constant::Class(r.u16()?),
            TAG_INTEGER | TAG_FLOAT => {
                r.take(4)?;
                Constant::Other
            }
            TAG_LONG | TAG_DOUBLE => {
                r.take(8)?;
                width = 2;
                Constant::Other
            }
            TAG_STRING | TAG_METHOD_TYPE | TAG_MODULE | TAG_PACKAGE => {
                r.take(2)?;
                Constant::Other
            }
            TAG_FIELDREF
            | TAG_METHODREF
            | TAG_INTERFACE_METHODREF
            | TAG_NAME_AND_TYPE
            | TAG_DYNAMIC
            | TAG_INVOKE_DYNAMIC => {
                r.take(4)?;
                Constant::Other
            }
            TAG_METHOD_HANDLE => {
                r.take(3)?;
                Constant::Other
            }
            tag => return Err(ClassFormatError::UnknownTag { tag, index }),
        };
        pool[index as usize] = constant;
        index = index.saturating_add(width);
    }
    Ok(pool)
}

fn skip_members(r: &mut Reader<'_>, count: u16) -> Result<(), ClassFormatError> {
    for _ in 0..count {
        // access_flags, name_index, descriptor_index
        r.take(6)?;
        let attribute_count = r.u16()?;
        for _ in 0..attribute_count {
            r.take(2)?;
            let len = r.u32()? as usize;
            r.take(len)?;
        }
    }
    Ok(())
}

fn utf8(pool: &[Constant], index: u16) -> Result<&str, ClassFormatError> {
    match pool.get(index as usize) {
        Some(Constant::Utf8(s)) => Ok(s),
        _ => Err(ClassFormatError::BadReference {
            index,
            expected: "Utf8",
        }),
    }
}

fn class_name(pool: &[Constant], index: u16) -> Result<&str, ClassFormatError> {
    match pool.get(index as usize) {
        Some(Constant::Class(name_index)) => utf8(pool, *name_index),
        _ => Err(ClassFormatError::BadReference {
            index,
            expected: "Class",
        }),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClassFormatError> {
        let range: Range<usize> = self.pos..self.pos.saturating_add(n);
        let slice = self
            .bytes
            .get(range)
            .ok_or(ClassFormatError::Truncated {
                offset: self.pos,
                needed: n,
            })?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ClassFormatError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ClassFormatError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ClassFormatError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_skeleton_header() {
        let bytes = skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC | access::SUPER);
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.this_class, "a/Foo");
        assert_eq!(class.qualified_name(), "a.Foo");
        assert_eq!(class.super_class.as_deref(), Some("java/lang/Object"));
        assert_eq!(class.major_version, 52);
        assert!(!class.is_interface());
        assert!(class.attributes.is_empty());
    }

    #[test]
    fn reports_interface_enum_and_annotation_flags() {
        let iface = skeleton("a/Bar", Some("java/lang/Object"), access::INTERFACE | access::ABSTRACT);
        assert!(ClassFile::parse(&iface).unwrap().is_interface());

        let e = skeleton("a/Color", Some("java/lang/Enum"), access::ENUM | access::FINAL);
        assert!(ClassFile::parse(&e).unwrap().is_enum());

        let ann = skeleton(
            "a/Tag",
            Some("java/lang/Object"),
            access::ANNOTATION | access::INTERFACE | access::ABSTRACT,
        );
        let ann = ClassFile::parse(&ann).unwrap();
        assert!(ann.is_annotation());
        assert!(ann.is_interface());
    }

    #[test]
    fn with_attribute_appends_and_keeps_header() {
        let bytes = skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC);
        let stamped = with_attribute(&bytes, "Custom", b"hello").unwrap();
        let class = ClassFile::parse(&stamped).unwrap();
        assert_eq!(class.this_class, "a/Foo");
        assert_eq!(class.super_class.as_deref(), Some("java/lang/Object"));
        assert_eq!(class.attribute("Custom").unwrap().data, b"hello");
        assert_eq!(stamped.len(), bytes.len() + 3 + "Custom".len() + 6 + 5);
    }

    #[test]
    fn with_attribute_reuses_existing_pool_entry() {
        let bytes = skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC);
        let once = with_attribute(&bytes, "Custom", b"1").unwrap();
        let twice = with_attribute(&once, "Custom", b"2").unwrap();
        // second stamp adds only the attribute record, not another pool entry
        assert_eq!(twice.len(), once.len() + 6 + 1);
        let class = ClassFile::parse(&twice).unwrap();
        assert_eq!(class.attributes.len(), 2);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let err = ClassFile::parse(b"\x00\x01\x02\x03\x00\x00\x00\x34").unwrap_err();
        assert!(matches!(err, ClassFormatError::BadMagic { .. }));

        let bytes = skeleton("a/Foo", None, access::PUBLIC);
        let err = ClassFile::parse(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ClassFormatError::Truncated { .. }));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = skeleton("a/Foo", None, access::PUBLIC);
        bytes.push(0);
        assert_eq!(
            ClassFile::parse(&bytes).unwrap_err(),
            ClassFormatError::TrailingBytes { count: 1 }
        );
    }

    #[test]
    fn name_conversions_round_trip_separators() {
        assert_eq!(internal_to_qualified("a/b/Foo$Inner"), "a.b.Foo$Inner");
        assert_eq!(qualified_to_internal("a.b.Foo"), "a/b/Foo");
    }
}
