//! Parser for the `.class` binary format as consumed by the CLDC runtime.
//!
//! The parser produces a raw [`ClassFile`]: constant pool entries, field and
//! method tables and the handful of attributes the runtime cares about. All
//! semantic checks that need linked classes (parent discipline, overrides,
//! access control) belong to the runtime crate, not here.

use crate::attribute::skip_attribute;
use crate::constant::ConstantPool;
use crate::cursor::Cursor;
use crate::field::FieldInfo;
use crate::flags::ClassFlags;
use crate::method::MethodInfo;
use std::fmt::{self, Display};

pub mod attribute;
pub mod constant;
pub mod cursor;
pub mod field;
pub mod flags;
pub mod method;
pub mod mutf8;

/// Magic number at the start of every class file.
pub const CLASS_MAGIC: u32 = 0xCAFE_BABE;

/// Supported major version range (JDK 1.1 through 1.6 era formats).
pub const MIN_MAJOR_VERSION: u16 = 45;
pub const MAX_MAJOR_VERSION: u16 = 50;

#[derive(Debug, PartialEq)]
pub enum ClassFileError {
    UnexpectedEof,
    TrailingBytes(usize),
    BadMagic(u32),
    UnsupportedVersion(u16, u16),
    UnsupportedConstantTag(u8),
    BadConstantIndex(u16),
    ConstantTypeMismatch { index: u16, expected: &'static str },
    MalformedUtf8,
    AttributeLengthMismatch(String),
    DuplicateAttribute(&'static str),
    MalformedAttribute(&'static str),
}

impl Display for ClassFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassFileError::UnexpectedEof => write!(f, "unexpected end of class file"),
            ClassFileError::TrailingBytes(n) => {
                write!(f, "{} trailing bytes after class file structure", n)
            }
            ClassFileError::BadMagic(m) => write!(f, "bad magic number {:#010x}", m),
            ClassFileError::UnsupportedVersion(major, minor) => {
                write!(f, "unsupported class file version {}.{}", major, minor)
            }
            ClassFileError::UnsupportedConstantTag(tag) => {
                write!(f, "unsupported constant pool tag {}", tag)
            }
            ClassFileError::BadConstantIndex(idx) => {
                write!(f, "constant pool index {} out of range", idx)
            }
            ClassFileError::ConstantTypeMismatch { index, expected } => {
                write!(f, "constant pool entry {} is not a {}", index, expected)
            }
            ClassFileError::MalformedUtf8 => write!(f, "malformed modified UTF-8 string"),
            ClassFileError::AttributeLengthMismatch(name) => {
                write!(f, "attribute {} length does not match its contents", name)
            }
            ClassFileError::DuplicateAttribute(name) => {
                write!(f, "duplicated {} attribute", name)
            }
            ClassFileError::MalformedAttribute(name) => {
                write!(f, "malformed {} attribute", name)
            }
        }
    }
}

impl std::error::Error for ClassFileError {}

pub type Result<T> = std::result::Result<T, ClassFileError>;

/// A parsed class file, still in symbolic (constant pool index) form.
#[derive(Debug)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub cp: ConstantPool,
    pub access_flags: ClassFlags,
    pub this_class: u16,
    /// Zero for `java/lang/Object`, otherwise a `Class` pool index.
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    /// `SourceFile` attribute, when present (a `Utf8` pool index).
    pub source_file: Option<u16>,
}

impl ClassFile {
    pub fn parse(data: &[u8]) -> Result<ClassFile> {
        let mut cur = Cursor::new(data);

        let magic = cur.read_u32()?;
        if magic != CLASS_MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }

        let minor_version = cur.read_u16()?;
        let major_version = cur.read_u16()?;
        if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major_version) {
            return Err(ClassFileError::UnsupportedVersion(
                major_version,
                minor_version,
            ));
        }

        let cp = ConstantPool::parse(&mut cur)?;

        let access_flags = ClassFlags::from_bits_truncate(cur.read_u16()?);
        let this_class = cur.read_u16()?;
        cp.get_class_name(this_class)?;
        let super_class = cur.read_u16()?;
        if super_class != 0 {
            cp.get_class_name(super_class)?;
        }

        let interface_count = cur.read_u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            let index = cur.read_u16()?;
            cp.get_class_name(index)?;
            interfaces.push(index);
        }

        let field_count = cur.read_u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(FieldInfo::parse(&mut cur, &cp)?);
        }

        let method_count = cur.read_u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(MethodInfo::parse(&mut cur, &cp)?);
        }

        let mut source_file = None;
        let attr_count = cur.read_u16()?;
        for _ in 0..attr_count {
            let name_index = cur.read_u16()?;
            let name = cp.get_utf8(name_index)?;
            if name == "SourceFile" {
                if source_file.is_some() {
                    return Err(ClassFileError::DuplicateAttribute("SourceFile"));
                }
                let length = cur.read_u32()?;
                if length != 2 {
                    return Err(ClassFileError::MalformedAttribute("SourceFile"));
                }
                let index = cur.read_u16()?;
                cp.get_utf8(index)?;
                source_file = Some(index);
            } else {
                skip_attribute(&mut cur, name)?;
            }
        }

        if cur.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(cur.remaining()));
        }

        Ok(ClassFile {
            minor_version,
            major_version,
            cp,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            source_file,
        })
    }

    pub fn this_class_name(&self) -> Result<&str> {
        self.cp.get_class_name(self.this_class)
    }

    pub fn super_class_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            Ok(None)
        } else {
            self.cp.get_class_name(self.super_class).map(Some)
        }
    }
}

impl TryFrom<&[u8]> for ClassFile {
    type Error = ClassFileError;

    fn try_from(data: &[u8]) -> Result<ClassFile> {
        ClassFile::parse(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let data = [0u8, 0, 0, 0, 0, 0, 0, 49];
        assert!(matches!(
            ClassFile::parse(&data),
            Err(ClassFileError::BadMagic(0))
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut data = Vec::new();
        data.extend_from_slice(&CLASS_MAGIC.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&52u16.to_be_bytes()); // Java 8
        assert!(matches!(
            ClassFile::parse(&data),
            Err(ClassFileError::UnsupportedVersion(52, 0))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let data = CLASS_MAGIC.to_be_bytes();
        assert_eq!(
            ClassFile::parse(&data).unwrap_err(),
            ClassFileError::UnexpectedEof
        );
    }
}
