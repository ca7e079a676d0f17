use crate::cursor::Cursor;
use crate::{ClassFileError, Result, mutf8};

pub const CONSTANT_UTF8: u8 = 1;
pub const CONSTANT_INTEGER: u8 = 3;
pub const CONSTANT_FLOAT: u8 = 4;
pub const CONSTANT_LONG: u8 = 5;
pub const CONSTANT_DOUBLE: u8 = 6;
pub const CONSTANT_CLASS: u8 = 7;
pub const CONSTANT_STRING: u8 = 8;
pub const CONSTANT_FIELDREF: u8 = 9;
pub const CONSTANT_METHODREF: u8 = 10;
pub const CONSTANT_INTERFACE_METHODREF: u8 = 11;
pub const CONSTANT_NAME_AND_TYPE: u8 = 12;

/// One raw constant pool entry. `Unused` fills index 0 and the phantom slot
/// following every `Long`/`Double` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantInfo {
    Unused,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
}

#[derive(Debug)]
pub struct ConstantPool {
    entries: Vec<ConstantInfo>,
}

impl ConstantPool {
    pub fn parse(cur: &mut Cursor<'_>) -> Result<ConstantPool> {
        let count = cur.read_u16()? as usize;
        let mut entries = Vec::with_capacity(count.max(1));
        entries.push(ConstantInfo::Unused); // index 0 is never addressable

        while entries.len() < count {
            let tag = cur.read_u8()?;
            let entry = match tag {
                CONSTANT_UTF8 => {
                    let length = cur.read_u16()? as usize;
                    let bytes = cur.read_bytes(length)?;
                    let decoded =
                        mutf8::decode(bytes).map_err(|_| ClassFileError::MalformedUtf8)?;
                    ConstantInfo::Utf8(decoded)
                }
                CONSTANT_INTEGER => ConstantInfo::Integer(cur.read_i32()?),
                CONSTANT_FLOAT => ConstantInfo::Float(cur.read_f32()?),
                CONSTANT_LONG => ConstantInfo::Long(cur.read_i64()?),
                CONSTANT_DOUBLE => ConstantInfo::Double(cur.read_f64()?),
                CONSTANT_CLASS => ConstantInfo::Class {
                    name_index: cur.read_u16()?,
                },
                CONSTANT_STRING => ConstantInfo::String {
                    string_index: cur.read_u16()?,
                },
                CONSTANT_FIELDREF => ConstantInfo::FieldRef {
                    class_index: cur.read_u16()?,
                    name_and_type_index: cur.read_u16()?,
                },
                CONSTANT_METHODREF => ConstantInfo::MethodRef {
                    class_index: cur.read_u16()?,
                    name_and_type_index: cur.read_u16()?,
                },
                CONSTANT_INTERFACE_METHODREF => ConstantInfo::InterfaceMethodRef {
                    class_index: cur.read_u16()?,
                    name_and_type_index: cur.read_u16()?,
                },
                CONSTANT_NAME_AND_TYPE => ConstantInfo::NameAndType {
                    name_index: cur.read_u16()?,
                    descriptor_index: cur.read_u16()?,
                },
                other => return Err(ClassFileError::UnsupportedConstantTag(other)),
            };

            let two_slots = matches!(entry, ConstantInfo::Long(_) | ConstantInfo::Double(_));
            entries.push(entry);
            if two_slots {
                entries.push(ConstantInfo::Unused);
            }
        }

        let pool = ConstantPool { entries };
        pool.check_cross_references()?;
        Ok(pool)
    }

    /// Validates that every index-carrying entry points at an entry of the
    /// right kind. Done once after parsing so the runtime can index freely.
    fn check_cross_references(&self) -> Result<()> {
        for entry in &self.entries {
            match entry {
                ConstantInfo::Class { name_index } => {
                    self.get_utf8(*name_index)?;
                }
                ConstantInfo::String { string_index } => {
                    self.get_utf8(*string_index)?;
                }
                ConstantInfo::FieldRef { class_index, name_and_type_index }
                | ConstantInfo::MethodRef { class_index, name_and_type_index }
                | ConstantInfo::InterfaceMethodRef { class_index, name_and_type_index } => {
                    self.get_class_name(*class_index)?;
                    self.get_name_and_type(*name_and_type_index)?;
                }
                ConstantInfo::NameAndType { name_index, descriptor_index } => {
                    self.get_utf8(*name_index)?;
                    self.get_utf8(*descriptor_index)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn entries(&self) -> &[ConstantInfo] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ConstantInfo> {
        self.entries
    }

    pub fn get(&self, index: u16) -> Result<&ConstantInfo> {
        match self.entries.get(index as usize) {
            None | Some(ConstantInfo::Unused) => Err(ClassFileError::BadConstantIndex(index)),
            Some(entry) => Ok(entry),
        }
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            ConstantInfo::Utf8(s) => Ok(s),
            _ => Err(ClassFileError::ConstantTypeMismatch {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub fn get_class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            ConstantInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::ConstantTypeMismatch {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn get_name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            ConstantInfo::NameAndType { name_index, descriptor_index } => {
                Ok((self.get_utf8(*name_index)?, self.get_utf8(*descriptor_index)?))
            }
            _ => Err(ClassFileError::ConstantTypeMismatch {
                index,
                expected: "NameAndType",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_from(bytes: &[u8]) -> Result<ConstantPool> {
        let mut cur = Cursor::new(bytes);
        ConstantPool::parse(&mut cur)
    }

    #[test]
    fn long_occupies_two_slots() {
        // count = 4: one Long (2 slots) + one Integer
        let mut data = vec![0, 4];
        data.push(CONSTANT_LONG);
        data.extend_from_slice(&0x0102030405060708i64.to_be_bytes());
        data.push(CONSTANT_INTEGER);
        data.extend_from_slice(&42i32.to_be_bytes());
        let pool = pool_from(&data).unwrap();
        assert_eq!(pool.get(1).unwrap(), &ConstantInfo::Long(0x0102030405060708));
        assert!(pool.get(2).is_err()); // phantom slot
        assert_eq!(pool.get(3).unwrap(), &ConstantInfo::Integer(42));
    }

    #[test]
    fn rejects_modern_tags() {
        // InvokeDynamic (18) is not part of the supported format
        let data = [0, 2, 18, 0, 0, 0, 0];
        assert!(matches!(
            pool_from(&data),
            Err(ClassFileError::UnsupportedConstantTag(18))
        ));
    }

    #[test]
    fn rejects_dangling_class_reference() {
        let mut data = vec![0, 2];
        data.push(CONSTANT_CLASS);
        data.extend_from_slice(&9u16.to_be_bytes());
        assert!(pool_from(&data).is_err());
    }

    #[test]
    fn index_zero_is_unusable() {
        let mut data = vec![0, 2];
        data.push(CONSTANT_INTEGER);
        data.extend_from_slice(&1i32.to_be_bytes());
        let pool = pool_from(&data).unwrap();
        assert!(pool.get(0).is_err());
    }
}
