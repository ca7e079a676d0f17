use crate::attribute::{read_checked, skip_attribute};
use crate::constant::ConstantPool;
use crate::cursor::Cursor;
use crate::flags::FieldFlags;
use crate::{ClassFileError, Result};

#[derive(Debug)]
pub struct FieldInfo {
    pub access_flags: FieldFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    /// `ConstantValue` attribute payload: a pool index of the initial value
    /// for a static field, when present.
    pub constant_value: Option<u16>,
}

impl FieldInfo {
    pub fn parse(cur: &mut Cursor<'_>, cp: &ConstantPool) -> Result<FieldInfo> {
        let access_flags = FieldFlags::from_bits_truncate(cur.read_u16()?);
        let name_index = cur.read_u16()?;
        cp.get_utf8(name_index)?;
        let descriptor_index = cur.read_u16()?;
        cp.get_utf8(descriptor_index)?;

        let mut constant_value = None;
        let attr_count = cur.read_u16()?;
        for _ in 0..attr_count {
            let attr_name_index = cur.read_u16()?;
            let attr_name = cp.get_utf8(attr_name_index)?;
            if attr_name == "ConstantValue" {
                if constant_value.is_some() {
                    return Err(ClassFileError::DuplicateAttribute("ConstantValue"));
                }
                let index = read_checked(cur, "ConstantValue", |c| c.read_u16())?;
                cp.get(index)?;
                constant_value = Some(index);
            } else {
                skip_attribute(cur, attr_name)?;
            }
        }

        Ok(FieldInfo {
            access_flags,
            name_index,
            descriptor_index,
            constant_value,
        })
    }
}
