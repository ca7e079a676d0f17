use crate::attribute::skip_attribute;
use crate::constant::ConstantPool;
use crate::cursor::Cursor;
use crate::flags::MethodFlags;
use crate::{ClassFileError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Zero for a catch-all handler, otherwise a `Class` pool index.
    pub catch_type: u16,
}

#[derive(Debug)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
}

#[derive(Debug)]
pub struct MethodInfo {
    pub access_flags: MethodFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub code: Option<CodeAttribute>,
}

impl MethodInfo {
    pub fn parse(cur: &mut Cursor<'_>, cp: &ConstantPool) -> Result<MethodInfo> {
        let access_flags = MethodFlags::from_bits_truncate(cur.read_u16()?);
        let name_index = cur.read_u16()?;
        cp.get_utf8(name_index)?;
        let descriptor_index = cur.read_u16()?;
        cp.get_utf8(descriptor_index)?;

        let mut code = None;
        let attr_count = cur.read_u16()?;
        for _ in 0..attr_count {
            let attr_name_index = cur.read_u16()?;
            let attr_name = cp.get_utf8(attr_name_index)?;
            if attr_name == "Code" {
                if code.is_some() {
                    return Err(ClassFileError::DuplicateAttribute("Code"));
                }
                code = Some(parse_code(cur, cp)?);
            } else {
                // Exceptions, Synthetic, Deprecated and friends carry nothing
                // the runtime needs.
                skip_attribute(cur, attr_name)?;
            }
        }

        Ok(MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            code,
        })
    }
}

fn parse_code(cur: &mut Cursor<'_>, cp: &ConstantPool) -> Result<CodeAttribute> {
    let length = cur.read_u32()? as usize;
    let start = cur.position();

    let max_stack = cur.read_u16()?;
    let max_locals = cur.read_u16()?;

    let code_length = cur.read_u32()? as usize;
    if code_length == 0 || code_length >= 65536 {
        return Err(ClassFileError::MalformedAttribute("Code"));
    }
    let code = cur.read_bytes(code_length)?.to_vec();

    let handler_count = cur.read_u16()?;
    let mut exception_table = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        let entry = ExceptionTableEntry {
            start_pc: cur.read_u16()?,
            end_pc: cur.read_u16()?,
            handler_pc: cur.read_u16()?,
            catch_type: cur.read_u16()?,
        };
        if entry.catch_type != 0 {
            cp.get_class_name(entry.catch_type)?;
        }
        exception_table.push(entry);
    }

    // LineNumberTable, LocalVariableTable, StackMapTable...
    let attr_count = cur.read_u16()?;
    for _ in 0..attr_count {
        let attr_name_index = cur.read_u16()?;
        let attr_name = cp.get_utf8(attr_name_index)?;
        skip_attribute(cur, attr_name)?;
    }

    if cur.position() - start != length {
        return Err(ClassFileError::AttributeLengthMismatch("Code".to_string()));
    }

    Ok(CodeAttribute {
        max_stack,
        max_locals,
        code,
        exception_table,
    })
}
