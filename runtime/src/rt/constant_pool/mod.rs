use crate::error::VmError;
use crate::keys::{ClassId, FieldKey, MethodId, MethodKey, Symbol};
use crate::rt::constant_pool::entry::{
    ClassEntry, FieldEntry, FieldEntryView, MemberEntry, MemberEntryView, NameAndTypeEntry,
    StringEntry,
};
use crate::rt::field::{FieldOffset, StaticCell};
use crate::{build_exception, throw_exception};
use lasso::ThreadedRodeo;
use std::fmt::{self, Display};
use valka_classfile::constant::ConstantInfo;

pub mod entry;

/// Kinds a runtime pool entry can have, extended past the file format with
/// the resolved states the linker caches in place.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RuntimeConstantType {
    Unused,
    Utf8,
    Integer,
    Float,
    Long,
    Double,
    Class,
    String,
    Field,
    Method,
    InterfaceMethod,
    NameAndType,
}

impl Display for RuntimeConstantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub enum RuntimeConstant {
    Unused,
    Utf8(entry::Utf8Entry),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(ClassEntry),
    String(StringEntry),
    Field(FieldEntry),
    Method(MemberEntry),
    InterfaceMethod(MemberEntry),
    NameAndType(NameAndTypeEntry),
}

impl RuntimeConstant {
    pub fn get_type(&self) -> RuntimeConstantType {
        match self {
            RuntimeConstant::Unused => RuntimeConstantType::Unused,
            RuntimeConstant::Utf8(_) => RuntimeConstantType::Utf8,
            RuntimeConstant::Integer(_) => RuntimeConstantType::Integer,
            RuntimeConstant::Float(_) => RuntimeConstantType::Float,
            RuntimeConstant::Long(_) => RuntimeConstantType::Long,
            RuntimeConstant::Double(_) => RuntimeConstantType::Double,
            RuntimeConstant::Class(_) => RuntimeConstantType::Class,
            RuntimeConstant::String(_) => RuntimeConstantType::String,
            RuntimeConstant::Field(_) => RuntimeConstantType::Field,
            RuntimeConstant::Method(_) => RuntimeConstantType::Method,
            RuntimeConstant::InterfaceMethod(_) => RuntimeConstantType::InterfaceMethod,
            RuntimeConstant::NameAndType(_) => RuntimeConstantType::NameAndType,
        }
    }
}

/// A class's constant pool at runtime. Symbolic entries carry one-shot
/// resolution caches set under the VM lock, so re-resolving an already
/// resolved entry just reads the cache.
pub struct RuntimeConstantPool {
    entries: Vec<RuntimeConstant>,
}

impl RuntimeConstantPool {
    pub fn new(raw: Vec<ConstantInfo>, interner: &ThreadedRodeo) -> Self {
        let entries = raw
            .into_iter()
            .map(|info| match info {
                ConstantInfo::Unused => RuntimeConstant::Unused,
                ConstantInfo::Utf8(s) => {
                    RuntimeConstant::Utf8(entry::Utf8Entry::new(interner.get_or_intern(&s)))
                }
                ConstantInfo::Integer(v) => RuntimeConstant::Integer(v),
                ConstantInfo::Float(v) => RuntimeConstant::Float(v),
                ConstantInfo::Long(v) => RuntimeConstant::Long(v),
                ConstantInfo::Double(v) => RuntimeConstant::Double(v),
                ConstantInfo::Class { name_index } => {
                    RuntimeConstant::Class(ClassEntry::new(name_index))
                }
                ConstantInfo::String { string_index } => {
                    RuntimeConstant::String(StringEntry::new(string_index))
                }
                ConstantInfo::FieldRef { class_index, name_and_type_index } => {
                    RuntimeConstant::Field(FieldEntry::new(class_index, name_and_type_index))
                }
                ConstantInfo::MethodRef { class_index, name_and_type_index } => {
                    RuntimeConstant::Method(MemberEntry::new(class_index, name_and_type_index))
                }
                ConstantInfo::InterfaceMethodRef { class_index, name_and_type_index } => {
                    RuntimeConstant::InterfaceMethod(MemberEntry::new(
                        class_index,
                        name_and_type_index,
                    ))
                }
                ConstantInfo::NameAndType { name_index, descriptor_index } => {
                    RuntimeConstant::NameAndType(NameAndTypeEntry::new(
                        name_index,
                        descriptor_index,
                    ))
                }
            })
            .collect();
        Self { entries }
    }

    pub fn entry(&self, idx: u16) -> Result<&RuntimeConstant, VmError> {
        match self.entries.get(idx as usize) {
            None | Some(RuntimeConstant::Unused) => throw_exception!(
                ClassFormatError,
                "invalid constant pool index {}",
                idx
            ),
            Some(entry) => Ok(entry),
        }
    }

    fn mismatch(&self, idx: u16, expected: RuntimeConstantType) -> VmError {
        let actual = self
            .entry(idx)
            .map(|e| e.get_type())
            .unwrap_or(RuntimeConstantType::Unused);
        build_exception!(
            IncompatibleClassChangeError,
            "constant pool entry {} is a {}, expected a {}",
            idx,
            actual,
            expected
        )
    }

    pub fn get_utf8_sym(&self, idx: u16) -> Result<Symbol, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Utf8(e) => Ok(e.sym),
            _ => Err(self.mismatch(idx, RuntimeConstantType::Utf8)),
        }
    }

    pub fn get_class_sym(&self, idx: u16) -> Result<Symbol, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Class(e) => e
                .name_sym
                .get_or_try_init(|| self.get_utf8_sym(e.name_idx))
                .copied(),
            _ => Err(self.mismatch(idx, RuntimeConstantType::Class)),
        }
    }

    pub fn get_string_sym(&self, idx: u16) -> Result<Symbol, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::String(e) => e
                .string_sym
                .get_or_try_init(|| self.get_utf8_sym(e.string_idx))
                .copied(),
            _ => Err(self.mismatch(idx, RuntimeConstantType::String)),
        }
    }

    fn get_nat(&self, idx: u16) -> Result<(Symbol, Symbol), VmError> {
        match self.entry(idx)? {
            RuntimeConstant::NameAndType(e) => {
                let name = *e.name_sym.get_or_try_init(|| self.get_utf8_sym(e.name_idx))?;
                let desc = *e
                    .descriptor_sym
                    .get_or_try_init(|| self.get_utf8_sym(e.descriptor_idx))?;
                Ok((name, desc))
            }
            _ => Err(self.mismatch(idx, RuntimeConstantType::NameAndType)),
        }
    }

    pub fn get_field_view(&self, idx: u16) -> Result<FieldEntryView, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Field(e) => {
                let class_sym = *e
                    .member
                    .class_sym
                    .get_or_try_init(|| self.get_class_sym(e.member.class_idx))?;
                let (name, desc) = self.get_nat(e.member.nat_idx)?;
                Ok(FieldEntryView {
                    class_sym,
                    key: FieldKey { name, desc },
                })
            }
            _ => Err(self.mismatch(idx, RuntimeConstantType::Field)),
        }
    }

    pub fn get_method_view(&self, idx: u16) -> Result<MemberEntryView, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Method(e) => self.member_view(e),
            _ => Err(self.mismatch(idx, RuntimeConstantType::Method)),
        }
    }

    pub fn get_interface_method_view(&self, idx: u16) -> Result<MemberEntryView, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::InterfaceMethod(e) => self.member_view(e),
            _ => Err(self.mismatch(idx, RuntimeConstantType::InterfaceMethod)),
        }
    }

    fn member_view(&self, e: &MemberEntry) -> Result<MemberEntryView, VmError> {
        let class_sym = *e
            .class_sym
            .get_or_try_init(|| self.get_class_sym(e.class_idx))?;
        let (name, desc) = self.get_nat(e.nat_idx)?;
        Ok(MemberEntryView {
            class_sym,
            key: MethodKey { name, desc },
        })
    }

    // ------------------------------------------------------------------
    // Resolved-state caches. Setting an already-set cache is a no-op, which
    // makes resolution idempotent under the VM lock.
    // ------------------------------------------------------------------

    pub fn cache_resolved_class(&self, idx: u16, class_id: ClassId) -> Result<(), VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Class(e) => {
                let _ = e.resolved.set(class_id);
                Ok(())
            }
            _ => Err(self.mismatch(idx, RuntimeConstantType::Class)),
        }
    }

    pub fn resolved_class(&self, idx: u16) -> Result<Option<ClassId>, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Class(e) => Ok(e.resolved.get().copied()),
            _ => Err(self.mismatch(idx, RuntimeConstantType::Class)),
        }
    }

    pub fn cache_resolved_method(&self, idx: u16, method_id: MethodId) -> Result<(), VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Method(e) | RuntimeConstant::InterfaceMethod(e) => {
                let _ = e.resolved.set(method_id);
                Ok(())
            }
            _ => Err(self.mismatch(idx, RuntimeConstantType::Method)),
        }
    }

    pub fn resolved_method(&self, idx: u16) -> Result<Option<MethodId>, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Method(e) | RuntimeConstant::InterfaceMethod(e) => {
                Ok(e.resolved.get().copied())
            }
            _ => Err(self.mismatch(idx, RuntimeConstantType::Method)),
        }
    }

    pub fn cache_resolved_instance_field(
        &self,
        idx: u16,
        offset: FieldOffset,
    ) -> Result<(), VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Field(e) => {
                let _ = e.resolved_offset.set(offset);
                Ok(())
            }
            _ => Err(self.mismatch(idx, RuntimeConstantType::Field)),
        }
    }

    pub fn cache_resolved_static_field(&self, idx: u16, cell: StaticCell) -> Result<(), VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Field(e) => {
                let _ = e.resolved_cell.set(cell);
                Ok(())
            }
            _ => Err(self.mismatch(idx, RuntimeConstantType::Field)),
        }
    }

    pub fn resolved_static_field(&self, idx: u16) -> Result<Option<StaticCell>, VmError> {
        match self.entry(idx)? {
            RuntimeConstant::Field(e) => Ok(e.resolved_cell.get().copied()),
            _ => Err(self.mismatch(idx, RuntimeConstantType::Field)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: Vec<ConstantInfo>) -> (RuntimeConstantPool, ThreadedRodeo) {
        let interner = ThreadedRodeo::default();
        let pool = RuntimeConstantPool::new(entries, &interner);
        (pool, interner)
    }

    #[test]
    fn class_entry_resolves_to_its_name() {
        let (cp, interner) = pool(vec![
            ConstantInfo::Unused,
            ConstantInfo::Class { name_index: 2 },
            ConstantInfo::Utf8("java/lang/Object".to_string()),
        ]);
        let sym = cp.get_class_sym(1).unwrap();
        assert_eq!(interner.resolve(&sym), "java/lang/Object");
        // Idempotent second read through the cache.
        assert_eq!(cp.get_class_sym(1).unwrap(), sym);
    }

    #[test]
    fn type_mismatch_is_an_incompatible_class_change() {
        let (cp, _) = pool(vec![ConstantInfo::Unused, ConstantInfo::Integer(3)]);
        assert!(cp.get_class_sym(1).is_err());
    }

    #[test]
    fn resolved_class_cache_is_idempotent() {
        let (cp, _) = pool(vec![
            ConstantInfo::Unused,
            ConstantInfo::Class { name_index: 2 },
            ConstantInfo::Utf8("A".to_string()),
        ]);
        assert_eq!(cp.resolved_class(1).unwrap(), None);
        cp.cache_resolved_class(1, ClassId::from_usize(5)).unwrap();
        cp.cache_resolved_class(1, ClassId::from_usize(9)).unwrap(); // no-op replay
        assert_eq!(cp.resolved_class(1).unwrap(), Some(ClassId::from_usize(5)));
    }

    #[test]
    fn out_of_range_index_is_a_format_error() {
        let (cp, _) = pool(vec![ConstantInfo::Unused]);
        assert!(cp.entry(0).is_err());
        assert!(cp.entry(7).is_err());
    }
}
