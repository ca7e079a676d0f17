use crate::keys::{ClassId, FieldKey, MethodId, MethodKey, Symbol};
use crate::rt::field::{FieldOffset, StaticCell};
use once_cell::sync::OnceCell;

pub struct Utf8Entry {
    pub sym: Symbol,
}

impl Utf8Entry {
    pub fn new(sym: Symbol) -> Self {
        Utf8Entry { sym }
    }
}

pub struct ClassEntry {
    pub name_idx: u16,
    pub name_sym: OnceCell<Symbol>,
    pub resolved: OnceCell<ClassId>,
}

impl ClassEntry {
    pub fn new(name_idx: u16) -> Self {
        ClassEntry {
            name_idx,
            name_sym: OnceCell::new(),
            resolved: OnceCell::new(),
        }
    }
}

pub struct StringEntry {
    pub string_idx: u16,
    pub string_sym: OnceCell<Symbol>,
    /// Interned instance, cached when an ldc of this entry prelinks.
    pub resolved_ref: OnceCell<crate::heap::HeapRef>,
}

impl StringEntry {
    pub fn new(string_idx: u16) -> Self {
        StringEntry {
            string_idx,
            string_sym: OnceCell::new(),
            resolved_ref: OnceCell::new(),
        }
    }
}

pub struct NameAndTypeEntry {
    pub name_idx: u16,
    pub descriptor_idx: u16,
    pub name_sym: OnceCell<Symbol>,
    pub descriptor_sym: OnceCell<Symbol>,
}

impl NameAndTypeEntry {
    pub fn new(name_idx: u16, descriptor_idx: u16) -> Self {
        NameAndTypeEntry {
            name_idx,
            descriptor_idx,
            name_sym: OnceCell::new(),
            descriptor_sym: OnceCell::new(),
        }
    }
}

/// Method or interface-method reference.
pub struct MemberEntry {
    pub class_idx: u16,
    pub nat_idx: u16,
    pub class_sym: OnceCell<Symbol>,
    pub resolved: OnceCell<MethodId>,
}

impl MemberEntry {
    pub fn new(class_idx: u16, nat_idx: u16) -> Self {
        MemberEntry {
            class_idx,
            nat_idx,
            class_sym: OnceCell::new(),
            resolved: OnceCell::new(),
        }
    }
}

/// Field reference; resolution caches either an instance offset or a static
/// cell, depending on which accessor linked it.
pub struct FieldEntry {
    pub member: MemberEntry,
    pub resolved_offset: OnceCell<FieldOffset>,
    pub resolved_cell: OnceCell<StaticCell>,
}

impl FieldEntry {
    pub fn new(class_idx: u16, nat_idx: u16) -> Self {
        FieldEntry {
            member: MemberEntry::new(class_idx, nat_idx),
            resolved_offset: OnceCell::new(),
            resolved_cell: OnceCell::new(),
        }
    }
}

pub struct FieldEntryView {
    pub class_sym: Symbol,
    pub key: FieldKey,
}

pub struct MemberEntryView {
    pub class_sym: Symbol,
    pub key: MethodKey,
}
