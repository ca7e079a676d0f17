use crate::jtype::AllocationType;
use crate::keys::{ClassId, FieldDescriptorId};
use valka_classfile::flags::FieldFlags;

/// Where a field lives relative to the object header. Reference slots grow
/// backwards from the header in word strides; non-reference data follows
/// the header at byte granularity; booleans pack eight per byte and are
/// addressed by absolute bit offset within the non-reference area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOffset {
    Ref(u16),
    NonRef(u16),
    Bit(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct InstanceField {
    pub flags: FieldFlags,
    pub descriptor_id: FieldDescriptorId,
    pub offset: FieldOffset,
    pub declaring_class: ClassId,
}

/// A static field's typed storage cell, carved from the permanent arena at
/// link time. Reference-typed cells are registered with the collector.
#[derive(Debug, Clone, Copy)]
pub struct StaticCell {
    pub offset: usize,
    pub ty: AllocationType,
}

#[derive(Debug, Clone, Copy)]
pub struct StaticField {
    pub flags: FieldFlags,
    pub descriptor_id: FieldDescriptorId,
    pub declaring_class: ClassId,
    pub cell: StaticCell,
}
