use crate::error::VmError;
use crate::heap::HeapRef;
use crate::jtype::AllocationType;
use crate::keys::{ClassId, MethodId, MethodKey, Symbol};
use once_cell::sync::OnceCell;
use std::collections::HashMap;

/// Array classes share java/lang/Object's dispatch table; invoking through
/// them reaches Object's methods.
pub struct PrimitiveArrayClass {
    pub name: Symbol,
    pub super_id: ClassId,
    pub element_type: AllocationType,
    pub vtable: Vec<MethodId>,
    pub vtable_index: HashMap<MethodKey, u16>,
    pub(crate) mirror_ref: OnceCell<HeapRef>,
}

impl PrimitiveArrayClass {
    pub fn get_mirror_ref(&self) -> Option<HeapRef> {
        self.mirror_ref.get().copied()
    }

    pub fn set_mirror_ref(&self, mirror: HeapRef) -> Result<(), VmError> {
        self.mirror_ref
            .set(mirror)
            .map_err(|_| VmError::Internal("array mirror already set".to_string()))
    }

    pub fn dispatch(&self, index: usize) -> Result<MethodId, VmError> {
        self.vtable
            .get(index)
            .copied()
            .ok_or_else(|| VmError::Internal(format!("dispatch slot {} out of range", index)))
    }

    pub fn get_vtable_method_id(&self, key: &MethodKey) -> Option<MethodId> {
        self.vtable_index
            .get(key)
            .map(|&pos| self.vtable[pos as usize])
    }
}

pub struct ObjectArrayClass {
    pub name: Symbol,
    pub super_id: ClassId,
    pub element_class_id: ClassId,
    pub vtable: Vec<MethodId>,
    pub vtable_index: HashMap<MethodKey, u16>,
    pub(crate) mirror_ref: OnceCell<HeapRef>,
}

impl ObjectArrayClass {
    pub fn get_mirror_ref(&self) -> Option<HeapRef> {
        self.mirror_ref.get().copied()
    }

    pub fn set_mirror_ref(&self, mirror: HeapRef) -> Result<(), VmError> {
        self.mirror_ref
            .set(mirror)
            .map_err(|_| VmError::Internal("array mirror already set".to_string()))
    }

    pub fn dispatch(&self, index: usize) -> Result<MethodId, VmError> {
        self.vtable
            .get(index)
            .copied()
            .ok_or_else(|| VmError::Internal(format!("dispatch slot {} out of range", index)))
    }

    pub fn get_vtable_method_id(&self, key: &MethodKey) -> Option<MethodId> {
        self.vtable_index
            .get(key)
            .map(|&pos| self.vtable[pos as usize])
    }
}
