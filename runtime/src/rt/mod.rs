use crate::error::VmError;
use crate::heap::HeapRef;
use crate::jtype::AllocationType;
use crate::keys::{ClassId, FieldKey, MethodId, MethodKey, Symbol, ThreadId};
use crate::rt::array::{ObjectArrayClass, PrimitiveArrayClass};
use crate::rt::class::InstanceClass;
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::field::StaticField;
use crate::rt::interface::InterfaceClass;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use valka_classfile::flags::ClassFlags;

pub mod array;
pub mod class;
pub mod constant_pool;
pub mod field;
pub mod interface;
pub mod method;

/// Class lifecycle. Transitions are monotone for the thread driving them;
/// ERRONEOUS is a sink entered when initialization throws.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    /// Descriptor allocated, id assigned, nothing derived yet.
    Preloaded = 0,
    /// Class file being derived; meeting this state again is a cycle.
    Linking = 1,
    /// Layout and dispatch tables are immutable from here on.
    Linked = 2,
    /// `<clinit>` running in the recorded initializer thread.
    Initializing = 3,
    Initialized = 4,
    Erroneous = 5,
}

impl From<u8> for ClassState {
    fn from(v: u8) -> Self {
        match v {
            0 => ClassState::Preloaded,
            1 => ClassState::Linking,
            2 => ClassState::Linked,
            3 => ClassState::Initializing,
            4 => ClassState::Initialized,
            5 => ClassState::Erroneous,
            _ => unreachable!(),
        }
    }
}

pub struct BaseClass {
    name: Symbol,
    pub flags: ClassFlags,
    super_id: Option<ClassId>,
    state: AtomicU8,
    /// Thread currently running `<clinit>`, for re-entry detection.
    init_thread: Mutex<Option<ThreadId>>,
    mirror_ref: OnceCell<HeapRef>,
    /// Transitively implemented interfaces (the flattened closure).
    interfaces: OnceCell<HashSet<ClassId>>,
    static_fields: OnceCell<HashMap<FieldKey, StaticField>>,
    clinit: OnceCell<MethodId>,
    source_file: Option<Symbol>,
}

impl BaseClass {
    pub fn new(
        name: Symbol,
        flags: ClassFlags,
        super_id: Option<ClassId>,
        source_file: Option<Symbol>,
    ) -> Self {
        Self {
            name,
            flags,
            super_id,
            source_file,
            state: AtomicU8::new(ClassState::Preloaded as u8),
            init_thread: Mutex::new(None),
            mirror_ref: OnceCell::new(),
            interfaces: OnceCell::new(),
            static_fields: OnceCell::new(),
            clinit: OnceCell::new(),
        }
    }

    pub(crate) fn set_clinit(&self, method_id: MethodId) -> Result<(), VmError> {
        self.clinit
            .set(method_id)
            .map_err(|_| VmError::Internal("clinit already set".to_string()))
    }

    fn get_interfaces(&self) -> Result<&HashSet<ClassId>, VmError> {
        self.interfaces
            .get()
            .ok_or(VmError::Unlinked("interfaces"))
    }

    pub(crate) fn set_interfaces(&self, interfaces: HashSet<ClassId>) -> Result<(), VmError> {
        self.interfaces
            .set(interfaces)
            .map_err(|_| VmError::Internal("interfaces already set".to_string()))
    }

    pub(crate) fn set_static_fields(
        &self,
        static_fields: HashMap<FieldKey, StaticField>,
    ) -> Result<(), VmError> {
        self.static_fields
            .set(static_fields)
            .map_err(|_| VmError::Internal("static fields already set".to_string()))
    }

    fn get_static_fields(&self) -> Result<&HashMap<FieldKey, StaticField>, VmError> {
        self.static_fields
            .get()
            .ok_or(VmError::Unlinked("static fields"))
    }
}

/// Behavior shared by every class-like entry in the class table.
pub trait ClassLike {
    fn base(&self) -> &BaseClass;

    fn name(&self) -> Symbol {
        self.base().name
    }

    fn flags(&self) -> ClassFlags {
        self.base().flags
    }

    fn get_super(&self) -> Option<ClassId> {
        self.base().super_id
    }

    fn get_source_file(&self) -> Option<Symbol> {
        self.base().source_file
    }

    fn get_clinit_method_id(&self) -> Option<MethodId> {
        self.base().clinit.get().copied()
    }

    fn state(&self) -> ClassState {
        self.base().state.load(Ordering::Acquire).into()
    }

    fn set_state(&self, state: ClassState) {
        self.base().state.store(state as u8, Ordering::Release);
    }

    fn init_thread(&self) -> Option<ThreadId> {
        *self.base().init_thread.lock().unwrap()
    }

    fn set_init_thread(&self, thread: Option<ThreadId>) {
        *self.base().init_thread.lock().unwrap() = thread;
    }

    fn set_mirror_ref(&self, mirror: HeapRef) -> Result<(), VmError> {
        self.base()
            .mirror_ref
            .set(mirror)
            .map_err(|_| VmError::Internal("mirror already set".to_string()))
    }

    fn get_mirror_ref(&self) -> Option<HeapRef> {
        self.base().mirror_ref.get().copied()
    }

    fn get_interfaces(&self) -> Result<&HashSet<ClassId>, VmError> {
        self.base().get_interfaces()
    }

    fn get_static_field(&self, key: &FieldKey) -> Option<&StaticField> {
        self.base()
            .get_static_fields()
            .ok()
            .and_then(|fields| fields.get(key))
    }

    fn has_static_field(&self, key: &FieldKey) -> bool {
        self.get_static_field(key).is_some()
    }

    fn static_fields(&self) -> Result<&HashMap<FieldKey, StaticField>, VmError> {
        self.base().get_static_fields()
    }
}

/// Table slot reserved for a class that has an id and a name but whose
/// class file has not been derived yet. The slot is replaced in place once
/// linking finishes; meeting it in LINKING during resolution is a cycle.
pub struct PreloadedClass {
    pub name: Symbol,
    state: AtomicU8,
}

impl PreloadedClass {
    pub fn new(name: Symbol) -> Self {
        PreloadedClass {
            name,
            state: AtomicU8::new(ClassState::Preloaded as u8),
        }
    }

    pub fn state(&self) -> ClassState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn set_state(&self, state: ClassState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

pub enum RuntimeClass {
    Preloaded(PreloadedClass),
    Instance(Box<InstanceClass>),
    Interface(Box<InterfaceClass>),
    PrimitiveArray(PrimitiveArrayClass),
    InstanceArray(ObjectArrayClass),
}

impl Display for RuntimeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeClass::Preloaded(_) => write!(f, "PreloadedClass"),
            RuntimeClass::Instance(_) => write!(f, "InstanceClass"),
            RuntimeClass::Interface(_) => write!(f, "InterfaceClass"),
            RuntimeClass::PrimitiveArray(_) => write!(f, "PrimitiveArrayClass"),
            RuntimeClass::InstanceArray(_) => write!(f, "ObjectArrayClass"),
        }
    }
}

impl RuntimeClass {
    pub fn as_class_like(&self) -> Result<&dyn ClassLike, VmError> {
        match self {
            RuntimeClass::Instance(c) => Ok(c.as_ref()),
            RuntimeClass::Interface(c) => Ok(c.as_ref()),
            _ => Err(VmError::Internal(format!("{} has no class body", self))),
        }
    }

    pub fn get_name(&self) -> Symbol {
        match self {
            RuntimeClass::Preloaded(c) => c.name,
            RuntimeClass::Instance(c) => c.name(),
            RuntimeClass::Interface(c) => c.name(),
            RuntimeClass::PrimitiveArray(c) => c.name,
            RuntimeClass::InstanceArray(c) => c.name,
        }
    }

    pub fn get_cp(&self) -> Result<&Arc<RuntimeConstantPool>, VmError> {
        match self {
            RuntimeClass::Instance(c) => Ok(&c.cp),
            RuntimeClass::Interface(c) => Ok(&c.cp),
            _ => Err(VmError::Internal(format!("{} has no constant pool", self))),
        }
    }

    pub fn get_super_id(&self) -> Option<ClassId> {
        match self {
            RuntimeClass::Preloaded(_) => None,
            RuntimeClass::Instance(c) => c.get_super(),
            RuntimeClass::Interface(c) => c.get_super(),
            RuntimeClass::PrimitiveArray(c) => Some(c.super_id),
            RuntimeClass::InstanceArray(c) => Some(c.super_id),
        }
    }

    pub fn get_mirror_ref(&self) -> Option<HeapRef> {
        match self {
            RuntimeClass::Preloaded(_) => None,
            RuntimeClass::Instance(c) => c.get_mirror_ref(),
            RuntimeClass::Interface(c) => c.get_mirror_ref(),
            RuntimeClass::PrimitiveArray(c) => c.get_mirror_ref(),
            RuntimeClass::InstanceArray(c) => c.get_mirror_ref(),
        }
    }

    pub fn set_mirror_ref(&self, mirror: HeapRef) -> Result<(), VmError> {
        match self {
            RuntimeClass::Preloaded(_) => {
                Err(VmError::Internal("mirror for a preloaded class".to_string()))
            }
            RuntimeClass::Instance(c) => ClassLike::set_mirror_ref(c.as_ref(), mirror),
            RuntimeClass::Interface(c) => ClassLike::set_mirror_ref(c.as_ref(), mirror),
            RuntimeClass::PrimitiveArray(c) => c.set_mirror_ref(mirror),
            RuntimeClass::InstanceArray(c) => c.set_mirror_ref(mirror),
        }
    }

    pub fn get_interfaces(&self) -> Result<&HashSet<ClassId>, VmError> {
        match self {
            RuntimeClass::Instance(c) => ClassLike::get_interfaces(c.as_ref()),
            RuntimeClass::Interface(c) => ClassLike::get_interfaces(c.as_ref()),
            _ => Err(VmError::Internal(format!("{} has no interface set", self))),
        }
    }

    /// Virtual dispatch: table lookup by stable slot.
    pub fn dispatch(&self, index: usize) -> Result<MethodId, VmError> {
        match self {
            RuntimeClass::Instance(c) => c.dispatch(index),
            RuntimeClass::PrimitiveArray(c) => c.dispatch(index),
            RuntimeClass::InstanceArray(c) => c.dispatch(index),
            other => Err(VmError::Internal(format!("virtual dispatch on {}", other))),
        }
    }

    /// Interface dispatch: binary search over the sorted interface-method
    /// id table.
    pub fn interface_dispatch(&self, interface_method_id: u16) -> Result<MethodId, VmError> {
        match self {
            RuntimeClass::Instance(c) => c.interface_dispatch(interface_method_id),
            _ => Err(VmError::Internal(format!("interface dispatch on {}", self))),
        }
    }

    pub fn get_vtable_method_id(&self, key: &MethodKey) -> Option<MethodId> {
        match self {
            RuntimeClass::Instance(c) => c.get_vtable_method_id_opt(key),
            RuntimeClass::PrimitiveArray(c) => c.get_vtable_method_id(key),
            RuntimeClass::InstanceArray(c) => c.get_vtable_method_id(key),
            RuntimeClass::Interface(_) | RuntimeClass::Preloaded(_) => None,
        }
    }

    /// Direct (non-virtual) lookup: declared statics/privates/initializers
    /// first, then the vtable.
    pub fn get_direct_method_id(&self, key: &MethodKey) -> Option<MethodId> {
        match self {
            RuntimeClass::Instance(c) => c.get_direct_method_id_opt(key),
            RuntimeClass::Interface(c) => c.get_method_id(key),
            RuntimeClass::PrimitiveArray(c) => c.get_vtable_method_id(key),
            RuntimeClass::InstanceArray(c) => c.get_vtable_method_id(key),
            RuntimeClass::Preloaded(_) => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            RuntimeClass::PrimitiveArray(_) | RuntimeClass::InstanceArray(_)
        )
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, RuntimeClass::Interface(_))
    }

    pub fn primitive_element(&self) -> Option<AllocationType> {
        match self {
            RuntimeClass::PrimitiveArray(c) => Some(c.element_type),
            _ => None,
        }
    }
}
