use crate::error::VmError;
use crate::keys::FullyQualifiedMethodKey;
use crate::thread::VmThread;
use crate::vm::{Value, VirtualMachine};
use lasso::ThreadedRodeo;
use std::collections::HashMap;

mod java_lang;
mod valka_io;

/// Uniform native entry point: the argument window with the receiver first
/// (when there is one), the return value by kind in the Option.
pub type NativeFn =
    fn(&VirtualMachine, &mut VmThread, &[Value]) -> Result<Option<Value>, VmError>;

/// The static native table: (class, name, descriptor) to function, built
/// once at VM construction. Methods look their entry up a single time
/// during linking and cache the pointer.
pub struct NativeRegistry {
    map: HashMap<FullyQualifiedMethodKey, NativeFn>,
}

impl NativeRegistry {
    pub fn with_builtins(interner: &ThreadedRodeo) -> Self {
        let mut registry = NativeRegistry {
            map: HashMap::new(),
        };
        java_lang::register(&mut registry, interner);
        valka_io::register(&mut registry, interner);
        registry
    }

    pub fn register(
        &mut self,
        interner: &ThreadedRodeo,
        class: &str,
        name: &str,
        descriptor: &str,
        f: NativeFn,
    ) {
        let key = FullyQualifiedMethodKey::new(
            interner.get_or_intern(class),
            interner.get_or_intern(name),
            interner.get_or_intern(descriptor),
        );
        self.map.insert(key, f);
    }

    pub fn get(&self, key: &FullyQualifiedMethodKey) -> Option<NativeFn> {
        self.map.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
