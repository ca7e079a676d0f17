use crate::error::VmError;
use crate::heap::Heap;
use crate::keys::{ClassId, MethodId, MethodKey, ThreadId};
use crate::rt::class::{collect_static_fields, load_interfaces, prepare_cp};
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::method::Method;
use crate::rt::{BaseClass, ClassLike, ClassState, RuntimeClass};
use crate::throw_exception;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use valka_classfile::ClassFile;

pub struct InterfaceClass {
    pub base: BaseClass,
    pub cp: Arc<RuntimeConstantPool>,
    /// Declared methods by key, plus the declaration order the interface
    /// table builder concatenates.
    methods: OnceCell<HashMap<MethodKey, MethodId>>,
    methods_ordered: OnceCell<Vec<MethodId>>,
}

impl InterfaceClass {
    /// Derives an interface from its class file. Every method must be
    /// public and abstract; `<clinit>` is the only static one allowed.
    /// Interface methods receive globally unique ids from the method area's
    /// monotone counter; invokeinterface dispatches by that id.
    pub fn load_and_link(
        cf: ClassFile,
        ma: &mut crate::heap::method_area::MethodArea,
        heap: &Heap,
        class_id: ClassId,
        super_id: Option<ClassId>,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let cp = prepare_cp(&cf, ma.interner());
        let name = cp.get_class_sym(cf.this_class)?;
        let source_file = cf
            .source_file
            .map(|idx| cp.get_utf8_sym(idx))
            .transpose()?;

        let interface = InterfaceClass {
            base: BaseClass::new(name, cf.access_flags, super_id, source_file),
            cp: cp.clone(),
            methods: OnceCell::new(),
            methods_ordered: OnceCell::new(),
        };
        interface.set_state(ClassState::Linking);

        Self::link_methods(&interface, cf.methods, class_id, ma)?;
        let string_constants =
            collect_static_fields(&interface.base, &cp, cf.fields, class_id, ma, heap)?;
        let interfaces = load_interfaces(&cp, cf.interfaces, super_id, ma, heap, thread_id)?;
        interface.base.set_interfaces(interfaces)?;
        ma.set_pending_string_constants(class_id, string_constants);

        interface.set_state(ClassState::Linked);
        ma.install_class(class_id, RuntimeClass::Interface(Box::new(interface)));
        Ok(())
    }

    fn link_methods(
        interface: &InterfaceClass,
        methods: Vec<valka_classfile::method::MethodInfo>,
        class_id: ClassId,
        ma: &mut crate::heap::method_area::MethodArea,
    ) -> Result<(), VmError> {
        let mut by_key = HashMap::new();
        let mut ordered = Vec::with_capacity(methods.len());

        for info in methods {
            let key = MethodKey {
                name: interface.cp.get_utf8_sym(info.name_index)?,
                desc: interface.cp.get_utf8_sym(info.descriptor_index)?,
            };
            if by_key.contains_key(&key) {
                throw_exception!(ClassFormatError, "duplicated interface method")?
            }

            let is_clinit = key == ma.br().clinit_mk;
            if info.access_flags.is_static() && !is_clinit {
                throw_exception!(ClassFormatError, "interface declares a static method")?
            }
            if !is_clinit {
                if !info.access_flags.is_public() {
                    throw_exception!(ClassFormatError, "interface method is not public")?
                }
                if !info.access_flags.is_abstract() {
                    throw_exception!(ClassFormatError, "interface method is not abstract")?
                }
            }

            let descriptor_id = ma.get_or_new_method_descriptor_id(key.desc)?;
            let args_count = ma.method_args_count(descriptor_id, info.access_flags.is_static());
            let method = Method::new(info, class_id, descriptor_id, key.name, key.desc, args_count)?;
            let method_id = ma.push_method(method);

            if is_clinit {
                interface.base.set_clinit(method_id)?;
            } else {
                let interface_method_index = ma.next_interface_method_id();
                ma.get_method(&method_id).set_index(interface_method_index);
                by_key.insert(key, method_id);
                ordered.push(method_id);
            }
        }

        interface
            .methods
            .set(by_key)
            .map_err(|_| VmError::Internal("interface methods already set".to_string()))?;
        interface
            .methods_ordered
            .set(ordered)
            .map_err(|_| VmError::Internal("interface method order already set".to_string()))?;
        Ok(())
    }

    pub fn get_method_id(&self, key: &MethodKey) -> Option<MethodId> {
        self.methods.get()?.get(key).copied()
    }

    pub fn methods_in_order(&self) -> &[MethodId] {
        self.methods_ordered.get().map_or(&[], Vec::as_slice)
    }

    pub fn method_keys(&self) -> impl Iterator<Item = (&MethodKey, &MethodId)> {
        self.methods.get().into_iter().flatten()
    }
}

impl ClassLike for InterfaceClass {
    fn base(&self) -> &BaseClass {
        &self.base
    }
}
