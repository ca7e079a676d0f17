use crate::class_loader::ClassPath;
use crate::error::VmError;
use crate::heap::{ClassShape, Heap};
use crate::jtype::{JavaType, MethodDescriptor};
use crate::keys::{
    ClassId, FieldDescriptorId, FieldKey, FullyQualifiedMethodKey, MethodDescriptorId, MethodId,
    MethodKey, Symbol, ThreadId,
};
use crate::rt::array::{ObjectArrayClass, PrimitiveArrayClass};
use crate::rt::class::InstanceClass;
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::field::{InstanceField, StaticCell, StaticField};
use crate::rt::interface::InterfaceClass;
use crate::rt::method::Method;
use crate::rt::{ClassLike, ClassState, PreloadedClass, RuntimeClass};
use crate::vm::bootstrap_registry::BootstrapRegistry;
use crate::{build_exception, debug_log, throw_exception};
use lasso::ThreadedRodeo;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use valka_classfile::ClassFile;

/// The class table and everything hanging off it: methods, descriptors,
/// mirrors, the bootstrap class loader. All mutation happens under the
/// global VM lock through the loader entry points; readers take the outer
/// RwLock in short bursts.
pub struct MethodArea {
    class_path: ClassPath,
    class_name_to_index: HashMap<Symbol, ClassId>,
    mirror_to_class_index: HashMap<crate::heap::HeapRef, ClassId>,
    classes: Vec<RuntimeClass>,
    methods: Vec<Arc<Method>>,

    field_descriptors: Vec<JavaType>,
    field_descriptors_index: HashMap<Symbol, FieldDescriptorId>,

    method_descriptors: Vec<MethodDescriptor>,
    method_descriptors_index: HashMap<Symbol, MethodDescriptorId>,

    /// Monotone source of globally unique interface method ids.
    interface_method_counter: u16,

    /// Element class to its array class, filled as array classes load;
    /// resolved ANEWARRAY uses it for the O(1) hop.
    array_class_by_element: HashMap<ClassId, ClassId>,

    /// String ConstantValue statics per class, interned when the class
    /// initializes (interning allocates, linking must not).
    pending_string_constants: HashMap<ClassId, Vec<(StaticCell, Symbol)>>,

    interner: Arc<ThreadedRodeo>,
    bootstrap_registry: Arc<BootstrapRegistry>,
}

impl MethodArea {
    pub fn init(
        class_path: ClassPath,
        interner: Arc<ThreadedRodeo>,
    ) -> (Self, Arc<BootstrapRegistry>) {
        debug_log!("creating the method area");
        let bootstrap_registry = Arc::new(BootstrapRegistry::new(&interner));

        let mut ma = Self {
            class_path,
            class_name_to_index: HashMap::new(),
            mirror_to_class_index: HashMap::new(),
            classes: Vec::with_capacity(256),
            methods: Vec::with_capacity(2048),
            field_descriptors: Vec::with_capacity(256),
            field_descriptors_index: HashMap::new(),
            method_descriptors: Vec::with_capacity(1024),
            method_descriptors_index: HashMap::new(),
            interface_method_counter: 0,
            array_class_by_element: HashMap::new(),
            pending_string_constants: HashMap::new(),
            bootstrap_registry: bootstrap_registry.clone(),
            interner,
        };

        // Bootstrap classes occupy fixed, well-known table slots.
        for &sym in &[
            bootstrap_registry.java_lang_object_sym,
            bootstrap_registry.java_lang_string_sym,
            bootstrap_registry.java_lang_class_sym,
            bootstrap_registry.java_lang_thread_sym,
        ] {
            let id = ma.push_class(RuntimeClass::Preloaded(PreloadedClass::new(sym)));
            ma.class_name_to_index.insert(sym, id);
        }

        (ma, bootstrap_registry)
    }

    pub fn br(&self) -> &BootstrapRegistry {
        &self.bootstrap_registry
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    pub fn get_or_new_field_descriptor_id(
        &mut self,
        descriptor: Symbol,
    ) -> Result<FieldDescriptorId, VmError> {
        if let Some(id) = self.field_descriptors_index.get(&descriptor) {
            return Ok(*id);
        }
        let parsed = JavaType::parse(self.interner.resolve(&descriptor))?;
        self.field_descriptors.push(parsed);
        let id = FieldDescriptorId::from_usize(self.field_descriptors.len());
        self.field_descriptors_index.insert(descriptor, id);
        Ok(id)
    }

    pub fn get_field_descriptor(&self, id: &FieldDescriptorId) -> &JavaType {
        &self.field_descriptors[id.to_index()]
    }

    pub fn get_or_new_method_descriptor_id(
        &mut self,
        descriptor: Symbol,
    ) -> Result<MethodDescriptorId, VmError> {
        if let Some(id) = self.method_descriptors_index.get(&descriptor) {
            return Ok(*id);
        }
        let parsed = MethodDescriptor::parse(self.interner.resolve(&descriptor))?;
        self.method_descriptors.push(parsed);
        let id = MethodDescriptorId::from_usize(self.method_descriptors.len());
        self.method_descriptors_index.insert(descriptor, id);
        Ok(id)
    }

    pub fn get_method_descriptor(&self, id: &MethodDescriptorId) -> &MethodDescriptor {
        &self.method_descriptors[id.to_index()]
    }

    pub fn get_method_descriptor_by_method_id(&self, method_id: &MethodId) -> &MethodDescriptor {
        self.get_method_descriptor(&self.get_method(method_id).descriptor_id())
    }

    /// Operand values an invocation of this method pops, receiver included.
    pub fn method_args_count(&self, descriptor_id: MethodDescriptorId, is_static: bool) -> u8 {
        let count = self.get_method_descriptor(&descriptor_id).arg_count()
            + if is_static { 0 } else { 1 };
        count as u8
    }

    // ------------------------------------------------------------------
    // Methods and classes
    // ------------------------------------------------------------------

    pub fn push_method(&mut self, method: Method) -> MethodId {
        self.methods.push(Arc::new(method));
        MethodId::from_usize(self.methods.len())
    }

    pub fn get_method(&self, method_id: &MethodId) -> &Method {
        &self.methods[method_id.to_index()]
    }

    pub fn get_method_arc(&self, method_id: &MethodId) -> Arc<Method> {
        self.methods[method_id.to_index()].clone()
    }

    pub fn next_interface_method_id(&mut self) -> u16 {
        let id = self.interface_method_counter;
        self.interface_method_counter += 1;
        id
    }

    pub fn push_class(&mut self, class: RuntimeClass) -> ClassId {
        self.classes.push(class);
        ClassId::from_usize(self.classes.len())
    }

    /// Replaces a preloaded slot with the fully derived class.
    pub fn install_class(&mut self, class_id: ClassId, class: RuntimeClass) {
        self.classes[class_id.to_index()] = class;
    }

    pub fn get_class(&self, class_id: &ClassId) -> &RuntimeClass {
        &self.classes[class_id.to_index()]
    }

    pub fn classes(&self) -> &[RuntimeClass] {
        &self.classes
    }

    pub fn get_instance_class(&self, class_id: &ClassId) -> Result<&InstanceClass, VmError> {
        match self.get_class(class_id) {
            RuntimeClass::Instance(c) => Ok(c),
            other => Err(VmError::Internal(format!("{} is not an instance class", other))),
        }
    }

    pub fn get_interface_class(&self, class_id: &ClassId) -> Result<&InterfaceClass, VmError> {
        match self.get_class(class_id) {
            RuntimeClass::Interface(c) => Ok(c),
            other => Err(VmError::Internal(format!("{} is not an interface", other))),
        }
    }

    pub fn get_class_like(&self, class_id: &ClassId) -> Result<&dyn ClassLike, VmError> {
        self.get_class(class_id).as_class_like()
    }

    pub fn get_cp_arc(&self, class_id: &ClassId) -> Result<Arc<RuntimeConstantPool>, VmError> {
        Ok(self.get_class(class_id).get_cp()?.clone())
    }

    pub fn get_cp_by_method_id(
        &self,
        method_id: &MethodId,
    ) -> Result<Arc<RuntimeConstantPool>, VmError> {
        let class_id = self.get_method(method_id).class_id();
        self.get_cp_arc(&class_id)
    }

    pub fn lookup_class_id(&self, name: Symbol) -> Option<ClassId> {
        self.class_name_to_index.get(&name).copied()
    }

    pub fn build_fully_qualified_native_method_key(
        &self,
        method_id: &MethodId,
    ) -> FullyQualifiedMethodKey {
        let method = self.get_method(method_id);
        let class = self.get_class(&method.class_id());
        FullyQualifiedMethodKey::new(class.get_name(), method.name, method.desc)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Resolves a class by name, loading and linking it on first use. Runs
    /// under the global VM lock; concurrent requests for the same class
    /// serialize here rather than race.
    #[hotpath::measure]
    pub fn get_class_id_or_load(
        &mut self,
        heap: &Heap,
        name_sym: Symbol,
        thread_id: ThreadId,
    ) -> Result<ClassId, VmError> {
        if let Some(class_id) = self.class_name_to_index.get(&name_sym).copied() {
            match self.get_class(&class_id) {
                RuntimeClass::Preloaded(p) => match p.state() {
                    ClassState::Linking => {
                        // The class is somewhere up the current resolution
                        // chain; this dependency is a cycle.
                        return throw_exception!(
                            ClassCircularityError,
                            "cyclic dependency on {}",
                            self.interner.resolve(&name_sym)
                        );
                    }
                    _ => return self.load_into(heap, class_id, name_sym, thread_id),
                },
                _ => return Ok(class_id),
            }
        }

        let class_id = self.push_class(RuntimeClass::Preloaded(PreloadedClass::new(name_sym)));
        self.class_name_to_index.insert(name_sym, class_id);
        self.load_into(heap, class_id, name_sym, thread_id)
    }

    #[hotpath::measure]
    fn load_into(
        &mut self,
        heap: &Heap,
        class_id: ClassId,
        name_sym: Symbol,
        thread_id: ThreadId,
    ) -> Result<ClassId, VmError> {
        if let RuntimeClass::Preloaded(p) = self.get_class(&class_id) {
            p.set_state(ClassState::Linking);
        }

        let name = self.interner.resolve(&name_sym).to_string();
        debug_log!("loading class {}", name);

        if name.starts_with('[') {
            self.load_array_class(heap, class_id, name_sym, &name, thread_id)?;
            return Ok(class_id);
        }

        let bytes = self.class_path.load(&name).ok_or_else(|| {
            build_exception!(NoClassDefFoundError, name.replace('/', "."))
        })?;
        let cf = ClassFile::parse(&bytes)?;

        if cf.this_class_name().map_err(VmError::from)? != name {
            throw_exception!(
                NoClassDefFoundError,
                "class file for {} declares another name",
                name
            )?
        }

        let super_id = match cf.super_class_name().map_err(VmError::from)? {
            Some(super_name) => {
                let super_sym = self.interner.get_or_intern(super_name);
                Some(self.get_class_id_or_load(heap, super_sym, thread_id)?)
            }
            None => None,
        };

        if cf.access_flags.is_interface() {
            InterfaceClass::load_and_link(cf, self, heap, class_id, super_id, thread_id)?;
        } else {
            InstanceClass::load_and_link(cf, self, heap, class_id, super_id, thread_id)?;
        }
        Ok(class_id)
    }

    /// Synthesizes an array class: the element class is resolved first
    /// (recursively for nested arrays) and the dispatch table is shared
    /// with java/lang/Object.
    fn load_array_class(
        &mut self,
        heap: &Heap,
        class_id: ClassId,
        name_sym: Symbol,
        name: &str,
        thread_id: ThreadId,
    ) -> Result<(), VmError> {
        let ty = JavaType::parse(name)?;
        let object_id = self.br().java_lang_object_id();
        let object = self.get_instance_class(&object_id)?;
        let vtable = object.get_vtable()?.clone();
        let vtable_index = object.get_vtable_index()?.clone();

        let class = if let Some(elem) = ty.primitive_array_element() {
            heap.register_shape(class_id, ClassShape::PrimitiveArray(elem.into()));
            RuntimeClass::PrimitiveArray(PrimitiveArrayClass {
                name: name_sym,
                super_id: object_id,
                element_type: elem.into(),
                vtable,
                vtable_index,
                mirror_ref: OnceCell::new(),
            })
        } else if let Some(elem_name) = ty.reference_array_element_name() {
            let elem_sym = self.interner.get_or_intern(&elem_name);
            let element_class_id = self.get_class_id_or_load(heap, elem_sym, thread_id)?;
            heap.register_shape(class_id, ClassShape::ReferenceArray);
            self.array_class_by_element.insert(element_class_id, class_id);
            RuntimeClass::InstanceArray(ObjectArrayClass {
                name: name_sym,
                super_id: object_id,
                element_class_id,
                vtable,
                vtable_index,
                mirror_ref: OnceCell::new(),
            })
        } else {
            return throw_exception!(NoClassDefFoundError, "malformed array class name {}", name);
        };

        self.install_class(class_id, class);
        Ok(())
    }

    pub fn array_class_for_element(&self, element: ClassId) -> Option<ClassId> {
        self.array_class_by_element.get(&element).copied()
    }

    pub fn set_pending_string_constants(
        &mut self,
        class_id: ClassId,
        constants: Vec<(StaticCell, Symbol)>,
    ) {
        if !constants.is_empty() {
            self.pending_string_constants.insert(class_id, constants);
        }
    }

    pub fn take_pending_string_constants(
        &mut self,
        class_id: ClassId,
    ) -> Vec<(StaticCell, Symbol)> {
        self.pending_string_constants
            .remove(&class_id)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Mirrors
    // ------------------------------------------------------------------

    pub fn get_class_id_by_mirror(&self, mirror: &crate::heap::HeapRef) -> Option<ClassId> {
        self.mirror_to_class_index.get(mirror).copied()
    }

    pub fn record_mirror(
        &mut self,
        class_id: ClassId,
        mirror: crate::heap::HeapRef,
    ) -> Result<(), VmError> {
        self.get_class(&class_id).set_mirror_ref(mirror)?;
        self.mirror_to_class_index.insert(mirror, class_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assignability
    // ------------------------------------------------------------------

    pub fn is_assignable_from(&self, target: ClassId, source: ClassId) -> bool {
        self.is_subclass_of(source, target)
    }

    fn is_subclass_of(&self, this_class: ClassId, target_class: ClassId) -> bool {
        if this_class == target_class {
            return true;
        }

        let this = self.get_class(&this_class);
        let target = self.get_class(&target_class);

        if this.is_array() && target.is_array() {
            return match (this, target) {
                (RuntimeClass::PrimitiveArray(a), RuntimeClass::PrimitiveArray(b)) => {
                    a.element_type == b.element_type
                }
                (RuntimeClass::InstanceArray(a), RuntimeClass::InstanceArray(b)) => {
                    self.is_subclass_of(a.element_class_id, b.element_class_id)
                }
                _ => false,
            };
        }

        if let Some(super_id) = this.get_super_id() {
            if self.is_subclass_of(super_id, target_class) {
                return true;
            }
        }

        if let Ok(interfaces) = this.get_interfaces() {
            if interfaces.contains(&target_class) {
                return true;
            }
            for &interface_id in interfaces {
                if self.is_subclass_of(interface_id, target_class) {
                    return true;
                }
            }
        }

        false
    }

    /// Subtype test against a class that may not be loaded; an unknown name
    /// cannot match.
    pub fn instance_of(&self, this_class_id: ClassId, other_sym: Symbol) -> bool {
        match self.class_name_to_index.get(&other_sym) {
            Some(&other_id) => self.is_subclass_of(this_class_id, other_id),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Member resolution
    // ------------------------------------------------------------------

    /// Finds an instance field by walking the class chain.
    pub fn resolve_instance_field(
        &self,
        class_id: ClassId,
        key: &FieldKey,
    ) -> Result<(ClassId, InstanceField), VmError> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.get_instance_class(&id)?;
            if let Some(field) = class.get_instance_field(key) {
                return Ok((id, *field));
            }
            current = class.get_super();
        }
        throw_exception!(
            NoSuchFieldError,
            "{}.{}",
            self.interner.resolve(&self.get_class(&class_id).get_name()),
            self.interner.resolve(&key.name)
        )
    }

    /// Finds a static field in the class chain, then in the flattened
    /// interfaces (interface constants are inherited).
    pub fn resolve_static_field(
        &self,
        class_id: ClassId,
        key: &FieldKey,
    ) -> Result<(ClassId, StaticField), VmError> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.get_class(&id);
            if let Ok(class_like) = class.as_class_like() {
                if let Some(field) = class_like.get_static_field(key) {
                    return Ok((id, *field));
                }
            }
            current = class.get_super_id();
        }

        if let Ok(interfaces) = self.get_class(&class_id).get_interfaces() {
            for &interface_id in interfaces {
                let interface = self.get_interface_class(&interface_id)?;
                if let Some(field) = interface.get_static_field(key) {
                    return Ok((interface_id, *field));
                }
            }
        }

        throw_exception!(
            NoSuchFieldError,
            "static {}.{}",
            self.interner.resolve(&self.get_class(&class_id).get_name()),
            self.interner.resolve(&key.name)
        )
    }

    /// Method resolution: the class chain first, then the flattened
    /// interfaces. Resolving a plain method through an interface class (or
    /// the other way round) is a linkage error.
    pub fn resolve_method(
        &self,
        class_id: ClassId,
        key: &MethodKey,
        expect_interface: bool,
    ) -> Result<MethodId, VmError> {
        let declared_on = self.get_class(&class_id);
        if expect_interface != declared_on.is_interface() {
            throw_exception!(
                IncompatibleClassChangeError,
                "method reference kind does not match the resolved class"
            )?
        }

        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.get_class(&id);
            if let Some(method_id) = class.get_direct_method_id(key) {
                return Ok(method_id);
            }
            current = class.get_super_id();
        }

        if let Ok(interfaces) = self.get_class(&class_id).get_interfaces() {
            for &interface_id in interfaces {
                if let Some(method_id) =
                    self.get_interface_class(&interface_id)?.get_method_id(key)
                {
                    return Ok(method_id);
                }
            }
        }

        let class_sym = self.get_class(&class_id).get_name();
        throw_exception!(NoSuchMethodError, method_key: *key, class_sym: class_sym)
    }
}
