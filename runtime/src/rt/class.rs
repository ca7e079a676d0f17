use crate::error::VmError;
use crate::heap::method_area::MethodArea;
use crate::heap::{ClassShape, Heap};
use crate::jtype::{AllocationType, JavaType};
use crate::keys::{ClassId, FieldKey, MethodId, MethodKey, Symbol, ThreadId};
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::field::{FieldOffset, InstanceField, StaticCell, StaticField};
use crate::rt::method::Method;
use crate::rt::{BaseClass, ClassLike, ClassState, RuntimeClass};
use crate::{build_exception, throw_exception};
use itertools::Itertools;
use lasso::ThreadedRodeo;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use valka_classfile::ClassFile;
use valka_classfile::field::FieldInfo;
use valka_classfile::method::MethodInfo;

/// Instance layout limits inherited from the packed field-offset encoding.
const MAX_NREF_BYTES: u32 = 32767;
const MAX_REF_BYTES: u32 = 32768;
const MAX_BIT_OFFSET: u32 = 32767;

pub struct InstanceClass {
    base: BaseClass,
    pub cp: Arc<RuntimeConstantPool>,

    /// Statics, privates and initializers, dispatched directly.
    declared_methods: OnceCell<HashMap<MethodKey, MethodId>>,
    vtable: OnceCell<Vec<MethodId>>,
    vtable_index: OnceCell<HashMap<MethodKey, u16>>,
    /// (interface method id, implementing method), sorted by id for binary
    /// search during invokeinterface.
    itable: OnceCell<Box<[(u16, MethodId)]>>,

    instance_fields: OnceCell<Vec<InstanceField>>,
    field_index: OnceCell<HashMap<FieldKey, usize>>,
    ref_n: OnceCell<u32>,
    nref_size: OnceCell<u32>,
    has_finalizer: OnceCell<bool>,
}

impl InstanceClass {
    /// Derives a class from its parsed class file and installs it into the
    /// preassigned table slot. Layout, dispatch tables and static cells are
    /// immutable once this returns.
    pub fn load_and_link(
        cf: ClassFile,
        ma: &mut MethodArea,
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

        check_parent_discipline(&cf, ma, super_id)?;

        let class = InstanceClass {
            base: BaseClass::new(name, cf.access_flags, super_id, source_file),
            cp: cp.clone(),
            declared_methods: OnceCell::new(),
            vtable: OnceCell::new(),
            vtable_index: OnceCell::new(),
            itable: OnceCell::new(),
            instance_fields: OnceCell::new(),
            field_index: OnceCell::new(),
            ref_n: OnceCell::new(),
            nref_size: OnceCell::new(),
            has_finalizer: OnceCell::new(),
        };
        class.set_state(ClassState::Linking);

        let string_constants = class.link_fields(cf.fields, class_id, ma, heap)?;
        let (declared_finalizer, method_ids) = class.link_methods(cf.methods, class_id, ma)?;

        let interfaces = load_interfaces(&cp, cf.interfaces, super_id, ma, heap, thread_id)?;
        class.base.set_interfaces(interfaces)?;

        class.build_dispatch_table(ma, &method_ids)?;
        class.build_interface_table(ma)?;

        let has_finalizer = declared_finalizer
            || super_id
                .map(|id| ma.get_instance_class(&id).map(|c| c.has_finalizer()))
                .transpose()?
                .unwrap_or(false);
        class
            .has_finalizer
            .set(has_finalizer)
            .map_err(|_| VmError::Internal("finalizer flag already set".to_string()))?;

        heap.register_shape(
            class_id,
            ClassShape::Instance {
                ref_n: class.ref_n()?,
                nref_size: class.nref_size()?,
                has_finalizer,
                weak_referent: class.weak_referent_slot(ma, heap),
            },
        );

        ma.set_pending_string_constants(class_id, string_constants);
        class.set_state(ClassState::Linked);
        ma.install_class(class_id, RuntimeClass::Instance(Box::new(class)));
        Ok(())
    }

    /// Lays the fields out by size class. Reference fields take backward
    /// slots continuing the parent's reference area; the non-reference area
    /// continues the parent's, aligned to the largest size class present,
    /// then filled in descending order: longs, ints, shorts, bytes, bits.
    fn link_fields(
        &self,
        fields: Vec<FieldInfo>,
        class_id: ClassId,
        ma: &mut MethodArea,
        heap: &Heap,
    ) -> Result<Vec<(StaticCell, Symbol)>, VmError> {
        let (par_ref_n, par_nref_size) = match self.get_super() {
            Some(super_id) => {
                let parent = ma.get_instance_class(&super_id)?;
                (parent.ref_n()?, parent.nref_size()?)
            }
            None => (0, 0),
        };

        struct ParsedField {
            key: FieldKey,
            info: FieldInfo,
            ty: JavaType,
        }

        let mut statics = Vec::new();
        let mut instance = Vec::new();
        let mut seen = HashSet::new();

        for info in fields {
            let key = FieldKey {
                name: self.cp.get_utf8_sym(info.name_index)?,
                desc: self.cp.get_utf8_sym(info.descriptor_index)?,
            };
            if !seen.insert(key) {
                throw_exception!(ClassFormatError, "duplicated field")?
            }
            let descriptor_id = ma.get_or_new_field_descriptor_id(key.desc)?;
            let ty = ma.get_field_descriptor(&descriptor_id).clone();
            let parsed = ParsedField { key, info, ty };
            if parsed.info.access_flags.is_static() {
                statics.push((parsed, descriptor_id));
            } else {
                instance.push((parsed, descriptor_id));
            }
        }

        // Size-class census of the declared instance fields.
        let mut ref_count = 0u32;
        let mut long_bytes = 0u32;
        let mut int_bytes = 0u32;
        let mut short_bytes = 0u32;
        let mut byte_count = 0u32;
        let mut bit_count = 0u32;

        for (field, _) in &instance {
            match field.ty.as_allocation_type() {
                AllocationType::Reference => ref_count += 1,
                AllocationType::Long | AllocationType::Double => long_bytes += 8,
                AllocationType::Int | AllocationType::Float => int_bytes += 4,
                AllocationType::Short | AllocationType::Char => short_bytes += 2,
                AllocationType::Byte => byte_count += 1,
                AllocationType::Boolean => bit_count += 1,
            }
        }

        let aligned_parent = if long_bytes != 0 {
            par_nref_size.next_multiple_of(8)
        } else if int_bytes != 0 {
            par_nref_size.next_multiple_of(4)
        } else if short_bytes != 0 {
            par_nref_size.next_multiple_of(2)
        } else {
            par_nref_size
        };

        let new_ref_n = par_ref_n + ref_count;
        let new_nref_size = aligned_parent
            + long_bytes
            + int_bytes
            + short_bytes
            + byte_count
            + bit_count.div_ceil(8);

        if new_nref_size > MAX_NREF_BYTES {
            throw_exception!(ClassFormatError, "non-reference area exceeds the VM limits")?
        }
        if new_ref_n * size_of::<usize>() as u32 > MAX_REF_BYTES {
            throw_exception!(ClassFormatError, "reference area exceeds the VM limits")?
        }

        let mut ref_slot = par_ref_n;
        let mut long_offset = aligned_parent;
        let mut int_offset = long_offset + long_bytes;
        let mut short_offset = int_offset + int_bytes;
        let mut byte_offset = short_offset + short_bytes;
        let mut bit_offset = (byte_offset + byte_count) * 8;

        if bit_offset + bit_count > MAX_BIT_OFFSET {
            throw_exception!(ClassFormatError, "bit-sized fields exceed the VM limits")?
        }

        let mut instance_fields = Vec::with_capacity(instance.len());
        let mut field_index = HashMap::with_capacity(instance.len());

        for (field, descriptor_id) in instance {
            let offset = match field.ty.as_allocation_type() {
                AllocationType::Reference => {
                    let slot = ref_slot;
                    ref_slot += 1;
                    FieldOffset::Ref(slot as u16)
                }
                AllocationType::Long | AllocationType::Double => {
                    let off = long_offset;
                    long_offset += 8;
                    FieldOffset::NonRef(off as u16)
                }
                AllocationType::Int | AllocationType::Float => {
                    let off = int_offset;
                    int_offset += 4;
                    FieldOffset::NonRef(off as u16)
                }
                AllocationType::Short | AllocationType::Char => {
                    let off = short_offset;
                    short_offset += 2;
                    FieldOffset::NonRef(off as u16)
                }
                AllocationType::Byte => {
                    let off = byte_offset;
                    byte_offset += 1;
                    FieldOffset::NonRef(off as u16)
                }
                AllocationType::Boolean => {
                    let off = bit_offset;
                    bit_offset += 1;
                    FieldOffset::Bit(off)
                }
            };

            field_index.insert(field.key, instance_fields.len());
            instance_fields.push(InstanceField {
                flags: field.info.access_flags,
                descriptor_id,
                offset,
                declaring_class: class_id,
            });
        }

        self.instance_fields
            .set(instance_fields)
            .map_err(|_| VmError::Internal("instance fields already set".to_string()))?;
        self.field_index
            .set(field_index)
            .map_err(|_| VmError::Internal("field index already set".to_string()))?;
        self.ref_n
            .set(new_ref_n)
            .map_err(|_| VmError::Internal("ref_n already set".to_string()))?;
        self.nref_size
            .set(new_nref_size)
            .map_err(|_| VmError::Internal("nref_size already set".to_string()))?;

        // Static fields become typed cells in the permanent arena.
        let statics = statics
            .into_iter()
            .map(|(f, descriptor_id)| (f.key, f.info, f.ty, descriptor_id))
            .collect::<Vec<_>>();
        let mut static_map = HashMap::with_capacity(statics.len());
        let mut string_constants = Vec::new();
        for (key, info, ty, descriptor_id) in statics {
            let cell = alloc_static_cell(heap, ty.as_allocation_type())?;
            if let Some(cv_index) = info.constant_value {
                apply_constant_value(&self.cp, cv_index, heap, cell, &mut string_constants)?;
            }
            static_map.insert(
                key,
                StaticField {
                    flags: info.access_flags,
                    descriptor_id,
                    declaring_class: class_id,
                    cell,
                },
            );
        }
        self.base.set_static_fields(static_map)?;

        Ok(string_constants)
    }

    /// Builds the method table. Returns whether the class declares a
    /// non-trivial finalizer, plus the pushed method ids in declaration
    /// order for the dispatch table builder.
    fn link_methods(
        &self,
        methods: Vec<MethodInfo>,
        class_id: ClassId,
        ma: &mut MethodArea,
    ) -> Result<(bool, Vec<MethodId>), VmError> {
        let mut declared = HashMap::new();
        let mut seen = HashSet::new();
        let mut method_ids = Vec::with_capacity(methods.len());
        let mut has_finalizer = false;

        for info in methods {
            let key = MethodKey {
                name: self.cp.get_utf8_sym(info.name_index)?,
                desc: self.cp.get_utf8_sym(info.descriptor_index)?,
            };
            if !seen.insert(key) {
                throw_exception!(ClassFormatError, "duplicated method")?
            }

            // An empty finalize body is a single return; only a real one
            // forces finalization tracking.
            if key == ma.br().finalize_mk {
                if let Some(code) = &info.code {
                    if code.code.len() > 1 {
                        has_finalizer = true;
                    }
                }
            }

            let descriptor_id = ma.get_or_new_method_descriptor_id(key.desc)?;
            let args_count = ma.method_args_count(descriptor_id, info.access_flags.is_static());
            let is_static = info.access_flags.is_static();
            let is_private = info.access_flags.is_private();
            let method = Method::new(info, class_id, descriptor_id, key.name, key.desc, args_count)?;
            let method_id = ma.push_method(method);
            method_ids.push(method_id);

            let is_init = key.name == ma.br().init_sym || key.name == ma.br().clinit_sym;
            if key == ma.br().clinit_mk {
                self.base.set_clinit(method_id)?;
            }
            if is_static || is_private || is_init {
                // Called directly, never through the dispatch table.
                ma.get_method(&method_id).set_index(0);
                declared.insert(key, method_id);
            }
        }

        self.declared_methods
            .set(declared)
            .map_err(|_| VmError::Internal("declared methods already set".to_string()))?;
        Ok((has_finalizer, method_ids))
    }

    /// Copies the parent dispatch table and overlays this class's virtual
    /// methods: an override must not weaken access and must not replace a
    /// final method; fresh methods get new slots at the end.
    fn build_dispatch_table(
        &self,
        ma: &MethodArea,
        method_ids: &[MethodId],
    ) -> Result<(), VmError> {
        let (mut vtable, mut vtable_index) = match self.get_super() {
            Some(super_id) => {
                let parent = ma.get_instance_class(&super_id)?;
                (parent.get_vtable()?.clone(), parent.get_vtable_index()?.clone())
            }
            None => (Vec::new(), HashMap::new()),
        };

        let declared = self
            .declared_methods
            .get()
            .ok_or(VmError::Unlinked("declared methods"))?;

        for &method_id in method_ids {
            let method = ma.get_method(&method_id);
            let key = MethodKey {
                name: method.name,
                desc: method.desc,
            };
            if declared.contains_key(&key) {
                continue;
            }

            match vtable_index.get(&key) {
                Some(&slot) => {
                    let overridden = ma.get_method(&vtable[slot as usize]);
                    if overridden.flags().is_final() {
                        throw_exception!(ClassFormatError, "a method overrides a final method")?
                    }
                    let weaker = (overridden.flags().is_public() && !method.flags().is_public())
                        || (overridden.flags().is_protected()
                            && !(method.flags().is_protected() || method.flags().is_public()));
                    if weaker {
                        throw_exception!(
                            ClassFormatError,
                            "a method is overridden with weaker access"
                        )?
                    }
                    method.set_index(slot);
                    vtable[slot as usize] = method_id;
                }
                None => {
                    let slot = vtable.len() as u16;
                    method.set_index(slot);
                    vtable_index.insert(key, slot);
                    vtable.push(method_id);
                }
            }
        }

        self.vtable
            .set(vtable)
            .map_err(|_| VmError::Internal("vtable already set".to_string()))?;
        self.vtable_index
            .set(vtable_index)
            .map_err(|_| VmError::Internal("vtable index already set".to_string()))?;
        Ok(())
    }

    /// Concatenates the method tables of every implemented interface and
    /// selects the concrete implementation for each entry through the
    /// dispatch table, then sorts by interface method id so invocation can
    /// binary search. Unimplemented entries keep the interface's abstract
    /// method; invoking one raises AbstractMethodError at dispatch.
    fn build_interface_table(&self, ma: &MethodArea) -> Result<(), VmError> {
        let vtable = self.get_vtable()?;
        let vtable_index = self.get_vtable_index()?;

        let mut entries = Vec::new();
        for &interface_id in ClassLike::get_interfaces(self)? {
            let interface = ma.get_interface_class(&interface_id)?;
            for &method_id in interface.methods_in_order() {
                let method = ma.get_method(&method_id);
                let key = MethodKey {
                    name: method.name,
                    desc: method.desc,
                };
                let concrete = match vtable_index.get(&key) {
                    Some(&slot) => vtable[slot as usize],
                    None => method_id,
                };
                entries.push((method.index(), concrete));
            }
        }

        let itable = entries
            .into_iter()
            .sorted_by_key(|&(id, _)| id)
            .collect::<Box<[_]>>();
        self.itable
            .set(itable)
            .map_err(|_| VmError::Internal("itable already set".to_string()))?;
        Ok(())
    }

    /// The reference slot the collector must treat weakly, derived from the
    /// class's own layout: java/lang/ref/Reference contributes its
    /// `referent` field, subclasses inherit the slot through their parent's
    /// registered shape.
    fn weak_referent_slot(&self, ma: &MethodArea, heap: &Heap) -> Option<u16> {
        if self.name() == ma.br().java_lang_ref_reference_sym {
            let key = ma.br().referent_fk;
            let index = self.field_index.get()?.get(&key).copied()?;
            return match self.instance_fields.get()?[index].offset {
                FieldOffset::Ref(slot) => Some(slot),
                _ => None,
            };
        }
        match heap.shape(self.get_super()?).ok()? {
            ClassShape::Instance { weak_referent, .. } => weak_referent,
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn dispatch(&self, index: usize) -> Result<MethodId, VmError> {
        self.get_vtable()?
            .get(index)
            .copied()
            .ok_or_else(|| VmError::Internal(format!("dispatch slot {} out of range", index)))
    }

    pub fn interface_dispatch(&self, interface_method_id: u16) -> Result<MethodId, VmError> {
        let itable = self.itable.get().ok_or(VmError::Unlinked("itable"))?;
        itable
            .binary_search_by_key(&interface_method_id, |&(id, _)| id)
            .map(|pos| itable[pos].1)
            .map_err(|_| {
                build_exception!(
                    IncompatibleClassChangeError,
                    "interface method {} not implemented",
                    interface_method_id
                )
            })
    }

    pub fn get_instance_field(&self, key: &FieldKey) -> Option<&InstanceField> {
        let index = self.field_index.get()?.get(key).copied()?;
        Some(&self.instance_fields.get()?[index])
    }

    pub fn instance_fields(&self) -> &[InstanceField] {
        self.instance_fields.get().map_or(&[], Vec::as_slice)
    }

    pub fn get_vtable_method_id_opt(&self, key: &MethodKey) -> Option<MethodId> {
        let index = self.vtable_index.get()?.get(key).copied()?;
        Some(self.vtable.get()?[index as usize])
    }

    pub fn get_direct_method_id_opt(&self, key: &MethodKey) -> Option<MethodId> {
        if let Some(&method_id) = self.declared_methods.get()?.get(key) {
            return Some(method_id);
        }
        self.get_vtable_method_id_opt(key)
    }

    pub fn ref_n(&self) -> Result<u32, VmError> {
        self.ref_n.get().copied().ok_or(VmError::Unlinked("ref_n"))
    }

    pub fn nref_size(&self) -> Result<u32, VmError> {
        self.nref_size
            .get()
            .copied()
            .ok_or(VmError::Unlinked("nref_size"))
    }

    pub fn has_finalizer(&self) -> bool {
        self.has_finalizer.get().copied().unwrap_or(false)
    }

    pub(crate) fn get_vtable(&self) -> Result<&Vec<MethodId>, VmError> {
        self.vtable.get().ok_or(VmError::Unlinked("vtable"))
    }

    pub(crate) fn get_vtable_index(&self) -> Result<&HashMap<MethodKey, u16>, VmError> {
        self.vtable_index
            .get()
            .ok_or(VmError::Unlinked("vtable index"))
    }

    pub fn declared_method(&self, key: &MethodKey) -> Option<MethodId> {
        self.declared_methods.get()?.get(key).copied()
    }
}

impl ClassLike for InstanceClass {
    fn base(&self) -> &BaseClass {
        &self.base
    }
}

/// Wraps the file pool into the runtime pool shared by the class and any
/// long-running operation that outlives a method-area borrow.
pub(crate) fn prepare_cp(cf: &ClassFile, interner: &ThreadedRodeo) -> Arc<RuntimeConstantPool> {
    let entries = cf.cp.entries().to_vec();
    Arc::new(RuntimeConstantPool::new(entries, interner))
}

fn check_parent_discipline(
    cf: &ClassFile,
    ma: &MethodArea,
    super_id: Option<ClassId>,
) -> Result<(), VmError> {
    match super_id {
        None => {
            // Only java/lang/Object goes without a parent.
            let name = cf.this_class_name().map_err(VmError::from)?;
            if name != "java/lang/Object" {
                throw_exception!(ClassFormatError, "class {} has no parent", name)?
            }
        }
        Some(super_id) => {
            let parent = ma.get_class(&super_id);
            if parent.is_interface() {
                throw_exception!(ClassFormatError, "parent class is an interface")?
            }
            if parent.is_array() {
                throw_exception!(ClassFormatError, "parent class is an array")?
            }
            if let Ok(parent_like) = parent.as_class_like() {
                if parent_like.flags().is_final() {
                    throw_exception!(ClassFormatError, "parent class is final")?
                }
            }
            if cf.access_flags.is_interface() {
                let parent_name = ma.interner().resolve(&parent.get_name());
                if parent_name != "java/lang/Object" {
                    throw_exception!(
                        ClassFormatError,
                        "interface parent is not java/lang/Object"
                    )?
                }
            }
        }
    }
    Ok(())
}

/// Resolves the declared interfaces (loading them if needed), verifies they
/// really are interfaces, and flattens the transitive closure together with
/// the parent's set.
pub(crate) fn load_interfaces(
    cp: &RuntimeConstantPool,
    interfaces: Vec<u16>,
    super_id: Option<ClassId>,
    ma: &mut MethodArea,
    heap: &Heap,
    thread_id: ThreadId,
) -> Result<HashSet<ClassId>, VmError> {
    let mut set = match super_id {
        Some(super_id) => match ma.get_class(&super_id).get_interfaces() {
            Ok(parent_set) => parent_set.clone(),
            Err(_) => HashSet::new(),
        },
        None => HashSet::new(),
    };

    for index in interfaces {
        let name = cp.get_class_sym(index)?;
        let interface_id = ma.get_class_id_or_load(heap, name, thread_id)?;
        if !ma.get_class(&interface_id).is_interface() {
            throw_exception!(
                IncompatibleClassChangeError,
                "a non-interface is implemented as an interface"
            )?
        }
        set.insert(interface_id);
        // Superinterfaces come along transitively.
        set.extend(ma.get_class(&interface_id).get_interfaces()?.iter().copied());
    }

    Ok(set)
}

/// Carves a typed cell for a static field from the permanent arena.
fn alloc_static_cell(heap: &Heap, ty: AllocationType) -> Result<StaticCell, VmError> {
    let size = ty.byte_size();
    let offset = heap.palloc(size)?;
    if ty == AllocationType::Reference {
        heap.register_static_ref_cell(offset);
    }
    Ok(StaticCell { offset, ty })
}

/// Applies a ConstantValue attribute to a static cell. String constants are
/// deferred: interning allocates, which must wait until the class leaves
/// the linking critical section.
fn apply_constant_value(
    cp: &RuntimeConstantPool,
    cv_index: u16,
    heap: &Heap,
    cell: StaticCell,
    string_constants: &mut Vec<(StaticCell, Symbol)>,
) -> Result<(), VmError> {
    use crate::rt::constant_pool::RuntimeConstant;
    use crate::vm::Value;

    match cp.entry(cv_index)? {
        RuntimeConstant::Integer(v) => heap.write_typed(cell.offset, cell.ty, Value::Integer(*v)),
        RuntimeConstant::Long(v) => heap.write_typed(cell.offset, cell.ty, Value::Long(*v)),
        RuntimeConstant::Float(v) => heap.write_typed(cell.offset, cell.ty, Value::Float(*v)),
        RuntimeConstant::Double(v) => heap.write_typed(cell.offset, cell.ty, Value::Double(*v)),
        RuntimeConstant::String(_) => {
            string_constants.push((cell, cp.get_string_sym(cv_index)?));
            Ok(())
        }
        _ => throw_exception!(ClassFormatError, "unusable ConstantValue entry"),
    }
}

/// Gathers an interface's static constant fields into permanent cells; the
/// layout machinery is shared with plain classes.
pub(crate) fn collect_static_fields(
    base: &BaseClass,
    cp: &RuntimeConstantPool,
    fields: Vec<FieldInfo>,
    class_id: ClassId,
    ma: &mut MethodArea,
    heap: &Heap,
) -> Result<Vec<(StaticCell, Symbol)>, VmError> {
    let mut static_map = HashMap::new();
    let mut string_constants = Vec::new();

    for info in fields {
        let key = FieldKey {
            name: cp.get_utf8_sym(info.name_index)?,
            desc: cp.get_utf8_sym(info.descriptor_index)?,
        };
        if static_map.contains_key(&key) {
            throw_exception!(ClassFormatError, "duplicated field")?
        }
        if !info.access_flags.is_static() {
            throw_exception!(ClassFormatError, "interface declares an instance field")?
        }
        let descriptor_id = ma.get_or_new_field_descriptor_id(key.desc)?;
        let ty = ma.get_field_descriptor(&descriptor_id).as_allocation_type();
        let cell = alloc_static_cell(heap, ty)?;
        if let Some(cv_index) = info.constant_value {
            apply_constant_value(cp, cv_index, heap, cell, &mut string_constants)?;
        }
        static_map.insert(
            key,
            StaticField {
                flags: info.access_flags,
                descriptor_id,
                declaring_class: class_id,
                cell,
            },
        );
    }

    base.set_static_fields(static_map)?;
    Ok(string_constants)
}

/// Two classes share a package when everything up to the last slash of
/// their names matches.
pub fn same_package(interner: &ThreadedRodeo, a: Symbol, b: Symbol) -> bool {
    let a = interner.resolve(&a);
    let b = interner.resolve(&b);
    let pa = a.rfind('/').map(|i| &a[..i]).unwrap_or("");
    let pb = b.rfind('/').map(|i| &b[..i]).unwrap_or("");
    pa == pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_comparison_uses_the_last_separator() {
        let interner = ThreadedRodeo::default();
        let a = interner.get_or_intern("com/example/A");
        let b = interner.get_or_intern("com/example/B");
        let c = interner.get_or_intern("com/example/sub/C");
        let d = interner.get_or_intern("TopLevel");
        let e = interner.get_or_intern("OtherTop");
        assert!(same_package(&interner, a, b));
        assert!(!same_package(&interner, a, c));
        assert!(same_package(&interner, d, e));
    }
}
