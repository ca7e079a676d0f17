use crate::class_loader::ClassPath;
use crate::error::VmError;
use crate::heap::method_area::MethodArea;
use crate::heap::{AllocFailure, Heap, HeapRef, gc};
use crate::jtype::AllocationType;
use crate::keys::{ClassId, Symbol};
use crate::monitor::MonitorTable;
use crate::native::NativeRegistry;
use crate::thread::{ThreadManager, VmThread};
use crate::vm::bootstrap_registry::BootstrapRegistry;
use crate::{VmConfig, throw_exception};
use lasso::ThreadedRodeo;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

pub mod bootstrap_registry;
pub mod stack;
pub mod throw;

/// Stack operand, local variable, argument or static value. Longs and
/// doubles are single values here; class-file local numbering still gives
/// them two slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(HeapRef),
    Null,
}

impl Value {
    pub fn as_nullable_obj_ref(&self) -> Result<Option<HeapRef>, VmError> {
        match self {
            Value::Ref(r) => Ok(Some(*r)),
            Value::Null => Ok(None),
            other => Err(VmError::Internal(format!("{:?} is not a reference", other))),
        }
    }

    /// A reference that must not be null; null raises NullPointerException.
    pub fn as_obj_ref(&self) -> Result<HeapRef, VmError> {
        match self {
            Value::Ref(r) => Ok(*r),
            Value::Null => throw_exception!(NullPointerException),
            other => Err(VmError::Internal(format!("{:?} is not a reference", other))),
        }
    }

    pub fn as_int(&self) -> Result<i32, VmError> {
        match self {
            Value::Integer(v) => Ok(*v),
            other => Err(VmError::Internal(format!("{:?} is not an int", other))),
        }
    }

    pub fn as_long(&self) -> Result<i64, VmError> {
        match self {
            Value::Long(v) => Ok(*v),
            other => Err(VmError::Internal(format!("{:?} is not a long", other))),
        }
    }

    pub fn as_float(&self) -> Result<f32, VmError> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(VmError::Internal(format!("{:?} is not a float", other))),
        }
    }

    pub fn as_double(&self) -> Result<f64, VmError> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(VmError::Internal(format!("{:?} is not a double", other))),
        }
    }
}

impl From<&crate::jtype::JavaType> for Value {
    fn from(ty: &crate::jtype::JavaType) -> Self {
        use crate::jtype::{JavaType, PrimitiveType};
        match ty {
            JavaType::Primitive(PrimitiveType::Long) => Value::Long(0),
            JavaType::Primitive(PrimitiveType::Float) => Value::Float(0.0),
            JavaType::Primitive(PrimitiveType::Double) => Value::Double(0.0),
            JavaType::Primitive(_) => Value::Integer(0),
            JavaType::Instance(_) | JavaType::Array(_) => Value::Null,
        }
    }
}

pub struct VirtualMachine {
    pub heap: Heap,
    method_area: RwLock<MethodArea>,
    pub threads: ThreadManager,
    pub monitors: MonitorTable,
    pub native_registry: NativeRegistry,
    pub br: Arc<BootstrapRegistry>,
    pub config: VmConfig,
    interner: Arc<ThreadedRodeo>,
    shutting_down: AtomicBool,
    self_ref: OnceCell<Weak<VirtualMachine>>,
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> Result<Arc<Self>, VmError> {
        let interner = Arc::new(ThreadedRodeo::default());

        let mut class_path = ClassPath::new();
        for dir in &config.boot_class_path {
            class_path.push_boot_directory(dir.clone());
        }
        for dir in &config.class_path {
            class_path.push_directory(dir.clone());
        }
        for (name, bytes) in &config.preloaded_classes {
            class_path.push_memory(name, bytes.clone());
        }

        let (method_area, br) = MethodArea::init(class_path, interner.clone());
        let heap = Heap::new(config.heap_size, interner.clone())?;
        let native_registry = NativeRegistry::with_builtins(&interner);

        let vm = Arc::new(VirtualMachine {
            heap,
            method_area: RwLock::new(method_area),
            threads: ThreadManager::new(),
            monitors: MonitorTable::new(),
            native_registry,
            br,
            config,
            interner,
            shutting_down: AtomicBool::new(false),
            self_ref: OnceCell::new(),
        });
        vm.self_ref
            .set(Arc::downgrade(&vm))
            .map_err(|_| VmError::Internal("self reference already set".to_string()))?;
        Ok(vm)
    }

    /// An owning handle to this VM, for code that outlives the borrow it
    /// was called with (thread spawns).
    pub fn arc(&self) -> Arc<VirtualMachine> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("the VM outlives its threads")
    }

    pub fn method_area_read(&self) -> RwLockReadGuard<'_, MethodArea> {
        self.method_area.read().unwrap()
    }

    pub fn method_area_write(&self) -> RwLockWriteGuard<'_, MethodArea> {
        self.method_area.write().unwrap()
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let finalizer = self.heap.finalizer_mirror();
        if finalizer != crate::heap::JNULL {
            self.monitors.gc_signal(finalizer);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Allocation: always under the global lock, collecting and retrying
    // once before giving up. Repeated failure is fatal.
    // ------------------------------------------------------------------

    fn alloc_with_retry(
        &self,
        thread: &VmThread,
        alloc: impl Fn(&Heap) -> Result<HeapRef, AllocFailure>,
    ) -> Result<HeapRef, VmError> {
        self.threads.lock.lock(&thread.shared);
        let result = match alloc(&self.heap) {
            Ok(r) => Ok(r),
            Err(failure) => {
                gc::collect(self, thread.id, failure.requested);
                alloc(&self.heap).map_err(|_| VmError::OutOfMemory)
            }
        };
        self.threads.lock.unlock(&thread.shared);
        result
    }

    pub fn alloc_instance(
        &self,
        thread: &VmThread,
        class_id: ClassId,
    ) -> Result<HeapRef, VmError> {
        let r = self.alloc_with_retry(thread, |heap| heap.try_alloc_instance(class_id))?;
        // Weak references enter the collector's list the moment they exist.
        if let Ok(crate::heap::ClassShape::Instance { weak_referent: Some(_), .. }) =
            self.heap.shape(class_id)
        {
            self.heap.register_weak_ref(r);
        }
        Ok(r)
    }

    pub fn alloc_primitive_array(
        &self,
        thread: &VmThread,
        class_id: ClassId,
        elem: AllocationType,
        count: i32,
    ) -> Result<HeapRef, VmError> {
        self.alloc_with_retry(thread, |heap| {
            heap.try_alloc_primitive_array(class_id, elem, count)
        })
    }

    pub fn alloc_reference_array(
        &self,
        thread: &VmThread,
        class_id: ClassId,
        count: i32,
    ) -> Result<HeapRef, VmError> {
        self.alloc_with_retry(thread, |heap| heap.try_alloc_reference_array(class_id, count))
    }

    pub fn alloc_raw(&self, thread: &VmThread, bytes: usize) -> Result<usize, VmError> {
        self.alloc_with_retry(thread, |heap| heap.try_alloc_raw(bytes))
    }

    pub fn clone_object(&self, thread: &VmThread, src: HeapRef) -> Result<HeapRef, VmError> {
        self.alloc_with_retry(thread, |heap| heap.try_clone_object(src))
    }

    // ------------------------------------------------------------------
    // Class resolution
    // ------------------------------------------------------------------

    /// Resolves a class by name, loading it on first use. The whole loader
    /// runs under the global lock, so concurrent requests serialize.
    pub fn resolve_class(&self, thread: &VmThread, name: Symbol) -> Result<ClassId, VmError> {
        self.threads.lock.lock(&thread.shared);
        let result = self
            .method_area_write()
            .get_class_id_or_load(&self.heap, name, thread.id);
        let result = result.and_then(|class_id| {
            self.install_string_layout_if_needed(name, class_id, thread.id)?;
            Ok(class_id)
        });
        self.threads.lock.unlock(&thread.shared);
        result
    }

    /// Once java/lang/String links, its layout (and the char array class)
    /// become known to the heap so string construction can work.
    fn install_string_layout_if_needed(
        &self,
        name: Symbol,
        class_id: ClassId,
        thread_id: crate::keys::ThreadId,
    ) -> Result<(), VmError> {
        if name != self.br.java_lang_string_sym || self.heap.string_layout().is_ok() {
            return Ok(());
        }

        let char_array_class_id = {
            let mut ma = self.method_area_write();
            ma.get_class_id_or_load(&self.heap, self.br.char_array_desc, thread_id)?
        };

        let ma = self.method_area_read();
        let string = ma.get_instance_class(&class_id)?;
        let field = |key| {
            string
                .get_instance_field(key)
                .map(|f| f.offset)
                .ok_or(VmError::Unlinked("java/lang/String layout field"))
        };
        let layout = crate::heap::StringLayout {
            class_id,
            char_array_class_id,
            value: field(&self.br.string_value_fk)?,
            offset: field(&self.br.string_offset_fk)?,
            count: field(&self.br.string_count_fk)?,
        };
        drop(ma);
        self.heap.install_string_layout(layout);
        Ok(())
    }

    /// The java.lang.Class mirror of a class, created on first use and
    /// registered as a GC root.
    pub fn class_mirror(&self, thread: &VmThread, class_id: ClassId) -> Result<HeapRef, VmError> {
        {
            let ma = self.method_area_read();
            if let Some(mirror) = ma.get_class(&class_id).get_mirror_ref() {
                return Ok(mirror);
            }
        }

        self.threads.lock.lock(&thread.shared);
        let result = (|| {
            // Re-check under the lock; mirrors are created exactly once.
            {
                let ma = self.method_area_read();
                if let Some(mirror) = ma.get_class(&class_id).get_mirror_ref() {
                    return Ok(mirror);
                }
            }
            let class_class = self.resolve_class(thread, self.br.java_lang_class_sym)?;
            let mirror = self.alloc_instance(thread, class_class)?;
            self.method_area_write().record_mirror(class_id, mirror)?;
            self.heap.register_mirror(mirror);
            Ok(mirror)
        })();
        self.threads.lock.unlock(&thread.shared);
        result
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// The pooled instance for an interned symbol, building it on first
    /// use. `literal` pins the string for the VM lifetime (ldc constants);
    /// plain interning stays weak and is purged with its last reference.
    pub fn intern_string(
        &self,
        thread: &mut VmThread,
        sym: Symbol,
        literal: bool,
    ) -> Result<HeapRef, VmError> {
        if let Some(r) = self.heap.string_pool_get(sym) {
            if literal {
                self.heap.register_literal(r);
            }
            return Ok(r);
        }

        self.threads.lock.lock(&thread.shared);
        let result = (|| {
            if let Some(r) = self.heap.string_pool_get(sym) {
                return Ok(r);
            }
            let text = self.interner.resolve(&sym).to_string();
            let r = self.build_java_string(thread, &text)?;
            self.heap.string_pool_insert(sym, r);
            Ok(r)
        })();
        if let Ok(r) = result {
            if literal {
                self.heap.register_literal(r);
            }
        }
        self.threads.lock.unlock(&thread.shared);
        result
    }

    /// A fresh, unpooled java.lang.String.
    pub fn new_java_string(&self, thread: &mut VmThread, text: &str) -> Result<HeapRef, VmError> {
        self.threads.lock.lock(&thread.shared);
        let result = self.build_java_string(thread, text);
        self.threads.lock.unlock(&thread.shared);
        result
    }

    fn build_java_string(&self, thread: &mut VmThread, text: &str) -> Result<HeapRef, VmError> {
        let layout = self.heap.string_layout()?;
        let units: Vec<u16> = text.encode_utf16().collect();

        let chars = self.alloc_primitive_array(
            thread,
            layout.char_array_class_id,
            AllocationType::Char,
            units.len() as i32,
        )?;
        for (i, unit) in units.iter().enumerate() {
            self.heap
                .write_element(chars, i as i32, Value::Integer(*unit as i32))?;
        }

        // Pin the payload while the string instance allocation may collect.
        thread.roots.push(chars);
        let string = self.alloc_instance(thread, layout.class_id);
        thread.roots.pop();
        let string = string?;

        self.heap
            .write_field(string, layout.value, AllocationType::Reference, Value::Ref(chars))?;
        self.heap
            .write_field(string, layout.offset, AllocationType::Int, Value::Integer(0))?;
        self.heap.write_field(
            string,
            layout.count,
            AllocationType::Int,
            Value::Integer(units.len() as i32),
        )?;
        Ok(string)
    }

    /// Interns deferred String ConstantValue statics of a class about to
    /// initialize.
    pub fn assign_string_constants(
        &self,
        thread: &mut VmThread,
        class_id: ClassId,
    ) -> Result<(), VmError> {
        let pending = self.method_area_write().take_pending_string_constants(class_id);
        for (cell, sym) in pending {
            let r = self.intern_string(thread, sym, true)?;
            self.heap.write_typed(cell.offset, cell.ty, Value::Ref(r))?;
        }
        Ok(())
    }

    /// Explicit collection request (Runtime.gc).
    pub fn request_gc(&self, thread: &VmThread) {
        self.threads.lock.lock(&thread.shared);
        gc::collect(self, thread.id, 0);
        self.threads.lock.unlock(&thread.shared);
    }
}
