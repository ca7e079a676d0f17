//! Test scaffolding: an in-memory class file assembler and a minimal boot
//! library, so the full VM can run without any external class files.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use valka_classfile::mutf8;
use valka_runtime::interpreter::Interpreter;
use valka_runtime::keys::MethodKey;
use valka_runtime::thread::VmThread;
use valka_runtime::vm::{Value, VirtualMachine};
use valka_runtime::{ClassId, VmConfig, VmError};

pub use valka_runtime::translator::opcode::JavaOpcode as J;

// ---------------------------------------------------------------------
// Constant pool builder
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct PoolBuilder {
    entries: Vec<Vec<u8>>,
    index: HashMap<Vec<u8>, u16>,
    slots: u16,
}

impl PoolBuilder {
    fn push(&mut self, bytes: Vec<u8>, wide: bool) -> u16 {
        if let Some(&idx) = self.index.get(&bytes) {
            return idx;
        }
        let idx = self.slots + 1;
        self.index.insert(bytes.clone(), idx);
        self.entries.push(bytes);
        self.slots += if wide { 2 } else { 1 };
        idx
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let encoded = mutf8::encode(s);
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&encoded);
        self.push(bytes, false)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_idx = self.utf8(name);
        let mut bytes = vec![7u8];
        bytes.extend_from_slice(&name_idx.to_be_bytes());
        self.push(bytes, false)
    }

    pub fn string(&mut self, s: &str) -> u16 {
        let value_idx = self.utf8(s);
        let mut bytes = vec![8u8];
        bytes.extend_from_slice(&value_idx.to_be_bytes());
        self.push(bytes, false)
    }

    pub fn integer(&mut self, v: i32) -> u16 {
        let mut bytes = vec![3u8];
        bytes.extend_from_slice(&v.to_be_bytes());
        self.push(bytes, false)
    }

    pub fn long(&mut self, v: i64) -> u16 {
        let mut bytes = vec![5u8];
        bytes.extend_from_slice(&v.to_be_bytes());
        self.push(bytes, true)
    }

    pub fn float(&mut self, v: f32) -> u16 {
        let mut bytes = vec![4u8];
        bytes.extend_from_slice(&v.to_bits().to_be_bytes());
        self.push(bytes, false)
    }

    pub fn double(&mut self, v: f64) -> u16 {
        let mut bytes = vec![6u8];
        bytes.extend_from_slice(&v.to_bits().to_be_bytes());
        self.push(bytes, true)
    }

    fn name_and_type(&mut self, name: &str, desc: &str) -> u16 {
        let name_idx = self.utf8(name);
        let desc_idx = self.utf8(desc);
        let mut bytes = vec![12u8];
        bytes.extend_from_slice(&name_idx.to_be_bytes());
        bytes.extend_from_slice(&desc_idx.to_be_bytes());
        self.push(bytes, false)
    }

    fn member(&mut self, tag: u8, class: &str, name: &str, desc: &str) -> u16 {
        let class_idx = self.class(class);
        let nat_idx = self.name_and_type(name, desc);
        let mut bytes = vec![tag];
        bytes.extend_from_slice(&class_idx.to_be_bytes());
        bytes.extend_from_slice(&nat_idx.to_be_bytes());
        self.push(bytes, false)
    }

    pub fn field_ref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        self.member(9, class, name, desc)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        self.member(10, class, name, desc)
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        self.member(11, class, name, desc)
    }

    fn emit(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.slots + 1).to_be_bytes());
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
        out
    }
}

// ---------------------------------------------------------------------
// Class builder
// ---------------------------------------------------------------------

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

pub struct Handler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// None catches everything.
    pub catch_type: Option<String>,
}

struct MethodSpec {
    flags: u16,
    name: String,
    desc: String,
    code: Option<(u16, u16, Vec<u8>, Vec<Handler>)>,
}

struct FieldSpec {
    flags: u16,
    name: String,
    desc: String,
    constant_string: Option<String>,
}

pub struct ClassBuilder {
    pub pool: PoolBuilder,
    name: String,
    super_name: Option<String>,
    flags: u16,
    interfaces: Vec<String>,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        ClassBuilder {
            pool: PoolBuilder::default(),
            name: name.to_string(),
            super_name: Some(super_name.to_string()),
            flags: ACC_PUBLIC | ACC_SUPER,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Only java/lang/Object goes without a parent.
    pub fn rootless(name: &str) -> Self {
        let mut b = ClassBuilder::new(name, "");
        b.super_name = None;
        b
    }

    pub fn interface(name: &str) -> Self {
        let mut b = ClassBuilder::new(name, "java/lang/Object");
        b.flags = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
        b
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn field(mut self, flags: u16, name: &str, desc: &str) -> Self {
        self.fields.push(FieldSpec {
            flags,
            name: name.to_string(),
            desc: desc.to_string(),
            constant_string: None,
        });
        self
    }

    pub fn string_constant(mut self, name: &str, value: &str) -> Self {
        self.fields.push(FieldSpec {
            flags: ACC_PUBLIC | ACC_STATIC | ACC_FINAL,
            name: name.to_string(),
            desc: "Ljava/lang/String;".to_string(),
            constant_string: Some(value.to_string()),
        });
        self
    }

    pub fn method(
        mut self,
        flags: u16,
        name: &str,
        desc: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Self {
        self.methods.push(MethodSpec {
            flags,
            name: name.to_string(),
            desc: desc.to_string(),
            code: Some((max_stack, max_locals, code, Vec::new())),
        });
        self
    }

    pub fn method_with_handlers(
        mut self,
        flags: u16,
        name: &str,
        desc: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        handlers: Vec<Handler>,
    ) -> Self {
        self.methods.push(MethodSpec {
            flags,
            name: name.to_string(),
            desc: desc.to_string(),
            code: Some((max_stack, max_locals, code, handlers)),
        });
        self
    }

    pub fn native_method(mut self, flags: u16, name: &str, desc: &str) -> Self {
        self.methods.push(MethodSpec {
            flags: flags | ACC_NATIVE,
            name: name.to_string(),
            desc: desc.to_string(),
            code: None,
        });
        self
    }

    pub fn abstract_method(mut self, flags: u16, name: &str, desc: &str) -> Self {
        self.methods.push(MethodSpec {
            flags: flags | ACC_ABSTRACT,
            name: name.to_string(),
            desc: desc.to_string(),
            code: None,
        });
        self
    }

    pub fn build(mut self) -> (String, Vec<u8>) {
        // Intern everything the tables point at before emitting the pool.
        let this_idx = self.pool.class(&self.name);
        let super_idx = match &self.super_name {
            Some(name) => self.pool.class(name),
            None => 0,
        };
        let interface_idxs: Vec<u16> = {
            let interfaces = std::mem::take(&mut self.interfaces);
            interfaces.iter().map(|i| self.pool.class(i)).collect()
        };

        let code_attr_name = self.pool.utf8("Code");
        let constant_value_name = self.pool.utf8("ConstantValue");

        struct EmittedField {
            flags: u16,
            name: u16,
            desc: u16,
            constant: Option<u16>,
        }
        let fields: Vec<EmittedField> = {
            let specs = std::mem::take(&mut self.fields);
            specs
                .into_iter()
                .map(|f| EmittedField {
                    flags: f.flags,
                    name: self.pool.utf8(&f.name),
                    desc: self.pool.utf8(&f.desc),
                    constant: f.constant_string.map(|s| self.pool.string(&s)),
                })
                .collect()
        };

        struct EmittedMethod {
            flags: u16,
            name: u16,
            desc: u16,
            code: Option<(u16, u16, Vec<u8>, Vec<(u16, u16, u16, u16)>)>,
        }
        let methods: Vec<EmittedMethod> = {
            let specs = std::mem::take(&mut self.methods);
            specs
                .into_iter()
                .map(|m| EmittedMethod {
                    flags: m.flags,
                    name: self.pool.utf8(&m.name),
                    desc: self.pool.utf8(&m.desc),
                    code: m.code.map(|(max_stack, max_locals, code, handlers)| {
                        let handlers = handlers
                            .into_iter()
                            .map(|h| {
                                let catch = h
                                    .catch_type
                                    .map(|name| self.pool.class(&name))
                                    .unwrap_or(0);
                                (h.start_pc, h.end_pc, h.handler_pc, catch)
                            })
                            .collect();
                        (max_stack, max_locals, code, handlers)
                    }),
                })
                .collect()
        };

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // minor
        out.extend_from_slice(&48u16.to_be_bytes()); // major (1.4 era)
        out.extend_from_slice(&self.pool.emit());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&this_idx.to_be_bytes());
        out.extend_from_slice(&super_idx.to_be_bytes());

        out.extend_from_slice(&(interface_idxs.len() as u16).to_be_bytes());
        for idx in interface_idxs {
            out.extend_from_slice(&idx.to_be_bytes());
        }

        out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for f in fields {
            out.extend_from_slice(&f.flags.to_be_bytes());
            out.extend_from_slice(&f.name.to_be_bytes());
            out.extend_from_slice(&f.desc.to_be_bytes());
            match f.constant {
                Some(value_idx) => {
                    out.extend_from_slice(&1u16.to_be_bytes());
                    out.extend_from_slice(&constant_value_name.to_be_bytes());
                    out.extend_from_slice(&2u32.to_be_bytes());
                    out.extend_from_slice(&value_idx.to_be_bytes());
                }
                None => out.extend_from_slice(&0u16.to_be_bytes()),
            }
        }

        out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
        for m in methods {
            out.extend_from_slice(&m.flags.to_be_bytes());
            out.extend_from_slice(&m.name.to_be_bytes());
            out.extend_from_slice(&m.desc.to_be_bytes());
            match m.code {
                Some((max_stack, max_locals, code, handlers)) => {
                    out.extend_from_slice(&1u16.to_be_bytes());
                    out.extend_from_slice(&code_attr_name.to_be_bytes());
                    let length = 2 + 2 + 4 + code.len() + 2 + handlers.len() * 8 + 2;
                    out.extend_from_slice(&(length as u32).to_be_bytes());
                    out.extend_from_slice(&max_stack.to_be_bytes());
                    out.extend_from_slice(&max_locals.to_be_bytes());
                    out.extend_from_slice(&(code.len() as u32).to_be_bytes());
                    out.extend_from_slice(&code);
                    out.extend_from_slice(&(handlers.len() as u16).to_be_bytes());
                    for (start, end, target, catch) in handlers {
                        out.extend_from_slice(&start.to_be_bytes());
                        out.extend_from_slice(&end.to_be_bytes());
                        out.extend_from_slice(&target.to_be_bytes());
                        out.extend_from_slice(&catch.to_be_bytes());
                    }
                    out.extend_from_slice(&0u16.to_be_bytes()); // code attrs
                }
                None => out.extend_from_slice(&0u16.to_be_bytes()),
            }
        }

        out.extend_from_slice(&0u16.to_be_bytes()); // class attributes

        (self.name, out)
    }
}

// ---------------------------------------------------------------------
// Bytecode helpers
// ---------------------------------------------------------------------

pub fn op(o: J) -> u8 {
    o as u8
}

pub fn wide_index(o: J, idx: u16) -> Vec<u8> {
    let mut out = vec![J::Wide as u8, o as u8];
    out.extend_from_slice(&idx.to_be_bytes());
    out
}

pub fn with_u16(o: J, operand: u16) -> Vec<u8> {
    let mut out = vec![o as u8];
    out.extend_from_slice(&operand.to_be_bytes());
    out
}

/// `return` as the whole method body.
pub fn empty_body() -> Vec<u8> {
    vec![J::Return as u8]
}

/// `aload_0; invokespecial super.<init>; return` constructor body.
pub fn ctor_body(pool: &mut PoolBuilder, super_name: &str) -> Vec<u8> {
    let super_init = pool.method_ref(super_name, "<init>", "()V");
    let mut code = vec![J::Aload0 as u8];
    code.extend_from_slice(&with_u16(J::Invokespecial, super_init));
    code.push(J::Return as u8);
    code
}

// ---------------------------------------------------------------------
// Boot library
// ---------------------------------------------------------------------

fn throwable() -> (String, Vec<u8>) {
    let mut b = ClassBuilder::new("java/lang/Throwable", "java/lang/Object")
        .field(ACC_PRIVATE, "message", "Ljava/lang/String;");

    let object_init = b.pool.method_ref("java/lang/Object", "<init>", "()V");
    let message_ref = b.pool.field_ref("java/lang/Throwable", "message", "Ljava/lang/String;");

    // <init>()V
    let mut plain = vec![J::Aload0 as u8];
    plain.extend_from_slice(&with_u16(J::Invokespecial, object_init));
    plain.push(J::Return as u8);

    // <init>(Ljava/lang/String;)V
    let mut with_message = vec![J::Aload0 as u8];
    with_message.extend_from_slice(&with_u16(J::Invokespecial, object_init));
    with_message.push(J::Aload0 as u8);
    with_message.push(J::Aload1 as u8);
    with_message.extend_from_slice(&with_u16(J::Putfield, message_ref));
    with_message.push(J::Return as u8);

    // getMessage()Ljava/lang/String;
    let mut get_message = vec![J::Aload0 as u8];
    get_message.extend_from_slice(&with_u16(J::Getfield, message_ref));
    get_message.push(J::Areturn as u8);

    b.method(ACC_PUBLIC, "<init>", "()V", 2, 1, plain)
        .method(ACC_PUBLIC, "<init>", "(Ljava/lang/String;)V", 2, 2, with_message)
        .method(ACC_PUBLIC, "getMessage", "()Ljava/lang/String;", 1, 1, get_message)
        .build()
}

/// A throwable subclass with the two conventional constructors chaining to
/// its parent.
pub fn exception_class(name: &str, super_name: &str) -> (String, Vec<u8>) {
    let mut b = ClassBuilder::new(name, super_name);

    let super_plain = b.pool.method_ref(super_name, "<init>", "()V");
    let super_message = b.pool.method_ref(super_name, "<init>", "(Ljava/lang/String;)V");

    let mut plain = vec![J::Aload0 as u8];
    plain.extend_from_slice(&with_u16(J::Invokespecial, super_plain));
    plain.push(J::Return as u8);

    let mut with_message = vec![J::Aload0 as u8, J::Aload1 as u8];
    with_message.extend_from_slice(&with_u16(J::Invokespecial, super_message));
    with_message.push(J::Return as u8);

    b.method(ACC_PUBLIC, "<init>", "()V", 1, 1, plain)
        .method(ACC_PUBLIC, "<init>", "(Ljava/lang/String;)V", 2, 2, with_message)
        .build()
}

pub fn boot_classes() -> Vec<(String, Vec<u8>)> {
    let mut classes = Vec::new();

    classes.push(
        ClassBuilder::rootless("java/lang/Object")
            .method(ACC_PUBLIC, "<init>", "()V", 0, 1, empty_body())
            .native_method(ACC_PUBLIC, "getClass", "()Ljava/lang/Class;")
            .native_method(ACC_PUBLIC, "hashCode", "()I")
            .native_method(ACC_PUBLIC | ACC_FINAL, "notify", "()V")
            .native_method(ACC_PUBLIC | ACC_FINAL, "notifyAll", "()V")
            .native_method(ACC_PUBLIC | ACC_FINAL, "wait", "(JI)V")
            .build(),
    );

    classes.push(
        ClassBuilder::new("java/lang/Class", "java/lang/Object")
            .native_method(ACC_PUBLIC, "getName", "()Ljava/lang/String;")
            .native_method(ACC_PUBLIC | ACC_STATIC, "forName", "(Ljava/lang/String;)Ljava/lang/Class;")
            .native_method(ACC_PUBLIC, "newInstance", "()Ljava/lang/Object;")
            .native_method(ACC_PUBLIC, "isInterface", "()Z")
            .native_method(ACC_PUBLIC, "isArray", "()Z")
            .build(),
    );

    {
        let mut b = ClassBuilder::new("java/lang/String", "java/lang/Object")
            .field(ACC_PRIVATE, "value", "[C")
            .field(ACC_PRIVATE, "offset", "I")
            .field(ACC_PRIVATE, "count", "I");
        let object_init = b.pool.method_ref("java/lang/Object", "<init>", "()V");
        let mut ctor = vec![J::Aload0 as u8];
        ctor.extend_from_slice(&with_u16(J::Invokespecial, object_init));
        ctor.push(J::Return as u8);
        let count_ref = b.pool.field_ref("java/lang/String", "count", "I");
        let mut length = vec![J::Aload0 as u8];
        length.extend_from_slice(&with_u16(J::Getfield, count_ref));
        length.push(J::Ireturn as u8);
        classes.push(
            b.method(ACC_PUBLIC, "<init>", "()V", 2, 1, ctor)
                .method(ACC_PUBLIC, "length", "()I", 1, 1, length)
                .native_method(ACC_PUBLIC, "intern", "()Ljava/lang/String;")
                .build(),
        );
    }

    {
        let mut b = ClassBuilder::new("java/lang/Thread", "java/lang/Object");
        let object_init = b.pool.method_ref("java/lang/Object", "<init>", "()V");
        let mut ctor = vec![J::Aload0 as u8];
        ctor.extend_from_slice(&with_u16(J::Invokespecial, object_init));
        ctor.push(J::Return as u8);
        classes.push(
            b.method(ACC_PUBLIC, "<init>", "()V", 1, 1, ctor)
                .method(ACC_PUBLIC, "run", "()V", 0, 1, empty_body())
                .native_method(ACC_PUBLIC, "start", "()V")
                .native_method(ACC_PUBLIC | ACC_STATIC, "sleep", "(J)V")
                .native_method(ACC_PUBLIC | ACC_STATIC, "currentThread", "()Ljava/lang/Thread;")
                .native_method(ACC_PUBLIC | ACC_STATIC, "yield", "()V")
                .native_method(ACC_PUBLIC | ACC_FINAL, "join", "()V")
                .native_method(ACC_PUBLIC | ACC_FINAL, "isAlive", "()Z")
                .native_method(ACC_PUBLIC, "interrupt", "()V")
                .build(),
        );
    }

    classes.push(throwable());
    classes.push(exception_class("java/lang/Exception", "java/lang/Throwable"));
    classes.push(exception_class("java/lang/RuntimeException", "java/lang/Exception"));
    classes.push(exception_class("java/lang/Error", "java/lang/Throwable"));
    for name in [
        "java/lang/ArithmeticException",
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/lang/ArrayStoreException",
        "java/lang/ClassCastException",
        "java/lang/IllegalArgumentException",
        "java/lang/IllegalMonitorStateException",
        "java/lang/IllegalThreadStateException",
        "java/lang/NegativeArraySizeException",
        "java/lang/NullPointerException",
    ] {
        classes.push(exception_class(name, "java/lang/RuntimeException"));
    }
    classes.push(exception_class("java/lang/InterruptedException", "java/lang/Exception"));
    classes.push(exception_class("java/lang/ClassNotFoundException", "java/lang/Exception"));
    classes.push(exception_class("java/lang/InstantiationException", "java/lang/Exception"));
    for name in [
        "java/lang/NoClassDefFoundError",
        "java/lang/NoSuchFieldError",
        "java/lang/NoSuchMethodError",
        "java/lang/AbstractMethodError",
        "java/lang/IllegalAccessError",
        "java/lang/IncompatibleClassChangeError",
        "java/lang/ClassFormatError",
        "java/lang/ClassCircularityError",
        "java/lang/UnsatisfiedLinkError",
        "java/lang/VirtualMachineError",
        "java/lang/InternalError",
    ] {
        classes.push(exception_class(name, "java/lang/Error"));
    }

    // java/lang/ref: layout-derived weak references.
    classes.push(
        ClassBuilder::new("java/lang/ref/Reference", "java/lang/Object")
            .field(ACC_PRIVATE, "referent", "Ljava/lang/Object;")
            .method(ACC_PUBLIC, "<init>", "()V", 0, 1, empty_body())
            .build(),
    );
    {
        let mut b = ClassBuilder::new("java/lang/ref/WeakReference", "java/lang/ref/Reference");
        let reference_init = b.pool.method_ref("java/lang/ref/Reference", "<init>", "()V");
        let referent_ref =
            b.pool
                .field_ref("java/lang/ref/Reference", "referent", "Ljava/lang/Object;");

        // <init>(Ljava/lang/Object;)V stores the referent.
        let mut ctor = vec![J::Aload0 as u8];
        ctor.extend_from_slice(&with_u16(J::Invokespecial, reference_init));
        ctor.push(J::Aload0 as u8);
        ctor.push(J::Aload1 as u8);
        ctor.extend_from_slice(&with_u16(J::Putfield, referent_ref));
        ctor.push(J::Return as u8);

        // get()Ljava/lang/Object;
        let mut get = vec![J::Aload0 as u8];
        get.extend_from_slice(&with_u16(J::Getfield, referent_ref));
        get.push(J::Areturn as u8);

        classes.push(
            b.method(ACC_PUBLIC, "<init>", "(Ljava/lang/Object;)V", 2, 2, ctor)
                .method(ACC_PUBLIC, "get", "()Ljava/lang/Object;", 1, 1, get)
                .build(),
        );
    }

    classes
}

// ---------------------------------------------------------------------
// VM harness
// ---------------------------------------------------------------------

pub struct TestVm {
    pub vm: Arc<VirtualMachine>,
    pub thread: Box<VmThread>,
}

pub fn boot_vm(extra_classes: Vec<(String, Vec<u8>)>) -> TestVm {
    let mut preloaded = boot_classes();
    preloaded.extend(extra_classes);

    let config = VmConfig {
        preloaded_classes: preloaded,
        heap_size: 8 * 1024 * 1024,
        enable_finalizer: false,
        ..VmConfig::default()
    };

    let vm = VirtualMachine::new(config).expect("VM construction");
    let thread = vm.threads.new_thread(vm.config.frame_stack_limit);
    vm.threads.register(&thread);

    for sym in [
        vm.br.java_lang_object_sym,
        vm.br.java_lang_string_sym,
        vm.br.java_lang_class_sym,
        vm.br.java_lang_thread_sym,
    ] {
        vm.resolve_class(&thread, sym).expect("bootstrap class");
    }
    vm.heap.enable_collector(true);

    let harness = TestVm { vm, thread };
    let mirror = harness
        .vm
        .alloc_instance(&harness.thread, harness.vm.br.java_lang_thread_id())
        .expect("main thread mirror");
    harness.thread.shared.set_mirror(mirror);
    harness
}

impl TestVm {
    pub fn resolve(&mut self, name: &str) -> Result<ClassId, VmError> {
        let sym = self.vm.interner().get_or_intern(name);
        self.vm.resolve_class(&self.thread, sym)
    }

    pub fn static_method(&mut self, class: &str, name: &str, desc: &str) -> valka_runtime::MethodId {
        let class_id = self.resolve(class).expect("test class resolves");
        let ma = self.vm.method_area_read();
        let key = MethodKey {
            name: ma.interner().get_or_intern(name),
            desc: ma.interner().get_or_intern(desc),
        };
        ma.get_class(&class_id)
            .get_direct_method_id(&key)
            .expect("test method exists")
    }

    /// Runs a static method and hands back its return value.
    pub fn call_static(
        &mut self,
        class: &str,
        name: &str,
        desc: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let method = self.static_method(class, name, desc);
        Interpreter::invoke_static_method(
            &mut self.thread,
            method,
            &self.vm,
            args.into_iter().collect(),
        )
    }

    /// Runs a static method expecting an uncaught Java exception, and
    /// returns the exception's class name in dotted form.
    pub fn call_static_expect_throw(
        &mut self,
        class: &str,
        name: &str,
        desc: &str,
        args: Vec<Value>,
    ) -> String {
        match self.call_static(class, name, desc, args) {
            Err(VmError::JavaExceptionThrown(exception)) => {
                let class_id = self.vm.heap.class_id_of(exception).expect("thrown object");
                let ma = self.vm.method_area_read();
                ma.interner()
                    .resolve(&ma.get_class(&class_id).get_name())
                    .replace('/', ".")
            }
            other => panic!("expected a thrown exception, got {:?}", other.map(|_| ())),
        }
    }
}
