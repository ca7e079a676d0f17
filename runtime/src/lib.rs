//! A compact virtual machine for the CLDC 1.1 profile: bootstrap class
//! loading and linking, a translated-bytecode interpreter, a bitmap-tracked
//! mark-sweep heap with a permanent metadata arena, and Java monitors over
//! one recursive machine-wide lock.

use crate::heap::JNULL;
use crate::interpreter::Interpreter;
use crate::keys::MethodKey;
use crate::vm::{Value, VirtualMachine, throw};
use smallvec::smallvec;
use std::path::PathBuf;
use std::sync::Arc;

pub mod class_loader;
pub mod error;
pub mod heap;
pub mod interpreter;
pub mod jtype;
pub mod keys;
pub mod monitor;
pub mod native;
pub mod rt;
pub mod thread;
pub mod translator;
pub mod vm;

pub use error::VmError;
pub use keys::{ClassId, MethodId, Symbol, ThreadId};

/// Log through tracing's log bridge; keeps call sites terse.
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing_log::log::debug!($($arg)*)
    };
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Internal (slash-separated) name of the class whose main runs.
    pub main_class: String,
    pub main_args: Vec<String>,
    pub class_path: Vec<PathBuf>,
    pub boot_class_path: Vec<PathBuf>,
    /// In-memory class bytes, searched before everything else. Embedders
    /// and tests ship their class library this way.
    pub preloaded_classes: Vec<(String, Vec<u8>)>,
    /// Maximum heap size in bytes; clamped up to the CLDC floor.
    pub heap_size: usize,
    /// Maximum interpreter frame depth per thread.
    pub frame_stack_limit: usize,
    pub enable_finalizer: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            main_class: String::new(),
            main_args: Vec::new(),
            class_path: Vec::new(),
            boot_class_path: Vec::new(),
            preloaded_classes: Vec::new(),
            heap_size: 4 * 1024 * 1024,
            frame_stack_limit: 512,
            enable_finalizer: true,
        }
    }
}

/// Boots a VM, runs `main_class.main(String[])` on the calling thread, and
/// tears the machine down once every spawned thread has finished. The exit
/// code is 1 when main died on an uncaught exception.
pub fn start(config: VmConfig) -> Result<i32, VmError> {
    let vm = VirtualMachine::new(config)?;
    let mut main_thread = vm.threads.new_thread(vm.config.frame_stack_limit);
    vm.threads.register(&main_thread);

    let outcome = boot_and_run(&vm, &mut main_thread);

    vm.begin_shutdown();
    vm.threads.unregister(&main_thread);
    vm.threads.wait_until_only(0);

    match outcome {
        Ok(()) => Ok(0),
        Err(VmError::JavaExceptionThrown(exception)) => {
            eprintln!("Uncaught exception: {}", throw::describe_exception(&vm, exception));
            Ok(1)
        }
        Err(fatal) => Err(fatal),
    }
}

fn boot_and_run(
    vm: &Arc<VirtualMachine>,
    main_thread: &mut thread::VmThread,
) -> Result<(), VmError> {
    // The bootstrap classes land in their fixed table slots before anything
    // else loads; String's resolution also installs the heap's string
    // layout. Collection stays off until the core structures exist.
    for sym in [
        vm.br.java_lang_object_sym,
        vm.br.java_lang_string_sym,
        vm.br.java_lang_class_sym,
        vm.br.java_lang_thread_sym,
    ] {
        vm.resolve_class(main_thread, sym)?;
    }
    vm.heap.enable_collector(true);

    // The main thread gets its java.lang.Thread mirror by hand; it was not
    // started through Thread.start.
    let main_mirror = vm.alloc_instance(main_thread, vm.br.java_lang_thread_id())?;
    main_thread.shared.set_mirror(main_mirror);

    if vm.config.enable_finalizer {
        spawn_finalizer(vm, main_thread)?;
    }

    let main_class_sym = vm
        .interner()
        .get_or_intern(vm.config.main_class.replace('.', "/"));
    let main_class = vm
        .resolve_class(main_thread, main_class_sym)
        .map_err(|_| VmError::MainClassNotFound(vm.config.main_class.clone()))?;

    let main_method = {
        let ma = vm.method_area_read();
        let main_mk = ma.br().main_mk;
        ma.get_class(&main_class)
            .get_direct_method_id(&main_mk)
            .filter(|mid| ma.get_method(mid).is_static())
    }
    .ok_or_else(|| VmError::MainClassNotFound(vm.config.main_class.clone()))?;

    let args_array = build_main_args(vm, main_thread)?;

    Interpreter::invoke_static_method(
        main_thread,
        main_method,
        vm,
        smallvec![Value::Ref(args_array)],
    )?;
    Ok(())
}

fn build_main_args(
    vm: &VirtualMachine,
    thread: &mut thread::VmThread,
) -> Result<crate::heap::HeapRef, VmError> {
    let array_class = vm.resolve_class(thread, vm.br.string_array_desc)?;
    let count = vm.config.main_args.len() as i32;
    let array = vm.alloc_reference_array(thread, array_class, count)?;

    thread.roots.push(array);
    let fill = (|| {
        let arg_syms: Vec<Symbol> = vm
            .config
            .main_args
            .iter()
            .map(|arg| vm.interner().get_or_intern(arg))
            .collect();
        for (i, sym) in arg_syms.into_iter().enumerate() {
            let s = vm.intern_string(thread, sym, false)?;
            vm.heap.write_element(array, i as i32, Value::Ref(s))?;
        }
        Ok(())
    })();
    thread.roots.pop();
    fill.map(|()| array)
}

/// The finalizer thread: parks on its own Thread mirror's monitor until the
/// collector queues work, pops one object at a time, and runs `finalize()`
/// on it outside the monitor. Exceptions from finalizers are swallowed.
fn spawn_finalizer(
    vm: &Arc<VirtualMachine>,
    main_thread: &mut thread::VmThread,
) -> Result<(), VmError> {
    let finalizer_mirror = vm.alloc_instance(main_thread, vm.br.java_lang_thread_id())?;
    vm.heap.set_finalizer_mirror(finalizer_mirror);
    vm.heap.register_mirror(finalizer_mirror);

    let vm_arc = vm.arc();
    std::thread::spawn(move || {
        let mut thread = vm_arc.threads.new_thread(vm_arc.config.frame_stack_limit);
        thread.shared.set_mirror(finalizer_mirror);
        vm_arc.threads.lock.lock(&thread.shared);
        vm_arc.threads.register(&thread);
        vm_arc.threads.lock.unlock(&thread.shared);

        loop {
            vm_arc
                .monitors
                .enter(&vm_arc.threads.lock, &thread.shared, finalizer_mirror);
            let next = loop {
                if vm_arc.is_shutting_down() {
                    break None;
                }
                match vm_arc.heap.take_finalizing() {
                    Some(r) => break Some(r),
                    None => {
                        let woke = vm_arc.monitors.wait(
                            &vm_arc.threads.lock,
                            &thread.shared,
                            finalizer_mirror,
                            0,
                            0,
                        );
                        if woke.is_err() {
                            break None;
                        }
                    }
                }
            };
            vm_arc
                .monitors
                .exit(&vm_arc.threads.lock, &thread.shared, finalizer_mirror);

            let Some(object) = next else { break };
            run_finalizer(&vm_arc, &mut thread, object);
        }

        vm_arc.threads.lock.lock(&thread.shared);
        vm_arc.threads.unregister(&thread);
        vm_arc.threads.lock.unlock(&thread.shared);
    });
    Ok(())
}

fn run_finalizer(vm: &Arc<VirtualMachine>, thread: &mut thread::VmThread, object: heap::HeapRef) {
    if object == JNULL {
        return;
    }
    let finalize = (|| {
        let class_id = vm.heap.class_id_of(object).ok()?;
        let ma = vm.method_area_read();
        let key: MethodKey = ma.br().finalize_mk;
        ma.resolve_method(class_id, &key, false).ok()
    })();
    if let Some(finalize) = finalize {
        let _ = Interpreter::invoke_instance_method(
            thread,
            finalize,
            vm,
            smallvec![Value::Ref(object)],
        );
    }
}
