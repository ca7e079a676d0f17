//! Natives of the java.lang core: Object, Class, String, System, Runtime,
//! Thread, Throwable and the float bit twiddlers.

use crate::error::VmError;
use crate::heap::JNULL;
use crate::interpreter::Interpreter;
use crate::native::NativeRegistry;
use crate::rt::RuntimeClass;
use crate::thread::VmThread;
use crate::vm::{Value, VirtualMachine, throw};
use crate::{build_exception, throw_exception};
use lasso::ThreadedRodeo;
use smallvec::smallvec;
use std::sync::{Arc, Condvar};

pub(super) fn register(registry: &mut NativeRegistry, interner: &ThreadedRodeo) {
    let object = "java/lang/Object";
    registry.register(interner, object, "getClass", "()Ljava/lang/Class;", object_get_class);
    registry.register(interner, object, "hashCode", "()I", object_hash_code);
    registry.register(interner, object, "notify", "()V", object_notify);
    registry.register(interner, object, "notifyAll", "()V", object_notify_all);
    registry.register(interner, object, "wait", "(JI)V", object_wait);
    registry.register(interner, object, "wait", "(J)V", object_wait);
    registry.register(interner, object, "wait", "()V", object_wait);
    registry.register(interner, object, "clone", "()Ljava/lang/Object;", object_clone);

    let class = "java/lang/Class";
    registry.register(interner, class, "getName", "()Ljava/lang/String;", class_get_name);
    registry.register(
        interner,
        class,
        "forName",
        "(Ljava/lang/String;)Ljava/lang/Class;",
        class_for_name,
    );
    registry.register(interner, class, "newInstance", "()Ljava/lang/Object;", class_new_instance);
    registry.register(interner, class, "isInterface", "()Z", class_is_interface);
    registry.register(interner, class, "isArray", "()Z", class_is_array);

    let string = "java/lang/String";
    registry.register(interner, string, "intern", "()Ljava/lang/String;", string_intern);

    let system = "java/lang/System";
    registry.register(interner, system, "currentTimeMillis", "()J", system_current_time_millis);
    registry.register(
        interner,
        system,
        "arraycopy",
        "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        system_arraycopy,
    );
    registry.register(
        interner,
        system,
        "identityHashCode",
        "(Ljava/lang/Object;)I",
        system_identity_hash_code,
    );

    let runtime = "java/lang/Runtime";
    registry.register(interner, runtime, "freeMemory", "()J", runtime_free_memory);
    registry.register(interner, runtime, "totalMemory", "()J", runtime_total_memory);
    registry.register(interner, runtime, "gc", "()V", runtime_gc);
    registry.register(interner, runtime, "exit", "(I)V", runtime_exit);

    let thread = "java/lang/Thread";
    registry.register(
        interner,
        thread,
        "currentThread",
        "()Ljava/lang/Thread;",
        thread_current_thread,
    );
    registry.register(interner, thread, "start", "()V", thread_start);
    registry.register(interner, thread, "yield", "()V", thread_yield);
    registry.register(interner, thread, "sleep", "(J)V", thread_sleep);
    registry.register(interner, thread, "interrupt", "()V", thread_interrupt);
    registry.register(interner, thread, "isAlive", "()Z", thread_is_alive);
    registry.register(interner, thread, "join", "()V", thread_join);
    registry.register(interner, thread, "activeCount", "()I", thread_active_count);

    let throwable = "java/lang/Throwable";
    registry.register(interner, throwable, "printStackTrace", "()V", throwable_print);
    registry.register(
        interner,
        throwable,
        "fillInStackTrace",
        "()Ljava/lang/Throwable;",
        throwable_fill_in_stack_trace,
    );

    let float = "java/lang/Float";
    registry.register(interner, float, "floatToIntBits", "(F)I", float_to_int_bits);
    registry.register(interner, float, "intBitsToFloat", "(I)F", int_bits_to_float);

    let double = "java/lang/Double";
    registry.register(interner, double, "doubleToLongBits", "(D)J", double_to_long_bits);
    registry.register(interner, double, "longBitsToDouble", "(J)D", long_bits_to_double);
}

// ---------------------------------------------------------------------
// java.lang.Object
// ---------------------------------------------------------------------

fn object_get_class(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let receiver = args[0].as_obj_ref()?;
    let class_id = vm.heap.class_id_of(receiver)?;
    let mirror = vm.class_mirror(thread, class_id)?;
    Ok(Some(Value::Ref(mirror)))
}

/// Identity hash: objects never move, so the heap offset works.
fn object_hash_code(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Integer(args[0].as_obj_ref()? as i32)))
}

fn object_notify(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let receiver = args[0].as_obj_ref()?;
    if !vm.monitors.notify(&vm.threads.lock, &thread.shared, receiver, false) {
        throw_exception!(IllegalMonitorStateException)?
    }
    Ok(None)
}

fn object_notify_all(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let receiver = args[0].as_obj_ref()?;
    if !vm.monitors.notify(&vm.threads.lock, &thread.shared, receiver, true) {
        throw_exception!(IllegalMonitorStateException)?
    }
    Ok(None)
}

fn object_wait(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let receiver = args[0].as_obj_ref()?;
    let millis = if args.len() > 1 { args[1].as_long()? } else { 0 };
    let nanos = if args.len() > 2 { args[2].as_int()? } else { 0 };
    if millis < 0 || !(0..1_000_000).contains(&nanos) {
        throw_exception!(IllegalArgumentException, "timeout out of range")?
    }
    if !vm
        .monitors
        .wait(&vm.threads.lock, &thread.shared, receiver, millis, nanos)?
    {
        throw_exception!(IllegalMonitorStateException)?
    }
    Ok(None)
}

fn object_clone(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let receiver = args[0].as_obj_ref()?;
    let copy = vm.clone_object(thread, receiver)?;
    Ok(Some(Value::Ref(copy)))
}

// ---------------------------------------------------------------------
// java.lang.Class
// ---------------------------------------------------------------------

fn mirror_class_id(
    vm: &VirtualMachine,
    mirror: Value,
) -> Result<crate::keys::ClassId, VmError> {
    let mirror = mirror.as_obj_ref()?;
    let ma = vm.method_area_read();
    ma.get_class_id_by_mirror(&mirror)
        .ok_or_else(|| VmError::Internal("mirror without a class".to_string()))
}

fn class_get_name(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let class_id = mirror_class_id(vm, args[0])?;
    let dotted = {
        let ma = vm.method_area_read();
        ma.interner().resolve(&ma.get_class(&class_id).get_name()).replace('/', ".")
    };
    let sym = vm.interner().get_or_intern(&dotted);
    let name = vm.intern_string(thread, sym, false)?;
    Ok(Some(Value::Ref(name)))
}

fn class_for_name(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let name_ref = args[0].as_obj_ref()?;
    let dotted = vm.heap.java_string_to_rust(name_ref)?;
    let internal = dotted.replace('.', "/");
    let sym = vm.interner().get_or_intern(&internal);

    let class_id = vm
        .resolve_class(thread, sym)
        .map_err(|_| build_exception!(ClassNotFoundException, dotted))?;
    Interpreter::ensure_initialized(thread, class_id, vm)?;
    let mirror = vm.class_mirror(thread, class_id)?;
    Ok(Some(Value::Ref(mirror)))
}

fn class_new_instance(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let class_id = mirror_class_id(vm, args[0])?;

    let constructor = {
        let ma = vm.method_area_read();
        let class = ma.get_class(&class_id);
        if class.is_interface() || class.is_array() {
            None
        } else if class
            .as_class_like()
            .map(|c| c.flags().is_abstract())
            .unwrap_or(true)
        {
            None
        } else {
            class.get_direct_method_id(&ma.br().no_arg_constructor_mk)
        }
    };
    let Some(constructor) = constructor else {
        return throw_exception!(InstantiationException, "no accessible no-arg constructor");
    };

    Interpreter::ensure_initialized(thread, class_id, vm)?;
    let instance = vm.alloc_instance(thread, class_id)?;
    thread.roots.push(instance);
    let outcome = Interpreter::invoke_instance_method(
        thread,
        constructor,
        vm,
        smallvec![Value::Ref(instance)],
    );
    thread.roots.pop();
    outcome?;
    Ok(Some(Value::Ref(instance)))
}

fn class_is_interface(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let class_id = mirror_class_id(vm, args[0])?;
    let ma = vm.method_area_read();
    Ok(Some(Value::Integer(ma.get_class(&class_id).is_interface() as i32)))
}

fn class_is_array(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let class_id = mirror_class_id(vm, args[0])?;
    let ma = vm.method_area_read();
    Ok(Some(Value::Integer(ma.get_class(&class_id).is_array() as i32)))
}

// ---------------------------------------------------------------------
// java.lang.String
// ---------------------------------------------------------------------

fn string_intern(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let receiver = args[0].as_obj_ref()?;
    let text = vm.heap.java_string_to_rust(receiver)?;
    let sym = vm.interner().get_or_intern(&text);

    // An existing pool entry wins; otherwise this instance becomes it.
    if let Some(pooled) = vm.heap.string_pool_get(sym) {
        return Ok(Some(Value::Ref(pooled)));
    }
    vm.threads.lock.lock(&thread.shared);
    let winner = match vm.heap.string_pool_get(sym) {
        Some(pooled) => pooled,
        None => {
            vm.heap.string_pool_insert(sym, receiver);
            receiver
        }
    };
    vm.threads.lock.unlock(&thread.shared);
    Ok(Some(Value::Ref(winner)))
}

// ---------------------------------------------------------------------
// java.lang.System / Runtime
// ---------------------------------------------------------------------

fn system_current_time_millis(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    _args: &[Value],
) -> Result<Option<Value>, VmError> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| VmError::Internal("clock before the epoch".to_string()))?;
    Ok(Some(Value::Long(now.as_millis() as i64)))
}

fn system_identity_hash_code(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    match args[0] {
        Value::Null => Ok(Some(Value::Integer(0))),
        other => Ok(Some(Value::Integer(other.as_obj_ref()? as i32))),
    }
}

fn system_arraycopy(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let src = args[0].as_obj_ref()?;
    let src_pos = args[1].as_int()?;
    let dst = args[2].as_obj_ref()?;
    let dst_pos = args[3].as_int()?;
    let length = args[4].as_int()?;

    let (src_shape, dst_shape) = {
        if !vm.heap.is_array(src)? || !vm.heap.is_array(dst)? {
            throw_exception!(ArrayStoreException, "arraycopy of a non-array")?
        }
        (vm.heap.shape(vm.heap.class_id_of(src)?)?, vm.heap.shape(vm.heap.class_id_of(dst)?)?)
    };

    let src_len = vm.heap.array_length(src)?;
    let dst_len = vm.heap.array_length(dst)?;
    if src_pos < 0
        || dst_pos < 0
        || length < 0
        || src_pos.checked_add(length).is_none_or(|end| end > src_len)
        || dst_pos.checked_add(length).is_none_or(|end| end > dst_len)
    {
        throw_exception!(ArrayIndexOutOfBoundsException, "arraycopy range out of bounds")?
    }

    use crate::heap::ClassShape;
    match (src_shape, dst_shape) {
        (ClassShape::PrimitiveArray(a), ClassShape::PrimitiveArray(b)) if a == b => {
            vm.heap.copy_primitive_elements(
                src,
                src_pos as usize,
                dst,
                dst_pos as usize,
                length as usize,
            )?;
        }
        (ClassShape::ReferenceArray, ClassShape::ReferenceArray) => {
            // Per-element assignability against the destination's element
            // class.
            let dst_element = {
                let ma = vm.method_area_read();
                match ma.get_class(&vm.heap.class_id_of(dst)?) {
                    RuntimeClass::InstanceArray(a) => a.element_class_id,
                    _ => return Err(VmError::Internal("reference array without element".to_string())),
                }
            };
            for i in 0..length {
                let value = vm.heap.read_element(src, src_pos + i)?;
                if let Value::Ref(r) = value {
                    let source_class = vm.heap.class_id_of(r)?;
                    let ma = vm.method_area_read();
                    if !ma.is_assignable_from(dst_element, source_class) {
                        drop(ma);
                        throw_exception!(ArrayStoreException, "incompatible element")?
                    }
                }
                vm.heap.write_element(dst, dst_pos + i, value)?;
            }
        }
        _ => throw_exception!(ArrayStoreException, "mismatched array types")?,
    }
    Ok(None)
}

fn runtime_free_memory(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    _args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Long(vm.heap.free_memory() as i64)))
}

fn runtime_total_memory(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    _args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Long(vm.heap.total_memory() as i64)))
}

fn runtime_gc(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    _args: &[Value],
) -> Result<Option<Value>, VmError> {
    vm.request_gc(thread);
    Ok(None)
}

fn runtime_exit(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    std::process::exit(args[1].as_int()?);
}

// ---------------------------------------------------------------------
// java.lang.Thread
// ---------------------------------------------------------------------

fn thread_current_thread(
    _vm: &VirtualMachine,
    thread: &mut VmThread,
    _args: &[Value],
) -> Result<Option<Value>, VmError> {
    let mirror = thread.shared.mirror();
    if mirror == JNULL {
        return Err(VmError::Internal("current thread has no mirror".to_string()));
    }
    Ok(Some(Value::Ref(mirror)))
}

/// Thread.start: resolve the target's run() up front, then hand the mirror
/// to a fresh native thread. The parent blocks until the child has
/// registered itself, so the child is observable (isAlive, join) by the
/// time start returns.
fn thread_start(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let mirror = args[0].as_obj_ref()?;
    if vm.threads.find_by_mirror(mirror).is_some() {
        throw_exception!(IllegalThreadStateException, "thread already started")?
    }

    let run_method = {
        let class_id = vm.heap.class_id_of(mirror)?;
        let ma = vm.method_area_read();
        let run_mk = ma.br().run_mk;
        ma.resolve_method(class_id, &run_mk, false)?
    };

    let vm_arc = vm.arc();
    let started = Arc::new(Condvar::new());
    let started_child = started.clone();

    vm.threads.lock.lock(&thread.shared);
    std::thread::spawn(move || {
        run_java_thread(vm_arc, mirror, run_method, started_child);
    });
    while vm.threads.find_by_mirror(mirror).is_none() {
        vm.threads.lock.wait_on(&thread.shared, &started, None);
    }
    vm.threads.lock.unlock(&thread.shared);
    Ok(None)
}

fn run_java_thread(
    vm: Arc<VirtualMachine>,
    mirror: crate::heap::HeapRef,
    run_method: crate::keys::MethodId,
    started: Arc<Condvar>,
) {
    let mut thread = vm.threads.new_thread(vm.config.frame_stack_limit);
    thread.shared.set_mirror(mirror);

    vm.threads.lock.lock(&thread.shared);
    vm.threads.register(&thread);
    started.notify_all();
    vm.threads.lock.unlock(&thread.shared);

    let result = Interpreter::invoke_instance_method(
        &mut thread,
        run_method,
        &vm,
        smallvec![Value::Ref(mirror)],
    );
    match result {
        Ok(_) => {}
        Err(VmError::JavaExceptionThrown(exception)) => {
            eprintln!(
                "Uncaught exception in thread: {}",
                throw::describe_exception(&vm, exception)
            );
        }
        Err(e) => {
            eprintln!("Thread died on a VM fault: {}", e.into_pretty_string(vm.interner()));
        }
    }

    vm.threads.lock.lock(&thread.shared);
    vm.threads.unregister(&thread);
    vm.threads.lock.unlock(&thread.shared);
}

fn thread_yield(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    _args: &[Value],
) -> Result<Option<Value>, VmError> {
    std::thread::yield_now();
    Ok(None)
}

fn thread_sleep(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let millis = args[0].as_long()?;
    if millis < 0 {
        throw_exception!(IllegalArgumentException, "negative sleep")?
    }
    vm.threads.sleep(thread, millis, 0)?;
    Ok(None)
}

fn thread_interrupt(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let mirror = args[0].as_obj_ref()?;
    if let Some(target) = vm.threads.find_by_mirror(mirror) {
        vm.threads.interrupt(&thread.shared, &target);
    }
    Ok(None)
}

fn thread_is_alive(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let mirror = args[0].as_obj_ref()?;
    let alive = vm
        .threads
        .find_by_mirror(mirror)
        .map(|shared| shared.is_alive())
        .unwrap_or(false);
    Ok(Some(Value::Integer(alive as i32)))
}

fn thread_join(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let mirror = args[0].as_obj_ref()?;
    if let Some(target) = vm.threads.find_by_mirror(mirror) {
        vm.threads.join(thread, &target)?;
    }
    Ok(None)
}

fn thread_active_count(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    _args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Integer(vm.threads.active_count() as i32)))
}

// ---------------------------------------------------------------------
// java.lang.Throwable
// ---------------------------------------------------------------------

fn throwable_print(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let receiver = args[0].as_obj_ref()?;
    eprintln!("{}", throw::describe_exception(vm, receiver));
    Ok(None)
}

/// Stack traces are not recorded; the chained-call contract still holds.
fn throwable_fill_in_stack_trace(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(args[0]))
}

// ---------------------------------------------------------------------
// java.lang.Float / Double
// ---------------------------------------------------------------------

fn float_to_int_bits(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Integer(args[0].as_float()?.to_bits() as i32)))
}

fn int_bits_to_float(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Float(f32::from_bits(args[0].as_int()? as u32))))
}

fn double_to_long_bits(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Long(args[0].as_double()?.to_bits() as i64)))
}

fn long_bits_to_double(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    Ok(Some(Value::Double(f64::from_bits(args[0].as_long()? as u64))))
}
