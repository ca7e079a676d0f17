//! Turning VM-raised exception descriptions into real Java objects on the
//! heap, and reading them back for diagnostics.

use crate::error::{JavaException, VmError};
use crate::heap::HeapRef;
use crate::interpreter::Interpreter;
use crate::jtype::AllocationType;
use crate::keys::MethodKey;
use crate::thread::VmThread;
use crate::vm::{Value, VirtualMachine};
use smallvec::smallvec;

/// Materializes a pending VM exception: resolves its class, allocates an
/// instance, and runs the matching constructor. A missing constructor
/// degrades to the bare instance so minimal class libraries still work.
pub fn materialize_exception(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    ex: JavaException,
) -> Result<HeapRef, VmError> {
    let class_sym = vm.interner().get_or_intern(ex.kind.class_name());
    let class_id = vm.resolve_class(thread, class_sym).map_err(|e| {
        // Failing to build the exception is not recoverable as a Java
        // exception; surface the original problem as a hard fault.
        VmError::Internal(format!(
            "cannot materialize {}: {}",
            ex.kind.class_name(),
            e
        ))
    })?;
    Interpreter::ensure_initialized(thread, class_id, vm)?;

    let instance = vm.alloc_instance(thread, class_id)?;
    thread.roots.push(instance);
    let outcome = run_constructor(vm, thread, instance, class_id, ex);
    thread.roots.pop();
    outcome?;
    Ok(instance)
}

fn run_constructor(
    vm: &VirtualMachine,
    thread: &mut VmThread,
    instance: HeapRef,
    class_id: crate::keys::ClassId,
    ex: JavaException,
) -> Result<(), VmError> {
    let (ctor_name, ctor_desc) = ex.constructor();
    let with_message = ex.message.is_some();

    let key = MethodKey {
        name: vm.interner().get_or_intern(ctor_name),
        desc: vm.interner().get_or_intern(ctor_desc),
    };
    let fallback_key = MethodKey {
        name: key.name,
        desc: vm.br.no_arg_constructor_mk.desc,
    };

    let (ctor, pass_message) = {
        let ma = vm.method_area_read();
        let class = ma.get_class(&class_id);
        match class.get_direct_method_id(&key) {
            Some(mid) => (Some(mid), with_message),
            None => (class.get_direct_method_id(&fallback_key), false),
        }
    };

    let Some(ctor) = ctor else {
        return Ok(());
    };

    let mut args = smallvec![Value::Ref(instance)];
    if pass_message {
        let message = ex
            .message
            .expect("message-bearing constructor without a message")
            .into_resolved(vm.interner());
        let message_ref = vm.new_java_string(thread, &message)?;
        args.push(Value::Ref(message_ref));
    }

    Interpreter::invoke_instance_method(thread, ctor, vm, args)?;
    Ok(())
}

/// One-line rendition of a live exception object for uncaught-exception
/// reports: the dotted class name, plus the message when the class exposes
/// one through the conventional field.
pub fn describe_exception(vm: &VirtualMachine, exception: HeapRef) -> String {
    let mut out = String::new();

    let class_id = match vm.heap.class_id_of(exception) {
        Ok(id) => id,
        Err(_) => return "<corrupt exception reference>".to_string(),
    };
    {
        let ma = vm.method_area_read();
        out.push_str(&ma.interner().resolve(&ma.get_class(&class_id).get_name()).replace('/', "."));
    }

    let message_field = {
        let ma = vm.method_area_read();
        ma.resolve_instance_field(class_id, &vm.br.throwable_message_fk)
            .ok()
            .map(|(_, field)| field.offset)
    };
    if let Some(offset) = message_field {
        if let Ok(Value::Ref(message)) =
            vm.heap.read_field(exception, offset, AllocationType::Reference)
        {
            if let Ok(text) = vm.heap.java_string_to_rust(message) {
                out.push_str(": ");
                out.push_str(&text);
            }
        }
    }
    out
}
