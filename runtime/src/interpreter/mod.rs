use crate::error::VmError;
use crate::heap::HeapRef;
use crate::interpreter::handlers::Flow;
use crate::keys::{ClassId, MethodId};
use crate::rt::method::{Method, MethodBody, TranslatedCode};
use crate::rt::ClassState;
use crate::thread::VmThread;
use crate::translator::opcode::Op;
use crate::translator::{self, TranslationInput};
use crate::vm::stack::{FrameType, JavaFrame, NativeFrame};
use crate::vm::{Value, VirtualMachine};
use crate::{build_exception, throw_exception};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing_log::log::warn;
use valka_classfile::method::ExceptionTableEntry;

pub mod handlers;
mod linker;

pub struct Interpreter;

impl Interpreter {
    /// Runs one method's translated code to completion in the current
    /// thread. Nested invocations recurse through the host call stack;
    /// exceptions unwind frame by frame through the error path.
    fn interpret_method(
        thread: &mut VmThread,
        method_id: MethodId,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, VmError> {
        let code = Self::translated_code(thread, method_id, vm)?;

        loop {
            let pc = thread.stack.pc()?;
            // The buffer lives in a raw heap chunk and never moves; prelink
            // rewrites happen in place under the VM lock and are observed
            // by re-reading the slice on the next dispatch.
            let bytes = vm.heap.raw_slice(code.code_off, code.code_len);
            let op = Op::try_from(bytes[pc]).map_err(|_| {
                VmError::Internal(format!("undecodable internal opcode {}", bytes[pc]))
            })?;

            let step = handlers::interpret_instruction(thread, vm, &code, bytes, op, pc);
            match step {
                Ok(Flow::Advance(size)) => {
                    thread.stack.cur_java_frame_mut()?.increment_pc(size);
                }
                Ok(Flow::Jump(target)) => {
                    *thread.stack.pc_mut()? = target;
                }
                // A prelink opcode was rewritten in place; dispatch again at
                // the same pc to run the resolved form.
                Ok(Flow::Stay) => {}
                Ok(Flow::Return(value)) => return Ok(value),
                Err(e) => {
                    let exception = match e {
                        VmError::JavaException(ex) => {
                            crate::vm::throw::materialize_exception(vm, thread, ex)?
                        }
                        VmError::JavaExceptionThrown(r) => r,
                        // Resource exhaustion and internal faults are fatal,
                        // not representable as Java exceptions.
                        fatal => return Err(fatal),
                    };
                    thread.exception = Some(exception);

                    if !Self::find_exception_handler(vm, &code, exception, thread)? {
                        // A failed monitor release on the way out replaces
                        // the exception being delivered.
                        let superseding =
                            Self::release_synchronized_on_unwind(vm, thread, &code, method_id)?;
                        let propagated = superseding.unwrap_or(exception);
                        thread.exception = Some(propagated);
                        thread.stack.pop_java_frame()?;
                        return Err(VmError::JavaExceptionThrown(propagated));
                    }
                }
            }
        }
    }

    /// Scans the current method's handler table for one covering the
    /// faulting pc whose catch type is the thrown class or a parent of it.
    /// On a hit the operand stack is cut down to the exception reference
    /// and execution resumes at the handler.
    fn find_exception_handler(
        vm: &VirtualMachine,
        code: &TranslatedCode,
        exception: HeapRef,
        thread: &mut VmThread,
    ) -> Result<bool, VmError> {
        let pc = thread.stack.pc()?;

        for entry in code.handlers.iter() {
            if pc < entry.start_pc as usize || pc >= entry.end_pc as usize {
                continue;
            }
            if Self::handler_matches(vm, thread, entry, exception)? {
                let frame = thread.stack.cur_java_frame_mut()?;
                frame.truncate_operands();
                *frame.pc_mut() = entry.handler_pc as usize;
                thread.stack.push_operand(Value::Ref(exception))?;
                thread.exception = None;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handler_matches(
        vm: &VirtualMachine,
        thread: &mut VmThread,
        entry: &ExceptionTableEntry,
        exception: HeapRef,
    ) -> Result<bool, VmError> {
        if entry.catch_type == 0 {
            return Ok(true);
        }

        let exception_class = vm.heap.class_id_of(exception)?;
        let frame_class = thread.stack.cur_java_frame()?.class_id();
        let catch_sym = {
            let ma = vm.method_area_read();
            ma.get_cp_arc(&frame_class)?.get_class_sym(entry.catch_type)?
        };
        let ma = vm.method_area_read();
        Ok(ma.instance_of(exception_class, catch_sym))
    }

    /// A synchronized method unwinding abnormally still owes a monitor
    /// release; failing that release supersedes the in-flight exception
    /// with IllegalMonitorStateException, returned here for delivery.
    fn release_synchronized_on_unwind(
        vm: &VirtualMachine,
        thread: &mut VmThread,
        code: &TranslatedCode,
        method_id: MethodId,
    ) -> Result<Option<HeapRef>, VmError> {
        if code.sync_shift == 0 {
            return Ok(None);
        }
        let is_static = {
            let ma = vm.method_area_read();
            ma.get_method(&method_id).is_static()
        };
        let monitor_ref = if is_static {
            let class_id = thread.stack.cur_java_frame()?.class_id();
            vm.class_mirror(thread, class_id)?
        } else {
            thread.stack.cur_java_frame()?.get_local(0)?.as_obj_ref()?
        };
        if vm
            .monitors
            .exit(&vm.threads.lock, &thread.shared, monitor_ref)
        {
            return Ok(None);
        }
        let superseding = crate::vm::throw::materialize_exception(
            vm,
            thread,
            crate::error::JavaException::new(
                crate::error::JavaExceptionKind::IllegalMonitorStateException,
            ),
        )?;
        Ok(Some(superseding))
    }

    /// Fetches a method's translated code, running the translator on first
    /// use. The one-shot transition happens under the global VM lock; a
    /// concurrent caller blocks there and then reads the cached form.
    fn translated_code(
        thread: &mut VmThread,
        method_id: MethodId,
        vm: &VirtualMachine,
    ) -> Result<TranslatedCode, VmError> {
        {
            let ma = vm.method_area_read();
            if let Some(code) = ma.get_method(&method_id).cached_code()? {
                return Ok(code);
            }
        }

        let method = {
            let ma = vm.method_area_read();
            ma.get_method_arc(&method_id)
        };
        let cp = {
            let ma = vm.method_area_read();
            ma.get_cp_by_method_id(&method_id)?
        };

        vm.threads.lock.lock(&thread.shared);
        let result = Self::translate_locked(thread, &method, &cp, vm);
        vm.threads.lock.unlock(&thread.shared);
        result
    }

    fn translate_locked(
        thread: &mut VmThread,
        method: &Arc<Method>,
        cp: &crate::rt::constant_pool::RuntimeConstantPool,
        vm: &VirtualMachine,
    ) -> Result<TranslatedCode, VmError> {
        // Someone may have completed the translation while this thread was
        // waiting on the lock.
        if let Some(code) = method.cached_code()? {
            return Ok(code);
        }

        let (raw, handlers) = method
            .take_raw_code()
            .ok_or_else(|| VmError::Internal("raw bytecode vanished".to_string()))?;
        let (max_stack, max_locals) = method.frame_attributes()?;

        let (translated, handlers) = translator::translate(TranslationInput {
            code: &raw,
            handlers: &handlers,
            max_locals,
            cp,
            synchronized: method.is_synchronized(),
            is_static: method.is_static(),
        })?;

        // The code buffer becomes a raw chunk on the GC heap, rewritten in
        // place by prelinking and freed only if this is a purged <clinit>.
        let code_off = vm.alloc_raw(thread, translated.len())?;
        vm.heap
            .raw_slice_mut(code_off, translated.len())
            .copy_from_slice(&translated);

        let code = TranslatedCode {
            code_off,
            code_len: translated.len(),
            max_stack,
            max_locals,
            sync_shift: method.is_synchronized() as u8,
            handlers: handlers.into(),
        };
        method.install_code(code.clone());
        Ok(code)
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Pops an invocation's argument window off the caller's operand stack,
    /// receiver first in the result.
    pub(crate) fn pop_args(
        thread: &mut VmThread,
        count: usize,
    ) -> Result<SmallVec<[Value; 8]>, VmError> {
        let mut args: SmallVec<[Value; 8]> = SmallVec::with_capacity(count);
        for _ in 0..count {
            args.push(thread.stack.pop_operand()?);
        }
        args.reverse();
        Ok(args)
    }

    pub fn invoke_method_core(
        thread: &mut VmThread,
        method_id: MethodId,
        args: SmallVec<[Value; 8]>,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, VmError> {
        let method = {
            let ma = vm.method_area_read();
            ma.get_method_arc(&method_id)
        };

        match &method.body {
            MethodBody::Abstract => {
                throw_exception!(AbstractMethodError, "invoking an abstract method")
            }
            MethodBody::Native(_) => {
                Self::invoke_native_method(thread, &method, method_id, args, vm)
            }
            MethodBody::Interpreted(_) => {
                Self::invoke_java_method(thread, &method, method_id, args, vm)
            }
        }
    }

    fn invoke_java_method(
        thread: &mut VmThread,
        method: &Arc<Method>,
        method_id: MethodId,
        args: SmallVec<[Value; 8]>,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, VmError> {
        let (max_stack, max_locals) = method.frame_attributes()?;
        let frame = JavaFrame::new(method_id, method.class_id(), max_stack, max_locals, &args);
        thread.stack.push_frame(FrameType::Java(frame))?;

        // An unhandled exception pops the frame inside interpret_method.
        let result = Self::interpret_method(thread, method_id, vm)?;
        thread.stack.pop_java_frame()?;
        Ok(result)
    }

    fn invoke_native_method(
        thread: &mut VmThread,
        method: &Arc<Method>,
        method_id: MethodId,
        args: SmallVec<[Value; 8]>,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, VmError> {
        let native = match method.native_fn() {
            Some(f) => f,
            None => {
                // Looked up once and cached in the method body.
                let key = {
                    let ma = vm.method_area_read();
                    ma.build_fully_qualified_native_method_key(&method_id)
                };
                let f = vm.native_registry.get(&key).ok_or_else(|| {
                    let ma = vm.method_area_read();
                    build_exception!(
                        UnsatisfiedLinkError,
                        "{}.{}",
                        ma.interner().resolve(&key.class),
                        ma.interner().resolve(&key.name)
                    )
                })?;
                method.set_native_fn(f);
                f
            }
        };

        // A synchronized native holds the receiver's monitor (the class
        // mirror for a static one) across the call.
        let monitor_ref = if method.is_synchronized() {
            let r = if method.is_static() {
                vm.class_mirror(thread, method.class_id())?
            } else {
                args[0].as_obj_ref()?
            };
            vm.monitors.enter(&vm.threads.lock, &thread.shared, r);
            Some(r)
        } else {
            None
        };

        let result = match thread
            .stack
            .push_frame(FrameType::Native(NativeFrame::new(method_id)))
        {
            Ok(()) => {
                let result = native(vm, thread, &args);
                thread.stack.pop_native_frame()?;
                result
            }
            Err(overflow) => Err(overflow),
        };

        if let Some(r) = monitor_ref {
            vm.monitors.exit(&vm.threads.lock, &thread.shared, r);
        }

        if let Err(e) = &result {
            warn!("native method raised: {}", e);
        }
        result
    }

    fn invoke_and_push(
        thread: &mut VmThread,
        method_id: MethodId,
        args: SmallVec<[Value; 8]>,
        vm: &VirtualMachine,
    ) -> Result<(), VmError> {
        if let Some(value) = Self::invoke_method_core(thread, method_id, args, vm)? {
            thread.stack.push_operand(value)?;
        }
        Ok(())
    }

    /// Entry point for running a resolved method from native code or the
    /// VM itself (thread bodies, finalizers, constructors).
    pub fn invoke_instance_method(
        thread: &mut VmThread,
        method_id: MethodId,
        vm: &VirtualMachine,
        args: SmallVec<[Value; 8]>,
    ) -> Result<Option<Value>, VmError> {
        Self::invoke_method_core(thread, method_id, args, vm)
    }

    pub fn invoke_static_method(
        thread: &mut VmThread,
        method_id: MethodId,
        vm: &VirtualMachine,
        args: SmallVec<[Value; 8]>,
    ) -> Result<Option<Value>, VmError> {
        let class_id = {
            let ma = vm.method_area_read();
            ma.get_method(&method_id).class_id()
        };
        Self::ensure_initialized(thread, class_id, vm)?;
        Self::invoke_method_core(thread, method_id, args, vm)
    }

    // ------------------------------------------------------------------
    // Class initialization
    // ------------------------------------------------------------------

    /// The `<clinit>` protocol: the first thread to need the class runs the
    /// initializer while other requesters wait on the class mirror's
    /// monitor; re-entry by the initializing thread returns immediately.
    pub fn ensure_initialized(
        thread: &mut VmThread,
        class_id: ClassId,
        vm: &VirtualMachine,
    ) -> Result<(), VmError> {
        {
            let ma = vm.method_area_read();
            let class = ma.get_class(&class_id);
            let class_like = match class.as_class_like() {
                Ok(c) => c,
                // Array classes carry no initializer.
                Err(_) => return Ok(()),
            };
            if class_like.state() == ClassState::Initialized {
                return Ok(());
            }
        }

        let mirror = vm.class_mirror(thread, class_id)?;
        vm.monitors.enter(&vm.threads.lock, &thread.shared, mirror);

        loop {
            let (state, init_thread) = {
                let ma = vm.method_area_read();
                let class_like = ma.get_class_like(&class_id)?;
                (class_like.state(), class_like.init_thread())
            };
            match state {
                ClassState::Initialized => {
                    vm.monitors.exit(&vm.threads.lock, &thread.shared, mirror);
                    return Ok(());
                }
                ClassState::Erroneous => {
                    vm.monitors.exit(&vm.threads.lock, &thread.shared, mirror);
                    return throw_exception!(
                        NoClassDefFoundError,
                        "class failed initialization"
                    );
                }
                ClassState::Initializing => {
                    if init_thread == Some(thread.id) {
                        // Recursive request from the initializer itself.
                        vm.monitors.exit(&vm.threads.lock, &thread.shared, mirror);
                        return Ok(());
                    }
                    vm.monitors
                        .wait(&vm.threads.lock, &thread.shared, mirror, 0, 0)?;
                }
                ClassState::Linked => break,
                other => {
                    vm.monitors.exit(&vm.threads.lock, &thread.shared, mirror);
                    return Err(VmError::Internal(format!(
                        "initialization request in state {:?}",
                        other
                    )));
                }
            }
        }

        {
            let ma = vm.method_area_read();
            let class_like = ma.get_class_like(&class_id)?;
            class_like.set_state(ClassState::Initializing);
            class_like.set_init_thread(Some(thread.id));
        }
        vm.monitors.exit(&vm.threads.lock, &thread.shared, mirror);

        let result = Self::run_initializer(thread, class_id, vm);

        vm.monitors.enter(&vm.threads.lock, &thread.shared, mirror);
        {
            let ma = vm.method_area_read();
            let class_like = ma.get_class_like(&class_id)?;
            class_like.set_state(if result.is_ok() {
                ClassState::Initialized
            } else {
                ClassState::Erroneous
            });
            class_like.set_init_thread(None);
        }
        vm.monitors
            .notify(&vm.threads.lock, &thread.shared, mirror, true);
        vm.monitors.exit(&vm.threads.lock, &thread.shared, mirror);

        result
    }

    fn run_initializer(
        thread: &mut VmThread,
        class_id: ClassId,
        vm: &VirtualMachine,
    ) -> Result<(), VmError> {
        // Parents initialize first.
        let super_id = {
            let ma = vm.method_area_read();
            ma.get_class(&class_id).get_super_id()
        };
        if let Some(super_id) = super_id {
            Self::ensure_initialized(thread, super_id, vm)?;
        }

        // String ConstantValue statics were deferred out of linking.
        vm.assign_string_constants(thread, class_id)?;

        let clinit = {
            let ma = vm.method_area_read();
            ma.get_class_like(&class_id)?.get_clinit_method_id()
        };
        if let Some(clinit) = clinit {
            Self::invoke_method_core(thread, clinit, SmallVec::new(), vm)?;

            // The initializer never runs again; its code chunk goes back to
            // the heap.
            let purged = {
                let ma = vm.method_area_read();
                ma.get_method(&clinit).purge_code()
            };
            if let Some(code) = purged {
                vm.heap.free_raw(code.code_off);
            }
        }
        Ok(())
    }
}
