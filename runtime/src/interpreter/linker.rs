//! First-execution linking of prelink opcodes: resolve the referenced
//! entity, enforce access control, then rewrite the opcode byte and its
//! operand in place in the method's code buffer. Resolution serializes on
//! the global VM lock inside the loader; the rewrite itself commits under
//! that lock, so a concurrent replay of the same site either repeats the
//! idempotent resolution or simply observes the rewritten form.

use crate::error::VmError;
use crate::heap::HeapRef;
use crate::interpreter::Interpreter;
use crate::jtype::AllocationType;
use crate::keys::{ClassId, Symbol};
use crate::rt::class::same_package;
use crate::rt::constant_pool::{RuntimeConstant, RuntimeConstantPool};
use crate::rt::field::FieldOffset;
use crate::rt::method::{TranslatedCode, pack_dispatch};
use crate::thread::VmThread;
use crate::throw_exception;
use crate::translator::opcode::{ArrayTypeCode, Op};
use crate::vm::VirtualMachine;
use std::sync::Arc;
use valka_classfile::flags::{FieldFlags, MethodFlags};

/// Rewrites the opcode byte and, when `operand` is given, the two operand
/// bytes. The caller holds the global lock.
fn rewrite(vm: &VirtualMachine, tc: &TranslatedCode, pc: usize, op: Op, operand: Option<u16>) {
    let code = vm.heap.raw_slice_mut(tc.code_off, tc.code_len);
    code[pc] = op as u8;
    if let Some(value) = operand {
        let bytes = value.to_ne_bytes();
        code[pc + 1] = bytes[0];
        code[pc + 2] = bytes[1];
    }
}

fn frame_class(thread: &VmThread) -> Result<ClassId, VmError> {
    Ok(thread.stack.cur_java_frame()?.class_id())
}

fn frame_cp(thread: &VmThread, vm: &VirtualMachine) -> Result<Arc<RuntimeConstantPool>, VmError> {
    let class_id = frame_class(thread)?;
    let ma = vm.method_area_read();
    ma.get_cp_arc(&class_id)
}

/// Resolves the class constant at `idx`, loading the class on first use,
/// and caches the result in the pool entry.
fn resolve_class_entry(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    cp: &RuntimeConstantPool,
    idx: u16,
) -> Result<ClassId, VmError> {
    if let Some(class_id) = cp.resolved_class(idx)? {
        return Ok(class_id);
    }
    let sym = cp.get_class_sym(idx)?;
    let class_id = vm.resolve_class(thread, sym)?;
    cp.cache_resolved_class(idx, class_id)?;
    Ok(class_id)
}

fn resolve_class_by_name(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    sym: Symbol,
) -> Result<ClassId, VmError> {
    vm.resolve_class(thread, sym)
}

/// Private / protected / package access rules, including the parent-class
/// and same-package tests.
fn check_access(
    vm: &VirtualMachine,
    from: ClassId,
    declaring: ClassId,
    is_public: bool,
    is_private: bool,
    is_protected: bool,
) -> Result<(), VmError> {
    if is_public || from == declaring {
        return Ok(());
    }

    let ma = vm.method_area_read();
    let from_name = ma.get_class(&from).get_name();
    let declaring_name = ma.get_class(&declaring).get_name();

    if is_private {
        return throw_exception!(
            IllegalAccessError,
            "private member of {}",
            ma.interner().resolve(&declaring_name)
        );
    }
    if same_package(ma.interner(), from_name, declaring_name) {
        return Ok(());
    }
    if is_protected && ma.is_assignable_from(declaring, from) {
        return Ok(());
    }

    throw_exception!(
        IllegalAccessError,
        "member of {} not accessible from {}",
        ma.interner().resolve(&declaring_name),
        ma.interner().resolve(&from_name)
    )
}

fn check_field_access(
    vm: &VirtualMachine,
    from: ClassId,
    declaring: ClassId,
    flags: FieldFlags,
) -> Result<(), VmError> {
    check_access(
        vm,
        from,
        declaring,
        flags.is_public(),
        flags.is_private(),
        flags.is_protected(),
    )
}

fn check_method_access(
    vm: &VirtualMachine,
    from: ClassId,
    declaring: ClassId,
    flags: MethodFlags,
) -> Result<(), VmError> {
    check_access(
        vm,
        from,
        declaring,
        flags.is_public(),
        flags.is_private(),
        flags.is_protected(),
    )
}

/// Drives one prelink transition. Resolution and initialization run first,
/// outside the global lock (they take it themselves where needed, and
/// `<clinit>` may execute arbitrary bytecode); the in-place rewrite then
/// commits under the lock, unless a concurrent prelink of the same site got
/// there first. Both orders produce the same bytes: resolution is
/// idempotent through the pool caches.
fn linked(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    prelink_op: u8,
    link: impl FnOnce(&mut VmThread) -> Result<(Op, Option<u16>), VmError>,
) -> Result<(), VmError> {
    if vm.heap.raw_slice(tc.code_off, tc.code_len)[pc] != prelink_op {
        return Ok(());
    }

    let (resolved_op, operand) = link(thread)?;

    vm.threads.lock.lock(&thread.shared);
    if vm.heap.raw_slice(tc.code_off, tc.code_len)[pc] == prelink_op {
        rewrite(vm, tc, pc, resolved_op, operand);
    }
    vm.threads.lock.unlock(&thread.shared);
    Ok(())
}

// ---------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------

fn getfield_op(ty: AllocationType) -> Op {
    match ty {
        AllocationType::Byte => Op::GetfieldByte,
        AllocationType::Boolean => Op::GetfieldBool,
        AllocationType::Char => Op::GetfieldChar,
        AllocationType::Short => Op::GetfieldShort,
        AllocationType::Int => Op::GetfieldInt,
        AllocationType::Float => Op::GetfieldFloat,
        AllocationType::Long => Op::GetfieldLong,
        AllocationType::Double => Op::GetfieldDouble,
        AllocationType::Reference => Op::GetfieldReference,
    }
}

fn putfield_op(ty: AllocationType) -> Op {
    match ty {
        AllocationType::Byte => Op::PutfieldByte,
        AllocationType::Boolean => Op::PutfieldBool,
        AllocationType::Char | AllocationType::Short => Op::PutfieldShort,
        AllocationType::Int => Op::PutfieldInt,
        AllocationType::Float => Op::PutfieldFloat,
        AllocationType::Long => Op::PutfieldLong,
        AllocationType::Double => Op::PutfieldDouble,
        AllocationType::Reference => Op::PutfieldReference,
    }
}

fn getstatic_op(ty: AllocationType) -> Op {
    match ty {
        // Static booleans live in byte cells; the byte accessor serves both.
        AllocationType::Byte | AllocationType::Boolean => Op::GetstaticByte,
        AllocationType::Char => Op::GetstaticChar,
        AllocationType::Short => Op::GetstaticShort,
        AllocationType::Int => Op::GetstaticInt,
        AllocationType::Float => Op::GetstaticFloat,
        AllocationType::Long => Op::GetstaticLong,
        AllocationType::Double => Op::GetstaticDouble,
        AllocationType::Reference => Op::GetstaticReference,
    }
}

fn putstatic_op(ty: AllocationType) -> Op {
    match ty {
        AllocationType::Byte | AllocationType::Boolean => Op::PutstaticByte,
        AllocationType::Char | AllocationType::Short => Op::PutstaticShort,
        AllocationType::Int => Op::PutstaticInt,
        AllocationType::Float => Op::PutstaticFloat,
        AllocationType::Long => Op::PutstaticLong,
        AllocationType::Double => Op::PutstaticDouble,
        AllocationType::Reference => Op::PutstaticReference,
    }
}

/// The typed field opcodes carry the layout position in their operand:
/// reference slot, byte offset, or absolute bit offset, picked by opcode.
fn field_operand(offset: FieldOffset) -> u16 {
    match offset {
        FieldOffset::Ref(slot) => slot,
        FieldOffset::NonRef(bytes) => bytes,
        FieldOffset::Bit(bit) => bit as u16,
    }
}

pub(super) fn prelink_getfield(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::GetfieldPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let view = cp.get_field_view(idx)?;
        let class_id = resolve_class_by_name(thread, vm, view.class_sym)?;

        let (field, ty) = {
            let ma = vm.method_area_read();
            let (declaring, field) = ma.resolve_instance_field(class_id, &view.key)?;
            let ty = ma.get_field_descriptor(&field.descriptor_id).as_allocation_type();
            drop(ma);
            check_field_access(vm, frame_class(thread)?, declaring, field.flags)?;
            (field, ty)
        };

        cp.cache_resolved_instance_field(idx, field.offset)?;
        Ok((getfield_op(ty), Some(field_operand(field.offset))))
    })
}

pub(super) fn prelink_putfield(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::PutfieldPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let view = cp.get_field_view(idx)?;
        let class_id = resolve_class_by_name(thread, vm, view.class_sym)?;

        let (field, ty) = {
            let ma = vm.method_area_read();
            let (declaring, field) = ma.resolve_instance_field(class_id, &view.key)?;
            let ty = ma.get_field_descriptor(&field.descriptor_id).as_allocation_type();
            drop(ma);
            check_field_access(vm, frame_class(thread)?, declaring, field.flags)?;
            (field, ty)
        };

        cp.cache_resolved_instance_field(idx, field.offset)?;
        Ok((putfield_op(ty), Some(field_operand(field.offset))))
    })
}

pub(super) fn prelink_static(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
    is_put: bool,
) -> Result<(), VmError> {
    let prelink = if is_put {
        Op::PutstaticPrelink
    } else {
        Op::GetstaticPrelink
    };
    linked(thread, vm, tc, pc, prelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let view = cp.get_field_view(idx)?;
        let class_id = resolve_class_by_name(thread, vm, view.class_sym)?;

        let (declaring, field) = {
            let ma = vm.method_area_read();
            ma.resolve_static_field(class_id, &view.key)?
        };
        check_field_access(vm, frame_class(thread)?, declaring, field.flags)?;

        // Touching a static initializes its declaring class first.
        Interpreter::ensure_initialized(thread, declaring, vm)?;

        cp.cache_resolved_static_field(idx, field.cell)?;
        let op = if is_put {
            putstatic_op(field.cell.ty)
        } else {
            getstatic_op(field.cell.ty)
        };
        // The operand keeps the pool index; the cell rides in the pool's
        // resolved-state cache.
        Ok((op, None))
    })
}

// ---------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------

pub(super) fn prelink_invokevirtual(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::InvokevirtualPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let view = cp.get_method_view(idx)?;
        let class_id = resolve_class_by_name(thread, vm, view.class_sym)?;

        let (method_id, index, args, flags, declaring) = {
            let ma = vm.method_area_read();
            let method_id = ma.resolve_method(class_id, &view.key, false)?;
            let method = ma.get_method(&method_id);
            (
                method_id,
                method.index(),
                method.args_count(),
                method.flags(),
                method.class_id(),
            )
        };
        if flags.is_static() {
            throw_exception!(IncompatibleClassChangeError, "invokevirtual of a static method")?
        }
        check_method_access(vm, frame_class(thread)?, declaring, flags)?;
        cp.cache_resolved_method(idx, method_id)?;

        Ok((Op::Invokevirtual, Some(pack_dispatch(index, args)?)))
    })
}

pub(super) fn prelink_invokespecial(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::InvokespecialPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let view = cp.get_method_view(idx)?;
        let class_id = resolve_class_by_name(thread, vm, view.class_sym)?;
        let current = frame_class(thread)?;

        let (method_id, index, args, flags, declaring, is_init) = {
            let ma = vm.method_area_read();
            let method_id = ma.resolve_method(class_id, &view.key, false)?;
            let method = ma.get_method(&method_id);
            (
                method_id,
                method.index(),
                method.args_count(),
                method.flags(),
                method.class_id(),
                view.key.name == ma.br().init_sym,
            )
        };
        if flags.is_static() {
            throw_exception!(IncompatibleClassChangeError, "invokespecial of a static method")?
        }
        check_method_access(vm, current, declaring, flags)?;
        cp.cache_resolved_method(idx, method_id)?;

        // ACC_SUPER: a non-constructor call into a proper superclass
        // dispatches through the parent table of the call site's class.
        let use_super = {
            let ma = vm.method_area_read();
            let current_class = ma.get_class(&current);
            let has_super_semantics = current_class
                .as_class_like()
                .map(|c| c.flags().has_super_semantics())
                .unwrap_or(false);
            has_super_semantics
                && !is_init
                && !flags.is_private()
                && current != class_id
                && ma.is_assignable_from(class_id, current)
        };

        if use_super {
            Ok((Op::Invokesuper, Some(pack_dispatch(index, args)?)))
        } else {
            Ok((Op::Invokespecial, None))
        }
    })
}

pub(super) fn prelink_invokestatic(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::InvokestaticPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let view = cp.get_method_view(idx)?;
        let class_id = resolve_class_by_name(thread, vm, view.class_sym)?;

        let (method_id, flags, declaring) = {
            let ma = vm.method_area_read();
            let method_id = ma.resolve_method(class_id, &view.key, false)?;
            let method = ma.get_method(&method_id);
            (method_id, method.flags(), method.class_id())
        };
        if !flags.is_static() {
            throw_exception!(IncompatibleClassChangeError, "invokestatic of an instance method")?
        }
        check_method_access(vm, frame_class(thread)?, declaring, flags)?;

        Interpreter::ensure_initialized(thread, declaring, vm)?;

        cp.cache_resolved_method(idx, method_id)?;
        Ok((Op::Invokestatic, None))
    })
}

pub(super) fn prelink_invokeinterface(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::InvokeinterfacePrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let view = cp.get_interface_method_view(idx)?;
        let interface_id = resolve_class_by_name(thread, vm, view.class_sym)?;

        let (method_id, interface_method_id, args) = {
            let ma = vm.method_area_read();
            let method_id = ma.resolve_method(interface_id, &view.key, true)?;
            let method = ma.get_method(&method_id);
            (method_id, method.index(), method.args_count())
        };
        cp.cache_resolved_method(idx, method_id)?;

        Ok((
            Op::Invokeinterface,
            Some(pack_dispatch(interface_method_id, args)?),
        ))
    })
}

// ---------------------------------------------------------------------
// Instantiation, casts, constants
// ---------------------------------------------------------------------

pub(super) fn prelink_new(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::NewPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let class_id = resolve_class_entry(thread, vm, &cp, idx)?;

        {
            let ma = vm.method_area_read();
            let class = ma.get_class(&class_id);
            if class.is_interface() || class.is_array() {
                throw_exception!(IncompatibleClassChangeError, "new of a non-instance class")?
            }
            if let Ok(class_like) = class.as_class_like() {
                if class_like.flags().is_abstract() {
                    throw_exception!(
                        IncompatibleClassChangeError,
                        "instantiating an abstract class"
                    )?
                }
            }
        }

        Interpreter::ensure_initialized(thread, class_id, vm)?;

        let finalizable = matches!(
            vm.heap.shape(class_id),
            Ok(crate::heap::ClassShape::Instance { has_finalizer: true, .. })
        );
        let op = if finalizable { Op::NewFinalizer } else { Op::New };
        Ok((op, None))
    })
}

pub(super) fn prelink_newarray(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    atype: u8,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::NewarrayPrelink as u8, |thread| {
        let atype = ArrayTypeCode::try_from(atype)
            .map_err(|_| VmError::Internal("bad newarray type survived translation".to_string()))?;
        let sym = {
            let ma = vm.method_area_read();
            ma.interner().get_or_intern(atype.descriptor())
        };
        resolve_class_by_name(thread, vm, sym)?;
        Ok((Op::Newarray, None))
    })
}

pub(super) fn prelink_anewarray(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::AnewarrayPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let element_id = resolve_class_entry(thread, vm, &cp, idx)?;

        // Load the array class of the element so the resolved opcode can
        // hop to it directly.
        let array_name = {
            let ma = vm.method_area_read();
            let element_name = ma.interner().resolve(&ma.get_class(&element_id).get_name());
            if element_name.starts_with('[') {
                format!("[{}", element_name)
            } else {
                format!("[L{};", element_name)
            }
        };
        let sym = {
            let ma = vm.method_area_read();
            ma.interner().get_or_intern(&array_name)
        };
        resolve_class_by_name(thread, vm, sym)?;

        Ok((Op::Anewarray, None))
    })
}

pub(super) fn prelink_multianewarray(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
) -> Result<(), VmError> {
    linked(thread, vm, tc, pc, Op::MultianewarrayPrelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        resolve_class_entry(thread, vm, &cp, idx)?;
        Ok((Op::Multianewarray, None))
    })
}

pub(super) fn prelink_cast(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
    resolved_op: Op,
) -> Result<(), VmError> {
    let prelink = match resolved_op {
        Op::Checkcast => Op::CheckcastPrelink,
        _ => Op::InstanceofPrelink,
    };
    linked(thread, vm, tc, pc, prelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        resolve_class_entry(thread, vm, &cp, idx)?;
        Ok((resolved_op, None))
    })
}

pub(super) fn prelink_ldc(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    pc: usize,
    idx: u16,
    resolved_op: Op,
) -> Result<(), VmError> {
    let prelink = match resolved_op {
        Op::LdcRef => Op::LdcPrelink,
        _ => Op::LdcWPrelink,
    };
    linked(thread, vm, tc, pc, prelink as u8, |thread| {
        let cp = frame_cp(thread, vm)?;
        let reference: HeapRef = match cp.entry(idx)? {
            RuntimeConstant::String(_) => {
                let sym = cp.get_string_sym(idx)?;
                // Literal strings are pinned: the rewritten opcode will
                // hand this reference out for the rest of the VM's life.
                let interned = vm.intern_string(thread, sym, true)?;
                if let RuntimeConstant::String(entry) = cp.entry(idx)? {
                    let _ = entry.resolved_ref.set(interned);
                }
                interned
            }
            RuntimeConstant::Class(_) => {
                let class_id = resolve_class_entry(thread, vm, &cp, idx)?;
                vm.class_mirror(thread, class_id)?
            }
            other => {
                return Err(VmError::Internal(format!(
                    "ldc prelink of a {}",
                    other.get_type()
                )));
            }
        };
        let _ = reference;
        Ok((resolved_op, None))
    })
}
