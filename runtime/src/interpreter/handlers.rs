use crate::error::VmError;
use crate::heap::{HeapRef, JNULL};
use crate::interpreter::Interpreter;
use crate::interpreter::linker;
use crate::jtype::AllocationType;
use crate::keys::ClassId;
use crate::rt::RuntimeClass;
use crate::rt::field::FieldOffset;
use crate::rt::method::{TranslatedCode, unpack_dispatch_args, unpack_dispatch_index};
use crate::thread::VmThread;
use crate::translator::opcode::{ArrayTypeCode, Op};
use crate::translator::switch_payload_offset;
use crate::vm::{Value, VirtualMachine};
use crate::throw_exception;

/// What the dispatch loop does after one instruction.
pub enum Flow {
    Advance(usize),
    Jump(usize),
    /// A prelink opcode rewrote itself; dispatch again at the same pc.
    Stay,
    Return(Option<Value>),
}

// ---------------------------------------------------------------------
// Operand decoding. Multi-byte immediates are host-endian after
// translation, at whatever alignment the original stream put them.
// ---------------------------------------------------------------------

fn u8_operand(code: &[u8], pos: usize) -> u8 {
    code[pos]
}

fn u16_operand(code: &[u8], pos: usize) -> u16 {
    u16::from_ne_bytes([code[pos], code[pos + 1]])
}

fn i16_operand(code: &[u8], pos: usize) -> i16 {
    u16_operand(code, pos) as i16
}

fn i32_operand(code: &[u8], pos: usize) -> i32 {
    i32::from_ne_bytes([code[pos], code[pos + 1], code[pos + 2], code[pos + 3]])
}

fn branch16(pc: usize, code: &[u8]) -> usize {
    (pc as isize + i16_operand(code, pc + 1) as isize) as usize
}

pub(super) fn interpret_instruction(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    tc: &TranslatedCode,
    code: &[u8],
    op: Op,
    pc: usize,
) -> Result<Flow, VmError> {
    match op {
        Op::Nop => Ok(Flow::Advance(1)),

        // ------------------------------------------------------------
        // Constants
        // ------------------------------------------------------------
        Op::AconstNull => push(thread, Value::Null, 1),
        Op::IconstM1 => push(thread, Value::Integer(-1), 1),
        Op::Iconst0 => push(thread, Value::Integer(0), 1),
        Op::Iconst1 => push(thread, Value::Integer(1), 1),
        Op::Iconst2 => push(thread, Value::Integer(2), 1),
        Op::Iconst3 => push(thread, Value::Integer(3), 1),
        Op::Iconst4 => push(thread, Value::Integer(4), 1),
        Op::Iconst5 => push(thread, Value::Integer(5), 1),
        Op::Lconst0 => push(thread, Value::Long(0), 1),
        Op::Lconst1 => push(thread, Value::Long(1), 1),
        Op::Fconst0 => push(thread, Value::Float(0.0), 1),
        Op::Fconst1 => push(thread, Value::Float(1.0), 1),
        Op::Fconst2 => push(thread, Value::Float(2.0), 1),
        Op::Dconst0 => push(thread, Value::Double(0.0), 1),
        Op::Dconst1 => push(thread, Value::Double(1.0), 1),
        Op::Bipush => push(thread, Value::Integer(code[pc + 1] as i8 as i32), 2),
        Op::Sipush => push(thread, Value::Integer(i16_operand(code, pc + 1) as i32), 3),

        Op::Ldc => handle_ldc(thread, vm, u8_operand(code, pc + 1) as u16, 2),
        Op::LdcW | Op::Ldc2W => handle_ldc(thread, vm, u16_operand(code, pc + 1), 3),
        Op::LdcRef => handle_ldc_ref(thread, vm, u8_operand(code, pc + 1) as u16, 2),
        Op::LdcWRef => handle_ldc_ref(thread, vm, u16_operand(code, pc + 1), 3),
        Op::LdcPrelink => {
            linker::prelink_ldc(thread, vm, tc, pc, u8_operand(code, pc + 1) as u16, Op::LdcRef)?;
            Ok(Flow::Stay)
        }
        Op::LdcWPrelink => {
            linker::prelink_ldc(thread, vm, tc, pc, u16_operand(code, pc + 1), Op::LdcWRef)?;
            Ok(Flow::Stay)
        }

        // ------------------------------------------------------------
        // Locals
        // ------------------------------------------------------------
        Op::Iload | Op::Lload | Op::Fload | Op::Dload | Op::Aload => {
            load_local(thread, u8_operand(code, pc + 1) as usize, 2)
        }
        Op::Iload0 | Op::Lload0 | Op::Fload0 | Op::Dload0 | Op::Aload0 => load_local(thread, 0, 1),
        Op::Iload1 | Op::Lload1 | Op::Fload1 | Op::Dload1 | Op::Aload1 => load_local(thread, 1, 1),
        Op::Iload2 | Op::Lload2 | Op::Fload2 | Op::Dload2 | Op::Aload2 => load_local(thread, 2, 1),
        Op::Iload3 | Op::Lload3 | Op::Fload3 | Op::Dload3 | Op::Aload3 => load_local(thread, 3, 1),

        Op::Istore | Op::Lstore | Op::Fstore | Op::Dstore | Op::Astore => {
            store_local(thread, u8_operand(code, pc + 1) as usize, 2)
        }
        Op::Istore0 | Op::Lstore0 | Op::Fstore0 | Op::Dstore0 | Op::Astore0 => {
            store_local(thread, 0, 1)
        }
        Op::Istore1 | Op::Lstore1 | Op::Fstore1 | Op::Dstore1 | Op::Astore1 => {
            store_local(thread, 1, 1)
        }
        Op::Istore2 | Op::Lstore2 | Op::Fstore2 | Op::Dstore2 | Op::Astore2 => {
            store_local(thread, 2, 1)
        }
        Op::Istore3 | Op::Lstore3 | Op::Fstore3 | Op::Dstore3 | Op::Astore3 => {
            store_local(thread, 3, 1)
        }

        Op::Iinc => {
            let index = u8_operand(code, pc + 1) as usize;
            let delta = code[pc + 2] as i8 as i32;
            let value = thread.stack.get_local(index)?.as_int()?;
            thread.stack.set_local(index, Value::Integer(value.wrapping_add(delta)))?;
            Ok(Flow::Advance(3))
        }

        Op::Wide => handle_wide(thread, code, pc),

        // ------------------------------------------------------------
        // Arrays
        // ------------------------------------------------------------
        Op::Iaload | Op::Laload | Op::Faload | Op::Daload | Op::Baload | Op::Caload
        | Op::Saload | Op::Aaload => {
            let index = thread.stack.pop_int_val()?;
            let array = thread.stack.pop_obj_val()?;
            let value = vm.heap.read_element(array, index)?;
            push(thread, value, 1)
        }

        Op::Iastore | Op::Lastore | Op::Fastore | Op::Dastore | Op::Bastore | Op::Castore
        | Op::Sastore => {
            let value = thread.stack.pop_operand()?;
            let index = thread.stack.pop_int_val()?;
            let array = thread.stack.pop_obj_val()?;
            vm.heap.write_element(array, index, value)?;
            Ok(Flow::Advance(1))
        }

        Op::Aastore => handle_aastore(thread, vm),

        Op::Arraylength => {
            let array = thread.stack.pop_obj_val()?;
            push(thread, Value::Integer(vm.heap.array_length(array)?), 1)
        }

        Op::Newarray => handle_newarray(thread, vm, code, pc),
        Op::Anewarray => handle_anewarray(thread, vm, code, pc),
        Op::Multianewarray => handle_multianewarray(thread, vm, code, pc),

        // ------------------------------------------------------------
        // Operand stack shuffling
        // ------------------------------------------------------------
        Op::Pop => {
            thread.stack.pop_operand()?;
            Ok(Flow::Advance(1))
        }
        Op::Pop2 => {
            if !is_wide(thread.stack.pop_operand()?) {
                thread.stack.pop_operand()?;
            }
            Ok(Flow::Advance(1))
        }
        Op::Dup => {
            thread.stack.dup_top()?;
            Ok(Flow::Advance(1))
        }
        Op::DupX1 => {
            let v1 = thread.stack.pop_operand()?;
            let v2 = thread.stack.pop_operand()?;
            thread.stack.push_operand(v1)?;
            thread.stack.push_operand(v2)?;
            push(thread, v1, 1)
        }
        Op::DupX2 => {
            let v1 = thread.stack.pop_operand()?;
            let v2 = thread.stack.pop_operand()?;
            if is_wide(v2) {
                thread.stack.push_operand(v1)?;
                thread.stack.push_operand(v2)?;
            } else {
                let v3 = thread.stack.pop_operand()?;
                thread.stack.push_operand(v1)?;
                thread.stack.push_operand(v3)?;
                thread.stack.push_operand(v2)?;
            }
            push(thread, v1, 1)
        }
        Op::Dup2 => {
            let v1 = *thread.stack.peek_operand()?;
            if is_wide(v1) {
                push(thread, v1, 1)
            } else {
                let v2 = *thread.stack.peek_operand_at(1)?;
                thread.stack.push_operand(v2)?;
                push(thread, v1, 1)
            }
        }
        Op::Dup2X1 => {
            let top = pop_group(thread)?;
            let v = thread.stack.pop_operand()?;
            push_group(thread, &top)?;
            thread.stack.push_operand(v)?;
            push_group(thread, &top)?;
            Ok(Flow::Advance(1))
        }
        Op::Dup2X2 => {
            let top = pop_group(thread)?;
            let under = pop_group(thread)?;
            push_group(thread, &top)?;
            push_group(thread, &under)?;
            push_group(thread, &top)?;
            Ok(Flow::Advance(1))
        }
        Op::Swap => {
            let v1 = thread.stack.pop_operand()?;
            let v2 = thread.stack.pop_operand()?;
            thread.stack.push_operand(v1)?;
            thread.stack.push_operand(v2)?;
            Ok(Flow::Advance(1))
        }

        // ------------------------------------------------------------
        // Arithmetic
        // ------------------------------------------------------------
        Op::Iadd => int_binop(thread, |a, b| Ok(a.wrapping_add(b))),
        Op::Isub => int_binop(thread, |a, b| Ok(a.wrapping_sub(b))),
        Op::Imul => int_binop(thread, |a, b| Ok(a.wrapping_mul(b))),
        Op::Idiv => int_binop(thread, |a, b| {
            if b == 0 {
                throw_exception!(ArithmeticException, "/ by zero")?
            }
            // INT_MIN / -1 overflows; Java defines it as the dividend.
            Ok(a.wrapping_div(b))
        }),
        Op::Irem => int_binop(thread, |a, b| {
            if b == 0 {
                throw_exception!(ArithmeticException, "% by zero")?
            }
            Ok(a.wrapping_rem(b))
        }),
        Op::Ineg => {
            let v = thread.stack.pop_int_val()?;
            push(thread, Value::Integer(v.wrapping_neg()), 1)
        }
        Op::Ishl => int_binop(thread, |a, b| Ok(a.wrapping_shl(b as u32 & 0x1f))),
        Op::Ishr => int_binop(thread, |a, b| Ok(a.wrapping_shr(b as u32 & 0x1f))),
        Op::Iushr => int_binop(thread, |a, b| {
            Ok(((a as u32).wrapping_shr(b as u32 & 0x1f)) as i32)
        }),
        Op::Iand => int_binop(thread, |a, b| Ok(a & b)),
        Op::Ior => int_binop(thread, |a, b| Ok(a | b)),
        Op::Ixor => int_binop(thread, |a, b| Ok(a ^ b)),

        Op::Ladd => long_binop(thread, |a, b| Ok(a.wrapping_add(b))),
        Op::Lsub => long_binop(thread, |a, b| Ok(a.wrapping_sub(b))),
        Op::Lmul => long_binop(thread, |a, b| Ok(a.wrapping_mul(b))),
        Op::Ldiv => long_binop(thread, |a, b| {
            if b == 0 {
                throw_exception!(ArithmeticException, "/ by zero")?
            }
            Ok(a.wrapping_div(b))
        }),
        Op::Lrem => long_binop(thread, |a, b| {
            if b == 0 {
                throw_exception!(ArithmeticException, "% by zero")?
            }
            Ok(a.wrapping_rem(b))
        }),
        Op::Lneg => {
            let v = thread.stack.pop_long_val()?;
            push(thread, Value::Long(v.wrapping_neg()), 1)
        }
        Op::Lshl => {
            let shift = thread.stack.pop_int_val()?;
            let v = thread.stack.pop_long_val()?;
            push(thread, Value::Long(v.wrapping_shl(shift as u32 & 0x3f)), 1)
        }
        Op::Lshr => {
            let shift = thread.stack.pop_int_val()?;
            let v = thread.stack.pop_long_val()?;
            push(thread, Value::Long(v.wrapping_shr(shift as u32 & 0x3f)), 1)
        }
        Op::Lushr => {
            let shift = thread.stack.pop_int_val()?;
            let v = thread.stack.pop_long_val()?;
            push(
                thread,
                Value::Long(((v as u64).wrapping_shr(shift as u32 & 0x3f)) as i64),
                1,
            )
        }
        Op::Land => long_binop(thread, |a, b| Ok(a & b)),
        Op::Lor => long_binop(thread, |a, b| Ok(a | b)),
        Op::Lxor => long_binop(thread, |a, b| Ok(a ^ b)),

        Op::Fadd => float_binop(thread, |a, b| a + b),
        Op::Fsub => float_binop(thread, |a, b| a - b),
        Op::Fmul => float_binop(thread, |a, b| a * b),
        Op::Fdiv => float_binop(thread, |a, b| a / b),
        // IEEE remainder by zero is NaN, no exception.
        Op::Frem => float_binop(thread, |a, b| a % b),
        Op::Fneg => {
            let v = thread.stack.pop_float_val()?;
            push(thread, Value::Float(-v), 1)
        }

        Op::Dadd => double_binop(thread, |a, b| a + b),
        Op::Dsub => double_binop(thread, |a, b| a - b),
        Op::Dmul => double_binop(thread, |a, b| a * b),
        Op::Ddiv => double_binop(thread, |a, b| a / b),
        Op::Drem => double_binop(thread, |a, b| a % b),
        Op::Dneg => {
            let v = thread.stack.pop_double_val()?;
            push(thread, Value::Double(-v), 1)
        }

        // ------------------------------------------------------------
        // Conversions
        // ------------------------------------------------------------
        Op::I2l => convert(thread, |v| Ok(Value::Long(v.as_int()? as i64))),
        Op::I2f => convert(thread, |v| Ok(Value::Float(v.as_int()? as f32))),
        Op::I2d => convert(thread, |v| Ok(Value::Double(v.as_int()? as f64))),
        Op::L2i => convert(thread, |v| Ok(Value::Integer(v.as_long()? as i32))),
        Op::L2f => convert(thread, |v| Ok(Value::Float(v.as_long()? as f32))),
        Op::L2d => convert(thread, |v| Ok(Value::Double(v.as_long()? as f64))),
        // `as` saturates and maps NaN to zero, exactly the Java rule.
        Op::F2i => convert(thread, |v| Ok(Value::Integer(v.as_float()? as i32))),
        Op::F2l => convert(thread, |v| Ok(Value::Long(v.as_float()? as i64))),
        Op::F2d => convert(thread, |v| Ok(Value::Double(v.as_float()? as f64))),
        Op::D2i => convert(thread, |v| Ok(Value::Integer(v.as_double()? as i32))),
        Op::D2l => convert(thread, |v| Ok(Value::Long(v.as_double()? as i64))),
        Op::D2f => convert(thread, |v| Ok(Value::Float(v.as_double()? as f32))),
        Op::I2b => convert(thread, |v| Ok(Value::Integer(v.as_int()? as i8 as i32))),
        Op::I2c => convert(thread, |v| Ok(Value::Integer(v.as_int()? as u16 as i32))),
        Op::I2s => convert(thread, |v| Ok(Value::Integer(v.as_int()? as i16 as i32))),

        // ------------------------------------------------------------
        // Comparisons
        // ------------------------------------------------------------
        Op::Lcmp => {
            let b = thread.stack.pop_long_val()?;
            let a = thread.stack.pop_long_val()?;
            // Branch-free sign of the (widened) difference.
            let t = a as i128 - b as i128;
            let r = if t == 0 { 0 } else { ((t >> 127) | 1) as i32 };
            push(thread, Value::Integer(r), 1)
        }
        Op::Fcmpl => {
            let b = thread.stack.pop_float_val()?;
            let a = thread.stack.pop_float_val()?;
            push(thread, Value::Integer(fp_compare(a as f64, b as f64, -1)), 1)
        }
        Op::Fcmpg => {
            let b = thread.stack.pop_float_val()?;
            let a = thread.stack.pop_float_val()?;
            push(thread, Value::Integer(fp_compare(a as f64, b as f64, 1)), 1)
        }
        Op::Dcmpl => {
            let b = thread.stack.pop_double_val()?;
            let a = thread.stack.pop_double_val()?;
            push(thread, Value::Integer(fp_compare(a, b, -1)), 1)
        }
        Op::Dcmpg => {
            let b = thread.stack.pop_double_val()?;
            let a = thread.stack.pop_double_val()?;
            push(thread, Value::Integer(fp_compare(a, b, 1)), 1)
        }

        // ------------------------------------------------------------
        // Branches
        // ------------------------------------------------------------
        Op::Ifeq => branch_if(thread, code, pc, |v| v == 0),
        Op::Ifne => branch_if(thread, code, pc, |v| v != 0),
        Op::Iflt => branch_if(thread, code, pc, |v| v < 0),
        Op::Ifge => branch_if(thread, code, pc, |v| v >= 0),
        Op::Ifgt => branch_if(thread, code, pc, |v| v > 0),
        Op::Ifle => branch_if(thread, code, pc, |v| v <= 0),
        Op::IfIcmpeq => branch_icmp(thread, code, pc, |a, b| a == b),
        Op::IfIcmpne => branch_icmp(thread, code, pc, |a, b| a != b),
        Op::IfIcmplt => branch_icmp(thread, code, pc, |a, b| a < b),
        Op::IfIcmpge => branch_icmp(thread, code, pc, |a, b| a >= b),
        Op::IfIcmpgt => branch_icmp(thread, code, pc, |a, b| a > b),
        Op::IfIcmple => branch_icmp(thread, code, pc, |a, b| a <= b),
        Op::IfAcmpeq => branch_acmp(thread, code, pc, true),
        Op::IfAcmpne => branch_acmp(thread, code, pc, false),
        Op::Ifnull => {
            let v = thread.stack.pop_nullable_ref()?;
            Ok(if v == Value::Null {
                Flow::Jump(branch16(pc, code))
            } else {
                Flow::Advance(3)
            })
        }
        Op::Ifnonnull => {
            let v = thread.stack.pop_nullable_ref()?;
            Ok(if v != Value::Null {
                Flow::Jump(branch16(pc, code))
            } else {
                Flow::Advance(3)
            })
        }
        Op::Goto => Ok(Flow::Jump(branch16(pc, code))),
        Op::GotoW => Ok(Flow::Jump((pc as isize + i32_operand(code, pc + 1) as isize) as usize)),

        Op::Tableswitch => {
            let index = thread.stack.pop_int_val()?;
            let base = switch_payload_offset(pc, tc.sync_shift as usize);
            let default = i32_operand(code, base);
            let low = i32_operand(code, base + 4);
            let high = i32_operand(code, base + 8);
            let offset = if index < low || index > high {
                default
            } else {
                i32_operand(code, base + 12 + (index - low) as usize * 4)
            };
            Ok(Flow::Jump((pc as isize + offset as isize) as usize))
        }

        Op::Lookupswitch => {
            let key = thread.stack.pop_int_val()?;
            let base = switch_payload_offset(pc, tc.sync_shift as usize);
            let default = i32_operand(code, base);
            let npairs = i32_operand(code, base + 4);

            // Keys are strictly ascending after translation.
            let mut low = 0i32;
            let mut high = npairs - 1;
            let mut offset = default;
            while low <= high {
                let mid = (low + high) >> 1;
                let entry = base + 8 + mid as usize * 8;
                let candidate = i32_operand(code, entry);
                match candidate.cmp(&key) {
                    std::cmp::Ordering::Equal => {
                        offset = i32_operand(code, entry + 4);
                        break;
                    }
                    std::cmp::Ordering::Less => low = mid + 1,
                    std::cmp::Ordering::Greater => high = mid - 1,
                }
            }
            Ok(Flow::Jump((pc as isize + offset as isize) as usize))
        }

        // ------------------------------------------------------------
        // Returns
        // ------------------------------------------------------------
        Op::Return => Ok(Flow::Return(None)),
        Op::Ireturn | Op::Freturn | Op::Lreturn | Op::Dreturn | Op::Areturn => {
            let value = thread.stack.pop_operand()?;
            Ok(Flow::Return(Some(value)))
        }
        Op::ReturnMonitorexit => {
            release_method_monitor(thread, vm)?;
            Ok(Flow::Return(None))
        }
        Op::IreturnMonitorexit
        | Op::LreturnMonitorexit
        | Op::FreturnMonitorexit
        | Op::DreturnMonitorexit
        | Op::AreturnMonitorexit => {
            let value = thread.stack.pop_operand()?;
            release_method_monitor(thread, vm)?;
            Ok(Flow::Return(Some(value)))
        }

        // ------------------------------------------------------------
        // Fields
        // ------------------------------------------------------------
        Op::GetfieldPrelink => {
            linker::prelink_getfield(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::PutfieldPrelink => {
            linker::prelink_putfield(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::GetstaticPrelink => {
            linker::prelink_static(thread, vm, tc, pc, u16_operand(code, pc + 1), false)?;
            Ok(Flow::Stay)
        }
        Op::PutstaticPrelink => {
            linker::prelink_static(thread, vm, tc, pc, u16_operand(code, pc + 1), true)?;
            Ok(Flow::Stay)
        }

        Op::GetfieldByte => getfield(thread, vm, code, pc, AllocationType::Byte),
        Op::GetfieldBool => getfield_bit(thread, vm, code, pc),
        Op::GetfieldChar => getfield(thread, vm, code, pc, AllocationType::Char),
        Op::GetfieldShort => getfield(thread, vm, code, pc, AllocationType::Short),
        Op::GetfieldInt => getfield(thread, vm, code, pc, AllocationType::Int),
        Op::GetfieldFloat => getfield(thread, vm, code, pc, AllocationType::Float),
        Op::GetfieldLong => getfield(thread, vm, code, pc, AllocationType::Long),
        Op::GetfieldDouble => getfield(thread, vm, code, pc, AllocationType::Double),
        Op::GetfieldReference => {
            let slot = u16_operand(code, pc + 1);
            let object = thread.stack.pop_obj_val()?;
            let value = vm
                .heap
                .read_field(object, FieldOffset::Ref(slot), AllocationType::Reference)?;
            push(thread, value, 3)
        }

        Op::PutfieldByte => putfield(thread, vm, code, pc, AllocationType::Byte),
        Op::PutfieldBool => putfield_bit(thread, vm, code, pc),
        Op::PutfieldShort => putfield(thread, vm, code, pc, AllocationType::Short),
        Op::PutfieldInt => putfield(thread, vm, code, pc, AllocationType::Int),
        Op::PutfieldFloat => putfield(thread, vm, code, pc, AllocationType::Float),
        Op::PutfieldLong => putfield(thread, vm, code, pc, AllocationType::Long),
        Op::PutfieldDouble => putfield(thread, vm, code, pc, AllocationType::Double),
        Op::PutfieldReference => {
            let value = thread.stack.pop_nullable_ref()?;
            let object = thread.stack.pop_obj_val()?;
            let slot = u16_operand(code, pc + 1);
            vm.heap
                .write_field(object, FieldOffset::Ref(slot), AllocationType::Reference, value)?;
            Ok(Flow::Advance(3))
        }

        Op::GetstaticByte => getstatic(thread, vm, code, pc),
        Op::GetstaticChar => getstatic(thread, vm, code, pc),
        Op::GetstaticShort => getstatic(thread, vm, code, pc),
        Op::GetstaticInt => getstatic(thread, vm, code, pc),
        Op::GetstaticFloat => getstatic(thread, vm, code, pc),
        Op::GetstaticLong => getstatic(thread, vm, code, pc),
        Op::GetstaticDouble => getstatic(thread, vm, code, pc),
        Op::GetstaticReference => getstatic(thread, vm, code, pc),

        Op::PutstaticByte
        | Op::PutstaticShort
        | Op::PutstaticInt
        | Op::PutstaticFloat
        | Op::PutstaticLong
        | Op::PutstaticDouble
        | Op::PutstaticReference => putstatic(thread, vm, code, pc),

        // ------------------------------------------------------------
        // Object creation and type tests
        // ------------------------------------------------------------
        Op::NewPrelink => {
            linker::prelink_new(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::New => handle_new(thread, vm, code, pc, false),
        Op::NewFinalizer => handle_new(thread, vm, code, pc, true),
        Op::NewarrayPrelink => {
            linker::prelink_newarray(thread, vm, tc, pc, code[pc + 1])?;
            Ok(Flow::Stay)
        }
        Op::AnewarrayPrelink => {
            linker::prelink_anewarray(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::MultianewarrayPrelink => {
            linker::prelink_multianewarray(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::CheckcastPrelink => {
            linker::prelink_cast(thread, vm, tc, pc, u16_operand(code, pc + 1), Op::Checkcast)?;
            Ok(Flow::Stay)
        }
        Op::InstanceofPrelink => {
            linker::prelink_cast(thread, vm, tc, pc, u16_operand(code, pc + 1), Op::Instanceof)?;
            Ok(Flow::Stay)
        }

        Op::Checkcast => {
            let target = resolved_class_operand(thread, vm, code, pc)?;
            match thread.stack.peek_operand()? {
                Value::Null => {}
                Value::Ref(r) => {
                    let source = vm.heap.class_id_of(*r)?;
                    let ma = vm.method_area_read();
                    if !ma.is_assignable_from(target, source) {
                        let name = ma.interner().resolve(&ma.get_class(&source).get_name());
                        let msg = name.replace('/', ".");
                        drop(ma);
                        throw_exception!(ClassCastException, msg)?
                    }
                }
                other => {
                    return Err(VmError::Internal(format!("checkcast of {:?}", other)));
                }
            }
            Ok(Flow::Advance(3))
        }

        Op::Instanceof => {
            let target = resolved_class_operand(thread, vm, code, pc)?;
            let value = thread.stack.pop_nullable_ref()?;
            let result = match value {
                Value::Ref(r) => {
                    let source = vm.heap.class_id_of(r)?;
                    let ma = vm.method_area_read();
                    ma.is_assignable_from(target, source) as i32
                }
                _ => 0,
            };
            push(thread, Value::Integer(result), 3)
        }

        // ------------------------------------------------------------
        // Invocation
        // ------------------------------------------------------------
        Op::InvokevirtualPrelink => {
            linker::prelink_invokevirtual(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::InvokespecialPrelink => {
            linker::prelink_invokespecial(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::InvokestaticPrelink => {
            linker::prelink_invokestatic(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }
        Op::InvokeinterfacePrelink => {
            linker::prelink_invokeinterface(thread, vm, tc, pc, u16_operand(code, pc + 1))?;
            Ok(Flow::Stay)
        }

        Op::Invokevirtual => handle_invokevirtual(thread, vm, code, pc),
        Op::Invokespecial => handle_invokespecial(thread, vm, code, pc),
        Op::Invokesuper => handle_invokesuper(thread, vm, code, pc),
        Op::Invokestatic => handle_invokestatic(thread, vm, code, pc),
        Op::Invokeinterface => handle_invokeinterface(thread, vm, code, pc),

        // ------------------------------------------------------------
        // Exceptions and monitors
        // ------------------------------------------------------------
        Op::Athrow => {
            let exception = thread.stack.pop_obj_val()?;
            Err(VmError::JavaExceptionThrown(exception))
        }

        Op::Monitorenter => {
            let object = thread.stack.pop_obj_val()?;
            vm.monitors.enter(&vm.threads.lock, &thread.shared, object);
            Ok(Flow::Advance(1))
        }
        Op::Monitorexit => {
            let object = thread.stack.pop_obj_val()?;
            if !vm.monitors.exit(&vm.threads.lock, &thread.shared, object) {
                throw_exception!(IllegalMonitorStateException)?
            }
            Ok(Flow::Advance(1))
        }
        Op::MonitorenterSpecial => {
            let receiver = thread.stack.get_local(0)?.as_obj_ref()?;
            vm.monitors.enter(&vm.threads.lock, &thread.shared, receiver);
            Ok(Flow::Advance(1))
        }
        Op::MonitorenterSpecialStatic => {
            let class_id = thread.stack.cur_java_frame()?.class_id();
            let mirror = vm.class_mirror(thread, class_id)?;
            vm.monitors.enter(&vm.threads.lock, &thread.shared, mirror);
            Ok(Flow::Advance(1))
        }
    }
}

// ---------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------

fn push(thread: &mut VmThread, value: Value, size: usize) -> Result<Flow, VmError> {
    thread.stack.push_operand(value)?;
    Ok(Flow::Advance(size))
}

fn is_wide(value: Value) -> bool {
    matches!(value, Value::Long(_) | Value::Double(_))
}

/// Pops one computational-type-2 value or two type-1 values, preserving
/// order for re-push.
fn pop_group(thread: &mut VmThread) -> Result<Vec<Value>, VmError> {
    let v1 = thread.stack.pop_operand()?;
    if is_wide(v1) {
        Ok(vec![v1])
    } else {
        let v2 = thread.stack.pop_operand()?;
        Ok(vec![v2, v1])
    }
}

fn push_group(thread: &mut VmThread, group: &[Value]) -> Result<(), VmError> {
    for &v in group {
        thread.stack.push_operand(v)?;
    }
    Ok(())
}

fn load_local(thread: &mut VmThread, index: usize, size: usize) -> Result<Flow, VmError> {
    let value = *thread.stack.get_local(index)?;
    push(thread, value, size)
}

fn store_local(thread: &mut VmThread, index: usize, size: usize) -> Result<Flow, VmError> {
    let value = thread.stack.pop_operand()?;
    thread.stack.set_local(index, value)?;
    Ok(Flow::Advance(size))
}

fn int_binop(
    thread: &mut VmThread,
    f: impl FnOnce(i32, i32) -> Result<i32, VmError>,
) -> Result<Flow, VmError> {
    let b = thread.stack.pop_int_val()?;
    let a = thread.stack.pop_int_val()?;
    let r = f(a, b)?;
    push(thread, Value::Integer(r), 1)
}

fn long_binop(
    thread: &mut VmThread,
    f: impl FnOnce(i64, i64) -> Result<i64, VmError>,
) -> Result<Flow, VmError> {
    let b = thread.stack.pop_long_val()?;
    let a = thread.stack.pop_long_val()?;
    let r = f(a, b)?;
    push(thread, Value::Long(r), 1)
}

fn float_binop(thread: &mut VmThread, f: impl FnOnce(f32, f32) -> f32) -> Result<Flow, VmError> {
    let b = thread.stack.pop_float_val()?;
    let a = thread.stack.pop_float_val()?;
    push(thread, Value::Float(f(a, b)), 1)
}

fn double_binop(thread: &mut VmThread, f: impl FnOnce(f64, f64) -> f64) -> Result<Flow, VmError> {
    let b = thread.stack.pop_double_val()?;
    let a = thread.stack.pop_double_val()?;
    push(thread, Value::Double(f(a, b)), 1)
}

fn convert(
    thread: &mut VmThread,
    f: impl FnOnce(Value) -> Result<Value, VmError>,
) -> Result<Flow, VmError> {
    let v = thread.stack.pop_operand()?;
    push(thread, f(v)?, 1)
}

/// Floating comparison with the NaN polarity of the L/G variants: NaN
/// compares as `nan_result` (-1 for L, +1 for G).
fn fp_compare(a: f64, b: f64, nan_result: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => nan_result,
    }
}

fn branch_if(
    thread: &mut VmThread,
    code: &[u8],
    pc: usize,
    cond: impl FnOnce(i32) -> bool,
) -> Result<Flow, VmError> {
    let v = thread.stack.pop_int_val()?;
    Ok(if cond(v) {
        Flow::Jump(branch16(pc, code))
    } else {
        Flow::Advance(3)
    })
}

fn branch_icmp(
    thread: &mut VmThread,
    code: &[u8],
    pc: usize,
    cond: impl FnOnce(i32, i32) -> bool,
) -> Result<Flow, VmError> {
    let b = thread.stack.pop_int_val()?;
    let a = thread.stack.pop_int_val()?;
    Ok(if cond(a, b) {
        Flow::Jump(branch16(pc, code))
    } else {
        Flow::Advance(3)
    })
}

fn branch_acmp(
    thread: &mut VmThread,
    code: &[u8],
    pc: usize,
    want_equal: bool,
) -> Result<Flow, VmError> {
    let b = thread.stack.pop_nullable_ref()?;
    let a = thread.stack.pop_nullable_ref()?;
    Ok(if (a == b) == want_equal {
        Flow::Jump(branch16(pc, code))
    } else {
        Flow::Advance(3)
    })
}

fn handle_wide(thread: &mut VmThread, code: &[u8], pc: usize) -> Result<Flow, VmError> {
    let sub = Op::try_from(code[pc + 1])
        .map_err(|_| VmError::Internal("bad wide sub-opcode".to_string()))?;
    let index = u16_operand(code, pc + 2) as usize;
    match sub {
        Op::Iload | Op::Lload | Op::Fload | Op::Dload | Op::Aload => {
            let value = *thread.stack.get_local(index)?;
            thread.stack.push_operand(value)?;
            Ok(Flow::Advance(4))
        }
        Op::Istore | Op::Lstore | Op::Fstore | Op::Dstore | Op::Astore => {
            let value = thread.stack.pop_operand()?;
            thread.stack.set_local(index, value)?;
            Ok(Flow::Advance(4))
        }
        Op::Iinc => {
            let delta = i16_operand(code, pc + 4) as i32;
            let value = thread.stack.get_local(index)?.as_int()?;
            thread.stack.set_local(index, Value::Integer(value.wrapping_add(delta)))?;
            Ok(Flow::Advance(6))
        }
        _ => Err(VmError::Internal("bad wide sub-opcode".to_string())),
    }
}

// ---------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------

fn handle_ldc(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    idx: u16,
    size: usize,
) -> Result<Flow, VmError> {
    use crate::rt::constant_pool::RuntimeConstant;

    let frame_class = thread.stack.cur_java_frame()?.class_id();
    let value = {
        let ma = vm.method_area_read();
        let cp = ma.get_cp_arc(&frame_class)?;
        match cp.entry(idx)? {
            RuntimeConstant::Integer(v) => Value::Integer(*v),
            RuntimeConstant::Float(v) => Value::Float(*v),
            RuntimeConstant::Long(v) => Value::Long(*v),
            RuntimeConstant::Double(v) => Value::Double(*v),
            other => {
                return Err(VmError::Internal(format!(
                    "ldc of a {} survived translation",
                    other.get_type()
                )));
            }
        }
    };
    push(thread, value, size)
}

/// Resolved `ldc` of a String or Class constant: the reference was cached
/// at prelink time.
fn handle_ldc_ref(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    idx: u16,
    size: usize,
) -> Result<Flow, VmError> {
    use crate::rt::constant_pool::RuntimeConstant;

    let frame_class = thread.stack.cur_java_frame()?.class_id();
    let reference = {
        let ma = vm.method_area_read();
        let cp = ma.get_cp_arc(&frame_class)?;
        match cp.entry(idx)? {
            RuntimeConstant::String(entry) => entry.resolved_ref.get().copied(),
            RuntimeConstant::Class(entry) => entry
                .resolved
                .get()
                .and_then(|id| ma.get_class(id).get_mirror_ref()),
            _ => None,
        }
    };
    match reference {
        Some(r) => push(thread, Value::Ref(r), size),
        None => Err(VmError::Unlinked("ldc constant not resolved")),
    }
}

// ---------------------------------------------------------------------
// Arrays
// ---------------------------------------------------------------------

fn handle_aastore(thread: &mut VmThread, vm: &VirtualMachine) -> Result<Flow, VmError> {
    let value = thread.stack.pop_nullable_ref()?;
    let index = thread.stack.pop_int_val()?;
    let array = thread.stack.pop_obj_val()?;

    // A stored reference must be assignable to the element class.
    if let Value::Ref(r) = value {
        let array_class = vm.heap.class_id_of(array)?;
        let value_class = vm.heap.class_id_of(r)?;
        let ma = vm.method_area_read();
        let element = match ma.get_class(&array_class) {
            RuntimeClass::InstanceArray(a) => a.element_class_id,
            _ => {
                return Err(VmError::Internal("aastore into a non-reference array".to_string()));
            }
        };
        if !ma.is_assignable_from(element, value_class) {
            let name = ma.interner().resolve(&ma.get_class(&value_class).get_name());
            let msg = name.replace('/', ".");
            drop(ma);
            throw_exception!(ArrayStoreException, msg)?
        }
    }

    vm.heap.write_element(array, index, value)?;
    Ok(Flow::Advance(1))
}

fn handle_newarray(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let atype = ArrayTypeCode::try_from(code[pc + 1])
        .map_err(|_| VmError::Internal("bad newarray type survived translation".to_string()))?;
    let count = thread.stack.pop_int_val()?;
    if count < 0 {
        throw_exception!(NegativeArraySizeException, count.to_string())?
    }

    let class_id = {
        let ma = vm.method_area_read();
        let sym = ma.interner().get_or_intern(atype.descriptor());
        ma.lookup_class_id(sym)
            .ok_or(VmError::Unlinked("primitive array class"))?
    };
    let elem = {
        let ma = vm.method_area_read();
        ma.get_class(&class_id)
            .primitive_element()
            .ok_or(VmError::Unlinked("primitive array element"))?
    };

    let array = vm.alloc_primitive_array(thread, class_id, elem, count)?;
    push(thread, Value::Ref(array), 2)
}

fn handle_anewarray(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let count = thread.stack.pop_int_val()?;
    if count < 0 {
        throw_exception!(NegativeArraySizeException, count.to_string())?
    }

    let element = resolved_class_operand(thread, vm, code, pc)?;
    let array_class = {
        let ma = vm.method_area_read();
        ma.array_class_for_element(element)
            .ok_or(VmError::Unlinked("array class for element"))?
    };

    let array = vm.alloc_reference_array(thread, array_class, count)?;
    push(thread, Value::Ref(array), 3)
}

fn handle_multianewarray(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let array_class = resolved_class_operand(thread, vm, code, pc)?;
    let dims = code[pc + 3] as usize;

    let mut counts = vec![0i32; dims];
    for i in (0..dims).rev() {
        counts[i] = thread.stack.pop_int_val()?;
        if counts[i] < 0 {
            throw_exception!(NegativeArraySizeException, counts[i].to_string())?
        }
    }

    let array = build_multi_array(thread, vm, array_class, &counts)?;
    push(thread, if array == JNULL { Value::Null } else { Value::Ref(array) }, 4)
}

/// Builds nested arrays depth-first. The freshly created outer array goes
/// on the temporary-roots stack before the recursion so the inner
/// allocations cannot lose it to a collection.
fn build_multi_array(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    array_class: ClassId,
    counts: &[i32],
) -> Result<HeapRef, VmError> {
    let count = counts[0];
    if count == 0 {
        return Ok(JNULL);
    }

    let (element_class, primitive) = {
        let ma = vm.method_area_read();
        match ma.get_class(&array_class) {
            RuntimeClass::InstanceArray(a) => (Some(a.element_class_id), None),
            RuntimeClass::PrimitiveArray(a) => (None, Some(a.element_type)),
            other => {
                return Err(VmError::Internal(format!("multianewarray of {}", other)));
            }
        }
    };

    if counts.len() == 1 {
        return match primitive {
            Some(elem) => vm.alloc_primitive_array(thread, array_class, elem, count),
            None => vm.alloc_reference_array(thread, array_class, count),
        };
    }

    let element_class = element_class.ok_or(VmError::Unlinked("nested array element class"))?;
    let array = vm.alloc_reference_array(thread, array_class, count)?;

    thread.roots.push(array);
    for i in 0..count {
        let nested = build_multi_array(thread, vm, element_class, &counts[1..])?;
        let value = if nested == JNULL { Value::Null } else { Value::Ref(nested) };
        vm.heap.write_element(array, i, value)?;
    }
    thread.roots.pop();

    Ok(array)
}

// ---------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------

fn getfield(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
    ty: AllocationType,
) -> Result<Flow, VmError> {
    let offset = u16_operand(code, pc + 1);
    let object = thread.stack.pop_obj_val()?;
    let value = vm.heap.read_field(object, FieldOffset::NonRef(offset), ty)?;
    push(thread, value, 3)
}

fn getfield_bit(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let bit = u16_operand(code, pc + 1) as u32;
    let object = thread.stack.pop_obj_val()?;
    let value = vm
        .heap
        .read_field(object, FieldOffset::Bit(bit), AllocationType::Boolean)?;
    push(thread, value, 3)
}

fn putfield(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
    ty: AllocationType,
) -> Result<Flow, VmError> {
    let offset = u16_operand(code, pc + 1);
    let value = thread.stack.pop_operand()?;
    let object = thread.stack.pop_obj_val()?;
    vm.heap.write_field(object, FieldOffset::NonRef(offset), ty, value)?;
    Ok(Flow::Advance(3))
}

fn putfield_bit(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let bit = u16_operand(code, pc + 1) as u32;
    let value = thread.stack.pop_operand()?;
    let object = thread.stack.pop_obj_val()?;
    vm.heap
        .write_field(object, FieldOffset::Bit(bit), AllocationType::Boolean, value)?;
    Ok(Flow::Advance(3))
}

fn static_cell(
    thread: &VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<crate::rt::field::StaticCell, VmError> {
    let idx = u16_operand(code, pc + 1);
    let frame_class = thread.stack.cur_java_frame()?.class_id();
    let ma = vm.method_area_read();
    ma.get_cp_arc(&frame_class)?
        .resolved_static_field(idx)?
        .ok_or(VmError::Unlinked("static field not resolved"))
}

fn getstatic(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let cell = static_cell(thread, vm, code, pc)?;
    let value = vm.heap.read_typed(cell.offset, cell.ty);
    push(thread, value, 3)
}

fn putstatic(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let cell = static_cell(thread, vm, code, pc)?;
    let value = thread.stack.pop_operand()?;
    vm.heap.write_typed(cell.offset, cell.ty, value)?;
    Ok(Flow::Advance(3))
}

// ---------------------------------------------------------------------
// Object creation
// ---------------------------------------------------------------------

fn resolved_class_operand(
    thread: &VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<ClassId, VmError> {
    let idx = u16_operand(code, pc + 1);
    let frame_class = thread.stack.cur_java_frame()?.class_id();
    let ma = vm.method_area_read();
    ma.get_cp_arc(&frame_class)?
        .resolved_class(idx)?
        .ok_or(VmError::Unlinked("class constant not resolved"))
}

fn handle_new(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
    finalizable: bool,
) -> Result<Flow, VmError> {
    let class_id = resolved_class_operand(thread, vm, code, pc)?;
    let object = vm.alloc_instance(thread, class_id)?;
    if finalizable {
        vm.heap.register_finalizable(object);
    }
    push(thread, Value::Ref(object), 3)
}

// ---------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------

fn handle_invokevirtual(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let packed = u16_operand(code, pc + 1);
    let args = Interpreter::pop_args(thread, unpack_dispatch_args(packed))?;
    let receiver = args[0].as_obj_ref()?;

    // The receiver's class picks the target through its dispatch table.
    let receiver_class = vm.heap.class_id_of(receiver)?;
    let method_id = {
        let ma = vm.method_area_read();
        ma.get_class(&receiver_class).dispatch(unpack_dispatch_index(packed))?
    };

    Interpreter::invoke_and_push(thread, method_id, args, vm)?;
    Ok(Flow::Advance(3))
}

fn resolved_method_operand(
    thread: &VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<crate::keys::MethodId, VmError> {
    let idx = u16_operand(code, pc + 1);
    let frame_class = thread.stack.cur_java_frame()?.class_id();
    let ma = vm.method_area_read();
    ma.get_cp_arc(&frame_class)?
        .resolved_method(idx)?
        .ok_or(VmError::Unlinked("method constant not resolved"))
}

fn handle_invokespecial(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let method_id = resolved_method_operand(thread, vm, code, pc)?;
    let args_count = {
        let ma = vm.method_area_read();
        ma.get_method(&method_id).args_count() as usize
    };
    let args = Interpreter::pop_args(thread, args_count)?;
    args[0].as_obj_ref()?;

    Interpreter::invoke_and_push(thread, method_id, args, vm)?;
    Ok(Flow::Advance(3))
}

/// ACC_SUPER form of invokespecial: the target comes out of the parent of
/// the *call site's* class, at the slot packed into the operand.
fn handle_invokesuper(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let packed = u16_operand(code, pc + 1);
    let args = Interpreter::pop_args(thread, unpack_dispatch_args(packed))?;
    args[0].as_obj_ref()?;

    let frame_class = thread.stack.cur_java_frame()?.class_id();
    let method_id = {
        let ma = vm.method_area_read();
        let super_id = ma
            .get_class(&frame_class)
            .get_super_id()
            .ok_or(VmError::Unlinked("super call without a parent"))?;
        ma.get_class(&super_id).dispatch(unpack_dispatch_index(packed))?
    };

    Interpreter::invoke_and_push(thread, method_id, args, vm)?;
    Ok(Flow::Advance(3))
}

fn handle_invokestatic(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let method_id = resolved_method_operand(thread, vm, code, pc)?;
    let args_count = {
        let ma = vm.method_area_read();
        ma.get_method(&method_id).args_count() as usize
    };
    let args = Interpreter::pop_args(thread, args_count)?;
    Interpreter::invoke_and_push(thread, method_id, args, vm)?;
    Ok(Flow::Advance(3))
}

fn handle_invokeinterface(
    thread: &mut VmThread,
    vm: &VirtualMachine,
    code: &[u8],
    pc: usize,
) -> Result<Flow, VmError> {
    let packed = u16_operand(code, pc + 1);
    let args = Interpreter::pop_args(thread, unpack_dispatch_args(packed))?;
    let receiver = args[0].as_obj_ref()?;

    // Binary search over the receiver class's sorted interface table.
    let receiver_class = vm.heap.class_id_of(receiver)?;
    let method_id = {
        let ma = vm.method_area_read();
        ma.get_class(&receiver_class)
            .interface_dispatch(unpack_dispatch_index(packed) as u16)?
    };

    Interpreter::invoke_and_push(thread, method_id, args, vm)?;
    Ok(Flow::Advance(5))
}

// ---------------------------------------------------------------------
// Synchronized method exit
// ---------------------------------------------------------------------

fn release_method_monitor(thread: &mut VmThread, vm: &VirtualMachine) -> Result<(), VmError> {
    let (method_id, class_id) = {
        let frame = thread.stack.cur_java_frame()?;
        (frame.method_id(), frame.class_id())
    };
    let is_static = {
        let ma = vm.method_area_read();
        ma.get_method(&method_id).is_static()
    };

    let monitor_ref = if is_static {
        vm.class_mirror(thread, class_id)?
    } else {
        thread.stack.get_local(0)?.as_obj_ref()?
    };

    if !vm.monitors.exit(&vm.threads.lock, &thread.shared, monitor_ref) {
        throw_exception!(IllegalMonitorStateException)?
    }
    Ok(())
}
