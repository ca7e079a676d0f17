//! One-shot bytecode translation, run the first time a method's code is
//! needed. Consumes the class-file opcode stream and produces the internal
//! form: multi-byte immediates in host byte order, prelink sentinels in
//! place of symbolic opcodes, synchronized-method entry and return
//! rewriting, and the static checks a preverified method must still pass.
//! The output buffer is one byte longer than the input for synchronized
//! methods (the synthetic monitor-enter slot); all relative branches and
//! handler ranges shift accordingly.

use crate::error::VmError;
use crate::rt::constant_pool::{RuntimeConstantPool, RuntimeConstantType};
use crate::throw_exception;
use crate::translator::opcode::{ArrayTypeCode, JavaOpcode, Op};
use byteorder::{BigEndian, ByteOrder};
use valka_classfile::method::ExceptionTableEntry;

pub mod opcode;

pub struct TranslationInput<'a> {
    pub code: &'a [u8],
    pub handlers: &'a [ExceptionTableEntry],
    pub max_locals: u16,
    pub cp: &'a RuntimeConstantPool,
    pub synchronized: bool,
    pub is_static: bool,
}

pub fn translate(
    input: TranslationInput<'_>,
) -> Result<(Vec<u8>, Vec<ExceptionTableEntry>), VmError> {
    let shift = input.synchronized as usize;
    let len = input.code.len() + shift;
    if len == 0 || len > u16::MAX as usize {
        throw_exception!(ClassFormatError, "method code length out of range")?
    }

    let mut code = vec![0u8; len];
    code[shift..].copy_from_slice(input.code);
    if input.synchronized {
        code[0] = if input.is_static {
            Op::MonitorenterSpecialStatic as u8
        } else {
            Op::MonitorenterSpecial as u8
        };
    }

    let mut t = Translator {
        code,
        shift,
        max_locals: input.max_locals,
        cp: input.cp,
        synchronized: input.synchronized,
    };
    t.run()?;

    // Handler ranges move with the code and must stay inside it.
    let mut handlers = Vec::with_capacity(input.handlers.len());
    for entry in input.handlers {
        let start_pc = entry.start_pc + shift as u16;
        let end_pc = entry.end_pc + shift as u16;
        let handler_pc = entry.handler_pc + shift as u16;
        if start_pc >= end_pc || end_pc as usize > len || handler_pc as usize >= len {
            throw_exception!(ClassFormatError, "exception handler out of range")?
        }
        handlers.push(ExceptionTableEntry {
            start_pc,
            end_pc,
            handler_pc,
            catch_type: entry.catch_type,
        });
    }

    Ok((t.code, handlers))
}

struct Translator<'a> {
    code: Vec<u8>,
    shift: usize,
    max_locals: u16,
    cp: &'a RuntimeConstantPool,
    synchronized: bool,
}

impl Translator<'_> {
    fn run(&mut self) -> Result<(), VmError> {
        let len = self.code.len();
        let mut i = self.shift;

        while i < len {
            let op = JavaOpcode::try_from(self.code[i]).map_err(|_| {
                crate::build_exception!(ClassFormatError, "unknown opcode {}", self.code[i])
            })?;
            i = self.translate_at(op, i)?;
            if i > len {
                throw_exception!(ClassFormatError, "truncated instruction at end of code")?
            }
        }
        Ok(())
    }

    fn need(&self, pos: usize, bytes: usize) -> Result<(), VmError> {
        if pos + bytes > self.code.len() {
            throw_exception!(ClassFormatError, "truncated instruction")?
        }
        Ok(())
    }

    /// Reads a big-endian u16 operand and rewrites it in host order.
    fn swap_u16(&mut self, pos: usize) -> Result<u16, VmError> {
        self.need(pos, 2)?;
        let value = BigEndian::read_u16(&self.code[pos..]);
        self.code[pos..pos + 2].copy_from_slice(&value.to_ne_bytes());
        Ok(value)
    }

    fn swap_i32(&mut self, pos: usize) -> Result<i32, VmError> {
        self.need(pos, 4)?;
        let value = BigEndian::read_i32(&self.code[pos..]);
        self.code[pos..pos + 4].copy_from_slice(&value.to_ne_bytes());
        Ok(value)
    }

    fn set_op(&mut self, pos: usize, op: Op) {
        self.code[pos] = op as u8;
    }

    fn check_local(&self, index: u16) -> Result<(), VmError> {
        if index >= self.max_locals {
            throw_exception!(
                ClassFormatError,
                "local variable index {} out of range",
                index
            )?
        }
        Ok(())
    }

    fn check_branch(&self, from: usize, offset: i32) -> Result<(), VmError> {
        let target = from as i64 + offset as i64;
        if target < 0 || target >= self.code.len() as i64 {
            throw_exception!(ClassFormatError, "branch target out of range")?
        }
        Ok(())
    }

    fn check_cp_type(&self, idx: u16, expected: RuntimeConstantType) -> Result<(), VmError> {
        let actual = self.cp.entry(idx)?.get_type();
        if actual != expected {
            throw_exception!(
                ClassFormatError,
                "constant pool entry {} is a {}, expected a {}",
                idx,
                actual,
                expected
            )?
        }
        Ok(())
    }

    fn translate_at(&mut self, op: JavaOpcode, i: usize) -> Result<usize, VmError> {
        use JavaOpcode as J;

        Ok(match op {
            // One-byte opcodes that translate to themselves.
            J::Nop
            | J::AconstNull
            | J::IconstM1
            | J::Iconst0
            | J::Iconst1
            | J::Iconst2
            | J::Iconst3
            | J::Iconst4
            | J::Iconst5
            | J::Lconst0
            | J::Lconst1
            | J::Fconst0
            | J::Fconst1
            | J::Fconst2
            | J::Dconst0
            | J::Dconst1
            | J::Iaload
            | J::Laload
            | J::Faload
            | J::Daload
            | J::Aaload
            | J::Baload
            | J::Caload
            | J::Saload
            | J::Iastore
            | J::Lastore
            | J::Fastore
            | J::Dastore
            | J::Aastore
            | J::Bastore
            | J::Castore
            | J::Sastore
            | J::Pop
            | J::Pop2
            | J::Dup
            | J::DupX1
            | J::DupX2
            | J::Dup2
            | J::Dup2X1
            | J::Dup2X2
            | J::Swap
            | J::Iadd
            | J::Ladd
            | J::Fadd
            | J::Dadd
            | J::Isub
            | J::Lsub
            | J::Fsub
            | J::Dsub
            | J::Imul
            | J::Lmul
            | J::Fmul
            | J::Dmul
            | J::Idiv
            | J::Ldiv
            | J::Fdiv
            | J::Ddiv
            | J::Irem
            | J::Lrem
            | J::Frem
            | J::Drem
            | J::Ineg
            | J::Lneg
            | J::Fneg
            | J::Dneg
            | J::Ishl
            | J::Lshl
            | J::Ishr
            | J::Lshr
            | J::Iushr
            | J::Lushr
            | J::Iand
            | J::Land
            | J::Ior
            | J::Lor
            | J::Ixor
            | J::Lxor
            | J::I2l
            | J::I2f
            | J::I2d
            | J::L2i
            | J::L2f
            | J::L2d
            | J::F2i
            | J::F2l
            | J::F2d
            | J::D2i
            | J::D2l
            | J::D2f
            | J::I2b
            | J::I2c
            | J::I2s
            | J::Lcmp
            | J::Fcmpl
            | J::Fcmpg
            | J::Dcmpl
            | J::Dcmpg
            | J::Arraylength
            | J::Athrow
            | J::Monitorenter
            | J::Monitorexit => i + 1,

            J::Bipush => {
                self.need(i + 1, 1)?;
                i + 2
            }

            J::Sipush => {
                self.swap_u16(i + 1)?;
                i + 3
            }

            J::Ldc => {
                self.need(i + 1, 1)?;
                let idx = self.code[i + 1] as u16;
                match self.cp.entry(idx)?.get_type() {
                    RuntimeConstantType::String | RuntimeConstantType::Class => {
                        self.set_op(i, Op::LdcPrelink);
                    }
                    RuntimeConstantType::Integer | RuntimeConstantType::Float => {}
                    other => throw_exception!(
                        ClassFormatError,
                        "ldc of a {} constant",
                        other
                    )?,
                }
                i + 2
            }

            J::LdcW => {
                let idx = self.swap_u16(i + 1)?;
                match self.cp.entry(idx)?.get_type() {
                    RuntimeConstantType::String | RuntimeConstantType::Class => {
                        self.set_op(i, Op::LdcWPrelink);
                    }
                    RuntimeConstantType::Integer | RuntimeConstantType::Float => {}
                    other => throw_exception!(
                        ClassFormatError,
                        "ldc_w of a {} constant",
                        other
                    )?,
                }
                i + 3
            }

            J::Ldc2W => {
                let idx = self.swap_u16(i + 1)?;
                match self.cp.entry(idx)?.get_type() {
                    RuntimeConstantType::Long | RuntimeConstantType::Double => {}
                    other => throw_exception!(
                        ClassFormatError,
                        "ldc2_w of a {} constant",
                        other
                    )?,
                }
                i + 3
            }

            J::Iload | J::Lload | J::Fload | J::Dload | J::Aload | J::Istore | J::Lstore
            | J::Fstore | J::Dstore | J::Astore => {
                self.need(i + 1, 1)?;
                self.check_local(self.code[i + 1] as u16)?;
                i + 2
            }

            J::Iload0 | J::Lload0 | J::Fload0 | J::Dload0 | J::Aload0 | J::Istore0
            | J::Lstore0 | J::Fstore0 | J::Dstore0 | J::Astore0 => {
                self.check_local(0)?;
                i + 1
            }
            J::Iload1 | J::Lload1 | J::Fload1 | J::Dload1 | J::Aload1 | J::Istore1
            | J::Lstore1 | J::Fstore1 | J::Dstore1 | J::Astore1 => {
                self.check_local(1)?;
                i + 1
            }
            J::Iload2 | J::Lload2 | J::Fload2 | J::Dload2 | J::Aload2 | J::Istore2
            | J::Lstore2 | J::Fstore2 | J::Dstore2 | J::Astore2 => {
                self.check_local(2)?;
                i + 1
            }
            J::Iload3 | J::Lload3 | J::Fload3 | J::Dload3 | J::Aload3 | J::Istore3
            | J::Lstore3 | J::Fstore3 | J::Dstore3 | J::Astore3 => {
                self.check_local(3)?;
                i + 1
            }

            J::Iinc => {
                self.need(i + 1, 2)?;
                self.check_local(self.code[i + 1] as u16)?;
                i + 3
            }

            J::Ifeq | J::Ifne | J::Iflt | J::Ifge | J::Ifgt | J::Ifle | J::IfIcmpeq
            | J::IfIcmpne | J::IfIcmplt | J::IfIcmpge | J::IfIcmpgt | J::IfIcmple
            | J::IfAcmpeq | J::IfAcmpne | J::Goto | J::Ifnull | J::Ifnonnull => {
                let offset = self.swap_u16(i + 1)? as i16;
                self.check_branch(i, offset as i32)?;
                i + 3
            }

            J::GotoW => {
                let offset = self.swap_i32(i + 1)?;
                self.check_branch(i, offset)?;
                i + 5
            }

            // Preverified input cannot contain subroutine opcodes.
            J::Jsr | J::Ret | J::JsrW => {
                throw_exception!(ClassFormatError, "jsr/ret in preverified code")?
            }

            J::Tableswitch => {
                let mut cursor = i + 1 + self.switch_padding(i);
                let default = self.swap_i32(cursor)?;
                self.check_branch(i, default)?;
                let low = self.swap_i32(cursor + 4)?;
                let high = self.swap_i32(cursor + 8)?;
                if high < low {
                    throw_exception!(ClassFormatError, "tableswitch high below low")?
                }
                cursor += 12;
                for _ in 0..=(high as i64 - low as i64) {
                    let offset = self.swap_i32(cursor)?;
                    self.check_branch(i, offset)?;
                    cursor += 4;
                }
                cursor
            }

            J::Lookupswitch => {
                let mut cursor = i + 1 + self.switch_padding(i);
                let default = self.swap_i32(cursor)?;
                self.check_branch(i, default)?;
                let npairs = self.swap_i32(cursor + 4)?;
                if npairs < 0 {
                    throw_exception!(ClassFormatError, "negative lookupswitch pair count")?
                }
                cursor += 8;
                let mut previous: Option<i32> = None;
                for _ in 0..npairs {
                    let key = self.swap_i32(cursor)?;
                    if previous.is_some_and(|p| p >= key) {
                        throw_exception!(
                            ClassFormatError,
                            "lookupswitch keys not strictly ascending"
                        )?
                    }
                    previous = Some(key);
                    let offset = self.swap_i32(cursor + 4)?;
                    self.check_branch(i, offset)?;
                    cursor += 8;
                }
                cursor
            }

            J::Ireturn => {
                if self.synchronized {
                    self.set_op(i, Op::IreturnMonitorexit);
                }
                i + 1
            }
            J::Lreturn => {
                if self.synchronized {
                    self.set_op(i, Op::LreturnMonitorexit);
                }
                i + 1
            }
            J::Freturn => {
                if self.synchronized {
                    self.set_op(i, Op::FreturnMonitorexit);
                }
                i + 1
            }
            J::Dreturn => {
                if self.synchronized {
                    self.set_op(i, Op::DreturnMonitorexit);
                }
                i + 1
            }
            J::Areturn => {
                if self.synchronized {
                    self.set_op(i, Op::AreturnMonitorexit);
                }
                i + 1
            }
            J::Return => {
                if self.synchronized {
                    self.set_op(i, Op::ReturnMonitorexit);
                }
                i + 1
            }

            J::Getstatic | J::Putstatic | J::Getfield | J::Putfield => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::Field)?;
                let sentinel = match op {
                    J::Getstatic => Op::GetstaticPrelink,
                    J::Putstatic => Op::PutstaticPrelink,
                    J::Getfield => Op::GetfieldPrelink,
                    _ => Op::PutfieldPrelink,
                };
                self.set_op(i, sentinel);
                i + 3
            }

            J::Invokevirtual | J::Invokespecial | J::Invokestatic => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::Method)?;
                let sentinel = match op {
                    J::Invokevirtual => Op::InvokevirtualPrelink,
                    J::Invokespecial => Op::InvokespecialPrelink,
                    _ => Op::InvokestaticPrelink,
                };
                self.set_op(i, sentinel);
                i + 3
            }

            J::Invokeinterface => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::InterfaceMethod)?;
                self.need(i + 3, 2)?;
                if self.code[i + 3] == 0 {
                    throw_exception!(ClassFormatError, "invokeinterface count is zero")?
                }
                // The count and pad bytes turn into no-ops so the next
                // instruction starts at the right offset.
                self.code[i + 3] = Op::Nop as u8;
                self.code[i + 4] = Op::Nop as u8;
                self.set_op(i, Op::InvokeinterfacePrelink);
                i + 5
            }

            J::New => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::Class)?;
                self.set_op(i, Op::NewPrelink);
                i + 3
            }

            J::Newarray => {
                self.need(i + 1, 1)?;
                if ArrayTypeCode::try_from(self.code[i + 1]).is_err() {
                    throw_exception!(
                        ClassFormatError,
                        "invalid newarray type code {}",
                        self.code[i + 1]
                    )?
                }
                self.set_op(i, Op::NewarrayPrelink);
                i + 2
            }

            J::Anewarray => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::Class)?;
                self.set_op(i, Op::AnewarrayPrelink);
                i + 3
            }

            J::Checkcast => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::Class)?;
                self.set_op(i, Op::CheckcastPrelink);
                i + 3
            }

            J::Instanceof => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::Class)?;
                self.set_op(i, Op::InstanceofPrelink);
                i + 3
            }

            J::Multianewarray => {
                let idx = self.swap_u16(i + 1)?;
                self.check_cp_type(idx, RuntimeConstantType::Class)?;
                self.need(i + 3, 1)?;
                if self.code[i + 3] == 0 {
                    throw_exception!(ClassFormatError, "multianewarray with zero dimensions")?
                }
                self.set_op(i, Op::MultianewarrayPrelink);
                i + 4
            }

            J::Wide => {
                self.need(i + 1, 1)?;
                let sub = JavaOpcode::try_from(self.code[i + 1]).map_err(|_| {
                    crate::build_exception!(ClassFormatError, "bad wide sub-opcode")
                })?;
                match sub {
                    J::Iload | J::Lload | J::Fload | J::Dload | J::Aload | J::Istore
                    | J::Lstore | J::Fstore | J::Dstore | J::Astore => {
                        let index = self.swap_u16(i + 2)?;
                        self.check_local(index)?;
                        i + 4
                    }
                    J::Iinc => {
                        let index = self.swap_u16(i + 2)?;
                        self.check_local(index)?;
                        self.swap_u16(i + 4)?;
                        i + 6
                    }
                    J::Ret => throw_exception!(ClassFormatError, "jsr/ret in preverified code")?,
                    _ => throw_exception!(ClassFormatError, "bad wide sub-opcode")?,
                }
            }
        })
    }

    /// Switch payload padding: the cells are 4-byte aligned relative to the
    /// method's original code start, so a synchronized method's one-byte
    /// shift is subtracted before aligning.
    fn switch_padding(&self, i: usize) -> usize {
        let original_pc = i - self.shift;
        (4 - ((original_pc + 1) % 4)) % 4
    }
}

/// Recomputes the padding of a switch payload at execution time; mirrors
/// `switch_padding` above.
pub fn switch_payload_offset(pc: usize, shift: usize) -> usize {
    let original_pc = pc - shift;
    pc + 1 + (4 - ((original_pc + 1) % 4)) % 4
}
