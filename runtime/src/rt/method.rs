use crate::error::VmError;
use crate::keys::{ClassId, MethodDescriptorId, Symbol};
use crate::native::NativeFn;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex};
use valka_classfile::flags::MethodFlags;
use valka_classfile::method::{CodeAttribute, ExceptionTableEntry, MethodInfo};

/// Translated bytecode, living in a raw chunk on the GC heap. Cheap to
/// clone; the interpreter copies it out of the method so it can run without
/// borrowing the method area.
#[derive(Clone)]
pub struct TranslatedCode {
    /// Byte offset of the code buffer within the heap.
    pub code_off: usize,
    pub code_len: usize,
    pub max_stack: u16,
    pub max_locals: u16,
    /// One for synchronized methods (the synthetic monitor-enter slot),
    /// zero otherwise. Switch payload alignment is relative to the original
    /// code start, so decoding needs it.
    pub sync_shift: u8,
    pub handlers: Arc<[ExceptionTableEntry]>,
}

/// Bytecode states: raw as parsed from the class file, translated into the
/// internal opcode set, or purged (a class initializer whose work is done).
pub enum CodeState {
    Raw {
        code: Vec<u8>,
        handlers: Vec<ExceptionTableEntry>,
    },
    Translated(TranslatedCode),
    Purged,
}

pub struct InterpretedBody {
    pub max_stack: u16,
    pub max_locals: u16,
    /// Guarded by the global VM lock for all transitions; the mutex is
    /// never contended across threads that do not hold it.
    code: Mutex<CodeState>,
}

pub enum MethodBody {
    Interpreted(InterpretedBody),
    /// Function pointer resolved from the native table on first use.
    Native(OnceCell<NativeFn>),
    Abstract,
}

pub struct Method {
    class_id: ClassId,
    pub name: Symbol,
    pub desc: Symbol,
    descriptor_id: MethodDescriptorId,
    flags: MethodFlags,
    /// Virtual dispatch slot, or the globally unique interface method id
    /// for interface methods. Static, private and initializer methods keep
    /// a nominal zero and are never dispatched through a table.
    index: OnceCell<u16>,
    /// Operand values an invocation pops, receiver included.
    args_count: u8,
    pub body: MethodBody,
}

impl Method {
    pub fn new(
        info: MethodInfo,
        class_id: ClassId,
        descriptor_id: MethodDescriptorId,
        name: Symbol,
        desc: Symbol,
        args_count: u8,
    ) -> Result<Self, VmError> {
        let flags = info.access_flags;
        let body = if flags.is_native() {
            MethodBody::Native(OnceCell::new())
        } else if flags.is_abstract() {
            MethodBody::Abstract
        } else {
            let code: CodeAttribute = info.code.ok_or_else(|| {
                crate::build_exception!(ClassFormatError, "non-abstract method without code")
            })?;
            MethodBody::Interpreted(InterpretedBody {
                max_stack: code.max_stack,
                max_locals: code.max_locals,
                code: Mutex::new(CodeState::Raw {
                    code: code.code,
                    handlers: code.exception_table,
                }),
            })
        };

        Ok(Method {
            class_id,
            name,
            desc,
            descriptor_id,
            flags,
            index: OnceCell::new(),
            args_count,
            body,
        })
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn descriptor_id(&self) -> MethodDescriptorId {
        self.descriptor_id
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.flags.is_static()
    }

    pub fn is_native(&self) -> bool {
        self.flags.is_native()
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.is_abstract()
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.is_synchronized()
    }

    /// Operand values an invocation pops, receiver included.
    pub fn args_count(&self) -> u8 {
        self.args_count
    }

    pub fn set_index(&self, index: u16) {
        // Overriding methods get their parent's slot assigned a second time
        // during dispatch table construction; the value is identical.
        let _ = self.index.set(index);
    }

    pub fn index(&self) -> u16 {
        self.index.get().copied().unwrap_or(0)
    }

    /// Already-translated code, if any.
    pub fn cached_code(&self) -> Result<Option<TranslatedCode>, VmError> {
        match &self.body {
            MethodBody::Interpreted(body) => match &*body.code.lock().unwrap() {
                CodeState::Translated(tc) => Ok(Some(tc.clone())),
                CodeState::Raw { .. } => Ok(None),
                CodeState::Purged => Err(VmError::Internal(
                    "invoking a purged class initializer".to_string(),
                )),
            },
            _ => Err(VmError::Internal("code of a non-interpreted method".to_string())),
        }
    }

    /// Takes the raw bytecode out for translation. Caller must hold the
    /// global lock and install the result with `install_code`.
    pub fn take_raw_code(&self) -> Option<(Vec<u8>, Vec<ExceptionTableEntry>)> {
        match &self.body {
            MethodBody::Interpreted(body) => {
                let mut state = body.code.lock().unwrap();
                match &*state {
                    CodeState::Raw { .. } => {
                        match std::mem::replace(&mut *state, CodeState::Purged) {
                            CodeState::Raw { code, handlers } => Some((code, handlers)),
                            _ => unreachable!(),
                        }
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn install_code(&self, translated: TranslatedCode) {
        match &self.body {
            MethodBody::Interpreted(body) => {
                *body.code.lock().unwrap() = CodeState::Translated(translated);
            }
            _ => panic!("installing code on a non-interpreted method"),
        }
    }

    pub fn frame_attributes(&self) -> Result<(u16, u16), VmError> {
        match &self.body {
            MethodBody::Interpreted(body) => Ok((body.max_stack, body.max_locals)),
            _ => Err(VmError::Internal("frame attributes of a bodyless method".to_string())),
        }
    }

    /// Forgets the translated code of a class initializer once the class is
    /// initialized. Returns the heap chunk to free.
    pub fn purge_code(&self) -> Option<TranslatedCode> {
        match &self.body {
            MethodBody::Interpreted(body) => {
                let mut state = body.code.lock().unwrap();
                match std::mem::replace(&mut *state, CodeState::Purged) {
                    CodeState::Translated(tc) => Some(tc),
                    other => {
                        // Never translated; nothing on the heap to release.
                        *state = other;
                        None
                    }
                }
            }
            _ => None,
        }
    }

    pub fn native_fn(&self) -> Option<NativeFn> {
        match &self.body {
            MethodBody::Native(cell) => cell.get().copied(),
            _ => None,
        }
    }

    pub fn set_native_fn(&self, f: NativeFn) {
        match &self.body {
            MethodBody::Native(cell) => {
                let _ = cell.set(f);
            }
            _ => panic!("caching a native pointer on a non-native method"),
        }
    }
}

/// Per-chain packed operand for resolved virtual invocations: the low byte
/// holds the argument value count (receiver included), the high byte the
/// dispatch table index. Classes outgrowing either byte fail to link.
pub fn pack_dispatch(index: u16, args: u8) -> Result<u16, VmError> {
    if index > 0xFF {
        return Err(crate::build_exception!(
            VirtualMachineError,
            "dispatch table exceeds the packed-index limit"
        ));
    }
    Ok((index << 8) | args as u16)
}

pub fn unpack_dispatch_index(packed: u16) -> usize {
    (packed >> 8) as usize
}

pub fn unpack_dispatch_args(packed: u16) -> usize {
    (packed & 0xFF) as usize
}
