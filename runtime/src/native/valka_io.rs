//! Raw standard-stream natives the minimal console classes sit on. The
//! core has no I/O of its own; these are the well-known seams a class
//! library binds System.out / System.err to.

use crate::error::VmError;
use crate::native::NativeRegistry;
use crate::thread::VmThread;
use crate::vm::{Value, VirtualMachine};
use crate::throw_exception;
use lasso::ThreadedRodeo;
use std::io::Write;

pub(super) fn register(registry: &mut NativeRegistry, interner: &ThreadedRodeo) {
    let stdio = "valka/io/Stdio";
    registry.register(interner, stdio, "write", "(II)V", stdio_write_byte);
    registry.register(interner, stdio, "writeBytes", "(I[BII)V", stdio_write_bytes);
    registry.register(
        interner,
        stdio,
        "writeString",
        "(ILjava/lang/String;)V",
        stdio_write_string,
    );
    registry.register(interner, stdio, "flush", "(I)V", stdio_flush);
}

const STDOUT: i32 = 1;
const STDERR: i32 = 2;

fn write_all(fd: i32, bytes: &[u8]) -> Result<(), VmError> {
    let result = match fd {
        STDOUT => std::io::stdout().write_all(bytes),
        STDERR => std::io::stderr().write_all(bytes),
        _ => return throw_exception!(IllegalArgumentException, "unknown stream {}", fd),
    };
    result.map_err(|e| VmError::Internal(format!("stream write failed: {}", e)))
}

fn stdio_write_byte(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let fd = args[0].as_int()?;
    let byte = args[1].as_int()? as u8;
    write_all(fd, &[byte])?;
    Ok(None)
}

fn stdio_write_bytes(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let fd = args[0].as_int()?;
    let array = args[1].as_obj_ref()?;
    let offset = args[2].as_int()?;
    let length = args[3].as_int()?;

    let array_len = vm.heap.array_length(array)?;
    if offset < 0 || length < 0 || offset.checked_add(length).is_none_or(|end| end > array_len) {
        throw_exception!(ArrayIndexOutOfBoundsException, "write range out of bounds")?
    }

    let mut bytes = Vec::with_capacity(length as usize);
    for i in 0..length {
        bytes.push(vm.heap.read_element(array, offset + i)?.as_int()? as u8);
    }
    write_all(fd, &bytes)?;
    Ok(None)
}

fn stdio_write_string(
    vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let fd = args[0].as_int()?;
    let string = args[1].as_obj_ref()?;
    let text = vm.heap.java_string_to_rust(string)?;
    write_all(fd, text.as_bytes())?;
    Ok(None)
}

fn stdio_flush(
    _vm: &VirtualMachine,
    _thread: &mut VmThread,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    let result = match args[0].as_int()? {
        STDOUT => std::io::stdout().flush(),
        STDERR => std::io::stderr().flush(),
        fd => return throw_exception!(IllegalArgumentException, "unknown stream {}", fd),
    };
    result.map_err(|e| VmError::Internal(format!("stream flush failed: {}", e)))?;
    Ok(None)
}
