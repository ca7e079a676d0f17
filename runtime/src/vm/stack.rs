use crate::error::VmError;
use crate::heap::HeapRef;
use crate::keys::{ClassId, MethodId};
use crate::vm::Value;

pub struct JavaFrame {
    method_id: MethodId,
    class_id: ClassId,
    pc: usize,
    locals: Vec<Value>,
    operands: Vec<Value>,
}

impl JavaFrame {
    /// Builds a frame with the arguments installed in the locals. Longs and
    /// doubles occupy two slots in class-file numbering; the second slot is
    /// padded and never addressed by verified code.
    pub fn new(
        method_id: MethodId,
        class_id: ClassId,
        max_stack: u16,
        max_locals: u16,
        args: &[Value],
    ) -> Self {
        let mut locals = vec![Value::Null; max_locals as usize];
        let mut slot = 0;
        for &arg in args {
            locals[slot] = arg;
            slot += match arg {
                Value::Long(_) | Value::Double(_) => 2,
                _ => 1,
            };
        }

        JavaFrame {
            method_id,
            class_id,
            pc: 0,
            locals,
            operands: Vec::with_capacity(max_stack as usize),
        }
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn pc_mut(&mut self) -> &mut usize {
        &mut self.pc
    }

    pub fn increment_pc(&mut self, amount: usize) {
        self.pc += amount;
    }

    pub fn get_local(&self, index: usize) -> Result<&Value, VmError> {
        self.locals
            .get(index)
            .ok_or(VmError::LocalOutOfRange(index as u16))
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::LocalOutOfRange(index as u16)),
        }
    }

    /// Drops the operand stack down to nothing; the exception handler
    /// prologue pushes the thrown reference afterwards.
    pub fn truncate_operands(&mut self) {
        self.operands.clear();
    }

    /// Every value slot the collector must scan.
    pub fn gc_values(&self) -> impl Iterator<Item = &Value> {
        self.locals.iter().chain(self.operands.iter())
    }
}

pub struct NativeFrame {
    method_id: MethodId,
}

impl NativeFrame {
    pub fn new(method_id: MethodId) -> Self {
        NativeFrame { method_id }
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }
}

pub enum FrameType {
    Java(JavaFrame),
    Native(NativeFrame),
}

impl FrameType {
    pub fn is_native(&self) -> bool {
        matches!(self, FrameType::Native(_))
    }
}

/// Per-thread frame stack. Depth is bounded by configuration; running out
/// is a hard stack overflow, not a Java exception.
pub struct FrameStack {
    frames: Vec<FrameType>,
    limit: usize,
}

impl FrameStack {
    pub fn new(limit: usize) -> Self {
        FrameStack {
            frames: Vec::new(),
            limit,
        }
    }

    pub fn frames(&self) -> &[FrameType] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_frame(&mut self, frame: FrameType) -> Result<(), VmError> {
        if self.frames.len() >= self.limit {
            return Err(VmError::StackOverflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn cur_frame(&self) -> Result<&FrameType, VmError> {
        self.frames.last().ok_or(VmError::FrameStackIsEmpty)
    }

    pub fn cur_java_frame(&self) -> Result<&JavaFrame, VmError> {
        match self.frames.last() {
            Some(FrameType::Java(frame)) => Ok(frame),
            Some(FrameType::Native(_)) => {
                Err(VmError::Internal("expected a Java frame".to_string()))
            }
            None => Err(VmError::FrameStackIsEmpty),
        }
    }

    pub fn cur_java_frame_mut(&mut self) -> Result<&mut JavaFrame, VmError> {
        match self.frames.last_mut() {
            Some(FrameType::Java(frame)) => Ok(frame),
            Some(FrameType::Native(_)) => {
                Err(VmError::Internal("expected a Java frame".to_string()))
            }
            None => Err(VmError::FrameStackIsEmpty),
        }
    }

    pub fn pop_java_frame(&mut self) -> Result<JavaFrame, VmError> {
        match self.frames.pop() {
            Some(FrameType::Java(frame)) => Ok(frame),
            Some(frame @ FrameType::Native(_)) => {
                self.frames.push(frame);
                Err(VmError::Internal("popping a native frame as Java".to_string()))
            }
            None => Err(VmError::FrameStackIsEmpty),
        }
    }

    pub fn pop_native_frame(&mut self) -> Result<NativeFrame, VmError> {
        match self.frames.pop() {
            Some(FrameType::Native(frame)) => Ok(frame),
            Some(frame @ FrameType::Java(_)) => {
                self.frames.push(frame);
                Err(VmError::Internal("popping a Java frame as native".to_string()))
            }
            None => Err(VmError::FrameStackIsEmpty),
        }
    }

    pub fn pc(&self) -> Result<usize, VmError> {
        Ok(self.cur_java_frame()?.pc())
    }

    pub fn pc_mut(&mut self) -> Result<&mut usize, VmError> {
        Ok(self.cur_java_frame_mut()?.pc_mut())
    }

    // ------------------------------------------------------------------
    // Operand stack of the current frame
    // ------------------------------------------------------------------

    pub fn push_operand(&mut self, value: Value) -> Result<(), VmError> {
        self.cur_java_frame_mut()?.operands.push(value);
        Ok(())
    }

    pub fn pop_operand(&mut self) -> Result<Value, VmError> {
        self.cur_java_frame_mut()?
            .operands
            .pop()
            .ok_or(VmError::OperandStackIsEmpty)
    }

    pub fn peek_operand(&self) -> Result<&Value, VmError> {
        self.cur_java_frame()?
            .operands
            .last()
            .ok_or(VmError::OperandStackIsEmpty)
    }

    pub fn peek_operand_at(&self, depth: usize) -> Result<&Value, VmError> {
        let operands = &self.cur_java_frame()?.operands;
        operands
            .get(operands.len().wrapping_sub(depth + 1))
            .ok_or(VmError::OperandStackIsEmpty)
    }

    pub fn pop_int_val(&mut self) -> Result<i32, VmError> {
        self.pop_operand()?.as_int()
    }

    pub fn pop_long_val(&mut self) -> Result<i64, VmError> {
        self.pop_operand()?.as_long()
    }

    pub fn pop_float_val(&mut self) -> Result<f32, VmError> {
        self.pop_operand()?.as_float()
    }

    pub fn pop_double_val(&mut self) -> Result<f64, VmError> {
        self.pop_operand()?.as_double()
    }

    /// Pops a reference, raising NullPointerException on null.
    pub fn pop_obj_val(&mut self) -> Result<HeapRef, VmError> {
        self.pop_operand()?.as_obj_ref()
    }

    /// Pops a reference that may legitimately be null.
    pub fn pop_nullable_ref(&mut self) -> Result<Value, VmError> {
        let value = self.pop_operand()?;
        match value {
            Value::Ref(_) | Value::Null => Ok(value),
            other => Err(VmError::Internal(format!("expected a reference, got {:?}", other))),
        }
    }

    pub fn dup_top(&mut self) -> Result<(), VmError> {
        let top = *self.peek_operand()?;
        self.push_operand(top)
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        self.cur_java_frame_mut()?.set_local(index, value)
    }

    pub fn get_local(&self, index: usize) -> Result<&Value, VmError> {
        self.cur_java_frame()?.get_local(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> JavaFrame {
        JavaFrame::new(MethodId::from_usize(1), ClassId::from_usize(1), 8, 4, &[])
    }

    #[test]
    fn frame_limit_is_a_stack_overflow() {
        let mut stack = FrameStack::new(2);
        stack.push_frame(FrameType::Java(frame())).unwrap();
        stack.push_frame(FrameType::Java(frame())).unwrap();
        assert!(matches!(
            stack.push_frame(FrameType::Java(frame())),
            Err(VmError::StackOverflow)
        ));
    }

    #[test]
    fn wide_arguments_take_two_local_slots() {
        let args = [Value::Long(7), Value::Integer(3)];
        let f = JavaFrame::new(MethodId::from_usize(1), ClassId::from_usize(1), 4, 4, &args);
        assert_eq!(f.get_local(0).unwrap(), &Value::Long(7));
        assert_eq!(f.get_local(2).unwrap(), &Value::Integer(3));
    }

    #[test]
    fn operand_stack_roundtrip() {
        let mut stack = FrameStack::new(4);
        stack.push_frame(FrameType::Java(frame())).unwrap();
        stack.push_operand(Value::Integer(1)).unwrap();
        stack.push_operand(Value::Integer(2)).unwrap();
        assert_eq!(stack.peek_operand_at(1).unwrap(), &Value::Integer(1));
        assert_eq!(stack.pop_int_val().unwrap(), 2);
        assert_eq!(stack.pop_int_val().unwrap(), 1);
        assert!(stack.pop_operand().is_err());
    }

    #[test]
    fn popping_null_as_object_is_npe() {
        let mut stack = FrameStack::new(4);
        stack.push_frame(FrameType::Java(frame())).unwrap();
        stack.push_operand(Value::Null).unwrap();
        assert!(matches!(
            stack.pop_obj_val(),
            Err(VmError::JavaException(_))
        ));
    }
}
