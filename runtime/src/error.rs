use crate::heap::HeapRef;
use crate::jtype::DescriptorError;
use crate::keys::{MethodKey, Symbol};
use lasso::ThreadedRodeo;
use std::fmt::{self, Display};
use valka_classfile::ClassFileError;

#[derive(Debug)]
pub enum VmError {
    ClassFile(ClassFileError),
    Descriptor(DescriptorError),
    MainClassNotFound(String),
    /// A Java-level throwable the VM wants to raise but has not yet
    /// materialized as a heap object.
    JavaException(JavaException),
    /// A Java-level throwable already materialized on the heap, travelling
    /// between the throw point and the matching handler.
    JavaExceptionThrown(HeapRef),
    StackOverflow,
    OutOfMemory,
    FrameStackIsEmpty,
    OperandStackIsEmpty,
    LocalOutOfRange(u16),
    Unlinked(&'static str),
    Internal(String),
}

impl From<ClassFileError> for VmError {
    fn from(value: ClassFileError) -> Self {
        VmError::ClassFile(value)
    }
}

impl From<DescriptorError> for VmError {
    fn from(value: DescriptorError) -> Self {
        VmError::Descriptor(value)
    }
}

impl From<JavaException> for VmError {
    fn from(value: JavaException) -> Self {
        VmError::JavaException(value)
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl VmError {
    pub fn into_pretty_string(self, interner: &ThreadedRodeo) -> String {
        match self {
            VmError::JavaException(ex) => {
                let mut out = ex.kind.class_name_dot();
                if let Some(message) = ex.message {
                    out.push_str(": ");
                    out.push_str(&message.into_resolved(interner));
                }
                out
            }
            VmError::StackOverflow => {
                "stack overflow, raise the frame stack limit".to_string()
            }
            VmError::OutOfMemory => {
                "out of memory, give the VM a larger heap".to_string()
            }
            other => format!("{:?}", other),
        }
    }
}

/// Exception kinds the VM raises on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JavaExceptionKind {
    ArithmeticException,
    ArrayIndexOutOfBoundsException,
    ArrayStoreException,
    ClassCastException,
    ClassNotFoundException,
    IllegalAccessError,
    IllegalArgumentException,
    IllegalMonitorStateException,
    IllegalThreadStateException,
    IncompatibleClassChangeError,
    InstantiationException,
    InterruptedException,
    NegativeArraySizeException,
    NoClassDefFoundError,
    NoSuchFieldError,
    NoSuchMethodError,
    NullPointerException,
    UnsatisfiedLinkError,
    VirtualMachineError,
    ClassFormatError,
    ClassCircularityError,
    AbstractMethodError,
    InternalError,
}

impl JavaExceptionKind {
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::ArithmeticException => "java/lang/ArithmeticException",
            Self::ArrayIndexOutOfBoundsException => "java/lang/ArrayIndexOutOfBoundsException",
            Self::ArrayStoreException => "java/lang/ArrayStoreException",
            Self::ClassCastException => "java/lang/ClassCastException",
            Self::ClassNotFoundException => "java/lang/ClassNotFoundException",
            Self::IllegalAccessError => "java/lang/IllegalAccessError",
            Self::IllegalArgumentException => "java/lang/IllegalArgumentException",
            Self::IllegalMonitorStateException => "java/lang/IllegalMonitorStateException",
            Self::IllegalThreadStateException => "java/lang/IllegalThreadStateException",
            Self::IncompatibleClassChangeError => "java/lang/IncompatibleClassChangeError",
            Self::InstantiationException => "java/lang/InstantiationException",
            Self::InterruptedException => "java/lang/InterruptedException",
            Self::NegativeArraySizeException => "java/lang/NegativeArraySizeException",
            Self::NoClassDefFoundError => "java/lang/NoClassDefFoundError",
            Self::NoSuchFieldError => "java/lang/NoSuchFieldError",
            Self::NoSuchMethodError => "java/lang/NoSuchMethodError",
            Self::NullPointerException => "java/lang/NullPointerException",
            Self::UnsatisfiedLinkError => "java/lang/UnsatisfiedLinkError",
            Self::VirtualMachineError => "java/lang/VirtualMachineError",
            Self::ClassFormatError => "java/lang/ClassFormatError",
            Self::ClassCircularityError => "java/lang/ClassCircularityError",
            Self::AbstractMethodError => "java/lang/AbstractMethodError",
            Self::InternalError => "java/lang/InternalError",
        }
    }

    pub fn class_name_dot(self) -> String {
        self.class_name().replace('/', ".")
    }
}

/// Exception message payloads. Symbol-bearing variants defer interner access
/// until the message is actually rendered.
#[derive(Debug, Clone)]
pub enum ExceptionMessage {
    Resolved(String),
    MethodNotFound(MethodKey, Symbol),
}

impl ExceptionMessage {
    pub fn into_resolved(self, interner: &ThreadedRodeo) -> String {
        match self {
            ExceptionMessage::Resolved(s) => s,
            ExceptionMessage::MethodNotFound(key, class_sym) => {
                format!(
                    "{}.{}{}",
                    interner.resolve(&class_sym).replace('/', "."),
                    interner.resolve(&key.name),
                    interner.resolve(&key.desc),
                )
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct JavaException {
    pub kind: JavaExceptionKind,
    pub message: Option<ExceptionMessage>,
}

impl JavaException {
    const CONSTRUCTOR_NAME: &'static str = "<init>";
    const STRING_PARAM_CONSTRUCTOR: &'static str = "(Ljava/lang/String;)V";
    const NO_PARAM_CONSTRUCTOR: &'static str = "()V";

    pub fn new(kind: JavaExceptionKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: JavaExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::Resolved(message.into())),
        }
    }

    pub fn with_method_not_found(
        kind: JavaExceptionKind,
        key: MethodKey,
        class_sym: Symbol,
    ) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::MethodNotFound(key, class_sym)),
        }
    }

    /// Constructor the materializer should invoke for this exception.
    pub fn constructor(&self) -> (&'static str, &'static str) {
        if self.message.is_some() {
            (Self::CONSTRUCTOR_NAME, Self::STRING_PARAM_CONSTRUCTOR)
        } else {
            (Self::CONSTRUCTOR_NAME, Self::NO_PARAM_CONSTRUCTOR)
        }
    }
}

/// Builds a `VmError::JavaException` value.
#[macro_export]
macro_rules! build_exception {
    ($kind:ident) => {
        $crate::error::VmError::JavaException($crate::error::JavaException::new(
            $crate::error::JavaExceptionKind::$kind,
        ))
    };
    ($kind:ident, method_key: $key:expr, class_sym: $class:expr) => {
        $crate::error::VmError::JavaException(
            $crate::error::JavaException::with_method_not_found(
                $crate::error::JavaExceptionKind::$kind,
                $key,
                $class,
            ),
        )
    };
    ($kind:ident, $msg:expr) => {
        $crate::error::VmError::JavaException($crate::error::JavaException::with_message(
            $crate::error::JavaExceptionKind::$kind,
            $msg,
        ))
    };
    ($kind:ident, $fmt:expr, $($arg:tt)*) => {
        $crate::error::VmError::JavaException($crate::error::JavaException::with_message(
            $crate::error::JavaExceptionKind::$kind,
            format!($fmt, $($arg)*),
        ))
    };
}

/// `Err(build_exception!(..))`, usable as a tail expression or with `?`.
#[macro_export]
macro_rules! throw_exception {
    ($($tt:tt)*) => {
        Err($crate::build_exception!($($tt)*))
    };
}
