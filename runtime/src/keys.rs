use std::fmt::{self, Display};
use std::num::NonZeroU32;

pub type Symbol = lasso::Spur;

macro_rules! id_type {
    ($name:ident) => {
        /// 1-based dense id; the zero value is reserved so ids pack into
        /// `NonZeroU32` (the heap stores class ids inside object headers).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl $name {
            pub fn new(raw: NonZeroU32) -> Self {
                $name(raw)
            }

            /// Builds an id from a 1-based position (typically `vec.len()`
            /// right after a push).
            pub fn from_usize(pos: usize) -> Self {
                $name(NonZeroU32::new(pos as u32).expect("id positions are 1-based"))
            }

            pub fn to_index(self) -> usize {
                (self.0.get() - 1) as usize
            }

            pub fn into_inner(self) -> NonZeroU32 {
                self.0
            }

            pub fn from_raw(raw: u32) -> Option<Self> {
                NonZeroU32::new(raw).map($name)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0.get())
            }
        }
    };
}

id_type!(ClassId);
id_type!(MethodId);
id_type!(ThreadId);
id_type!(FieldDescriptorId);
id_type!(MethodDescriptorId);

/// Interned (name, descriptor) pair identifying a field within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub name: Symbol,
    pub desc: Symbol,
}

/// Interned (name, descriptor) pair identifying a method within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub name: Symbol,
    pub desc: Symbol,
}

/// Method key qualified by the declaring class, used for native lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullyQualifiedMethodKey {
    pub class: Symbol,
    pub name: Symbol,
    pub desc: Symbol,
}

impl FullyQualifiedMethodKey {
    pub fn new(class: Symbol, name: Symbol, desc: Symbol) -> Self {
        Self { class, name, desc }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_one_based() {
        let id = ClassId::from_usize(1);
        assert_eq!(id.to_index(), 0);
        assert_eq!(id.into_inner().get(), 1);
    }

    #[test]
    #[should_panic]
    fn zero_position_is_rejected() {
        let _ = MethodId::from_usize(0);
    }
}
