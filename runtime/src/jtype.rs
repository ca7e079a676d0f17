//! Field and method descriptor parsing plus the storage-type view the heap
//! uses for typed loads and stores.

use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
}

impl PrimitiveType {
    pub fn values() -> &'static [PrimitiveType] {
        &[
            PrimitiveType::Boolean,
            PrimitiveType::Byte,
            PrimitiveType::Char,
            PrimitiveType::Short,
            PrimitiveType::Int,
            PrimitiveType::Float,
            PrimitiveType::Long,
            PrimitiveType::Double,
        ]
    }

    pub fn descriptor_char(self) -> char {
        match self {
            PrimitiveType::Boolean => 'Z',
            PrimitiveType::Byte => 'B',
            PrimitiveType::Char => 'C',
            PrimitiveType::Short => 'S',
            PrimitiveType::Int => 'I',
            PrimitiveType::Float => 'F',
            PrimitiveType::Long => 'J',
            PrimitiveType::Double => 'D',
        }
    }

    pub fn java_name(self) -> &'static str {
        match self {
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Byte => "byte",
            PrimitiveType::Char => "char",
            PrimitiveType::Short => "short",
            PrimitiveType::Int => "int",
            PrimitiveType::Float => "float",
            PrimitiveType::Long => "long",
            PrimitiveType::Double => "double",
        }
    }
}

/// Storage type of a field slot or array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl AllocationType {
    /// Size of one element in bytes. Booleans report one byte; packed
    /// bit-level storage (instance fields, boolean arrays) is handled by the
    /// heap itself.
    pub fn byte_size(self) -> usize {
        match self {
            AllocationType::Boolean | AllocationType::Byte => 1,
            AllocationType::Char | AllocationType::Short => 2,
            AllocationType::Int | AllocationType::Float => 4,
            AllocationType::Long | AllocationType::Double => 8,
            AllocationType::Reference => size_of::<usize>(),
        }
    }
}

impl From<PrimitiveType> for AllocationType {
    fn from(p: PrimitiveType) -> Self {
        match p {
            PrimitiveType::Boolean => AllocationType::Boolean,
            PrimitiveType::Byte => AllocationType::Byte,
            PrimitiveType::Char => AllocationType::Char,
            PrimitiveType::Short => AllocationType::Short,
            PrimitiveType::Int => AllocationType::Int,
            PrimitiveType::Float => AllocationType::Float,
            PrimitiveType::Long => AllocationType::Long,
            PrimitiveType::Double => AllocationType::Double,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct DescriptorError(pub String);

impl Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed descriptor: {}", self.0)
    }
}

/// A parsed field type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JavaType {
    Primitive(PrimitiveType),
    Instance(String),
    Array(Box<JavaType>),
}

impl JavaType {
    pub fn parse(desc: &str) -> Result<JavaType, DescriptorError> {
        let mut chars = desc.chars();
        let ty = parse_type(&mut chars, desc)?;
        if chars.next().is_some() {
            return Err(DescriptorError(desc.to_string()));
        }
        Ok(ty)
    }

    pub fn as_allocation_type(&self) -> AllocationType {
        match self {
            JavaType::Primitive(p) => (*p).into(),
            JavaType::Instance(_) | JavaType::Array(_) => AllocationType::Reference,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, JavaType::Instance(_) | JavaType::Array(_))
    }

    /// For an array descriptor like `[I`, the primitive element type.
    pub fn primitive_array_element(&self) -> Option<PrimitiveType> {
        match self {
            JavaType::Array(elem) => match elem.as_ref() {
                JavaType::Primitive(p) => Some(*p),
                _ => None,
            },
            _ => None,
        }
    }

    /// For array descriptors like `[Ljava/lang/String;` or `[[I`, the
    /// element type's class name in loadable form.
    pub fn reference_array_element_name(&self) -> Option<String> {
        match self {
            JavaType::Array(elem) => match elem.as_ref() {
                JavaType::Instance(name) => Some(name.clone()),
                JavaType::Array(_) => Some(elem.descriptor()),
                JavaType::Primitive(_) => None,
            },
            _ => None,
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            JavaType::Primitive(p) => p.descriptor_char().to_string(),
            JavaType::Instance(name) => format!("L{};", name),
            JavaType::Array(elem) => format!("[{}", elem.descriptor()),
        }
    }

    /// Local-variable slots this type occupies in class-file numbering.
    pub fn slot_width(&self) -> usize {
        match self {
            JavaType::Primitive(PrimitiveType::Long | PrimitiveType::Double) => 2,
            _ => 1,
        }
    }
}

impl TryFrom<&str> for JavaType {
    type Error = DescriptorError;

    fn try_from(desc: &str) -> Result<JavaType, DescriptorError> {
        JavaType::parse(desc)
    }
}

fn parse_type(
    chars: &mut std::str::Chars<'_>,
    whole: &str,
) -> Result<JavaType, DescriptorError> {
    match chars.next() {
        Some('Z') => Ok(JavaType::Primitive(PrimitiveType::Boolean)),
        Some('B') => Ok(JavaType::Primitive(PrimitiveType::Byte)),
        Some('C') => Ok(JavaType::Primitive(PrimitiveType::Char)),
        Some('S') => Ok(JavaType::Primitive(PrimitiveType::Short)),
        Some('I') => Ok(JavaType::Primitive(PrimitiveType::Int)),
        Some('F') => Ok(JavaType::Primitive(PrimitiveType::Float)),
        Some('J') => Ok(JavaType::Primitive(PrimitiveType::Long)),
        Some('D') => Ok(JavaType::Primitive(PrimitiveType::Double)),
        Some('L') => {
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == ';' {
                    if name.is_empty() {
                        return Err(DescriptorError(whole.to_string()));
                    }
                    return Ok(JavaType::Instance(name));
                }
                name.push(c);
            }
            Err(DescriptorError(whole.to_string()))
        }
        Some('[') => Ok(JavaType::Array(Box::new(parse_type(chars, whole)?))),
        _ => Err(DescriptorError(whole.to_string())),
    }
}

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<JavaType>,
    /// `None` for `void`.
    pub ret: Option<JavaType>,
}

impl MethodDescriptor {
    pub fn parse(desc: &str) -> Result<MethodDescriptor, DescriptorError> {
        let mut chars = desc.chars();
        if chars.next() != Some('(') {
            return Err(DescriptorError(desc.to_string()));
        }

        let mut params = Vec::new();
        loop {
            let rest = chars.as_str();
            if rest.starts_with(')') {
                chars.next();
                break;
            }
            if rest.is_empty() {
                return Err(DescriptorError(desc.to_string()));
            }
            params.push(parse_type(&mut chars, desc)?);
        }

        let ret = match chars.as_str() {
            "V" => None,
            _ => Some(parse_type(&mut chars, desc)?),
        };
        if ret.is_none() {
            chars.next();
        }
        if chars.next().is_some() {
            return Err(DescriptorError(desc.to_string()));
        }

        Ok(MethodDescriptor { params, ret })
    }

    /// Number of operand-stack values an invocation pops for the arguments,
    /// not counting the receiver.
    pub fn arg_count(&self) -> usize {
        self.params.len()
    }

    /// Local-variable slots the arguments occupy in class-file numbering
    /// (longs and doubles take two), not counting the receiver.
    pub fn arg_slots(&self) -> usize {
        self.params.iter().map(JavaType::slot_width).sum()
    }

    pub fn to_java_signature(&self, class_name: &str, method_name: &str) -> String {
        let params = self
            .params
            .iter()
            .map(pretty_type)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}.{}({})", class_name.replace('/', "."), method_name, params)
    }
}

impl TryFrom<&str> for MethodDescriptor {
    type Error = DescriptorError;

    fn try_from(desc: &str) -> Result<MethodDescriptor, DescriptorError> {
        MethodDescriptor::parse(desc)
    }
}

fn pretty_type(ty: &JavaType) -> String {
    match ty {
        JavaType::Primitive(p) => p.java_name().to_string(),
        JavaType::Instance(name) => name.replace('/', "."),
        JavaType::Array(elem) => format!("{}[]", pretty_type(elem)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("I", JavaType::Primitive(PrimitiveType::Int))]
    #[case("Ljava/lang/String;", JavaType::Instance("java/lang/String".to_string()))]
    #[case(
        "[[J",
        JavaType::Array(Box::new(JavaType::Array(Box::new(JavaType::Primitive(
            PrimitiveType::Long
        )))))
    )]
    fn parses_field_descriptors(#[case] desc: &str, #[case] expected: JavaType) {
        assert_eq!(JavaType::parse(desc).unwrap(), expected);
        assert_eq!(JavaType::parse(desc).unwrap().descriptor(), desc);
    }

    #[rstest]
    #[case("")]
    #[case("L")]
    #[case("Ljava/lang/String")]
    #[case("X")]
    #[case("II")]
    fn rejects_bad_field_descriptors(#[case] desc: &str) {
        assert!(JavaType::parse(desc).is_err());
    }

    #[test]
    fn parses_method_descriptor() {
        let md = MethodDescriptor::parse("(IJLjava/lang/String;[B)V").unwrap();
        assert_eq!(md.params.len(), 4);
        assert_eq!(md.ret, None);
        assert_eq!(md.arg_count(), 4);
        assert_eq!(md.arg_slots(), 5); // J takes two
    }

    #[test]
    fn parses_return_type() {
        let md = MethodDescriptor::parse("()Ljava/lang/Object;").unwrap();
        assert_eq!(
            md.ret,
            Some(JavaType::Instance("java/lang/Object".to_string()))
        );
    }

    #[rstest]
    #[case("()")]
    #[case("(I")]
    #[case("I()V")]
    #[case("()VV")]
    fn rejects_bad_method_descriptors(#[case] desc: &str) {
        assert!(MethodDescriptor::parse(desc).is_err());
    }

    #[test]
    fn array_element_names() {
        let t = JavaType::parse("[Ljava/lang/String;").unwrap();
        assert_eq!(
            t.reference_array_element_name().unwrap(),
            "java/lang/String"
        );
        let t = JavaType::parse("[[I").unwrap();
        assert_eq!(t.reference_array_element_name().unwrap(), "[I");
        let t = JavaType::parse("[I").unwrap();
        assert_eq!(t.primitive_array_element().unwrap(), PrimitiveType::Int);
    }
}
