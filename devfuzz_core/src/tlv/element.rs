use super::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementType {
    Boolean,
    SignedInteger,
    UnsignedInteger,
    Float,
    Utf8String,
    ByteString,
    Null,
    Structure,
    Array,
    List,
}

impl ElementType {
    pub fn is_container(self) -> bool {
        matches!(
            self,
            ElementType::Structure | ElementType::Array | ElementType::List
        )
    }
}

/// Every `(type, width)` pair the decoder and encoder handle.
///
/// For integers and floats the width is the size of the value; for strings it is the
/// size of the length prefix. Fixed-size and container kinds use width 0.
pub const SUPPORTED_TYPES: [(ElementType, u8); 23] = [
    (ElementType::Array, 0),
    (ElementType::Boolean, 0),
    (ElementType::ByteString, 1),
    (ElementType::ByteString, 2),
    (ElementType::ByteString, 4),
    (ElementType::ByteString, 8),
    (ElementType::Float, 4),
    (ElementType::Float, 8),
    (ElementType::List, 0),
    (ElementType::Null, 0),
    (ElementType::Structure, 0),
    (ElementType::SignedInteger, 1),
    (ElementType::SignedInteger, 2),
    (ElementType::SignedInteger, 4),
    (ElementType::SignedInteger, 8),
    (ElementType::UnsignedInteger, 1),
    (ElementType::UnsignedInteger, 2),
    (ElementType::UnsignedInteger, 4),
    (ElementType::UnsignedInteger, 8),
    (ElementType::Utf8String, 1),
    (ElementType::Utf8String, 2),
    (ElementType::Utf8String, 4),
    (ElementType::Utf8String, 8),
];

pub fn is_supported(element_type: ElementType, width: u8) -> bool {
    SUPPORTED_TYPES.contains(&(element_type, width))
}

/// Field tag attached to an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tag {
    #[default]
    Anonymous,
    Context(u8),
    CommonProfile(u32),
    ImplicitProfile(u32),
    FullyQualified { vendor: u16, profile: u16, tag: u32 },
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Anonymous => write!(f, "anonymous"),
            Tag::Context(tag) => write!(f, "context {tag}"),
            Tag::CommonProfile(tag) => write!(f, "common {tag:#x}"),
            Tag::ImplicitProfile(tag) => write!(f, "implicit {tag:#x}"),
            Tag::FullyQualified {
                vendor,
                profile,
                tag,
            } => write!(f, "{vendor:#06x}:{profile:#06x}:{tag:#x}"),
        }
    }
}

/// Content of an element: one scalar, or the ordered children of a container.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    Null,
    Container(Vec<DecodedElement>),
}

impl Value {
    fn matches(&self, element_type: ElementType, width: u8) -> bool {
        match (self, element_type, width) {
            (Value::Bool(_), ElementType::Boolean, 0) => true,
            (Value::I8(_), ElementType::SignedInteger, 1) => true,
            (Value::I16(_), ElementType::SignedInteger, 2) => true,
            (Value::I32(_), ElementType::SignedInteger, 4) => true,
            (Value::I64(_), ElementType::SignedInteger, 8) => true,
            (Value::U8(_), ElementType::UnsignedInteger, 1) => true,
            (Value::U16(_), ElementType::UnsignedInteger, 2) => true,
            (Value::U32(_), ElementType::UnsignedInteger, 4) => true,
            (Value::U64(_), ElementType::UnsignedInteger, 8) => true,
            (Value::F32(_), ElementType::Float, 4) => true,
            (Value::F64(_), ElementType::Float, 8) => true,
            (Value::Utf8(s), ElementType::Utf8String, w) => length_fits(s.len(), w),
            (Value::Bytes(b), ElementType::ByteString, w) => length_fits(b.len(), w),
            (Value::Null, ElementType::Null, 0) => true,
            (Value::Container(_), t, 0) => t.is_container(),
            _ => false,
        }
    }
}

fn length_fits(len: usize, width: u8) -> bool {
    let len = len as u64;
    match width {
        1 => len <= u64::from(u8::MAX),
        2 => len <= u64::from(u16::MAX),
        4 => len <= u64::from(u32::MAX),
        8 => true,
        _ => false,
    }
}

fn prefix_width_for(len: usize) -> u8 {
    [1u8, 2, 4]
        .into_iter()
        .find(|&width| length_fits(len, width))
        .unwrap_or(8)
}

/// One node of a decoded envelope.
///
/// The only way to build one is through [`DecodedElement::new`] (or the typed
/// shorthands, which cannot fail), so the content always agrees with the declared
/// `(type, width)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawElement", into = "RawElement")]
pub struct DecodedElement {
    element_type: ElementType,
    width: u8,
    tag: Tag,
    value: Value,
}

impl DecodedElement {
    pub fn new(
        element_type: ElementType,
        width: u8,
        tag: Tag,
        value: Value,
    ) -> Result<Self, DecodeError> {
        if !is_supported(element_type, width) {
            return Err(DecodeError::UnsupportedType {
                element_type,
                width,
            });
        }
        if !value.matches(element_type, width) {
            return Err(DecodeError::TypeMismatch {
                element_type,
                width,
            });
        }
        Ok(Self {
            element_type,
            width,
            tag,
            value,
        })
    }

    fn scalar(element_type: ElementType, width: u8, value: Value) -> Self {
        Self {
            element_type,
            width,
            tag: Tag::Anonymous,
            value,
        }
    }

    pub fn bool(value: bool) -> Self {
        Self::scalar(ElementType::Boolean, 0, Value::Bool(value))
    }
    pub fn i8(value: i8) -> Self {
        Self::scalar(ElementType::SignedInteger, 1, Value::I8(value))
    }
    pub fn i16(value: i16) -> Self {
        Self::scalar(ElementType::SignedInteger, 2, Value::I16(value))
    }
    pub fn i32(value: i32) -> Self {
        Self::scalar(ElementType::SignedInteger, 4, Value::I32(value))
    }
    pub fn i64(value: i64) -> Self {
        Self::scalar(ElementType::SignedInteger, 8, Value::I64(value))
    }
    pub fn u8(value: u8) -> Self {
        Self::scalar(ElementType::UnsignedInteger, 1, Value::U8(value))
    }
    pub fn u16(value: u16) -> Self {
        Self::scalar(ElementType::UnsignedInteger, 2, Value::U16(value))
    }
    pub fn u32(value: u32) -> Self {
        Self::scalar(ElementType::UnsignedInteger, 4, Value::U32(value))
    }
    pub fn u64(value: u64) -> Self {
        Self::scalar(ElementType::UnsignedInteger, 8, Value::U64(value))
    }
    pub fn f32(value: f32) -> Self {
        Self::scalar(ElementType::Float, 4, Value::F32(value))
    }
    pub fn f64(value: f64) -> Self {
        Self::scalar(ElementType::Float, 8, Value::F64(value))
    }
    pub fn null() -> Self {
        Self::scalar(ElementType::Null, 0, Value::Null)
    }

    /// UTF-8 string with the narrowest length prefix that fits.
    pub fn utf8(value: impl Into<String>) -> Self {
        let value = value.into();
        let width = prefix_width_for(value.len());
        Self::scalar(ElementType::Utf8String, width, Value::Utf8(value))
    }

    /// Byte string with the narrowest length prefix that fits.
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        let value = value.into();
        let width = prefix_width_for(value.len());
        Self::scalar(ElementType::ByteString, width, Value::Bytes(value))
    }

    pub fn structure(children: Vec<DecodedElement>) -> Self {
        Self::scalar(ElementType::Structure, 0, Value::Container(children))
    }
    pub fn array(children: Vec<DecodedElement>) -> Self {
        Self::scalar(ElementType::Array, 0, Value::Container(children))
    }
    pub fn list(children: Vec<DecodedElement>) -> Self {
        Self::scalar(ElementType::List, 0, Value::Container(children))
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = tag;
        self
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_container(&self) -> bool {
        self.element_type.is_container()
    }

    pub fn children(&self) -> Option<&[DecodedElement]> {
        match &self.value {
            Value::Container(children) => Some(children),
            _ => None,
        }
    }

    pub fn push_child(&mut self, child: DecodedElement) -> Result<(), DecodeError> {
        match &mut self.value {
            Value::Container(children) => {
                children.push(child);
                Ok(())
            }
            _ => Err(DecodeError::NotAContainer(self.element_type)),
        }
    }

    /// Numeric value as an id-sized unsigned integer, if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self.value {
            Value::U8(v) => Some(u64::from(v)),
            Value::U16(v) => Some(u64::from(v)),
            Value::U32(v) => Some(u64::from(v)),
            Value::U64(v) => Some(v),
            Value::I8(v) => u64::try_from(v).ok(),
            Value::I16(v) => u64::try_from(v).ok(),
            Value::I32(v) => u64::try_from(v).ok(),
            Value::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Human readable kind, e.g. `"unsigned integer 2"` or `"utf8 string"`.
    pub fn type_name(&self) -> String {
        type_name(self.element_type, self.width)
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(
            f,
            "{:indent$}[{}, tag: {}] = ",
            "",
            self.type_name(),
            self.tag
        )?;
        match &self.value {
            Value::Container(children) if children.is_empty() => write!(f, "{{}}"),
            Value::Container(children) => {
                writeln!(f, "{{")?;
                for child in children {
                    child.fmt_indented(f, indent + 2)?;
                    writeln!(f)?;
                }
                write!(f, "{:indent$}}}", "")
            }
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Utf8(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            Value::Null => write!(f, "null"),
        }
    }
}

pub(crate) fn type_name(element_type: ElementType, width: u8) -> String {
    match element_type {
        ElementType::Boolean => "boolean".to_string(),
        ElementType::SignedInteger => format!("signed integer {width}"),
        ElementType::UnsignedInteger => format!("unsigned integer {width}"),
        ElementType::Float if width == 4 => "float".to_string(),
        ElementType::Float => "double".to_string(),
        ElementType::Utf8String => "utf8 string".to_string(),
        ElementType::ByteString => "byte string".to_string(),
        ElementType::Null => "null".to_string(),
        ElementType::Structure => "structure".to_string(),
        ElementType::Array => "array".to_string(),
        ElementType::List => "list".to_string(),
    }
}

impl fmt::Display for DecodedElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Serialized shape of an element, used by device-state snapshots.
#[derive(Serialize, Deserialize)]
struct RawElement {
    #[serde(rename = "type")]
    element_type: ElementType,
    #[serde(default)]
    width: u8,
    #[serde(default)]
    tag: Tag,
    value: RawValue,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Null,
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
    Children(Vec<RawElement>),
}

impl RawValue {
    fn as_i64(&self) -> Option<i64> {
        match *self {
            RawValue::Signed(v) => Some(v),
            RawValue::Unsigned(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match *self {
            RawValue::Unsigned(v) => Some(v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            RawValue::Float(v) => Some(v),
            RawValue::Unsigned(v) => Some(v as f64),
            RawValue::Signed(v) => Some(v as f64),
            // JSON has no NaN or infinity; serde_json writes them as null.
            RawValue::Null => Some(f64::NAN),
            _ => None,
        }
    }
}

impl From<DecodedElement> for RawElement {
    fn from(element: DecodedElement) -> Self {
        let value = match element.value {
            Value::Bool(v) => RawValue::Bool(v),
            Value::I8(v) => RawValue::Signed(v.into()),
            Value::I16(v) => RawValue::Signed(v.into()),
            Value::I32(v) => RawValue::Signed(v.into()),
            Value::I64(v) => RawValue::Signed(v),
            Value::U8(v) => RawValue::Unsigned(v.into()),
            Value::U16(v) => RawValue::Unsigned(v.into()),
            Value::U32(v) => RawValue::Unsigned(v.into()),
            Value::U64(v) => RawValue::Unsigned(v),
            Value::F32(v) => RawValue::Float(v.into()),
            Value::F64(v) => RawValue::Float(v),
            Value::Utf8(v) => RawValue::Text(v),
            Value::Bytes(v) => RawValue::Text(hex::encode(v)),
            Value::Null => RawValue::Null,
            Value::Container(children) => {
                RawValue::Children(children.into_iter().map(RawElement::from).collect())
            }
        };
        RawElement {
            element_type: element.element_type,
            width: element.width,
            tag: element.tag,
            value,
        }
    }
}

fn narrow<S, T: TryFrom<S>>(
    value: S,
    element_type: ElementType,
    width: u8,
) -> Result<T, DecodeError> {
    T::try_from(value).map_err(|_| {
        DecodeError::Malformed(format!(
            "value out of range for {}",
            type_name(element_type, width)
        ))
    })
}

impl TryFrom<RawElement> for DecodedElement {
    type Error = DecodeError;

    fn try_from(raw: RawElement) -> Result<Self, Self::Error> {
        let (element_type, width) = (raw.element_type, raw.width);
        let mismatch = || DecodeError::TypeMismatch {
            element_type,
            width,
        };
        let unsupported = || DecodeError::UnsupportedType {
            element_type,
            width,
        };

        let value = match (element_type, raw.value) {
            (ElementType::Boolean, RawValue::Bool(v)) => Value::Bool(v),
            (ElementType::SignedInteger, raw_value) => {
                let v = raw_value.as_i64().ok_or_else(mismatch)?;
                match width {
                    1 => Value::I8(narrow(v, element_type, width)?),
                    2 => Value::I16(narrow(v, element_type, width)?),
                    4 => Value::I32(narrow(v, element_type, width)?),
                    8 => Value::I64(v),
                    _ => return Err(unsupported()),
                }
            }
            (ElementType::UnsignedInteger, raw_value) => {
                let v = raw_value.as_u64().ok_or_else(mismatch)?;
                match width {
                    1 => Value::U8(narrow(v, element_type, width)?),
                    2 => Value::U16(narrow(v, element_type, width)?),
                    4 => Value::U32(narrow(v, element_type, width)?),
                    8 => Value::U64(v),
                    _ => return Err(unsupported()),
                }
            }
            (ElementType::Float, raw_value) => {
                let v = raw_value.as_f64().ok_or_else(mismatch)?;
                match width {
                    4 => Value::F32(v as f32),
                    8 => Value::F64(v),
                    _ => return Err(unsupported()),
                }
            }
            (ElementType::Utf8String, RawValue::Text(v)) => Value::Utf8(v),
            (ElementType::ByteString, RawValue::Text(v)) => Value::Bytes(
                hex::decode(&v)
                    .map_err(|e| DecodeError::Malformed(format!("byte string {v:?}: {e}")))?,
            ),
            (ElementType::Null, RawValue::Null) => Value::Null,
            (t, RawValue::Children(children)) if t.is_container() => Value::Container(
                children
                    .into_iter()
                    .map(DecodedElement::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            _ => return Err(mismatch()),
        };

        DecodedElement::new(element_type, width, raw.tag, value)
    }
}
