use super::END_OF_CONTAINER;
use super::element::{DecodedElement, ElementType, Tag, Value};

pub fn encode(element: &DecodedElement) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(element, &mut out);
    out
}

/// Appends the encoding of `element` to `out`.
///
/// Tags are written in their narrowest form, so a profile tag decoded from a 4-byte
/// field whose value fits in 2 bytes comes back out in 2 bytes.
pub fn encode_into(element: &DecodedElement, out: &mut Vec<u8>) {
    let (tag_control, tag_bytes) = encode_tag(element.tag());
    out.push(tag_control << 5 | type_code(element));
    out.extend_from_slice(&tag_bytes);

    match element.value() {
        Value::Bool(_) | Value::Null => {}
        Value::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::U8(v) => out.push(*v),
        Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Utf8(s) => write_prefixed(s.as_bytes(), element.width(), out),
        Value::Bytes(b) => write_prefixed(b, element.width(), out),
        Value::Container(children) => {
            for child in children {
                encode_into(child, out);
            }
            out.push(END_OF_CONTAINER);
        }
    }
}

fn write_prefixed(bytes: &[u8], width: u8, out: &mut Vec<u8>) {
    let len = (bytes.len() as u64).to_le_bytes();
    out.extend_from_slice(&len[..usize::from(width)]);
    out.extend_from_slice(bytes);
}

// Widths are validated when the element is built.
fn width_index(width: u8) -> u8 {
    match width {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

fn type_code(element: &DecodedElement) -> u8 {
    let width = element.width();
    match element.element_type() {
        ElementType::SignedInteger => width_index(width),
        ElementType::UnsignedInteger => 0x04 + width_index(width),
        ElementType::Boolean => match element.value() {
            Value::Bool(true) => 0x09,
            _ => 0x08,
        },
        ElementType::Float if width == 4 => 0x0A,
        ElementType::Float => 0x0B,
        ElementType::Utf8String => 0x0C + width_index(width),
        ElementType::ByteString => 0x10 + width_index(width),
        ElementType::Null => 0x14,
        ElementType::Structure => 0x15,
        ElementType::Array => 0x16,
        ElementType::List => 0x17,
    }
}

fn encode_tag(tag: Tag) -> (u8, Vec<u8>) {
    match tag {
        Tag::Anonymous => (0, Vec::new()),
        Tag::Context(t) => (1, vec![t]),
        Tag::CommonProfile(t) => match u16::try_from(t) {
            Ok(short) => (2, short.to_le_bytes().to_vec()),
            Err(_) => (3, t.to_le_bytes().to_vec()),
        },
        Tag::ImplicitProfile(t) => match u16::try_from(t) {
            Ok(short) => (4, short.to_le_bytes().to_vec()),
            Err(_) => (5, t.to_le_bytes().to_vec()),
        },
        Tag::FullyQualified {
            vendor,
            profile,
            tag,
        } => {
            let mut bytes = Vec::with_capacity(8);
            bytes.extend_from_slice(&vendor.to_le_bytes());
            bytes.extend_from_slice(&profile.to_le_bytes());
            match u16::try_from(tag) {
                Ok(short) => {
                    bytes.extend_from_slice(&short.to_le_bytes());
                    (6, bytes)
                }
                Err(_) => {
                    bytes.extend_from_slice(&tag.to_le_bytes());
                    (7, bytes)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::{SUPPORTED_TYPES, decode};
    use proptest::prelude::*;

    #[test]
    fn encodes_a_command_payload() {
        let element = DecodedElement::structure(vec![
            DecodedElement::u8(1).with_tag(Tag::Context(0)),
            DecodedElement::utf8("on").with_tag(Tag::Context(1)),
        ]);
        assert_eq!(
            encode(&element),
            vec![0x15, 0x24, 0x00, 0x01, 0x2C, 0x01, 0x02, b'o', b'n', 0x18]
        );
    }

    #[test]
    fn string_prefix_follows_declared_width() {
        let element = DecodedElement::new(
            ElementType::Utf8String,
            2,
            Tag::Anonymous,
            Value::Utf8("a".to_string()),
        )
        .unwrap();
        assert_eq!(encode(&element), vec![0x0D, 0x01, 0x00, b'a']);
    }

    #[test]
    fn wide_profile_tags_use_the_long_form() {
        let element = DecodedElement::null().with_tag(Tag::CommonProfile(0x0001_0000));
        assert_eq!(encode(&element), vec![0x74, 0x00, 0x00, 0x01, 0x00]);
    }

    fn arb_tag() -> impl Strategy<Value = Tag> {
        prop_oneof![
            Just(Tag::Anonymous),
            any::<u8>().prop_map(Tag::Context),
            any::<u32>().prop_map(Tag::CommonProfile),
            any::<u32>().prop_map(Tag::ImplicitProfile),
            (any::<u16>(), any::<u16>(), any::<u32>()).prop_map(|(vendor, profile, tag)| {
                Tag::FullyQualified {
                    vendor,
                    profile,
                    tag,
                }
            }),
        ]
    }

    fn arb_value(element_type: ElementType, width: u8) -> BoxedStrategy<Value> {
        match (element_type, width) {
            (ElementType::Boolean, _) => any::<bool>().prop_map(Value::Bool).boxed(),
            (ElementType::SignedInteger, 1) => any::<i8>().prop_map(Value::I8).boxed(),
            (ElementType::SignedInteger, 2) => any::<i16>().prop_map(Value::I16).boxed(),
            (ElementType::SignedInteger, 4) => any::<i32>().prop_map(Value::I32).boxed(),
            (ElementType::SignedInteger, _) => any::<i64>().prop_map(Value::I64).boxed(),
            (ElementType::UnsignedInteger, 1) => any::<u8>().prop_map(Value::U8).boxed(),
            (ElementType::UnsignedInteger, 2) => any::<u16>().prop_map(Value::U16).boxed(),
            (ElementType::UnsignedInteger, 4) => any::<u32>().prop_map(Value::U32).boxed(),
            (ElementType::UnsignedInteger, _) => any::<u64>().prop_map(Value::U64).boxed(),
            (ElementType::Float, 4) => (-1.0e6f32..1.0e6).prop_map(Value::F32).boxed(),
            (ElementType::Float, _) => (-1.0e12f64..1.0e12).prop_map(Value::F64).boxed(),
            (ElementType::Utf8String, _) => ".{0,40}".prop_map(Value::Utf8).boxed(),
            // Short enough for every prefix width, including the 1-byte one.
            (ElementType::ByteString, _) => proptest::collection::vec(any::<u8>(), 0..256)
                .prop_map(Value::Bytes)
                .boxed(),
            (ElementType::Null, _) => Just(Value::Null).boxed(),
            (ElementType::Structure | ElementType::Array | ElementType::List, _) => {
                Just(Value::Container(Vec::new())).boxed()
            }
        }
    }

    /// Any supported `(type, width)` pair, with the width chosen explicitly so wide
    /// string prefixes and every integer size are exercised.
    fn arb_scalar() -> impl Strategy<Value = DecodedElement> {
        proptest::sample::select(SUPPORTED_TYPES.to_vec()).prop_flat_map(
            |(element_type, width)| {
                arb_value(element_type, width).prop_map(move |value| {
                    DecodedElement::new(element_type, width, Tag::Anonymous, value).unwrap()
                })
            },
        )
    }

    fn arb_element() -> impl Strategy<Value = DecodedElement> {
        let leaf = (arb_scalar(), arb_tag()).prop_map(|(e, t)| e.with_tag(t));
        leaf.prop_recursive(4, 48, 6, |inner| {
            (
                prop_oneof![Just(0u8), Just(1), Just(2)],
                proptest::collection::vec(inner, 0..6),
                arb_tag(),
            )
                .prop_map(|(kind, children, tag)| {
                    let container = match kind {
                        0 => DecodedElement::structure(children),
                        1 => DecodedElement::array(children),
                        _ => DecodedElement::list(children),
                    };
                    container.with_tag(tag)
                })
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(element in arb_element()) {
            let bytes = encode(&element);
            prop_assert_eq!(decode(&bytes).unwrap(), element);
        }

        #[test]
        fn decode_never_panics_on_arbitrary_bytes(
            bytes in proptest::collection::vec(any::<u8>(), 0..64)
        ) {
            let _ = decode(&bytes);
        }
    }
}
