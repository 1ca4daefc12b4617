use super::element::{DecodedElement, ElementType, Tag, Value};
use super::{DecodeError, END_OF_CONTAINER};

/// Deepest container nesting accepted before decoding gives up.
pub const MAX_CONTAINER_DEPTH: usize = 32;

/// Cursor over an encoded buffer.
///
/// Each successful [`Decoder::decode_element`] consumes exactly one top-level element,
/// including every child and the end-of-container marker of containers. A failed
/// call leaves the cursor where it was.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn decode_element(&mut self) -> Result<DecodedElement, DecodeError> {
        let start = self.pos;
        let result = self.read_element(0);
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn read_element(&mut self, depth: usize) -> Result<DecodedElement, DecodeError> {
        let offset = self.pos;
        let control = self.read_array::<1>()?[0];
        let type_code = control & 0x1F;

        if control == END_OF_CONTAINER {
            return Err(DecodeError::UnexpectedEndOfContainer { offset });
        }

        use ElementType::{Float, SignedInteger, UnsignedInteger};

        let tag = self.read_tag(control >> 5)?;
        let (element_type, width, value) = match type_code {
            0x00 => (SignedInteger, 1, Value::I8(i8::from_le_bytes(self.read_array()?))),
            0x01 => (SignedInteger, 2, Value::I16(i16::from_le_bytes(self.read_array()?))),
            0x02 => (SignedInteger, 4, Value::I32(i32::from_le_bytes(self.read_array()?))),
            0x03 => (SignedInteger, 8, Value::I64(i64::from_le_bytes(self.read_array()?))),
            0x04 => (UnsignedInteger, 1, Value::U8(self.read_array::<1>()?[0])),
            0x05 => (UnsignedInteger, 2, Value::U16(u16::from_le_bytes(self.read_array()?))),
            0x06 => (UnsignedInteger, 4, Value::U32(u32::from_le_bytes(self.read_array()?))),
            0x07 => (UnsignedInteger, 8, Value::U64(u64::from_le_bytes(self.read_array()?))),
            0x08 => (ElementType::Boolean, 0, Value::Bool(false)),
            0x09 => (ElementType::Boolean, 0, Value::Bool(true)),
            0x0A => (Float, 4, Value::F32(f32::from_le_bytes(self.read_array()?))),
            0x0B => (Float, 8, Value::F64(f64::from_le_bytes(self.read_array()?))),
            0x0C..=0x0F => {
                let width = 1u8 << (type_code - 0x0C);
                let start = self.pos;
                let bytes = self.read_prefixed(width)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::InvalidUtf8 { offset: start })?;
                (ElementType::Utf8String, width, Value::Utf8(text.to_owned()))
            }
            0x10..=0x13 => {
                let width = 1u8 << (type_code - 0x10);
                let bytes = self.read_prefixed(width)?.to_vec();
                (ElementType::ByteString, width, Value::Bytes(bytes))
            }
            0x14 => (ElementType::Null, 0, Value::Null),
            0x15 => (ElementType::Structure, 0, self.read_children(depth)?),
            0x16 => (ElementType::Array, 0, self.read_children(depth)?),
            0x17 => (ElementType::List, 0, self.read_children(depth)?),
            _ => return Err(DecodeError::UnsupportedControl { control, offset }),
        };

        DecodedElement::new(element_type, width, tag, value)
    }

    fn read_children(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth + 1 > MAX_CONTAINER_DEPTH {
            return Err(DecodeError::DepthExceeded {
                max: MAX_CONTAINER_DEPTH,
            });
        }
        let mut children = Vec::new();
        loop {
            match self.buf.get(self.pos) {
                None => {
                    return Err(DecodeError::UnterminatedContainer { offset: self.pos });
                }
                Some(&END_OF_CONTAINER) => {
                    self.pos += 1;
                    return Ok(Value::Container(children));
                }
                Some(_) => children.push(self.read_element(depth + 1)?),
            }
        }
    }

    fn read_tag(&mut self, tag_control: u8) -> Result<Tag, DecodeError> {
        Ok(match tag_control {
            0 => Tag::Anonymous,
            1 => Tag::Context(self.read_array::<1>()?[0]),
            2 => Tag::CommonProfile(u16::from_le_bytes(self.read_array()?).into()),
            3 => Tag::CommonProfile(u32::from_le_bytes(self.read_array()?)),
            4 => Tag::ImplicitProfile(u16::from_le_bytes(self.read_array()?).into()),
            5 => Tag::ImplicitProfile(u32::from_le_bytes(self.read_array()?)),
            6 => Tag::FullyQualified {
                vendor: u16::from_le_bytes(self.read_array()?),
                profile: u16::from_le_bytes(self.read_array()?),
                tag: u16::from_le_bytes(self.read_array()?).into(),
            },
            _ => Tag::FullyQualified {
                vendor: u16::from_le_bytes(self.read_array()?),
                profile: u16::from_le_bytes(self.read_array()?),
                tag: u32::from_le_bytes(self.read_array()?),
            },
        })
    }

    fn read_prefixed(&mut self, width: u8) -> Result<&'a [u8], DecodeError> {
        let offset = self.pos;
        let len = match width {
            1 => u64::from(self.read_array::<1>()?[0]),
            2 => u64::from(u16::from_le_bytes(self.read_array()?)),
            4 => u64::from(u32::from_le_bytes(self.read_array()?)),
            _ => u64::from_le_bytes(self.read_array()?),
        };
        let len = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEof { offset })?;
        self.take(len)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof { offset: self.pos })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Decodes a buffer holding exactly one envelope.
pub fn decode(bytes: &[u8]) -> Result<DecodedElement, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let element = decoder.decode_element()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes {
            remaining: decoder.remaining(),
        });
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_scalars_in_little_endian() {
        assert_eq!(decode(&[0x04, 0x2A]).unwrap(), DecodedElement::u8(42));
        assert_eq!(decode(&[0x05, 0x34, 0x12]).unwrap(), DecodedElement::u16(0x1234));
        assert_eq!(decode(&[0x00, 0xFF]).unwrap(), DecodedElement::i8(-1));
        assert_eq!(decode(&[0x09]).unwrap(), DecodedElement::bool(true));
        assert_eq!(decode(&[0x14]).unwrap(), DecodedElement::null());
        assert_eq!(
            decode(&[0x0A, 0x00, 0x00, 0xC0, 0x3F]).unwrap(),
            DecodedElement::f32(1.5)
        );
        assert_eq!(
            decode(&[0x0C, 0x02, b'o', b'n']).unwrap(),
            DecodedElement::utf8("on")
        );
        assert_eq!(
            decode(&[0x10, 0x01, 0xAB]).unwrap(),
            DecodedElement::bytes(vec![0xAB])
        );
    }

    #[test]
    fn decodes_every_tag_form() {
        let cases: [(&[u8], Tag); 6] = [
            (&[0x24, 0x07, 0x01], Tag::Context(7)),
            (&[0x44, 0x01, 0x02, 0x01], Tag::CommonProfile(0x0201)),
            (&[0x64, 0x01, 0x02, 0x03, 0x04, 0x01], Tag::CommonProfile(0x0403_0201)),
            (&[0x84, 0x10, 0x00, 0x01], Tag::ImplicitProfile(0x10)),
            (
                &[0xC4, 0xF1, 0xFF, 0x01, 0x00, 0x05, 0x00, 0x01],
                Tag::FullyQualified {
                    vendor: 0xFFF1,
                    profile: 1,
                    tag: 5,
                },
            ),
            (
                &[0xE4, 0xF1, 0xFF, 0x01, 0x00, 0x05, 0x00, 0x01, 0x00, 0x01],
                Tag::FullyQualified {
                    vendor: 0xFFF1,
                    profile: 1,
                    tag: 0x0001_0005,
                },
            ),
        ];
        for (bytes, tag) in cases {
            let element = decode(bytes).unwrap();
            assert_eq!(element.tag(), tag, "bytes {bytes:02x?}");
            assert_eq!(element.as_u64(), Some(1));
        }
    }

    #[test]
    fn decodes_nested_containers_in_order() {
        // { 0: 1, 1: [true, null] }
        let bytes = [0x15, 0x24, 0x00, 0x01, 0x36, 0x01, 0x09, 0x14, 0x18, 0x18];
        let element = decode(&bytes).unwrap();
        let expected = DecodedElement::structure(vec![
            DecodedElement::u8(1).with_tag(Tag::Context(0)),
            DecodedElement::array(vec![DecodedElement::bool(true), DecodedElement::null()])
                .with_tag(Tag::Context(1)),
        ]);
        assert_eq!(element, expected);
    }

    #[test]
    fn truncated_scalar_reports_offset() {
        assert_eq!(
            decode(&[0x05, 0x34]),
            Err(DecodeError::UnexpectedEof { offset: 1 })
        );
        assert_eq!(
            decode(&[0x0C, 0x05, b'a']),
            Err(DecodeError::UnexpectedEof { offset: 2 })
        );
        assert_eq!(decode(&[]), Err(DecodeError::UnexpectedEof { offset: 0 }));
    }

    #[test]
    fn container_without_end_marker_is_rejected() {
        assert_eq!(
            decode(&[0x15, 0x24, 0x00, 0x01]),
            Err(DecodeError::UnterminatedContainer { offset: 4 })
        );
    }

    #[test]
    fn stray_end_marker_is_rejected() {
        assert_eq!(
            decode(&[0x18]),
            Err(DecodeError::UnexpectedEndOfContainer { offset: 0 })
        );
    }

    #[test]
    fn reserved_type_codes_are_rejected() {
        assert_eq!(
            decode(&[0x19]),
            Err(DecodeError::UnsupportedControl {
                control: 0x19,
                offset: 0
            })
        );
        // end-of-container type with a tag attached
        assert!(matches!(
            decode(&[0x15, 0x38, 0x18]),
            Err(DecodeError::UnsupportedControl { control: 0x38, .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert_eq!(
            decode(&[0x0C, 0x02, 0xC3, 0x28]),
            Err(DecodeError::InvalidUtf8 { offset: 1 })
        );
    }

    #[test]
    fn nesting_is_bounded() {
        let mut bytes = vec![0x17; MAX_CONTAINER_DEPTH];
        bytes.extend(vec![END_OF_CONTAINER; MAX_CONTAINER_DEPTH]);
        assert!(decode(&bytes).is_ok());

        let mut bytes = vec![0x17; MAX_CONTAINER_DEPTH + 1];
        bytes.extend(vec![END_OF_CONTAINER; MAX_CONTAINER_DEPTH + 1]);
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::DepthExceeded {
                max: MAX_CONTAINER_DEPTH
            })
        );
    }

    #[test]
    fn trailing_bytes_are_reported() {
        assert_eq!(
            decode(&[0x04, 0x01, 0x04, 0x02]),
            Err(DecodeError::TrailingBytes { remaining: 2 })
        );
    }

    #[test]
    fn decoder_steps_through_a_sequence_and_rewinds_on_failure() {
        let bytes = [0x04, 0x01, 0x09, 0x05, 0x01];
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode_element().unwrap(), DecodedElement::u8(1));
        assert_eq!(decoder.decode_element().unwrap(), DecodedElement::bool(true));
        assert_eq!(decoder.position(), 3);
        assert!(decoder.decode_element().is_err());
        assert_eq!(decoder.position(), 3);
        assert_eq!(decoder.remaining(), 2);
    }

    #[test]
    fn oversized_length_prefix_does_not_panic() {
        let bytes = [0x13, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }
}
