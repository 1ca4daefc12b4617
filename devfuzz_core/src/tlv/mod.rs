//! Decoding and encoding of the self-describing tag-length-value format carried
//! in device responses and reports.
//!
//! A decoded envelope is a tree of [`DecodedElement`]s. Every element is
//! validated once at construction, so code holding a `DecodedElement` never needs
//! to re-check that its content matches its declared type.

mod decode;
mod element;
mod encode;
mod payload;

pub use decode::{Decoder, MAX_CONTAINER_DEPTH, decode};
pub use element::{DecodedElement, ElementType, SUPPORTED_TYPES, Tag, Value, is_supported};
pub(crate) use element::type_name;
pub use encode::{encode, encode_into};
pub use payload::{FirstStructureChild, PayloadLocator, WholeEnvelope};

use thiserror::Error;

/// Control byte marking the end of a structure, array or list.
pub(crate) const END_OF_CONTAINER: u8 = 0x18;

/// Errors raised while turning bytes into elements, or while building an element
/// whose content does not match its declared type.
///
/// A decode error always aborts the element being decoded together with all of its
/// enclosing containers; no partial tree is handed back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("Unsupported control byte {control:#04x} at offset {offset}")]
    UnsupportedControl { control: u8, offset: usize },

    #[error("End-of-container marker outside of any container at offset {offset}")]
    UnexpectedEndOfContainer { offset: usize },

    #[error("Container opened before offset {offset} was never closed")]
    UnterminatedContainer { offset: usize },

    #[error("Invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("Container nesting exceeds the maximum depth of {max}")]
    DepthExceeded { max: usize },

    #[error("{remaining} trailing bytes after the envelope")]
    TrailingBytes { remaining: usize },

    #[error("Unsupported element kind {element_type:?} with width {width}")]
    UnsupportedType { element_type: ElementType, width: u8 },

    #[error("Content does not match declared kind {element_type:?} with width {width}")]
    TypeMismatch { element_type: ElementType, width: u8 },

    #[error("Element of kind {0:?} cannot hold children")]
    NotAContainer(ElementType),

    #[error("Malformed element description: {0}")]
    Malformed(String),
}
