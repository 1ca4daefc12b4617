use super::element::{DecodedElement, ElementType};

/// Picks the element holding the reportable payload out of a decoded response envelope.
pub trait PayloadLocator: Send + Sync {
    fn locate<'a>(&self, envelope: &'a DecodedElement) -> Option<&'a DecodedElement>;
}

/// Responses wrap their fields in an outer structure whose first child is the payload.
/// Anything else is taken as the payload itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstStructureChild;

impl PayloadLocator for FirstStructureChild {
    fn locate<'a>(&self, envelope: &'a DecodedElement) -> Option<&'a DecodedElement> {
        if envelope.element_type() != ElementType::Structure {
            return Some(envelope);
        }
        envelope.children()?.first()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WholeEnvelope;

impl PayloadLocator for WholeEnvelope {
    fn locate<'a>(&self, envelope: &'a DecodedElement) -> Option<&'a DecodedElement> {
        Some(envelope)
    }
}
