//! Attribute value codec.
//!
//! DSML carries values either as plain text or, when annotated with
//! `xsi:type="xsd:base64Binary"`, as base64. Decoding yields raw bytes;
//! encoding decides which of the two forms to emit.

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::xml::Element;

/// Errors produced while decoding a value element.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    /// The element was marked base64 but its content is not valid base64.
    #[error("invalid base64 value: {0}")]
    InvalidBase64(String),
}

/// A value prepared for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedValue {
    /// Printable UTF-8 text, written verbatim (XML-escaped).
    Text(String),
    /// Base64 text, written with an `xsi:type="xsd:base64Binary"` annotation.
    Base64(String),
}

/// Returns true if `xsi_type` denotes base64 content.
fn is_base64_type(xsi_type: Option<&str>) -> bool {
    xsi_type.is_some_and(|t| t.rsplit(':').next() == Some("base64Binary"))
}

/// Decode a value-bearing element (`value`, `initial`, `requestValue`, ...).
pub fn decode(element: &Element) -> Result<Vec<u8>, ValueError> {
    if is_base64_type(element.xsi_type()) {
        decode_base64(element.text())
    } else {
        Ok(element.text().as_bytes().to_vec())
    }
}

/// Decode base64 text, ignoring embedded whitespace (line-wrapped payloads).
pub fn decode_base64(text: &str) -> Result<Vec<u8>, ValueError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact.as_bytes()).map_err(|e| ValueError::InvalidBase64(e.to_string()))
}

/// Base64-encode raw bytes.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// A value is printable iff it is UTF-8 and free of control characters.
///
/// Tab, CR and LF count as control: XML consumers normalize line endings
/// in text content, so such values only survive as base64.
pub fn is_printable(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok_and(|s| s.chars().all(|c| !c.is_control()))
}

/// Choose the output form for a value.
pub fn encode(bytes: &[u8]) -> EncodedValue {
    match std::str::from_utf8(bytes) {
        Ok(text) if is_printable(bytes) => EncodedValue::Text(text.to_string()),
        _ => EncodedValue::Base64(encode_base64(bytes)),
    }
}

impl EncodedValue {
    /// Decode this output form back to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ValueError> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Base64(b64) => decode_base64(b64),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn base64_value(text: &str) -> Element {
        Element::new("value")
            .with_prefixed_attribute("xsi", "type", "xsd:base64Binary")
            .with_text(text)
    }

    #[test]
    fn plain_text_is_taken_literally() {
        let el = Element::new("value").with_text("Babs Jensen");
        assert_eq!(decode(&el).unwrap(), b"Babs Jensen");
    }

    #[test]
    fn base64_annotation_is_honoured() {
        assert_eq!(decode(&base64_value("AAEC")).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn base64_tolerates_line_wrapping() {
        assert_eq!(decode(&base64_value("SGVs\n  bG8=\n")).unwrap(), b"Hello");
    }

    #[test]
    fn invalid_base64_is_an_error() {
        assert!(matches!(decode(&base64_value("!!!")), Err(ValueError::InvalidBase64(_))));
    }

    #[test]
    fn other_xsi_types_are_text() {
        let el = Element::new("value")
            .with_prefixed_attribute("xsi", "type", "xsd:string")
            .with_text("AAEC");
        assert_eq!(decode(&el).unwrap(), b"AAEC");
    }

    #[test]
    fn printable_classification() {
        assert!(is_printable(b"plain text with spaces"));
        assert!(!is_printable(b"tab\tinside"));
        assert!(!is_printable(b"line1\r\nline2"));
        assert!(!is_printable(b"trailing\n"));
        assert!(is_printable("åäö".as_bytes()));
        assert!(!is_printable(b"nul\0inside"));
        assert!(!is_printable(&[0xff, 0xfe]));
    }

    #[test]
    fn encode_picks_form() {
        assert_eq!(encode(b"cn"), EncodedValue::Text("cn".into()));
        assert_eq!(encode(&[0, 1]), EncodedValue::Base64("AAE=".into()));
        assert_eq!(encode(b"line1\r\nline2"), EncodedValue::Base64("bGluZTENCmxpbmUy".into()));
        assert_eq!(encode(b"a\tb"), EncodedValue::Base64("YQli".into()));
    }

    proptest! {
        #[test]
        fn base64_decode_inverts_encode(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let el = base64_value(&encode_base64(&bytes));
            prop_assert_eq!(decode(&el).unwrap(), bytes);
        }

        #[test]
        fn output_form_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(encode(&bytes).to_bytes().unwrap(), bytes);
        }
    }
}
