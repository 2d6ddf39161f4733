//! Minimal BER codec for control values.
//!
//! Only the constructs needed by the sort (RFC 2891) and virtual list view
//! controls are supported: definite lengths, single-byte tags, INTEGER,
//! ENUMERATED, BOOLEAN, OCTET STRING and SEQUENCE.

/// Universal BOOLEAN tag.
pub const TAG_BOOLEAN: u8 = 0x01;
/// Universal INTEGER tag.
pub const TAG_INTEGER: u8 = 0x02;
/// Universal OCTET STRING tag.
pub const TAG_OCTET_STRING: u8 = 0x04;
/// Universal ENUMERATED tag.
pub const TAG_ENUMERATED: u8 = 0x0a;
/// Universal constructed SEQUENCE tag.
pub const TAG_SEQUENCE: u8 = 0x30;

/// Context-specific primitive tag `[n]`.
pub const fn context(n: u8) -> u8 {
    0x80 | n
}

/// Context-specific constructed tag `[n]`.
pub const fn context_constructed(n: u8) -> u8 {
    0xa0 | n
}

/// Errors produced while decoding BER.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BerError {
    /// Input ended before the element was complete.
    #[error("truncated BER element")]
    Truncated,

    /// An element carried an unexpected tag.
    #[error("unexpected BER tag {actual:#04x}, expected {expected:#04x}")]
    UnexpectedTag {
        /// Tag the caller asked for.
        expected: u8,
        /// Tag found in the input.
        actual: u8,
    },

    /// Length encoding not supported (indefinite or wider than 4 bytes).
    #[error("unsupported BER length encoding")]
    UnsupportedLength,

    /// INTEGER content empty or wider than 8 bytes.
    #[error("invalid BER integer")]
    InvalidInteger,
}

/// Encode a definite length.
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let significant = &bytes[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Encode one tag-length-value element.
pub fn encode_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

/// Encode a two's complement integer in minimal form under `tag`.
pub fn encode_integer(tag: u8, value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    encode_tlv(tag, &bytes[start..])
}

/// Encode a BOOLEAN under `tag`.
pub fn encode_boolean(tag: u8, value: bool) -> Vec<u8> {
    encode_tlv(tag, &[if value { 0xff } else { 0x00 }])
}

/// Encode a SEQUENCE (or any constructed tag) from already-encoded parts.
pub fn encode_constructed(tag: u8, parts: &[Vec<u8>]) -> Vec<u8> {
    let content: Vec<u8> = parts.concat();
    encode_tlv(tag, &content)
}

/// Cursor over a run of BER elements.
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    data: &'a [u8],
}

impl<'a> BerReader<'a> {
    /// Read elements from `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// True when all elements have been consumed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Tag of the next element, if any.
    pub fn peek_tag(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Read the next element, returning its tag and content.
    pub fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), BerError> {
        let (&tag, rest) = self.data.split_first().ok_or(BerError::Truncated)?;
        let (&first, rest) = rest.split_first().ok_or(BerError::Truncated)?;

        let (len, rest) = if first & 0x80 == 0 {
            (usize::from(first), rest)
        } else {
            let width = usize::from(first & 0x7f);
            if width == 0 || width > 4 {
                return Err(BerError::UnsupportedLength);
            }
            if rest.len() < width {
                return Err(BerError::Truncated);
            }
            let len = rest[..width].iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            (len, &rest[width..])
        };

        if rest.len() < len {
            return Err(BerError::Truncated);
        }
        let (content, remaining) = rest.split_at(len);
        self.data = remaining;
        Ok((tag, content))
    }

    /// Read the next element and require `tag`.
    pub fn expect(&mut self, tag: u8) -> Result<&'a [u8], BerError> {
        let (actual, content) = self.read_tlv()?;
        if actual != tag {
            return Err(BerError::UnexpectedTag { expected: tag, actual });
        }
        Ok(content)
    }

    /// Read a constructed element and return a reader over its content.
    pub fn sequence(&mut self, tag: u8) -> Result<Self, BerError> {
        self.expect(tag).map(Self::new)
    }

    /// Read an integer-valued element (INTEGER, ENUMERATED or implicit tag).
    pub fn integer(&mut self, tag: u8) -> Result<i64, BerError> {
        let content = self.expect(tag)?;
        if content.is_empty() || content.len() > 8 {
            return Err(BerError::InvalidInteger);
        }
        let negative = content[0] & 0x80 != 0;
        let init: i64 = if negative { -1 } else { 0 };
        Ok(content.iter().fold(init, |acc, &b| (acc << 8) | i64::from(b)))
    }

    /// Read a BOOLEAN-valued element.
    pub fn boolean(&mut self, tag: u8) -> Result<bool, BerError> {
        let content = self.expect(tag)?;
        match content {
            [b] => Ok(*b != 0),
            _ => Err(BerError::Truncated),
        }
    }

    /// Read an octet-string-valued element.
    pub fn octets(&mut self, tag: u8) -> Result<&'a [u8], BerError> {
        self.expect(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_lengths() {
        let mut out = Vec::new();
        encode_length(5, &mut out);
        assert_eq!(out, vec![5]);

        let mut out = Vec::new();
        encode_length(300, &mut out);
        assert_eq!(out, vec![0x82, 0x01, 0x2c]);
    }

    #[test]
    fn integers_are_minimal() {
        assert_eq!(encode_integer(TAG_INTEGER, 0), vec![0x02, 0x01, 0x00]);
        assert_eq!(encode_integer(TAG_INTEGER, 127), vec![0x02, 0x01, 0x7f]);
        assert_eq!(encode_integer(TAG_INTEGER, 128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(encode_integer(TAG_INTEGER, -1), vec![0x02, 0x01, 0xff]);
        assert_eq!(encode_integer(TAG_INTEGER, -129), vec![0x02, 0x02, 0xff, 0x7f]);
    }

    #[test]
    fn integers_decode_back() {
        for value in [0i64, 1, 127, 128, 255, 256, 65_535, -1, -128, -129, i64::from(i32::MAX)] {
            let encoded = encode_integer(TAG_INTEGER, value);
            let mut reader = BerReader::new(&encoded);
            assert_eq!(reader.integer(TAG_INTEGER).unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn nested_sequence_reads() {
        let encoded = encode_constructed(TAG_SEQUENCE, &[
            encode_tlv(TAG_OCTET_STRING, b"cn"),
            encode_boolean(context(1), true),
        ]);
        let mut outer = BerReader::new(&encoded);
        let mut inner = outer.sequence(TAG_SEQUENCE).unwrap();
        assert_eq!(inner.octets(TAG_OCTET_STRING).unwrap(), b"cn");
        assert_eq!(inner.peek_tag(), Some(context(1)));
        assert!(inner.boolean(context(1)).unwrap());
        assert!(inner.is_empty());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut reader = BerReader::new(&[0x30, 0x05, 0x01]);
        assert_eq!(reader.read_tlv(), Err(BerError::Truncated));
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let encoded = encode_tlv(TAG_OCTET_STRING, b"x");
        let mut reader = BerReader::new(&encoded);
        assert_eq!(
            reader.expect(TAG_INTEGER),
            Err(BerError::UnexpectedTag { expected: TAG_INTEGER, actual: TAG_OCTET_STRING })
        );
    }
}
