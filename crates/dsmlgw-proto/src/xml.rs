//! Namespace-stripped XML element tree.
//!
//! DSML documents arrive with arbitrary namespace prefixes (`dsml:`, `soap-env:`,
//! none at all). Request handling only cares about local names, so the reader
//! below folds every element into an owned [`Element`] keyed by its local name
//! and keeps the prefix around for the few attributes where it matters
//! (`xsi:type` on values).

use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};

/// Maximum element nesting accepted by [`Element::parse`].
///
/// Filters are the only deeply nested structure in a batch, and the filter
/// translator recurses once per level.
pub const MAX_DEPTH: usize = 128;

/// Errors produced while reading a document.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum XmlError {
    /// The underlying reader rejected the document.
    #[error("malformed XML at byte {position}: {reason}")]
    Malformed {
        /// Reader position when the error was detected.
        position: u64,
        /// Reader error description.
        reason: String,
    },

    /// The document contains no root element.
    #[error("document has no root element")]
    Empty,

    /// A closing tag did not match the open element.
    #[error("unbalanced element: expected </{expected}>")]
    Unbalanced {
        /// Local name of the element still open.
        expected: String,
    },

    /// The document nests deeper than [`MAX_DEPTH`].
    #[error("element nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
}

/// A single attribute with its optional namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Namespace prefix (`xsi` in `xsi:type`).
    pub prefix: Option<String>,
    /// Local attribute name.
    pub name: String,
    /// Unescaped attribute value.
    pub value: String,
}

/// An element with its attributes, element children and character data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<Attribute>,
    children: Vec<Self>,
    text: String,
}

impl Element {
    /// Create an empty element with the given local name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Builder: add an unprefixed attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute { prefix: None, name: name.into(), value: value.into() });
        self
    }

    /// Builder: add a prefixed attribute such as `xsi:type`.
    #[must_use]
    pub fn with_prefixed_attribute(
        mut self,
        prefix: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.attributes.push(Attribute {
            prefix: Some(prefix.into()),
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Builder: append a child element.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Builder: set the character data.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Parse a complete document and return its root element.
    ///
    /// Text is kept verbatim (no trimming) because attribute values may
    /// legitimately begin or end with whitespace.
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Self> = Vec::new();
        let mut root: Option<Self> = None;

        loop {
            let event = reader.read_event().map_err(|e| XmlError::Malformed {
                position: reader.error_position() as u64,
                reason: e.to_string(),
            })?;

            match event {
                Event::Start(ref start) => {
                    if stack.len() >= MAX_DEPTH {
                        return Err(XmlError::TooDeep);
                    }
                    stack.push(Self::from_start(start, &reader)?);
                },
                Event::Empty(ref start) => {
                    let element = Self::from_start(start, &reader)?;
                    Self::attach(&mut stack, &mut root, element);
                },
                Event::End(ref end) => {
                    let Some(element) = stack.pop() else {
                        return Err(XmlError::Unbalanced {
                            expected: String::from_utf8_lossy(end.local_name().as_ref())
                                .into_owned(),
                        });
                    };
                    if end.local_name().as_ref() != element.name.as_bytes() {
                        return Err(XmlError::Unbalanced { expected: element.name });
                    }
                    Self::attach(&mut stack, &mut root, element);
                },
                Event::Text(ref text) => {
                    if let Some(current) = stack.last_mut() {
                        let unescaped = text.unescape().map_err(|e| XmlError::Malformed {
                            position: reader.buffer_position() as u64,
                            reason: e.to_string(),
                        })?;
                        current.text.push_str(&unescaped);
                    }
                },
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                },
                Event::Eof => break,
                _ => {},
            }
        }

        if let Some(open) = stack.pop() {
            return Err(XmlError::Unbalanced { expected: open.name });
        }

        root.ok_or(XmlError::Empty)
    }

    fn from_start(start: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Self, XmlError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Malformed {
                position: reader.buffer_position() as u64,
                reason: e.to_string(),
            })?;

            let key = attr.key.as_ref();
            if key == b"xmlns" || key.starts_with(b"xmlns:") {
                continue;
            }

            let prefix = attr
                .key
                .prefix()
                .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());
            let local = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| XmlError::Malformed {
                    position: reader.buffer_position() as u64,
                    reason: e.to_string(),
                })?
                .into_owned();

            attributes.push(Attribute { prefix, name: local, value });
        }

        Ok(Self { name, attributes, children: Vec::new(), text: String::new() })
    }

    fn attach(stack: &mut [Self], root: &mut Option<Self>, element: Self) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                // Trailing siblings of the root are ignored; the first root wins.
                if root.is_none() {
                    *root = Some(element);
                }
            },
        }
    }

    /// Local element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All attributes in document order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Value of the first unprefixed attribute called `name`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.prefix.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Value of a prefixed `type` attribute (`xsi:type`), whatever the prefix.
    pub fn xsi_type(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.prefix.is_some() && a.name == "type")
            .map(|a| a.value.as_str())
    }

    /// Element children in document order.
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Consume the element, keeping only its children.
    pub fn into_children(self) -> Vec<Self> {
        self.children
    }

    /// First child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given local name, in order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Concatenated character data of this element (not of descendants).
    pub fn text(&self) -> &str {
        &self.text
    }
}
