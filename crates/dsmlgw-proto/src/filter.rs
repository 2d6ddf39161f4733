//! Search filter AST and its RFC 4515 string form.
//!
//! A DSML `<filter>` element is translated in two explicit steps:
//!
//! 1. [`FilterNode::from_filter`] walks the element tree (recursive descent)
//!    and produces a [`FilterNode`] AST, rejecting anything it does not
//!    recognize.
//! 2. The AST's `Display` impl renders the parenthesized string handed to the
//!    directory client.
//!
//! Assertion values are escaped on rendering, so a value such as `a*b` in an
//! `equalityMatch` stays an equality test and cannot widen the filter.

use std::fmt;

use crate::{
    value::{self, ValueError},
    xml::Element,
};

/// Errors produced while translating a filter element.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    /// The element is not a filter component.
    #[error("unrecognized filter element <{0}>")]
    UnknownElement(String),

    /// `<filter>` or `<not>` did not contain exactly one component.
    #[error("<{element}> must contain exactly one filter component, found {found}")]
    Arity {
        /// Element with the wrong number of children.
        element: String,
        /// Number of children found.
        found: usize,
    },

    /// A required attribute is missing.
    #[error("<{element}> is missing attribute '{attribute}'")]
    MissingAttribute {
        /// Element lacking the attribute.
        element: String,
        /// Name of the missing attribute.
        attribute: &'static str,
    },

    /// An assertion element has no `<value>` child.
    #[error("<{0}> is missing its <value>")]
    MissingValue(String),

    /// Attribute description contains characters outside the RFC 4512 set.
    #[error("invalid attribute description '{0}'")]
    InvalidAttribute(String),

    /// `<substrings>` has no fragments.
    #[error("<substrings> for '{0}' has no fragments")]
    EmptySubstrings(String),

    /// A `<substrings>` fragment is empty, which RFC 4515 cannot express.
    #[error("<substrings> for '{attribute}' has an empty <{fragment}>")]
    EmptyFragment {
        /// Attribute of the substrings assertion.
        attribute: String,
        /// Name of the empty fragment element.
        fragment: String,
    },

    /// `<substrings>` fragments are out of order (initial, any*, final).
    #[error("<substrings> for '{0}' has misplaced initial/final fragments")]
    FragmentOrder(String),

    /// `<extensibleMatch>` has neither an attribute nor a matching rule.
    #[error("<extensibleMatch> needs a name or a matchingRule")]
    IncompleteExtensibleMatch,

    /// An assertion value failed to decode.
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Attribute/value pair used by the comparison filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// Attribute description.
    pub attribute: String,
    /// Raw assertion value.
    pub value: Vec<u8>,
}

/// One piece of a substring assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstringFragment {
    /// Leading fragment (`Al*`).
    Initial(Vec<u8>),
    /// Inner fragment (`*ex*`).
    Any(Vec<u8>),
    /// Trailing fragment (`*er`).
    Final(Vec<u8>),
}

/// Search filter AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterNode {
    /// All components must match.
    And(Vec<Self>),
    /// Any component must match.
    Or(Vec<Self>),
    /// Negation.
    Not(Box<Self>),
    /// `(attr=value)`
    Equality(Assertion),
    /// `(attr=initial*any*final)`
    Substrings {
        /// Attribute description.
        attribute: String,
        /// Fragments in document order.
        fragments: Vec<SubstringFragment>,
    },
    /// `(attr=*)`
    Present(String),
    /// `(attr>=value)`
    GreaterOrEqual(Assertion),
    /// `(attr<=value)`
    LessOrEqual(Assertion),
    /// `(attr~=value)`
    ApproxMatch(Assertion),
    /// `(attr:dn:rule:=value)`
    ExtensibleMatch {
        /// Optional attribute description.
        attribute: Option<String>,
        /// Optional matching rule OID or name.
        matching_rule: Option<String>,
        /// Whether DN attributes participate.
        dn_attributes: bool,
        /// Raw assertion value.
        value: Vec<u8>,
    },
}

impl FilterNode {
    /// Translate a `<filter>` element, which wraps exactly one component.
    pub fn from_filter(filter: &Element) -> Result<Self, FilterError> {
        match filter.children() {
            [only] => Self::from_element(only),
            other => {
                Err(FilterError::Arity { element: filter.name().to_string(), found: other.len() })
            },
        }
    }

    /// Translate a single filter component element.
    pub fn from_element(el: &Element) -> Result<Self, FilterError> {
        match el.name() {
            "and" => components(el).map(Self::And),
            "or" => components(el).map(Self::Or),
            "not" => match el.children() {
                [only] => Ok(Self::Not(Box::new(Self::from_element(only)?))),
                other => Err(FilterError::Arity { element: "not".to_string(), found: other.len() }),
            },
            "equalityMatch" => assertion(el).map(Self::Equality),
            "greaterOrEqual" => assertion(el).map(Self::GreaterOrEqual),
            "lessOrEqual" => assertion(el).map(Self::LessOrEqual),
            "approxMatch" => assertion(el).map(Self::ApproxMatch),
            "present" => attribute_name(el).map(Self::Present),
            "substrings" => substrings(el),
            "extensibleMatch" => extensible_match(el),
            other => Err(FilterError::UnknownElement(other.to_string())),
        }
    }

    /// Render the RFC 4515 string form.
    pub fn to_ldap_string(&self) -> String {
        self.to_string()
    }
}

fn components(el: &Element) -> Result<Vec<FilterNode>, FilterError> {
    el.children().iter().map(FilterNode::from_element).collect()
}

fn attribute_name(el: &Element) -> Result<String, FilterError> {
    let name = el.attribute("name").ok_or_else(|| FilterError::MissingAttribute {
        element: el.name().to_string(),
        attribute: "name",
    })?;
    validate_attribute(name)?;
    Ok(name.to_string())
}

/// Attribute descriptions: a descriptor or numeric OID plus `;options`.
pub fn validate_attribute(name: &str) -> Result<(), FilterError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ';' | '_'));
    if valid { Ok(()) } else { Err(FilterError::InvalidAttribute(name.to_string())) }
}

fn assertion(el: &Element) -> Result<Assertion, FilterError> {
    let attribute = attribute_name(el)?;
    let value_el =
        el.child("value").ok_or_else(|| FilterError::MissingValue(el.name().to_string()))?;
    Ok(Assertion { attribute, value: value::decode(value_el)? })
}

fn substrings(el: &Element) -> Result<FilterNode, FilterError> {
    let attribute = attribute_name(el)?;
    let mut fragments = Vec::with_capacity(el.children().len());

    for child in el.children() {
        let bytes = value::decode(child)?;
        let fragment = match child.name() {
            "initial" => SubstringFragment::Initial(bytes),
            "any" => SubstringFragment::Any(bytes),
            "final" => SubstringFragment::Final(bytes),
            other => return Err(FilterError::UnknownElement(other.to_string())),
        };
        if bytes_of(&fragment).is_empty() {
            return Err(FilterError::EmptyFragment {
                attribute,
                fragment: child.name().to_string(),
            });
        }
        fragments.push(fragment);
    }

    if fragments.is_empty() {
        return Err(FilterError::EmptySubstrings(attribute));
    }

    let last = fragments.len() - 1;
    let misplaced = fragments.iter().enumerate().any(|(i, f)| match f {
        SubstringFragment::Initial(_) => i != 0,
        SubstringFragment::Final(_) => i != last,
        SubstringFragment::Any(_) => false,
    });
    if misplaced {
        return Err(FilterError::FragmentOrder(attribute));
    }

    Ok(FilterNode::Substrings { attribute, fragments })
}

fn bytes_of(fragment: &SubstringFragment) -> &[u8] {
    match fragment {
        SubstringFragment::Initial(v) | SubstringFragment::Any(v) | SubstringFragment::Final(v) => v,
    }
}

fn extensible_match(el: &Element) -> Result<FilterNode, FilterError> {
    let attribute = match el.attribute("name") {
        Some(name) => {
            validate_attribute(name)?;
            Some(name.to_string())
        },
        None => None,
    };
    let matching_rule = match el.attribute("matchingRule") {
        Some(rule) => {
            validate_attribute(rule)?;
            Some(rule.to_string())
        },
        None => None,
    };
    if attribute.is_none() && matching_rule.is_none() {
        return Err(FilterError::IncompleteExtensibleMatch);
    }
    let dn_attributes = el.attribute("dnAttributes").is_some_and(parse_xsd_bool);
    let value_el =
        el.child("value").ok_or_else(|| FilterError::MissingValue("extensibleMatch".to_string()))?;

    Ok(FilterNode::ExtensibleMatch {
        attribute,
        matching_rule,
        dn_attributes,
        value: value::decode(value_el)?,
    })
}

/// `xsd:boolean` lexical form (`true`, `false`, `1`, `0`).
pub fn parse_xsd_bool(text: &str) -> bool {
    matches!(text.trim(), "true" | "1")
}

/// Escape an assertion value for inclusion in a filter string.
///
/// Filter metacharacters and NUL become `\xx`; bytes that are not valid UTF-8
/// are hex-escaped as well so the rendered filter is always a `String`.
pub fn escape_value(bytes: &[u8], out: &mut String) {
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '*' => out.push_str("\\2a"),
                '(' => out.push_str("\\28"),
                ')' => out.push_str("\\29"),
                '\\' => out.push_str("\\5c"),
                '\0' => out.push_str("\\00"),
                other => out.push(other),
            }
        }
        for &b in chunk.invalid() {
            push_hex_escape(b, out);
        }
    }
}

fn push_hex_escape(b: u8, out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push('\\');
    out.push(char::from(HEX[usize::from(b >> 4)]));
    out.push(char::from(HEX[usize::from(b & 0x0f)]));
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        render(self, &mut out);
        f.write_str(&out)
    }
}

fn render_assertion(op: &str, a: &Assertion, out: &mut String) {
    out.push('(');
    out.push_str(&a.attribute);
    out.push_str(op);
    escape_value(&a.value, out);
    out.push(')');
}

fn render(node: &FilterNode, out: &mut String) {
    match node {
        FilterNode::And(children) | FilterNode::Or(children) => {
            out.push_str(if matches!(node, FilterNode::And(_)) { "(&" } else { "(|" });
            for child in children {
                render(child, out);
            }
            out.push(')');
        },
        FilterNode::Not(child) => {
            out.push_str("(!");
            render(child, out);
            out.push(')');
        },
        FilterNode::Equality(a) => render_assertion("=", a, out),
        FilterNode::GreaterOrEqual(a) => render_assertion(">=", a, out),
        FilterNode::LessOrEqual(a) => render_assertion("<=", a, out),
        FilterNode::ApproxMatch(a) => render_assertion("~=", a, out),
        FilterNode::Present(attribute) => {
            out.push('(');
            out.push_str(attribute);
            out.push_str("=*)");
        },
        FilterNode::Substrings { attribute, fragments } => {
            out.push('(');
            out.push_str(attribute);
            out.push('=');
            // Tracks whether the last emitted character is the wildcard.
            let mut star = false;
            for fragment in fragments {
                match fragment {
                    SubstringFragment::Initial(v) => {
                        escape_value(v, out);
                        out.push('*');
                        star = true;
                    },
                    SubstringFragment::Any(v) => {
                        if !star {
                            out.push('*');
                        }
                        escape_value(v, out);
                        out.push('*');
                        star = true;
                    },
                    SubstringFragment::Final(v) => {
                        if !star {
                            out.push('*');
                        }
                        escape_value(v, out);
                        star = false;
                    },
                }
            }
            out.push(')');
        },
        FilterNode::ExtensibleMatch { attribute, matching_rule, dn_attributes, value } => {
            out.push('(');
            if let Some(attribute) = attribute {
                out.push_str(attribute);
            }
            if *dn_attributes {
                out.push_str(":dn");
            }
            if let Some(rule) = matching_rule {
                out.push(':');
                out.push_str(rule);
            }
            out.push_str(":=");
            escape_value(value, out);
            out.push(')');
        },
    }
}
