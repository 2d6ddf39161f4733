//! Request and response controls.
//!
//! Two request controls are understood: server-side sort (RFC 2891) and
//! virtual list view. Their parameters are read from the base64 BER
//! `controlValue` when one is supplied, otherwise from structured children:
//!
//! ```xml
//! <control type="1.2.840.113556.1.4.473" criticality="true">
//!   <sortKey attribute="sn" reverse="true"/>
//! </control>
//! <control type="2.16.840.1.113730.3.4.9">
//!   <virtualListView index="1" before="0" after="19" contentCount="0"/>
//! </control>
//! ```
//!
//! Anything else is surfaced as [`Control::Unknown`]; whether that fails the
//! operation is decided by the request layer from its criticality.

use crate::{
    ber::{self, BerError, BerReader},
    filter::parse_xsd_bool,
    value::{self, ValueError},
    xml::Element,
};

/// Server-side sort request.
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
/// Server-side sort response.
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";
/// Virtual list view request.
pub const VLV_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
/// Virtual list view response.
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";

/// Errors produced while translating a control element.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    /// The `type` attribute is absent.
    #[error("<control> is missing its type")]
    MissingType,

    /// A recognized control carries unusable parameters.
    #[error("invalid {oid} control: {reason}")]
    Invalid {
        /// Control OID.
        oid: String,
        /// What was wrong.
        reason: String,
    },

    /// The `controlValue` payload failed to decode.
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// One key of a sort request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Attribute to order by.
    pub attribute: String,
    /// Optional ordering matching rule.
    pub ordering_rule: Option<String>,
    /// Descending order when set.
    pub reverse: bool,
}

/// Where a virtual list view window is anchored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlvTarget {
    /// 1-based index into the sorted result set with the client's estimate
    /// of its size (0 when unknown).
    ByOffset {
        /// Target index.
        offset: i32,
        /// Client's content count estimate.
        content_count: i32,
    },
    /// First entry whose sort key is greater than or equal to the value.
    GreaterOrEqual(Vec<u8>),
}

/// Virtual list view window parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualListView {
    /// Entries requested before the target.
    pub before: i32,
    /// Entries requested after the target.
    pub after: i32,
    /// Window anchor.
    pub target: VlvTarget,
    /// Server context from a previous response.
    pub context_id: Option<Vec<u8>>,
}

/// A translated request control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Server-side sort.
    Sort {
        /// Ordered sort keys.
        keys: Vec<SortKey>,
        /// Criticality flag.
        critical: bool,
    },
    /// Virtual list view.
    VirtualListView {
        /// Window parameters.
        view: VirtualListView,
        /// Criticality flag.
        critical: bool,
    },
    /// A control this gateway does not implement.
    Unknown {
        /// Control OID.
        oid: String,
        /// Criticality flag.
        critical: bool,
    },
}

impl Control {
    /// Translate a `<control>` element.
    pub fn from_element(el: &Element) -> Result<Self, ControlError> {
        let oid = el.attribute("type").map(str::trim).ok_or(ControlError::MissingType)?;
        let critical = el.attribute("criticality").is_some_and(parse_xsd_bool);
        let raw = el.child("controlValue").map(value::decode).transpose()?;

        let invalid =
            |reason: String| ControlError::Invalid { oid: oid.to_string(), reason };

        match oid {
            SORT_REQUEST_OID => {
                let keys = match raw {
                    Some(bytes) => decode_sort_keys(&bytes).map_err(|e| invalid(e.to_string()))?,
                    None => sort_keys_from_children(el).map_err(invalid)?,
                };
                if keys.is_empty() {
                    return Err(invalid("no sort keys".to_string()));
                }
                Ok(Self::Sort { keys, critical })
            },
            VLV_REQUEST_OID => {
                let view = match raw {
                    Some(bytes) => decode_vlv(&bytes).map_err(|e| invalid(e.to_string()))?,
                    None => vlv_from_element(el).map_err(invalid)?,
                };
                Ok(Self::VirtualListView { view, critical })
            },
            other => Ok(Self::Unknown { oid: other.to_string(), critical }),
        }
    }

    /// Control OID.
    pub fn oid(&self) -> &str {
        match self {
            Self::Sort { .. } => SORT_REQUEST_OID,
            Self::VirtualListView { .. } => VLV_REQUEST_OID,
            Self::Unknown { oid, .. } => oid,
        }
    }

    /// Criticality flag.
    pub fn is_critical(&self) -> bool {
        match self {
            Self::Sort { critical, .. }
            | Self::VirtualListView { critical, .. }
            | Self::Unknown { critical, .. } => *critical,
        }
    }

    /// BER-encoded control value for the wire, if the control has one.
    pub fn encode_value(&self) -> Option<Vec<u8>> {
        match self {
            Self::Sort { keys, .. } => Some(encode_sort_keys(keys)),
            Self::VirtualListView { view, .. } => Some(encode_vlv(view)),
            Self::Unknown { .. } => None,
        }
    }
}

fn sort_keys_from_children(el: &Element) -> Result<Vec<SortKey>, String> {
    el.children_named("sortKey")
        .map(|key| {
            let attribute = key
                .attribute("attribute")
                .or_else(|| key.attribute("attributeType"))
                .ok_or_else(|| "sortKey without attribute".to_string())?;
            Ok(SortKey {
                attribute: attribute.to_string(),
                ordering_rule: key.attribute("orderingRule").map(str::to_string),
                reverse: key
                    .attribute("reverse")
                    .or_else(|| key.attribute("reverseOrder"))
                    .is_some_and(parse_xsd_bool),
            })
        })
        .collect()
}

fn int_attribute(el: &Element, name: &str) -> Result<Option<i32>, String> {
    el.attribute(name)
        .map(|v| v.trim().parse::<i32>().map_err(|_| format!("{name} is not an integer: {v}")))
        .transpose()
}

fn vlv_from_element(control: &Element) -> Result<VirtualListView, String> {
    let el = control.child("virtualListView").unwrap_or(control);

    let before = int_attribute(el, "before")?.unwrap_or(0);
    let after = int_attribute(el, "after")?.unwrap_or(0);
    if before < 0 || after < 0 {
        return Err("before/after must not be negative".to_string());
    }

    let target = match el.child("greaterOrEqual") {
        Some(assertion) => {
            VlvTarget::GreaterOrEqual(value::decode(assertion).map_err(|e| e.to_string())?)
        },
        None => VlvTarget::ByOffset {
            offset: int_attribute(el, "index")?.ok_or_else(|| "missing index".to_string())?,
            content_count: int_attribute(el, "contentCount")?.unwrap_or(0),
        },
    };

    let context_id = el
        .child("contextID")
        .map(value::decode)
        .transpose()
        .map_err(|e| e.to_string())?;

    Ok(VirtualListView { before, after, target, context_id })
}

fn encode_sort_keys(keys: &[SortKey]) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = keys
        .iter()
        .map(|key| {
            let mut parts = vec![ber::encode_tlv(ber::TAG_OCTET_STRING, key.attribute.as_bytes())];
            if let Some(rule) = &key.ordering_rule {
                parts.push(ber::encode_tlv(ber::context(0), rule.as_bytes()));
            }
            if key.reverse {
                parts.push(ber::encode_boolean(ber::context(1), true));
            }
            ber::encode_constructed(ber::TAG_SEQUENCE, &parts)
        })
        .collect();
    ber::encode_constructed(ber::TAG_SEQUENCE, &encoded)
}

fn decode_sort_keys(bytes: &[u8]) -> Result<Vec<SortKey>, BerError> {
    let mut outer = BerReader::new(bytes);
    let mut list = outer.sequence(ber::TAG_SEQUENCE)?;
    let mut keys = Vec::new();

    while !list.is_empty() {
        let mut key = list.sequence(ber::TAG_SEQUENCE)?;
        let attribute = String::from_utf8_lossy(key.octets(ber::TAG_OCTET_STRING)?).into_owned();
        let mut ordering_rule = None;
        let mut reverse = false;
        while let Some(tag) = key.peek_tag() {
            if tag == ber::context(0) {
                ordering_rule = Some(String::from_utf8_lossy(key.octets(tag)?).into_owned());
            } else if tag == ber::context(1) {
                reverse = key.boolean(tag)?;
            } else {
                key.read_tlv()?;
            }
        }
        keys.push(SortKey { attribute, ordering_rule, reverse });
    }

    Ok(keys)
}

fn encode_vlv(view: &VirtualListView) -> Vec<u8> {
    let mut parts = vec![
        ber::encode_integer(ber::TAG_INTEGER, i64::from(view.before)),
        ber::encode_integer(ber::TAG_INTEGER, i64::from(view.after)),
    ];
    match &view.target {
        VlvTarget::ByOffset { offset, content_count } => {
            parts.push(ber::encode_constructed(ber::context_constructed(0), &[
                ber::encode_integer(ber::TAG_INTEGER, i64::from(*offset)),
                ber::encode_integer(ber::TAG_INTEGER, i64::from(*content_count)),
            ]));
        },
        VlvTarget::GreaterOrEqual(value) => {
            parts.push(ber::encode_tlv(ber::context(1), value));
        },
    }
    if let Some(context_id) = &view.context_id {
        parts.push(ber::encode_tlv(ber::TAG_OCTET_STRING, context_id));
    }
    ber::encode_constructed(ber::TAG_SEQUENCE, &parts)
}

fn narrow(value: i64) -> Result<i32, BerError> {
    i32::try_from(value).map_err(|_| BerError::InvalidInteger)
}

fn decode_vlv(bytes: &[u8]) -> Result<VirtualListView, BerError> {
    let mut outer = BerReader::new(bytes);
    let mut seq = outer.sequence(ber::TAG_SEQUENCE)?;
    let before = narrow(seq.integer(ber::TAG_INTEGER)?)?;
    let after = narrow(seq.integer(ber::TAG_INTEGER)?)?;

    let target = match seq.peek_tag() {
        Some(tag) if tag == ber::context_constructed(0) => {
            let mut by_offset = seq.sequence(tag)?;
            VlvTarget::ByOffset {
                offset: narrow(by_offset.integer(ber::TAG_INTEGER)?)?,
                content_count: narrow(by_offset.integer(ber::TAG_INTEGER)?)?,
            }
        },
        Some(tag) if tag == ber::context(1) => VlvTarget::GreaterOrEqual(seq.octets(tag)?.to_vec()),
        Some(actual) => {
            return Err(BerError::UnexpectedTag { expected: ber::context_constructed(0), actual });
        },
        None => return Err(BerError::Truncated),
    };

    let context_id = if seq.peek_tag() == Some(ber::TAG_OCTET_STRING) {
        Some(seq.octets(ber::TAG_OCTET_STRING)?.to_vec())
    } else {
        None
    };

    Ok(VirtualListView { before, after, target, context_id })
}

/// A control returned by the directory with a search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseControl {
    /// Outcome of a sort request.
    SortResult {
        /// Sort result code (0 = success).
        result: u32,
        /// Attribute that caused a failure, if reported.
        attribute: Option<String>,
    },
    /// Outcome of a virtual list view request.
    VirtualListView {
        /// 1-based position of the target entry.
        target_position: i32,
        /// Server's estimate of the result set size.
        content_count: i32,
        /// VLV result code (0 = success).
        result: u32,
        /// Opaque server context for follow-up requests.
        context_id: Option<Vec<u8>>,
    },
    /// Any other control, passed through verbatim.
    Other {
        /// Control OID.
        oid: String,
        /// Criticality flag.
        critical: bool,
        /// Raw control value.
        value: Option<Vec<u8>>,
    },
}

impl ResponseControl {
    /// Interpret a raw response control, keeping unknown ones as
    /// [`ResponseControl::Other`].
    pub fn decode(oid: &str, critical: bool, value: Option<&[u8]>) -> Result<Self, BerError> {
        match (oid, value) {
            (SORT_RESPONSE_OID, Some(bytes)) => {
                let mut outer = BerReader::new(bytes);
                let mut seq = outer.sequence(ber::TAG_SEQUENCE)?;
                let result = enumerated(seq.integer(ber::TAG_ENUMERATED)?)?;
                let attribute = match seq.peek_tag() {
                    Some(tag) if tag == ber::context(0) => {
                        Some(String::from_utf8_lossy(seq.octets(tag)?).into_owned())
                    },
                    _ => None,
                };
                Ok(Self::SortResult { result, attribute })
            },
            (VLV_RESPONSE_OID, Some(bytes)) => {
                let mut outer = BerReader::new(bytes);
                let mut seq = outer.sequence(ber::TAG_SEQUENCE)?;
                let target_position = narrow(seq.integer(ber::TAG_INTEGER)?)?;
                let content_count = narrow(seq.integer(ber::TAG_INTEGER)?)?;
                let result = enumerated(seq.integer(ber::TAG_ENUMERATED)?)?;
                let context_id = if seq.peek_tag() == Some(ber::TAG_OCTET_STRING) {
                    Some(seq.octets(ber::TAG_OCTET_STRING)?.to_vec())
                } else {
                    None
                };
                Ok(Self::VirtualListView { target_position, content_count, result, context_id })
            },
            _ => Ok(Self::Other {
                oid: oid.to_string(),
                critical,
                value: value.map(<[u8]>::to_vec),
            }),
        }
    }

    /// Control OID.
    pub fn oid(&self) -> &str {
        match self {
            Self::SortResult { .. } => SORT_RESPONSE_OID,
            Self::VirtualListView { .. } => VLV_RESPONSE_OID,
            Self::Other { oid, .. } => oid,
        }
    }

    /// Criticality flag.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Other { critical: true, .. })
    }

    /// BER-encoded control value.
    pub fn encode_value(&self) -> Option<Vec<u8>> {
        match self {
            Self::SortResult { result, attribute } => {
                let mut parts = vec![ber::encode_integer(ber::TAG_ENUMERATED, i64::from(*result))];
                if let Some(attribute) = attribute {
                    parts.push(ber::encode_tlv(ber::context(0), attribute.as_bytes()));
                }
                Some(ber::encode_constructed(ber::TAG_SEQUENCE, &parts))
            },
            Self::VirtualListView { target_position, content_count, result, context_id } => {
                let mut parts = vec![
                    ber::encode_integer(ber::TAG_INTEGER, i64::from(*target_position)),
                    ber::encode_integer(ber::TAG_INTEGER, i64::from(*content_count)),
                    ber::encode_integer(ber::TAG_ENUMERATED, i64::from(*result)),
                ];
                if let Some(context_id) = context_id {
                    parts.push(ber::encode_tlv(ber::TAG_OCTET_STRING, context_id));
                }
                Some(ber::encode_constructed(ber::TAG_SEQUENCE, &parts))
            },
            Self::Other { value, .. } => value.clone(),
        }
    }
}

fn enumerated(value: i64) -> Result<u32, BerError> {
    u32::try_from(value).map_err(|_| BerError::InvalidInteger)
}
