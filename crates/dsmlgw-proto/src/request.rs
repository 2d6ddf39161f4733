//! Typed directory requests.
//!
//! A batch carries request elements as opaque nodes; this module turns one
//! node into a [`Request`]. Dispatch happens on [`RequestKind`], so adding a
//! request type means adding a variant and letting the compiler point at
//! every `match` that must handle it.

use tracing::{debug, warn};

use crate::{
    control::{Control, ControlError},
    filter::{self, FilterError, FilterNode, parse_xsd_bool},
    response::ResultCode,
    value::{self, ValueError},
    xml::Element,
};

/// Request element tags understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `authRequest`
    Auth,
    /// `searchRequest`
    Search,
    /// `modifyRequest`
    Modify,
    /// `addRequest`
    Add,
    /// `delRequest`
    Delete,
    /// `modDNRequest`
    ModifyDn,
    /// `compareRequest`
    Compare,
    /// `extendedRequest`
    Extended,
}

impl RequestKind {
    /// Every kind, in DSML schema order.
    pub const ALL: [Self; 8] = [
        Self::Auth,
        Self::Search,
        Self::Modify,
        Self::Add,
        Self::Delete,
        Self::ModifyDn,
        Self::Compare,
        Self::Extended,
    ];

    /// Look up a kind by element tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Request element tag.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Auth => "authRequest",
            Self::Search => "searchRequest",
            Self::Modify => "modifyRequest",
            Self::Add => "addRequest",
            Self::Delete => "delRequest",
            Self::ModifyDn => "modDNRequest",
            Self::Compare => "compareRequest",
            Self::Extended => "extendedRequest",
        }
    }

    /// Response element tag (request tag with a `Response` suffix).
    pub const fn response_tag(self) -> &'static str {
        match self {
            Self::Auth => "authResponse",
            Self::Search => "searchResponse",
            Self::Modify => "modifyResponse",
            Self::Add => "addResponse",
            Self::Delete => "delResponse",
            Self::ModifyDn => "modDNResponse",
            Self::Compare => "compareResponse",
            Self::Extended => "extendedResponse",
        }
    }
}

/// Errors produced while translating a request element.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    /// The element tag is not a known request.
    #[error("unsupported operation <{0}>")]
    UnknownTag(String),

    /// A required attribute is missing.
    #[error("<{element}> is missing attribute '{attribute}'")]
    MissingAttribute {
        /// Element lacking the attribute.
        element: &'static str,
        /// Missing attribute name.
        attribute: &'static str,
    },

    /// A required child element is missing.
    #[error("<{element}> is missing <{child}>")]
    MissingChild {
        /// Element lacking the child.
        element: &'static str,
        /// Missing child tag.
        child: &'static str,
    },

    /// An attribute has an unusable value.
    #[error("<{element}> has invalid {attribute}='{value}'")]
    InvalidValue {
        /// Element carrying the attribute.
        element: &'static str,
        /// Attribute name.
        attribute: &'static str,
        /// Offending value.
        value: String,
    },

    /// A critical control is not supported for this request.
    #[error("unsupported critical control {0}")]
    UnsupportedCriticalControl(String),

    /// Filter translation failed.
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),

    /// Control translation failed.
    #[error("invalid control: {0}")]
    Control(#[from] ControlError),

    /// A value failed to decode.
    #[error(transparent)]
    Value(#[from] ValueError),
}

impl RequestError {
    /// Result code reported for this parse failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::UnsupportedCriticalControl(_) => ResultCode::UNAVAILABLE_CRITICAL_EXTENSION,
            Self::UnknownTag(_) => ResultCode::UNWILLING_TO_PERFORM,
            _ => ResultCode::PROTOCOL_ERROR,
        }
    }
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// The base entry only.
    #[default]
    Base,
    /// Immediate children of the base.
    OneLevel,
    /// The base and all descendants.
    Subtree,
}

impl Scope {
    /// Map the DSML keyword; anything unrecognized narrows to `Base`.
    pub fn from_dsml(text: &str) -> Self {
        match text.trim() {
            "singleLevel" => Self::OneLevel,
            "wholeSubtree" => Self::Subtree,
            "baseObject" => Self::Base,
            other => {
                debug!(scope = other, "unrecognized search scope, using baseObject");
                Self::Base
            },
        }
    }
}

/// Alias dereferencing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    /// Never dereference.
    #[default]
    Never,
    /// Dereference while searching below the base.
    InSearching,
    /// Dereference when locating the base.
    FindingBaseObject,
    /// Always dereference.
    Always,
}

impl DerefAliases {
    /// Map the DSML keyword; anything unrecognized narrows to `Never`.
    pub fn from_dsml(text: &str) -> Self {
        match text.trim() {
            "derefInSearching" => Self::InSearching,
            "derefFindingBaseObj" => Self::FindingBaseObject,
            "derefAlways" => Self::Always,
            "neverDerefAliases" => Self::Never,
            other => {
                debug!(deref = other, "unrecognized derefAliases, using neverDerefAliases");
                Self::Never
            },
        }
    }
}

/// An attribute description with its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
    /// Attribute description.
    pub name: String,
    /// Values in document order.
    pub values: Vec<Vec<u8>>,
}

/// `searchRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base.
    pub dn: String,
    /// Search scope.
    pub scope: Scope,
    /// Alias dereferencing.
    pub deref_aliases: DerefAliases,
    /// Maximum entries returned (0 = no client limit).
    pub size_limit: u32,
    /// Maximum seconds spent (0 = no client limit).
    pub time_limit: u32,
    /// Return attribute names only.
    pub types_only: bool,
    /// Translated filter.
    pub filter: FilterNode,
    /// Requested attributes (empty = all user attributes).
    pub attributes: Vec<String>,
}

/// Modification operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    /// Add values.
    Add,
    /// Delete values (all values when none are listed).
    Delete,
    /// Replace all values.
    Replace,
}

/// One `modification` of a `modifyRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    /// What to do.
    pub operation: ModifyOperation,
    /// Attribute and values.
    pub attribute: PartialAttribute,
}

/// `modifyRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    /// Target entry.
    pub dn: String,
    /// Modifications in document order.
    pub modifications: Vec<Modification>,
}

/// `addRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    /// New entry DN.
    pub dn: String,
    /// Attributes in document order.
    pub attributes: Vec<PartialAttribute>,
}

/// `delRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Entry to delete.
    pub dn: String,
}

/// `modDNRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    /// Entry to rename.
    pub dn: String,
    /// New RDN.
    pub new_rdn: String,
    /// Remove the old RDN values (defaults to true).
    pub delete_old_rdn: bool,
    /// New parent, if moving.
    pub new_superior: Option<String>,
}

/// `compareRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    /// Entry to compare against.
    pub dn: String,
    /// Attribute description.
    pub attribute: String,
    /// Asserted value.
    pub value: Vec<u8>,
}

/// `extendedRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    /// Extended operation OID.
    pub oid: String,
    /// Decoded request value.
    pub value: Option<Vec<u8>>,
}

/// `authRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Principal named by the request.
    pub principal: String,
}

/// A translated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    /// Authentication check.
    Auth(AuthRequest),
    /// Search.
    Search(SearchRequest),
    /// Modify.
    Modify(ModifyRequest),
    /// Add.
    Add(AddRequest),
    /// Delete.
    Delete(DeleteRequest),
    /// Rename / move.
    ModifyDn(ModifyDnRequest),
    /// Compare.
    Compare(CompareRequest),
    /// Extended operation.
    Extended(ExtendedRequest),
}

impl OperationRequest {
    /// Kind of this operation.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Auth(_) => RequestKind::Auth,
            Self::Search(_) => RequestKind::Search,
            Self::Modify(_) => RequestKind::Modify,
            Self::Add(_) => RequestKind::Add,
            Self::Delete(_) => RequestKind::Delete,
            Self::ModifyDn(_) => RequestKind::ModifyDn,
            Self::Compare(_) => RequestKind::Compare,
            Self::Extended(_) => RequestKind::Extended,
        }
    }

    /// Target DN, for operations that have one.
    pub fn dn(&self) -> Option<&str> {
        match self {
            Self::Search(r) => Some(&r.dn),
            Self::Modify(r) => Some(&r.dn),
            Self::Add(r) => Some(&r.dn),
            Self::Delete(r) => Some(&r.dn),
            Self::ModifyDn(r) => Some(&r.dn),
            Self::Compare(r) => Some(&r.dn),
            Self::Auth(_) | Self::Extended(_) => None,
        }
    }
}

/// A request with its envelope fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// `requestID`, echoed on the response.
    pub request_id: Option<String>,
    /// Supported controls (unknown non-critical ones are dropped).
    pub controls: Vec<Control>,
    /// The operation itself.
    pub operation: OperationRequest,
}

impl Request {
    /// Translate a request element.
    pub fn parse(el: &Element) -> Result<Self, RequestError> {
        let kind =
            RequestKind::from_tag(el.name()).ok_or_else(|| RequestError::UnknownTag(el.name().into()))?;
        Self::parse_as(kind, el)
    }

    /// Translate a request element already classified as `kind`.
    pub fn parse_as(kind: RequestKind, el: &Element) -> Result<Self, RequestError> {
        let operation = match kind {
            RequestKind::Auth => OperationRequest::Auth(AuthRequest {
                principal: required(el, kind, "principal")?.to_string(),
            }),
            RequestKind::Search => OperationRequest::Search(parse_search(el)?),
            RequestKind::Modify => OperationRequest::Modify(parse_modify(el)?),
            RequestKind::Add => OperationRequest::Add(AddRequest {
                dn: required(el, kind, "dn")?.to_string(),
                attributes: el
                    .children_named("attr")
                    .map(|attr| partial_attribute(attr, kind))
                    .collect::<Result<_, _>>()?,
            }),
            RequestKind::Delete => {
                OperationRequest::Delete(DeleteRequest { dn: required(el, kind, "dn")?.to_string() })
            },
            RequestKind::ModifyDn => OperationRequest::ModifyDn(ModifyDnRequest {
                dn: required(el, kind, "dn")?.to_string(),
                new_rdn: required(el, kind, "newrdn")?.to_string(),
                delete_old_rdn: el.attribute("deleteoldrdn").is_none_or(parse_xsd_bool),
                new_superior: el
                    .attribute("newSuperior")
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string),
            }),
            RequestKind::Compare => OperationRequest::Compare(parse_compare(el)?),
            RequestKind::Extended => OperationRequest::Extended(parse_extended(el)?),
        };

        let controls = parse_controls(el, kind)?;

        Ok(Self { request_id: el.attribute("requestID").map(str::to_string), controls, operation })
    }
}

fn required<'a>(
    el: &'a Element,
    kind: RequestKind,
    attribute: &'static str,
) -> Result<&'a str, RequestError> {
    el.attribute(attribute).ok_or(RequestError::MissingAttribute { element: kind.tag(), attribute })
}

fn parse_u32(el: &Element, kind: RequestKind, attribute: &'static str) -> Result<u32, RequestError> {
    match el.attribute(attribute) {
        None => Ok(0),
        Some(text) => text.trim().parse().map_err(|_| RequestError::InvalidValue {
            element: kind.tag(),
            attribute,
            value: text.to_string(),
        }),
    }
}

fn partial_attribute(el: &Element, kind: RequestKind) -> Result<PartialAttribute, RequestError> {
    let name = el
        .attribute("name")
        .ok_or(RequestError::MissingAttribute { element: kind.tag(), attribute: "name" })?;
    filter::validate_attribute(name)?;
    let values = el.children_named("value").map(value::decode).collect::<Result<_, _>>()?;
    Ok(PartialAttribute { name: name.to_string(), values })
}

fn parse_search(el: &Element) -> Result<SearchRequest, RequestError> {
    let kind = RequestKind::Search;
    let filter_el = el.child("filter").ok_or(RequestError::MissingChild {
        element: kind.tag(),
        child: "filter",
    })?;

    let attributes = el
        .child("attributes")
        .map(|attrs| {
            attrs
                .children_named("attribute")
                .map(|a| {
                    let name = a.attribute("name").ok_or(RequestError::MissingAttribute {
                        element: "attribute",
                        attribute: "name",
                    })?;
                    Ok(name.to_string())
                })
                .collect::<Result<Vec<_>, RequestError>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(SearchRequest {
        dn: required(el, kind, "dn")?.to_string(),
        scope: el.attribute("scope").map(Scope::from_dsml).unwrap_or_default(),
        deref_aliases: el.attribute("derefAliases").map(DerefAliases::from_dsml).unwrap_or_default(),
        size_limit: parse_u32(el, kind, "sizeLimit")?,
        time_limit: parse_u32(el, kind, "timeLimit")?,
        types_only: el.attribute("typesOnly").is_some_and(parse_xsd_bool),
        filter: FilterNode::from_filter(filter_el)?,
        attributes,
    })
}

fn parse_modify(el: &Element) -> Result<ModifyRequest, RequestError> {
    let kind = RequestKind::Modify;
    let modifications = el
        .children_named("modification")
        .map(|m| {
            let op = m.attribute("operation").ok_or(RequestError::MissingAttribute {
                element: "modification",
                attribute: "operation",
            })?;
            let operation = match op.trim() {
                "add" => ModifyOperation::Add,
                "delete" => ModifyOperation::Delete,
                "replace" => ModifyOperation::Replace,
                other => {
                    return Err(RequestError::InvalidValue {
                        element: "modification",
                        attribute: "operation",
                        value: other.to_string(),
                    });
                },
            };
            Ok(Modification { operation, attribute: partial_attribute(m, kind)? })
        })
        .collect::<Result<_, _>>()?;

    Ok(ModifyRequest { dn: required(el, kind, "dn")?.to_string(), modifications })
}

fn parse_compare(el: &Element) -> Result<CompareRequest, RequestError> {
    let kind = RequestKind::Compare;
    let assertion = el
        .child("assertion")
        .ok_or(RequestError::MissingChild { element: kind.tag(), child: "assertion" })?;
    let attribute = partial_attribute(assertion, kind)?;
    let value = attribute
        .values
        .into_iter()
        .next()
        .ok_or(RequestError::MissingChild { element: "assertion", child: "value" })?;

    Ok(CompareRequest { dn: required(el, kind, "dn")?.to_string(), attribute: attribute.name, value })
}

fn parse_extended(el: &Element) -> Result<ExtendedRequest, RequestError> {
    let kind = RequestKind::Extended;
    let oid = el
        .child("requestName")
        .map(|n| n.text().trim().to_string())
        .filter(|oid| !oid.is_empty())
        .ok_or(RequestError::MissingChild { element: kind.tag(), child: "requestName" })?;

    // requestValue is xsd:base64Binary by schema, annotated or not.
    let value = el.child("requestValue").map(|v| value::decode_base64(v.text())).transpose()?;

    Ok(ExtendedRequest { oid, value })
}

/// Translate the `control` children of a request.
///
/// Unknown controls are dropped unless critical, in which case the whole
/// request fails with `unavailableCriticalExtension`. Sort and VLV only apply
/// to searches and are treated as unknown elsewhere.
fn parse_controls(el: &Element, kind: RequestKind) -> Result<Vec<Control>, RequestError> {
    let mut controls = Vec::new();

    for control_el in el.children_named("control") {
        let critical = control_el.attribute("criticality").is_some_and(parse_xsd_bool);

        let control = match Control::from_element(control_el) {
            Ok(control) => control,
            Err(e) if critical => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "ignoring malformed non-critical control");
                continue;
            },
        };

        let applicable = match &control {
            Control::Sort { .. } | Control::VirtualListView { .. } => kind == RequestKind::Search,
            Control::Unknown { .. } => false,
        };

        if applicable {
            controls.push(control);
        } else if control.is_critical() {
            return Err(RequestError::UnsupportedCriticalControl(control.oid().to_string()));
        } else {
            debug!(oid = control.oid(), request = kind.tag(), "dropping unsupported control");
        }
    }

    Ok(controls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{SORT_REQUEST_OID, SortKey};

    fn parse(xml: &str) -> Result<Request, RequestError> {
        Request::parse(&Element::parse(xml).unwrap())
    }

    #[test]
    fn kinds_round_trip_through_tags() {
        for kind in RequestKind::ALL {
            assert_eq!(RequestKind::from_tag(kind.tag()), Some(kind));
            assert!(kind.response_tag().ends_with("Response"));
        }
        assert_eq!(RequestKind::from_tag("abandonRequest"), None);
    }

    #[test]
    fn search_request_fields() {
        let req = parse(
            r#"<searchRequest dn="ou=people,dc=example,dc=com" scope="wholeSubtree"
                 derefAliases="derefAlways" sizeLimit="10" timeLimit="5" typesOnly="true" requestID="s1">
                 <filter><present name="objectclass"/></filter>
                 <attributes><attribute name="cn"/><attribute name="mail"/></attributes>
               </searchRequest>"#,
        )
        .unwrap();

        assert_eq!(req.request_id.as_deref(), Some("s1"));
        let OperationRequest::Search(search) = req.operation else { panic!("expected search") };
        assert_eq!(search.scope, Scope::Subtree);
        assert_eq!(search.deref_aliases, DerefAliases::Always);
        assert_eq!(search.size_limit, 10);
        assert_eq!(search.time_limit, 5);
        assert!(search.types_only);
        assert_eq!(search.filter.to_ldap_string(), "(objectclass=*)");
        assert_eq!(search.attributes, vec!["cn", "mail"]);
    }

    #[test]
    fn unknown_scope_and_deref_narrow() {
        assert_eq!(Scope::from_dsml("everything"), Scope::Base);
        assert_eq!(DerefAliases::from_dsml("sometimes"), DerefAliases::Never);
    }

    #[test]
    fn search_without_filter_is_rejected() {
        let err = parse(r#"<searchRequest dn="dc=example"/>"#).unwrap_err();
        assert_eq!(err, RequestError::MissingChild { element: "searchRequest", child: "filter" });
        assert_eq!(err.result_code(), ResultCode::PROTOCOL_ERROR);
    }

    #[test]
    fn invalid_size_limit_is_rejected() {
        let err = parse(
            r#"<searchRequest dn="" sizeLimit="lots"><filter><present name="cn"/></filter></searchRequest>"#,
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::InvalidValue { attribute: "sizeLimit", .. }));
    }

    #[test]
    fn modify_request_keeps_order_and_operations() {
        let req = parse(
            r#"<modifyRequest dn="cn=a,dc=x">
                 <modification name="mail" operation="replace"><value>a@x</value></modification>
                 <modification name="description" operation="delete"/>
                 <modification name="cn" operation="add"><value>b</value><value>c</value></modification>
               </modifyRequest>"#,
        )
        .unwrap();

        let OperationRequest::Modify(modify) = req.operation else { panic!("expected modify") };
        let ops: Vec<_> = modify.modifications.iter().map(|m| m.operation).collect();
        assert_eq!(ops, vec![ModifyOperation::Replace, ModifyOperation::Delete, ModifyOperation::Add]);
        assert!(modify.modifications[1].attribute.values.is_empty());
        assert_eq!(modify.modifications[2].attribute.values, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn modify_with_unknown_operation_is_rejected() {
        let err = parse(
            r#"<modifyRequest dn="cn=a"><modification name="x" operation="increment"/></modifyRequest>"#,
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::InvalidValue { value, .. } if value == "increment"));
    }

    #[test]
    fn add_request_attributes_in_order() {
        let req = parse(
            r#"<addRequest dn="cn=new,dc=x">
                 <attr name="objectclass"><value>top</value><value>person</value></attr>
                 <attr name="sn"><value>New</value></attr>
               </addRequest>"#,
        )
        .unwrap();
        let OperationRequest::Add(add) = req.operation else { panic!("expected add") };
        let names: Vec<_> = add.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["objectclass", "sn"]);
    }

    #[test]
    fn mod_dn_defaults_delete_old_rdn() {
        let req = parse(r#"<modDNRequest dn="cn=a,dc=x" newrdn="cn=b"/>"#).unwrap();
        assert_eq!(req.operation, OperationRequest::ModifyDn(ModifyDnRequest {
            dn: "cn=a,dc=x".into(),
            new_rdn: "cn=b".into(),
            delete_old_rdn: true,
            new_superior: None,
        }));

        let req =
            parse(r#"<modDNRequest dn="cn=a,dc=x" newrdn="cn=b" deleteoldrdn="false" newSuperior="ou=y"/>"#)
                .unwrap();
        let OperationRequest::ModifyDn(m) = req.operation else { panic!("expected modDN") };
        assert!(!m.delete_old_rdn);
        assert_eq!(m.new_superior.as_deref(), Some("ou=y"));
    }

    #[test]
    fn compare_takes_assertion_value() {
        let req = parse(
            r#"<compareRequest dn="cn=a"><assertion name="sn"><value>Smith</value></assertion></compareRequest>"#,
        )
        .unwrap();
        assert_eq!(req.operation, OperationRequest::Compare(CompareRequest {
            dn: "cn=a".into(),
            attribute: "sn".into(),
            value: b"Smith".to_vec(),
        }));
    }

    #[test]
    fn extended_value_is_base64_decoded() {
        let req = parse(
            r#"<extendedRequest><requestName>1.3.6.1.4.1.4203.1.11.3</requestName><requestValue>AQI=</requestValue></extendedRequest>"#,
        )
        .unwrap();
        assert_eq!(req.operation, OperationRequest::Extended(ExtendedRequest {
            oid: "1.3.6.1.4.1.4203.1.11.3".into(),
            value: Some(vec![1, 2]),
        }));
    }

    #[test]
    fn critical_unknown_control_fails_the_request() {
        let err = parse(
            r#"<delRequest dn="cn=a"><control type="1.2.3" criticality="true"/></delRequest>"#,
        )
        .unwrap_err();
        assert_eq!(err, RequestError::UnsupportedCriticalControl("1.2.3".into()));
        assert_eq!(err.result_code(), ResultCode::UNAVAILABLE_CRITICAL_EXTENSION);
    }

    #[test]
    fn non_critical_unknown_control_is_dropped() {
        let req = parse(r#"<delRequest dn="cn=a"><control type="1.2.3"/></delRequest>"#).unwrap();
        assert!(req.controls.is_empty());
    }

    #[test]
    fn sort_control_applies_to_search_only() {
        let control = format!(
            r#"<control type="{SORT_REQUEST_OID}" criticality="true"><sortKey attribute="sn"/></control>"#
        );
        let search = parse(&format!(
            r#"<searchRequest dn=""><filter><present name="cn"/></filter>{control}</searchRequest>"#
        ))
        .unwrap();
        assert_eq!(search.controls, vec![Control::Sort {
            keys: vec![SortKey { attribute: "sn".into(), ordering_rule: None, reverse: false }],
            critical: true,
        }]);

        let err = parse(&format!(r#"<delRequest dn="cn=a">{control}</delRequest>"#)).unwrap_err();
        assert_eq!(err, RequestError::UnsupportedCriticalControl(SORT_REQUEST_OID.into()));
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let err = parse(r#"<abandonRequest abandonID="1"/>"#).unwrap_err();
        assert_eq!(err, RequestError::UnknownTag("abandonRequest".into()));
        assert_eq!(err.result_code(), ResultCode::UNWILLING_TO_PERFORM);
    }
}
